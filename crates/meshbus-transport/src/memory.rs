//! In-process transport.
//!
//! Connections are pairs of bounded channels, so frames keep their
//! boundaries without any framing. Used to attach components living in the
//! same process as the router, and throughout the test suites.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use meshbus_core::TransportMask;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::debug;

use crate::error::TransportError;
use crate::shutdown::ShutdownToken;
use crate::traits::{Connection, DEFAULT_MAX_FRAME_LEN, Transport};

/// Frames buffered per direction before `send` waits.
pub const CHANNEL_DEPTH: usize = 256;

const ACCEPT_BACKLOG: usize = 64;

/// One end of an in-process connection.
pub struct MemoryConnection {
    peer: String,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    /// Shared by both ends; once set neither side can send.
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryConnection {
    /// Create two connected ends. `a` sees `b_label` as its peer and vice versa.
    pub fn pair(a_label: &str, b_label: &str) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let a = Self {
            peer: format!("mem:{b_label}"),
            tx: a_tx,
            rx: Mutex::new(a_rx),
            closed: Arc::clone(&closed),
        };
        let b = Self {
            peer: format!("mem:{a_label}"),
            tx: b_tx,
            rx: Mutex::new(b_rx),
            closed,
        };
        (a, b)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Connection for MemoryConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn transport(&self) -> TransportMask {
        TransportMask::LOCAL
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > DEFAULT_MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: DEFAULT_MAX_FRAME_LEN,
            });
        }
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        self.tx
            .send(frame.to_vec())
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut rx = self.rx.lock().await;
        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            frame = rx.recv() => frame.ok_or(TransportError::Disconnected),
            _ = closed.wait_for(|c| *c) => {
                // Frames queued before the close still get delivered.
                rx.try_recv().map_err(|_| TransportError::Disconnected)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.closed.send_replace(true);
        Ok(())
    }
}

/// Dials a [`MemoryTransport`]. Cheap to clone.
#[derive(Clone)]
pub struct MemoryConnector {
    name: Arc<str>,
    incoming: mpsc::Sender<MemoryConnection>,
    next_id: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Open a connection; the other end is handed to the transport's `accept`.
    pub async fn connect(&self) -> Result<MemoryConnection, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client_label = format!("{}-client-{id}", self.name);
        let (server_end, client_end) = MemoryConnection::pair(&client_label, &self.name);
        self.incoming
            .send(server_end)
            .await
            .map_err(|_| TransportError::Stopped)?;
        debug!("{}: opened in-process connection {}", self.name, client_label);
        Ok(client_end)
    }
}

/// Listener side of the in-process transport.
pub struct MemoryTransport {
    name: String,
    connector: MemoryConnector,
    incoming: Mutex<mpsc::Receiver<MemoryConnection>>,
    shutdown: ShutdownToken,
}

impl MemoryTransport {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let shutdown = ShutdownToken::new();
        shutdown.set_online();
        Self {
            connector: MemoryConnector {
                name: Arc::from(name.as_str()),
                incoming: tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            name,
            incoming: Mutex::new(rx),
            shutdown,
        }
    }

    /// A handle for dialling this transport from elsewhere in the process.
    pub fn connector(&self) -> MemoryConnector {
        self.connector.clone()
    }
}

impl Transport for MemoryTransport {
    type Conn = MemoryConnection;

    fn name(&self) -> &str {
        &self.name
    }

    async fn accept(&self) -> Result<MemoryConnection, TransportError> {
        if self.shutdown.is_stopped() {
            return Err(TransportError::Stopped);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            conn = incoming.recv() => conn.ok_or(TransportError::Stopped),
            _ = self.shutdown.stopped() => Err(TransportError::Stopped),
        }
    }

    /// `_spec` is ignored: an in-process transport can only reach itself.
    async fn connect(&self, _spec: &str) -> Result<MemoryConnection, TransportError> {
        if self.shutdown.is_stopped() {
            return Err(TransportError::Stopped);
        }
        self.connector.connect().await
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.shutdown.signal_stop_and_go_offline();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_carries_frames_both_ways() {
        let (a, b) = MemoryConnection::pair("a", "b");
        assert_eq!(a.peer(), "mem:b");
        a.send(b"ping").await.unwrap();
        assert_eq!(b.receive().await.unwrap(), b"ping");
        b.send(b"pong").await.unwrap();
        assert_eq!(a.receive().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn queued_frames_survive_disconnect() {
        let (a, b) = MemoryConnection::pair("a", "b");
        a.send(b"one").await.unwrap();
        a.send(b"two").await.unwrap();
        a.disconnect().await.unwrap();
        assert!(!b.is_connected());
        assert_eq!(b.receive().await.unwrap(), b"one");
        assert_eq!(b.receive().await.unwrap(), b"two");
        assert!(matches!(b.receive().await, Err(TransportError::Disconnected)));
        assert!(matches!(b.send(b"x").await, Err(TransportError::Disconnected)));
    }

    #[tokio::test]
    async fn dropped_peer_reads_as_disconnect() {
        let (a, b) = MemoryConnection::pair("a", "b");
        drop(a);
        assert!(matches!(b.receive().await, Err(TransportError::Disconnected)));
    }

    #[tokio::test]
    async fn connector_feeds_accept() {
        let transport = MemoryTransport::new("local");
        let client = transport.connector().connect().await.unwrap();
        let server = transport.accept().await.unwrap();
        assert_eq!(client.peer(), "mem:local");
        assert!(server.peer().starts_with("mem:local-client-"));
        client.send(b"hello").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn stop_wakes_pending_accept() {
        let transport = Arc::new(MemoryTransport::new("local"));
        let pending = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.accept().await })
        };
        tokio::task::yield_now().await;
        transport.stop().await.unwrap();
        assert!(matches!(pending.await.unwrap(), Err(TransportError::Stopped)));
        assert!(transport.connect("").await.is_err());
    }
}
