//! A single framed TCP connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use meshbus_core::TransportMask;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, warn};

use super::{RX_QUEUE_DEPTH, TCP_RECV_BUFFER};
use crate::error::TransportError;
use crate::framing::{FrameAccumulator, encode_frame};
use crate::shutdown::ShutdownToken;
use crate::traits::Connection;

struct Shared {
    connected: AtomicBool,
    shutdown: ShutdownToken,
}

/// A framed TCP stream. The read half is drained by a background task.
pub struct TcpConnection {
    peer: String,
    max_frame_len: usize,
    writer: Mutex<Option<OwnedWriteHalf>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    shared: Arc<Shared>,
}

impl TcpConnection {
    /// Wrap a connected stream and start its read task.
    pub async fn from_stream(
        stream: TcpStream,
        max_frame_len: usize,
        nodelay: bool,
    ) -> Result<Self, TransportError> {
        if nodelay {
            stream.set_nodelay(true)?;
        }
        let peer = match stream.peer_addr() {
            Ok(addr) => format!("tcp:{addr}"),
            Err(_) => "tcp:unknown".to_string(),
        };
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(RX_QUEUE_DEPTH);

        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            shutdown: ShutdownToken::new(),
        });
        shared.shutdown.set_online();

        let handle = tokio::spawn(Self::read_loop(
            Arc::clone(&shared),
            reader,
            tx,
            shared.shutdown.subscribe(),
            max_frame_len,
            peer.clone(),
        ));
        shared.shutdown.add_task(handle).await;

        Ok(Self {
            peer,
            max_frame_len,
            writer: Mutex::new(Some(writer)),
            rx: Mutex::new(rx),
            shared,
        })
    }

    /// Read bytes, split them into frames, queue them for `receive`.
    ///
    /// Dropping `frames` on exit is what turns into `Disconnected` for the
    /// receiver, after everything already queued has been consumed.
    async fn read_loop(
        shared: Arc<Shared>,
        mut reader: OwnedReadHalf,
        frames: mpsc::Sender<Vec<u8>>,
        mut stop_rx: watch::Receiver<bool>,
        max_frame_len: usize,
        peer: String,
    ) {
        let mut acc = FrameAccumulator::new(max_frame_len);
        let mut buf = vec![0u8; TCP_RECV_BUFFER];

        'read: loop {
            let n = tokio::select! {
                result = reader.read(&mut buf) => match result {
                    Ok(0) => {
                        debug!("{}: socket closed (EOF)", peer);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("{}: read error: {}", peer, e);
                        break;
                    }
                },
                _ = stop_rx.changed() => break,
            };

            match acc.feed(&buf[..n]) {
                Ok(batch) => {
                    for frame in batch {
                        if frames.send(frame).await.is_err() {
                            break 'read;
                        }
                    }
                }
                Err(e) => {
                    warn!("{}: dropping connection: {}", peer, e);
                    break;
                }
            }
        }

        shared.connected.store(false, Ordering::SeqCst);
    }
}

impl Connection for TcpConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn transport(&self) -> TransportMask {
        TransportMask::TCP
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let framed = encode_frame(frame, self.max_frame_len)?;
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.write_all(&framed).await.map_err(TransportError::Io),
            None => Err(TransportError::Disconnected),
        }
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Disconnected)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.shared.shutdown.signal_stop_and_go_offline();

        // Half-close so the peer sees EOF.
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.shared.connected.store(false, Ordering::SeqCst);

        self.shared.shutdown.join_all().await;
        Ok(())
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.shared.shutdown.signal_stop();
    }
}
