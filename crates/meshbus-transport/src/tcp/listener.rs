//! TCP listener side: accepts inbound sockets and dials outbound ones.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::TcpConfig;
use super::connection::TcpConnection;
use crate::error::TransportError;
use crate::shutdown::ShutdownToken;
use crate::traits::Transport;

pub struct TcpTransport {
    config: TcpConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: ShutdownToken,
}

impl TcpTransport {
    /// Bind the listener. Port 0 picks an ephemeral port; see [`local_addr`](Self::local_addr).
    pub async fn bind(config: TcpConfig) -> Result<Self, TransportError> {
        if config.max_frame_len == 0 {
            return Err(TransportError::Configuration(
                "max_frame_len must be positive".into(),
            ));
        }
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("{}: listening on {}", config.name, local_addr);

        let shutdown = ShutdownToken::new();
        shutdown.set_online();
        Ok(Self {
            config,
            listener,
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_online(&self) -> bool {
        self.shutdown.is_online()
    }
}

impl Transport for TcpTransport {
    type Conn = TcpConnection;

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn accept(&self) -> Result<TcpConnection, TransportError> {
        loop {
            if self.shutdown.is_stopped() {
                return Err(TransportError::Stopped);
            }
            let stream = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        info!("{}: accepted connection from {}", self.config.name, peer_addr);
                        stream
                    }
                    Err(e) => {
                        warn!("{}: accept error: {}", self.config.name, e);
                        continue;
                    }
                },
                _ = self.shutdown.stopped() => {
                    debug!("{}: accept stopping", self.config.name);
                    return Err(TransportError::Stopped);
                }
            };

            match TcpConnection::from_stream(stream, self.config.max_frame_len, self.config.nodelay).await {
                Ok(conn) => return Ok(conn),
                Err(e) => warn!("{}: failed to set up connection: {}", self.config.name, e),
            }
        }
    }

    /// `spec` is `host:port`; hostnames are resolved.
    async fn connect(&self, spec: &str) -> Result<TcpConnection, TransportError> {
        let stream = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(spec)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    target: spec.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(TransportError::Connect {
                    target: spec.to_string(),
                    reason: "timed out".into(),
                });
            }
        };
        info!("{}: connected to {}", self.config.name, spec);
        TcpConnection::from_stream(stream, self.config.max_frame_len, self.config.nodelay).await
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.shutdown.signal_stop_and_go_offline();
        Ok(())
    }
}
