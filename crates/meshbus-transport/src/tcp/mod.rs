//! TCP transport with length-prefixed framing.
//!
//! [`TcpTransport`] owns a listener and yields a [`TcpConnection`] per
//! accepted socket; it can also dial out. Every connection runs one read
//! task that splits the byte stream into frames.

pub mod connection;
pub mod listener;

pub use connection::TcpConnection;
pub use listener::TcpTransport;

use std::net::SocketAddr;
use std::time::Duration;

use crate::traits::DEFAULT_MAX_FRAME_LEN;

/// Timeout for outbound connection attempts.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of the read buffer for `TcpStream::read`.
pub const TCP_RECV_BUFFER: usize = 8192;

/// Frames buffered between a connection's read task and `receive`.
pub const RX_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Name used in logs.
    pub name: String,
    pub bind_addr: SocketAddr,
    pub max_frame_len: usize,
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl TcpConfig {
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_timeout: CONNECT_TIMEOUT,
            nodelay: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = TcpConfig::new("tcp", "127.0.0.1:0".parse().unwrap());
        assert_eq!(config.name, "tcp");
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(config.connect_timeout, CONNECT_TIMEOUT);
        assert!(config.nodelay);
    }
}
