//! Error types for the daemon.

use meshbus_crypto::CryptoError;
use meshbus_router::RouterError;
use meshbus_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("key material error: {0}")]
    Key(#[from] CryptoError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("router error: {0}")]
    Router(#[from] RouterError),
    #[error("node already running")]
    AlreadyRunning,
}
