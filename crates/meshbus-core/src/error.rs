//! Error types for the meshbus-core crate.

use meshbus_crypto::CryptoError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid bus name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("invalid unique name {0:?}")]
    InvalidUniqueName(String),
    #[error("unknown authentication mechanism {0:?}")]
    UnknownMechanism(String),
    #[error("malformed message: {0}")]
    InvalidMessage(&'static str),
    #[error("body signature mismatch: expected {expected:?}, got {actual:?}")]
    SignatureMismatch {
        expected: &'static str,
        actual: String,
    },
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<rmp_serde::encode::Error> for CoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CoreError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CoreError::Decode(e.to_string())
    }
}
