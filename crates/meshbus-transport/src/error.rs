//! Error types for the transport layer.

/// Errors that can occur on a transport or one of its connections.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("connection closed")]
    Disconnected,
    #[error("transport stopped")]
    Stopped,
    #[error("connect to {target} failed: {reason}")]
    Connect { target: String, reason: String },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl TransportError {
    /// Whether the connection this error came from is unusable afterwards.
    ///
    /// An oversized frame leaves a byte stream out of sync, so it counts.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_variants() {
        let io = TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(io.to_string().contains("I/O error"));
        assert_eq!(TransportError::Disconnected.to_string(), "connection closed");
        assert_eq!(
            TransportError::FrameTooLarge { len: 10, max: 4 }.to_string(),
            "frame of 10 bytes exceeds limit of 4"
        );
    }

    #[test]
    fn only_configuration_errors_are_recoverable() {
        assert!(TransportError::Disconnected.is_fatal());
        assert!(TransportError::FrameTooLarge { len: 2, max: 1 }.is_fatal());
        assert!(!TransportError::Configuration("x".into()).is_fatal());
    }
}
