use core::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    InvalidKeyLength { expected: usize, actual: usize },
    /// An HMAC context was requested with a zero-length key.
    EmptyKey,
    /// `update`/`finish` was called on a hash that was never initialised.
    Uninitialized,
    /// `finish(keep_alive = true)` was requested on an HMAC context.
    KeepAliveOnHmac,
    KeyIdMismatch,
    InvalidSignature,
    InvalidPadding,
    DecryptionFailed,
    InvalidHmac,
    InvalidLength { reason: &'static str },
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidKeyLength { expected, actual } => {
                write!(f, "invalid key length: expected {expected}, got {actual}")
            }
            CryptoError::EmptyKey => write!(f, "HMAC key must not be empty"),
            CryptoError::Uninitialized => write!(f, "hash context used before init"),
            CryptoError::KeepAliveOnHmac => {
                write!(f, "keep-alive finish is not supported for HMAC contexts")
            }
            CryptoError::KeyIdMismatch => write!(f, "authority key id does not match public key"),
            CryptoError::InvalidSignature => write!(f, "invalid signature"),
            CryptoError::InvalidPadding => write!(f, "invalid PKCS7 padding"),
            CryptoError::DecryptionFailed => write!(f, "decryption failed"),
            CryptoError::InvalidHmac => write!(f, "HMAC verification failed"),
            CryptoError::InvalidLength { reason } => write!(f, "invalid length: {reason}"),
        }
    }
}

impl std::error::Error for CryptoError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_a_message() {
        let variants = [
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16,
            },
            CryptoError::EmptyKey,
            CryptoError::Uninitialized,
            CryptoError::KeepAliveOnHmac,
            CryptoError::KeyIdMismatch,
            CryptoError::InvalidSignature,
            CryptoError::InvalidPadding,
            CryptoError::DecryptionFailed,
            CryptoError::InvalidHmac,
            CryptoError::InvalidLength {
                reason: "too short",
            },
        ];
        for variant in &variants {
            assert!(!variant.to_string().is_empty(), "{variant:?}");
        }
    }

    #[test]
    fn key_length_message_names_both_sizes() {
        let err = CryptoError::InvalidKeyLength {
            expected: 64,
            actual: 3,
        };
        assert_eq!(err.to_string(), "invalid key length: expected 64, got 3");
    }
}
