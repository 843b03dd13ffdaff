//! Key-info structures exchanged during the handshake.
//!
//! A [`KeyInfo`] carries a public key together with its authority key id, a
//! short digest of the encoded key. Each peer recomputes the id of the key it
//! received; a mismatch aborts the handshake.

use crate::CryptoError;
use crate::sha::sha256;

/// Length of an authority key id.
pub const KEY_ID_LEN: usize = 8;

/// Length of [`KeyInfo::to_bytes`].
pub const ENCODED_LEN: usize = 1 + 32 + KEY_ID_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyAlgorithm {
    X25519 = 1,
    Ed25519 = 2,
}

impl TryFrom<u8> for KeyAlgorithm {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(KeyAlgorithm::X25519),
            2 => Ok(KeyAlgorithm::Ed25519),
            _ => Err(CryptoError::InvalidLength {
                reason: "unknown key algorithm tag",
            }),
        }
    }
}

/// First [`KEY_ID_LEN`] bytes of SHA-256 over the encoded public key.
pub fn authority_key_id(public_key: &[u8; 32]) -> [u8; KEY_ID_LEN] {
    let digest = sha256(public_key);
    let mut id = [0u8; KEY_ID_LEN];
    id.copy_from_slice(&digest[..KEY_ID_LEN]);
    id
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyInfo {
    pub algorithm: KeyAlgorithm,
    pub public_key: [u8; 32],
    pub key_id: [u8; KEY_ID_LEN],
}

impl KeyInfo {
    /// Build a key-info with a freshly computed key id.
    pub fn new(algorithm: KeyAlgorithm, public_key: [u8; 32]) -> Self {
        Self {
            algorithm,
            public_key,
            key_id: authority_key_id(&public_key),
        }
    }

    /// Recompute the key id and compare it with the one carried.
    pub fn verify_key_id(&self) -> Result<(), CryptoError> {
        if authority_key_id(&self.public_key) == self.key_id {
            Ok(())
        } else {
            Err(CryptoError::KeyIdMismatch)
        }
    }

    /// `algorithm || public_key || key_id`
    pub fn to_bytes(&self) -> [u8; ENCODED_LEN] {
        let mut out = [0u8; ENCODED_LEN];
        out[0] = self.algorithm as u8;
        out[1..33].copy_from_slice(&self.public_key);
        out[33..].copy_from_slice(&self.key_id);
        out
    }

    /// Parse without checking the key id; call [`verify_key_id`](Self::verify_key_id).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ENCODED_LEN {
            return Err(CryptoError::InvalidLength {
                reason: "key info must be 41 bytes",
            });
        }
        let algorithm = KeyAlgorithm::try_from(bytes[0])?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&bytes[1..33]);
        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&bytes[33..]);
        Ok(Self {
            algorithm,
            public_key,
            key_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_is_sha256_prefix() {
        let key = [0x11u8; 32];
        assert_eq!(authority_key_id(&key), sha256(&key)[..KEY_ID_LEN]);
    }

    #[test]
    fn fresh_key_info_verifies() {
        let info = KeyInfo::new(KeyAlgorithm::X25519, [7u8; 32]);
        info.verify_key_id().unwrap();
        assert_eq!(KeyInfo::from_bytes(&info.to_bytes()).unwrap(), info);
    }

    #[test]
    fn tampered_key_is_detected() {
        let mut info = KeyInfo::new(KeyAlgorithm::Ed25519, [7u8; 32]);
        info.public_key[0] ^= 1;
        assert_eq!(info.verify_key_id(), Err(CryptoError::KeyIdMismatch));
    }

    #[test]
    fn tampered_id_is_detected() {
        let mut info = KeyInfo::new(KeyAlgorithm::X25519, [9u8; 32]);
        info.key_id[7] ^= 0x80;
        assert_eq!(info.verify_key_id(), Err(CryptoError::KeyIdMismatch));
    }

    #[test]
    fn rejects_bad_encodings() {
        assert!(KeyInfo::from_bytes(&[0u8; 40]).is_err());
        let mut bytes = KeyInfo::new(KeyAlgorithm::X25519, [1u8; 32]).to_bytes();
        bytes[0] = 9;
        assert!(KeyInfo::from_bytes(&bytes).is_err());
    }
}
