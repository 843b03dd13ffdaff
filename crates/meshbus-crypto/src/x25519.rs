//! X25519 Diffie-Hellman key agreement.
//!
//! Every handshake mechanism starts from a fresh ephemeral X25519 key pair on
//! each side; the shared secret feeds the master-secret derivation.

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// An X25519 private key. Wiped on drop by `x25519-dalek`.
pub struct X25519PrivateKey(StaticSecret);

impl X25519PrivateKey {
    /// Generate a random private key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(rand::rngs::OsRng))
    }

    /// Create a private key from raw bytes (clamping is applied on use).
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    #[must_use]
    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey(PublicKey::from(&self.0))
    }

    /// Compute the shared secret with a peer's public key.
    #[must_use]
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.0.diffie_hellman(&their_public.0).as_bytes())
    }
}

impl core::fmt::Debug for X25519PrivateKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("X25519PrivateKey").field(&"<redacted>").finish()
    }
}

/// An X25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X25519PublicKey(PublicKey);

impl X25519PublicKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl From<[u8; 32]> for X25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_32(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn rfc7748_shared_secret() {
        let alice = X25519PrivateKey::from_bytes(hex_32(
            "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a",
        ));
        let bob = X25519PrivateKey::from_bytes(hex_32(
            "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb",
        ));

        assert_eq!(
            hex::encode(alice.public_key().to_bytes()),
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
        );
        let expected = "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742";
        assert_eq!(hex::encode(*alice.diffie_hellman(&bob.public_key())), expected);
        assert_eq!(hex::encode(*bob.diffie_hellman(&alice.public_key())), expected);
    }

    #[test]
    fn generated_pairs_agree() {
        let a = X25519PrivateKey::generate();
        let b = X25519PrivateKey::generate();
        assert_eq!(
            *a.diffie_hellman(&b.public_key()),
            *b.diffie_hellman(&a.public_key())
        );
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let key = X25519PrivateKey::from_bytes([0x42; 32]);
        assert!(!format!("{key:?}").contains("42"));
    }
}
