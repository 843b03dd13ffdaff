//! Cryptographic primitives for the meshbus router.
//!
//! The security engine consumes these through a small number of entry points:
//! the [`CryptoHash`] digest/HMAC contract for transcripts and key
//! confirmation, [`hkdf`](hkdf::hkdf) for key derivation, X25519/Ed25519 for
//! key agreement and identity, [`KeyInfo`] for authority key ids and
//! [`SessionCipher`] for protecting traffic once a peer is authenticated.

pub mod aes_cbc;
pub mod ed25519;
pub mod error;
pub mod hash;
pub mod hkdf;
pub mod hmac;
pub mod key_info;
pub mod seal;
pub mod sha;
pub mod x25519;

pub use error::CryptoError;
pub use hash::{CryptoHash, HashAlgorithm};
pub use key_info::{KeyAlgorithm, KeyInfo};
pub use seal::SessionCipher;
