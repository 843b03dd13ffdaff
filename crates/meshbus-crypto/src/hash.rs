//! The digest/HMAC contract consumed by the security engine.
//!
//! A [`CryptoHash`] starts out uninitialised. [`CryptoHash::init`] picks an
//! algorithm and, when a key is supplied, turns the context into an HMAC.
//! The two flavours are distinct variants, so an HMAC context can never be
//! finalised as a plain digest or the other way round.
//!
//! `finish(true)` ("keep-alive") is only meaningful for plain digests: the
//! running state is cloned, the clone is finalised and the original keeps
//! absorbing data. This is what lets the handshake take transcript snapshots
//! without rehashing from the beginning.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

use crate::CryptoError;

/// Hash functions available through [`CryptoHash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Output length in bytes.
    pub const fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }
}

#[derive(Clone)]
enum DigestState {
    Sha256(Sha256),
    Sha512(Sha512),
}

enum MacState {
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

enum Context {
    Digest(DigestState),
    Hmac(MacState),
}

/// Incremental digest or HMAC computation.
#[derive(Default)]
pub struct CryptoHash {
    ctx: Option<Context>,
}

impl CryptoHash {
    /// Create an uninitialised context.
    pub const fn new() -> Self {
        Self { ctx: None }
    }

    /// Shorthand for a freshly initialised plain digest.
    pub fn digest(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => DigestState::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => DigestState::Sha512(Sha512::new()),
        };
        Self {
            ctx: Some(Context::Digest(state)),
        }
    }

    /// Shorthand for a freshly initialised HMAC.
    pub fn hmac(algorithm: HashAlgorithm, key: &[u8]) -> Result<Self, CryptoError> {
        let mut hash = Self::new();
        hash.init(algorithm, Some(key))?;
        Ok(hash)
    }

    /// (Re)initialise the context, discarding any previous state.
    ///
    /// A `Some` key selects HMAC. An empty key is rejected and leaves the
    /// context uninitialised.
    pub fn init(&mut self, algorithm: HashAlgorithm, hmac_key: Option<&[u8]>) -> Result<(), CryptoError> {
        self.ctx = None;
        let Some(key) = hmac_key else {
            *self = Self::digest(algorithm);
            return Ok(());
        };
        if key.is_empty() {
            return Err(CryptoError::EmptyKey);
        }
        let state = match algorithm {
            HashAlgorithm::Sha256 => MacState::Sha256(
                Hmac::<Sha256>::new_from_slice(key).map_err(|_| CryptoError::EmptyKey)?,
            ),
            HashAlgorithm::Sha512 => MacState::Sha512(
                Hmac::<Sha512>::new_from_slice(key).map_err(|_| CryptoError::EmptyKey)?,
            ),
        };
        self.ctx = Some(Context::Hmac(state));
        Ok(())
    }

    /// Absorb more data.
    pub fn update(&mut self, data: &[u8]) -> Result<(), CryptoError> {
        match self.ctx.as_mut().ok_or(CryptoError::Uninitialized)? {
            Context::Digest(DigestState::Sha256(h)) => Digest::update(h, data),
            Context::Digest(DigestState::Sha512(h)) => Digest::update(h, data),
            Context::Hmac(MacState::Sha256(m)) => Mac::update(m, data),
            Context::Hmac(MacState::Sha512(m)) => Mac::update(m, data),
        }
        Ok(())
    }

    /// Finalise and return the digest.
    ///
    /// Without keep-alive the context returns to the uninitialised state.
    /// With keep-alive (plain digests only) the context keeps its state and
    /// can absorb more data. Requesting keep-alive on an HMAC fails with
    /// [`CryptoError::KeepAliveOnHmac`] and leaves the HMAC untouched.
    pub fn finish(&mut self, keep_alive: bool) -> Result<Vec<u8>, CryptoError> {
        match self.ctx.as_ref() {
            None => return Err(CryptoError::Uninitialized),
            Some(Context::Hmac(_)) if keep_alive => return Err(CryptoError::KeepAliveOnHmac),
            Some(Context::Digest(state)) if keep_alive => {
                return Ok(finalize_digest(state.clone()));
            }
            Some(_) => {}
        }

        let out = match self.ctx.take() {
            Some(Context::Digest(state)) => finalize_digest(state),
            Some(Context::Hmac(MacState::Sha256(m))) => m.finalize().into_bytes().to_vec(),
            Some(Context::Hmac(MacState::Sha512(m))) => m.finalize().into_bytes().to_vec(),
            None => return Err(CryptoError::Uninitialized),
        };
        Ok(out)
    }

    pub fn is_initialized(&self) -> bool {
        self.ctx.is_some()
    }

    pub fn is_hmac(&self) -> bool {
        matches!(self.ctx, Some(Context::Hmac(_)))
    }

    /// Algorithm of the current context, if initialised.
    pub fn algorithm(&self) -> Option<HashAlgorithm> {
        self.ctx.as_ref().map(|ctx| match ctx {
            Context::Digest(DigestState::Sha256(_)) | Context::Hmac(MacState::Sha256(_)) => {
                HashAlgorithm::Sha256
            }
            Context::Digest(DigestState::Sha512(_)) | Context::Hmac(MacState::Sha512(_)) => {
                HashAlgorithm::Sha512
            }
        })
    }
}

fn finalize_digest(state: DigestState) -> Vec<u8> {
    match state {
        DigestState::Sha256(h) => h.finalize().to_vec(),
        DigestState::Sha512(h) => h.finalize().to_vec(),
    }
}

impl core::fmt::Debug for CryptoHash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CryptoHash")
            .field("algorithm", &self.algorithm())
            .field("hmac", &self.is_hmac())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmac::hmac_sha256;
    use crate::sha::{sha256, sha512};

    #[test]
    fn update_before_init_is_rejected() {
        let mut hash = CryptoHash::new();
        assert_eq!(hash.update(b"x"), Err(CryptoError::Uninitialized));
        assert_eq!(hash.finish(false), Err(CryptoError::Uninitialized));
        assert_eq!(hash.finish(true), Err(CryptoError::Uninitialized));
    }

    #[test]
    fn empty_hmac_key_is_rejected() {
        let mut hash = CryptoHash::new();
        assert_eq!(
            hash.init(HashAlgorithm::Sha256, Some(&[])),
            Err(CryptoError::EmptyKey)
        );
        assert!(!hash.is_initialized());
    }

    #[test]
    fn failed_reinit_discards_previous_state() {
        let mut hash = CryptoHash::digest(HashAlgorithm::Sha256);
        hash.update(b"abc").unwrap();
        assert!(hash.init(HashAlgorithm::Sha256, Some(b"")).is_err());
        assert_eq!(hash.update(b"x"), Err(CryptoError::Uninitialized));
    }

    #[test]
    fn digest_matches_one_shot() {
        let mut hash = CryptoHash::digest(HashAlgorithm::Sha512);
        hash.update(b"ab").unwrap();
        hash.update(b"c").unwrap();
        assert_eq!(hash.finish(false).unwrap(), sha512(b"abc").to_vec());
        assert!(!hash.is_initialized());
    }

    #[test]
    fn hmac_matches_one_shot() {
        let mut hash = CryptoHash::hmac(HashAlgorithm::Sha256, b"Jefe").unwrap();
        hash.update(b"what do ya want ").unwrap();
        hash.update(b"for nothing?").unwrap();
        assert_eq!(
            hash.finish(false).unwrap(),
            hmac_sha256(b"Jefe", b"what do ya want for nothing?").to_vec()
        );
    }

    #[test]
    fn keep_alive_snapshot_leaves_digest_running() {
        let mut hash = CryptoHash::digest(HashAlgorithm::Sha256);
        hash.update(b"hello ").unwrap();

        let snapshot = hash.finish(true).unwrap();
        assert_eq!(snapshot, sha256(b"hello ").to_vec());
        assert!(hash.is_initialized());

        hash.update(b"world").unwrap();
        assert_eq!(hash.finish(false).unwrap(), sha256(b"hello world").to_vec());
    }

    #[test]
    fn keep_alive_on_hmac_fails_without_finalising() {
        let mut hash = CryptoHash::hmac(HashAlgorithm::Sha256, b"key").unwrap();
        hash.update(b"part one ").unwrap();
        assert_eq!(hash.finish(true), Err(CryptoError::KeepAliveOnHmac));

        // The context is still usable and still holds the first update.
        hash.update(b"part two").unwrap();
        assert_eq!(
            hash.finish(false).unwrap(),
            hmac_sha256(b"key", b"part one part two").to_vec()
        );
    }

    #[test]
    fn reports_algorithm_and_flavour() {
        let hash = CryptoHash::hmac(HashAlgorithm::Sha512, b"k").unwrap();
        assert_eq!(hash.algorithm(), Some(HashAlgorithm::Sha512));
        assert!(hash.is_hmac());
        assert_eq!(CryptoHash::new().algorithm(), None);
        assert_eq!(HashAlgorithm::Sha512.digest_len(), 64);
    }
}
