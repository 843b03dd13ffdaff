//! Credential callbacks.
//!
//! The router never holds secrets of its own. Pre-shared keys and signing
//! keys come from the hosting process through an [`AuthListener`], which also
//! decides whether a peer's identity is acceptable.

use meshbus_core::Mechanism;
use meshbus_crypto::ed25519::{Ed25519PrivateKey, Ed25519PublicKey};
use zeroize::Zeroizing;

/// Material supplied for one handshake attempt.
#[derive(Clone, Default)]
pub struct Credentials {
    pub psk: Option<Zeroizing<Vec<u8>>>,
    pub signing_key: Option<Ed25519PrivateKey>,
}

impl Credentials {
    /// Whether these credentials are enough to run `mechanism`.
    pub fn suffice_for(&self, mechanism: Mechanism) -> bool {
        match mechanism {
            Mechanism::EcdheNull => true,
            Mechanism::EcdhePsk => self.psk.as_ref().is_some_and(|k| !k.is_empty()),
            Mechanism::EcdheEd25519 => self.signing_key.is_some(),
        }
    }
}

impl core::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("psk", &self.psk.as_ref().map(|_| "<redacted>"))
            .field("signing_key", &self.signing_key)
            .finish()
    }
}

/// Invoked by the security engine while a handshake runs.
///
/// `peer` is the transport's description of the remote side. Calls happen on
/// the connection's reader task and must not block for long.
pub trait AuthListener: Send + Sync + 'static {
    /// Credentials for the local side. `attempt` counts from 1.
    fn request_credentials(&self, mechanism: Mechanism, peer: &str, attempt: u32) -> Option<Credentials>;

    /// Accept or refuse the peer. `identity` is the peer's long-term key for
    /// [`Mechanism::EcdheEd25519`] and `None` otherwise.
    fn verify_credentials(
        &self,
        mechanism: Mechanism,
        peer: &str,
        identity: Option<&Ed25519PublicKey>,
    ) -> bool;

    fn authentication_complete(&self, _mechanism: Mechanism, _peer: &str, _success: bool) {}
}

/// Fixed credentials and a list of trusted identities.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credentials: Credentials,
    trusted: Vec<Ed25519PublicKey>,
    trust_any_identity: bool,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_psk(mut self, psk: impl Into<Vec<u8>>) -> Self {
        self.credentials.psk = Some(Zeroizing::new(psk.into()));
        self
    }

    pub fn with_signing_key(mut self, key: Ed25519PrivateKey) -> Self {
        self.credentials.signing_key = Some(key);
        self
    }

    pub fn trust(mut self, identity: Ed25519PublicKey) -> Self {
        self.trusted.push(identity);
        self
    }

    /// Accept any peer that proves possession of some Ed25519 key.
    pub fn trust_any_identity(mut self) -> Self {
        self.trust_any_identity = true;
        self
    }
}

impl AuthListener for StaticCredentials {
    fn request_credentials(&self, mechanism: Mechanism, _peer: &str, _attempt: u32) -> Option<Credentials> {
        self.credentials
            .suffice_for(mechanism)
            .then(|| self.credentials.clone())
    }

    fn verify_credentials(
        &self,
        mechanism: Mechanism,
        _peer: &str,
        identity: Option<&Ed25519PublicKey>,
    ) -> bool {
        match (mechanism, identity) {
            (Mechanism::EcdheNull, _) => true,
            // Knowing the key is the proof; a wrong one fails key confirmation.
            (Mechanism::EcdhePsk, _) => self.credentials.suffice_for(Mechanism::EcdhePsk),
            (Mechanism::EcdheEd25519, Some(identity)) => {
                self.trust_any_identity || self.trusted.contains(identity)
            }
            (Mechanism::EcdheEd25519, None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_offered_only_when_sufficient() {
        let none = StaticCredentials::new();
        assert!(none.request_credentials(Mechanism::EcdheNull, "p", 1).is_some());
        assert!(none.request_credentials(Mechanism::EcdhePsk, "p", 1).is_none());
        assert!(none.request_credentials(Mechanism::EcdheEd25519, "p", 1).is_none());

        let psk = StaticCredentials::new().with_psk(b"secret".to_vec());
        let creds = psk.request_credentials(Mechanism::EcdhePsk, "p", 1).unwrap();
        assert_eq!(creds.psk.as_deref().map(Vec::as_slice), Some(&b"secret"[..]));

        let empty = StaticCredentials::new().with_psk(Vec::new());
        assert!(empty.request_credentials(Mechanism::EcdhePsk, "p", 1).is_none());
    }

    #[test]
    fn identities_must_be_trusted() {
        let friend = Ed25519PrivateKey::from_bytes([1; 32]).public_key();
        let stranger = Ed25519PrivateKey::from_bytes([2; 32]).public_key();
        let creds = StaticCredentials::new().trust(friend);

        assert!(creds.verify_credentials(Mechanism::EcdheEd25519, "p", Some(&friend)));
        assert!(!creds.verify_credentials(Mechanism::EcdheEd25519, "p", Some(&stranger)));
        assert!(!creds.verify_credentials(Mechanism::EcdheEd25519, "p", None));

        let open = StaticCredentials::new().trust_any_identity();
        assert!(open.verify_credentials(Mechanism::EcdheEd25519, "p", Some(&stranger)));
    }

    #[test]
    fn debug_hides_the_psk() {
        let creds = StaticCredentials::new().with_psk(b"hunter2".to_vec());
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
