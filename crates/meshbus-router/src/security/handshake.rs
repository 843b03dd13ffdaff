//! The authentication and key-exchange state machine.
//!
//! The same machine drives both ends of a connection; it is sans-IO, taking
//! one [`HandshakeMessage`] at a time and returning the messages to send back.
//!
//! ```text
//! INITIATOR                                   RESPONDER
//!     |-- Offer{mechanisms} ------------------->|  Negotiating
//!     |<----------------- Accept{mechanism} ----|
//!     |<---------- KeyExchange{key_info, ..} ---|  ExchangingKeys
//!     |-- KeyExchange{key_info, ..} ----------->|
//!     |-- Verifier{mac} ----------------------->|  VerifyingPeer
//!     |<-------------------- Verifier{mac} -----|  Authenticated
//! ```
//!
//! Every message up to the second key exchange is absorbed into a SHA-256
//! transcript. The snapshot taken after both key exchanges salts the master
//! secret and is what each side's verifier MAC covers, so a peer that saw a
//! different conversation, or derived a different secret, fails confirmation.

use std::sync::Arc;

use meshbus_core::{HandshakeMessage, Mechanism};
use meshbus_crypto::ed25519::{Ed25519PublicKey, Ed25519Signature};
use meshbus_crypto::hkdf::hkdf;
use meshbus_crypto::hmac::hmac_sha256_verify;
use meshbus_crypto::x25519::{X25519PrivateKey, X25519PublicKey};
use meshbus_crypto::{CryptoError, CryptoHash, HashAlgorithm, KeyAlgorithm, KeyInfo, SessionCipher};
use tracing::debug;
use zeroize::Zeroizing;

use super::credentials::{AuthListener, Credentials};
use crate::error::AuthError;

const MASTER_SECRET_INFO: &[u8] = b"meshbus master secret";
const SESSION_KEYS_INFO: &[u8] = b"meshbus session keys";
const MASTER_SECRET_LEN: usize = 64;
const SESSION_KEYS_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn label(self) -> &'static [u8] {
        match self {
            Role::Initiator => b"initiator",
            Role::Responder => b"responder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Negotiating,
    ExchangingKeys,
    VerifyingPeer,
    Authenticated,
    Failed,
}

impl AuthState {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Negotiating => "negotiating",
            AuthState::ExchangingKeys => "exchanging keys",
            AuthState::VerifyingPeer => "verifying peer",
            AuthState::Authenticated => "authenticated",
            AuthState::Failed => "failed",
        }
    }

    pub fn in_flight(self) -> bool {
        matches!(
            self,
            AuthState::Negotiating | AuthState::ExchangingKeys | AuthState::VerifyingPeer
        )
    }
}

/// What a successful handshake leaves behind.
pub struct Authenticated {
    pub mechanism: Mechanism,
    pub cipher: SessionCipher,
    /// The peer's long-term key, for [`Mechanism::EcdheEd25519`].
    pub peer_identity: Option<Ed25519PublicKey>,
}

impl core::fmt::Debug for Authenticated {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Authenticated")
            .field("mechanism", &self.mechanism)
            .field("peer_identity", &self.peer_identity)
            .finish_non_exhaustive()
    }
}

/// How to report a failure to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// A [`HandshakeMessage::Failed`].
    pub message: HandshakeMessage,
    /// The attempt budget is spent, or the failure is final.
    pub evict: bool,
}

/// Per-attempt secrets. Dropped, and thereby wiped, when the attempt ends.
struct Attempt {
    transcript: CryptoHash,
    ephemeral: X25519PrivateKey,
    mechanism: Option<Mechanism>,
    credentials: Credentials,
    shared: Option<Zeroizing<[u8; 32]>>,
    peer_identity: Option<Ed25519PublicKey>,
    /// Transcript snapshot after both key exchanges.
    confirm: Vec<u8>,
    master: Option<Zeroizing<Vec<u8>>>,
}

impl Attempt {
    fn new() -> Self {
        Self {
            transcript: CryptoHash::digest(HashAlgorithm::Sha256),
            ephemeral: X25519PrivateKey::generate(),
            mechanism: None,
            credentials: Credentials::default(),
            shared: None,
            peer_identity: None,
            confirm: Vec::new(),
            master: None,
        }
    }

    fn absorb(&mut self, msg: &HandshakeMessage) -> Result<(), AuthError> {
        self.transcript.update(&msg.transcript_bytes()?)?;
        Ok(())
    }

    fn snapshot(&mut self) -> Result<Vec<u8>, AuthError> {
        Ok(self.transcript.finish(true)?)
    }

    fn mechanism(&self, state: AuthState) -> Result<Mechanism, AuthError> {
        self.mechanism.ok_or(AuthError::UnexpectedMessage {
            state: state.as_str(),
            got: "key_exchange",
        })
    }

    /// Our key exchange message, signed for the Ed25519 mechanism.
    fn local_key_exchange(&mut self, state: AuthState) -> Result<HandshakeMessage, AuthError> {
        let mechanism = self.mechanism(state)?;
        let key_info = KeyInfo::new(KeyAlgorithm::X25519, self.ephemeral.public_key().to_bytes())
            .to_bytes()
            .to_vec();

        let (identity, signature) = if mechanism == Mechanism::EcdheEd25519 {
            let key = self
                .credentials
                .signing_key
                .clone()
                .ok_or(AuthError::MissingCredentials(mechanism))?;
            let mut signed = self.snapshot()?;
            signed.extend_from_slice(&key_info);
            (
                Some(key.public_key().to_bytes().to_vec()),
                Some(key.sign(&signed).to_bytes().to_vec()),
            )
        } else {
            (None, None)
        };

        let msg = HandshakeMessage::KeyExchange {
            key_info,
            identity,
            signature,
        };
        self.absorb(&msg)?;
        Ok(msg)
    }

    /// Check the peer's key exchange and compute the ECDH secret.
    fn accept_peer_keys(
        &mut self,
        msg: &HandshakeMessage,
        state: AuthState,
        listener: &dyn AuthListener,
        peer: &str,
    ) -> Result<(), AuthError> {
        let HandshakeMessage::KeyExchange {
            key_info,
            identity,
            signature,
        } = msg
        else {
            return Err(AuthError::UnexpectedMessage {
                state: state.as_str(),
                got: msg.kind(),
            });
        };
        let mechanism = self.mechanism(state)?;

        let info = KeyInfo::from_bytes(key_info).map_err(AuthError::InvalidKeyInfo)?;
        if info.algorithm != KeyAlgorithm::X25519 {
            return Err(AuthError::InvalidKeyInfo(CryptoError::InvalidLength {
                reason: "ephemeral key must be X25519",
            }));
        }
        info.verify_key_id().map_err(|_| AuthError::KeyIdMismatch)?;

        let identity = if mechanism == Mechanism::EcdheEd25519 {
            let (Some(identity), Some(signature)) = (identity, signature) else {
                return Err(AuthError::InvalidSignature);
            };
            let identity = Ed25519PublicKey::from_slice(identity).map_err(AuthError::InvalidKeyInfo)?;
            let signature =
                Ed25519Signature::from_slice(signature).map_err(|_| AuthError::InvalidSignature)?;
            let mut signed = self.snapshot()?;
            signed.extend_from_slice(key_info);
            identity
                .verify(&signed, &signature)
                .map_err(|_| AuthError::InvalidSignature)?;
            Some(identity)
        } else {
            None
        };

        if !listener.verify_credentials(mechanism, peer, identity.as_ref()) {
            return Err(AuthError::RejectedCredentials);
        }

        self.absorb(msg)?;
        self.peer_identity = identity;
        self.shared = Some(
            self.ephemeral
                .diffie_hellman(&X25519PublicKey::from_bytes(info.public_key)),
        );
        Ok(())
    }

    /// Derive the master secret once both key exchanges are in the transcript.
    fn derive_master(&mut self) -> Result<(), AuthError> {
        let Some(shared) = self.shared.as_ref() else {
            return Err(AuthError::ConfirmationMismatch);
        };
        let mut ikm = Zeroizing::new(shared.to_vec());
        if let Some(psk) = self.credentials.psk.as_ref() {
            ikm.extend_from_slice(psk);
        }
        self.confirm = self.snapshot()?;
        self.master = Some(hkdf(
            MASTER_SECRET_LEN,
            &ikm,
            Some(&self.confirm),
            Some(MASTER_SECRET_INFO),
        )?);
        Ok(())
    }

    fn master(&self) -> Result<&[u8], AuthError> {
        self.master
            .as_deref()
            .map(Vec::as_slice)
            .ok_or(AuthError::ConfirmationMismatch)
    }

    fn verifier(&self, role: Role) -> Result<Vec<u8>, AuthError> {
        let mut mac = CryptoHash::hmac(HashAlgorithm::Sha256, self.master()?)?;
        mac.update(&self.confirm)?;
        mac.update(role.label())?;
        Ok(mac.finish(false)?)
    }

    fn check_verifier(&self, role: Role, mac: &[u8]) -> Result<(), AuthError> {
        let mut covered = self.confirm.clone();
        covered.extend_from_slice(role.label());
        hmac_sha256_verify(self.master()?, &covered, mac).map_err(|_| AuthError::ConfirmationMismatch)
    }

    fn session_cipher(&self) -> Result<SessionCipher, AuthError> {
        let keys = hkdf(SESSION_KEYS_LEN, self.master()?, None, Some(SESSION_KEYS_INFO))?;
        Ok(SessionCipher::from_slice(&keys)?)
    }
}

fn current(attempt: &mut Option<Attempt>, state: AuthState) -> Result<&mut Attempt, AuthError> {
    attempt.as_mut().ok_or(AuthError::UnexpectedMessage {
        state: state.as_str(),
        got: "message",
    })
}

/// One side of the handshake for one connection.
///
/// A fresh attempt starts with every `Offer`. Failed attempts count against
/// `max_attempts`; see [`Handshake::fail`].
pub struct Handshake {
    role: Role,
    peer: String,
    /// Offered (initiator) or acceptable (responder) mechanisms, preferred first.
    mechanisms: Vec<Mechanism>,
    max_attempts: u32,
    listener: Arc<dyn AuthListener>,
    attempts: u32,
    state: AuthState,
    mechanism: Option<Mechanism>,
    current: Option<Attempt>,
    outcome: Option<Authenticated>,
}

impl Handshake {
    pub fn new(
        role: Role,
        peer: impl Into<String>,
        mechanisms: Vec<Mechanism>,
        max_attempts: u32,
        listener: Arc<dyn AuthListener>,
    ) -> Self {
        Self {
            role,
            peer: peer.into(),
            mechanisms,
            max_attempts: max_attempts.max(1),
            listener,
            attempts: 0,
            state: AuthState::Unauthenticated,
            mechanism: None,
            current: None,
            outcome: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Mechanism of the current or last attempt.
    pub fn mechanism(&self) -> Option<Mechanism> {
        self.mechanism
    }

    pub fn mechanisms(&self) -> &[Mechanism] {
        &self.mechanisms
    }

    /// Stop offering `mechanism` in later attempts.
    pub fn drop_mechanism(&mut self, mechanism: Mechanism) {
        self.mechanisms.retain(|m| *m != mechanism);
    }

    /// Start an attempt as initiator.
    pub fn offer(&mut self) -> Result<HandshakeMessage, AuthError> {
        if self.state.in_flight() {
            return Err(AuthError::Busy);
        }
        if self.mechanisms.is_empty() {
            return Err(AuthError::NoCommonMechanism);
        }
        let msg = HandshakeMessage::Offer {
            mechanisms: self.mechanisms.clone(),
        };
        let attempt = self.begin_attempt();
        attempt.absorb(&msg)?;
        self.transition(AuthState::Negotiating);
        Ok(msg)
    }

    /// Feed one message from the peer and return the replies, in order.
    ///
    /// Any error ends the current attempt; pass it to [`fail`](Self::fail) to
    /// learn what to tell the peer.
    pub fn receive(&mut self, msg: HandshakeMessage) -> Result<Vec<HandshakeMessage>, AuthError> {
        let result = self.step(msg);
        if result.is_err() {
            self.abort();
        }
        result
    }

    /// The outcome of a completed handshake. Yields it once.
    pub fn complete(&mut self) -> Option<Authenticated> {
        self.outcome.take()
    }

    /// End the current attempt because of `err` and decide what the peer is told.
    ///
    /// A peer's `Failed{retry: true}` spends an attempt like a local failure;
    /// `Failed{retry: false}` is final.
    pub fn fail(&mut self, err: &AuthError) -> FailureReport {
        self.abort();
        let evict = !err.is_retryable()
            || matches!(err, AuthError::Rejected { retry: false, .. })
            || self.attempts >= self.max_attempts;
        FailureReport {
            message: HandshakeMessage::Failed {
                reason: err.to_string(),
                retry: !evict,
            },
            evict,
        }
    }

    fn step(&mut self, msg: HandshakeMessage) -> Result<Vec<HandshakeMessage>, AuthError> {
        let state = self.state;
        match (self.role, state, msg) {
            (_, _, HandshakeMessage::Failed { reason, retry }) => {
                Err(AuthError::Rejected { reason, retry })
            }
            (Role::Initiator, _, HandshakeMessage::Busy) => Err(AuthError::Busy),

            (Role::Responder, AuthState::Unauthenticated | AuthState::Failed, offer @ HandshakeMessage::Offer { .. }) => {
                self.on_offer(offer)
            }
            (Role::Responder, _, HandshakeMessage::Offer { .. }) => Ok(vec![HandshakeMessage::Busy]),

            (Role::Initiator, AuthState::Negotiating, accept @ HandshakeMessage::Accept { .. }) => {
                self.on_accept(accept)
            }
            (Role::Initiator, AuthState::ExchangingKeys, kx @ HandshakeMessage::KeyExchange { .. }) => {
                let attempt = current(&mut self.current, state)?;
                attempt.accept_peer_keys(&kx, state, self.listener.as_ref(), &self.peer)?;
                let ours = attempt.local_key_exchange(state)?;
                attempt.derive_master()?;
                let mac = attempt.verifier(Role::Initiator)?;
                self.transition(AuthState::VerifyingPeer);
                Ok(vec![ours, HandshakeMessage::Verifier { mac }])
            }
            (Role::Responder, AuthState::ExchangingKeys, kx @ HandshakeMessage::KeyExchange { .. }) => {
                let attempt = current(&mut self.current, state)?;
                attempt.accept_peer_keys(&kx, state, self.listener.as_ref(), &self.peer)?;
                attempt.derive_master()?;
                self.transition(AuthState::VerifyingPeer);
                Ok(Vec::new())
            }
            (Role::Responder, AuthState::VerifyingPeer, HandshakeMessage::Verifier { mac }) => {
                let attempt = current(&mut self.current, state)?;
                attempt.check_verifier(Role::Initiator, &mac)?;
                let ours = attempt.verifier(Role::Responder)?;
                self.finish()?;
                Ok(vec![HandshakeMessage::Verifier { mac: ours }])
            }
            (Role::Initiator, AuthState::VerifyingPeer, HandshakeMessage::Verifier { mac }) => {
                current(&mut self.current, state)?.check_verifier(Role::Responder, &mac)?;
                self.finish()?;
                Ok(Vec::new())
            }

            (_, state, other) => Err(AuthError::UnexpectedMessage {
                state: state.as_str(),
                got: other.kind(),
            }),
        }
    }

    fn on_offer(&mut self, offer: HandshakeMessage) -> Result<Vec<HandshakeMessage>, AuthError> {
        let HandshakeMessage::Offer { mechanisms } = &offer else {
            return Err(AuthError::UnexpectedMessage {
                state: self.state.as_str(),
                got: offer.kind(),
            });
        };
        let supported: Vec<Mechanism> = mechanisms
            .iter()
            .copied()
            .filter(|m| self.mechanisms.contains(m))
            .collect();

        self.begin_attempt().absorb(&offer)?;
        self.transition(AuthState::Negotiating);
        let first = *supported.first().ok_or(AuthError::NoCommonMechanism)?;
        // The initiator's most preferred mechanism we hold credentials for.
        let (mechanism, credentials) = supported
            .iter()
            .find_map(|m| self.credentials_for(*m).ok().map(|c| (*m, c)))
            .ok_or(AuthError::MissingCredentials(first))?;

        let accept = HandshakeMessage::Accept { mechanism };
        let attempt = current(&mut self.current, AuthState::Negotiating)?;
        attempt.absorb(&accept)?;
        attempt.mechanism = Some(mechanism);
        attempt.credentials = credentials;
        let ours = attempt.local_key_exchange(AuthState::Negotiating)?;
        self.mechanism = Some(mechanism);
        self.transition(AuthState::ExchangingKeys);
        Ok(vec![accept, ours])
    }

    fn on_accept(&mut self, accept: HandshakeMessage) -> Result<Vec<HandshakeMessage>, AuthError> {
        let HandshakeMessage::Accept { mechanism } = accept else {
            return Err(AuthError::UnexpectedMessage {
                state: self.state.as_str(),
                got: accept.kind(),
            });
        };
        if !self.mechanisms.contains(&mechanism) {
            return Err(AuthError::UnsupportedMechanism(mechanism));
        }
        let credentials = self.credentials_for(mechanism)?;
        let attempt = current(&mut self.current, AuthState::Negotiating)?;
        attempt.absorb(&accept)?;
        attempt.mechanism = Some(mechanism);
        attempt.credentials = credentials;
        self.mechanism = Some(mechanism);
        self.transition(AuthState::ExchangingKeys);
        Ok(Vec::new())
    }

    fn credentials_for(&self, mechanism: Mechanism) -> Result<Credentials, AuthError> {
        if mechanism == Mechanism::EcdheNull {
            return Ok(Credentials::default());
        }
        self.listener
            .request_credentials(mechanism, &self.peer, self.attempts)
            .filter(|c| c.suffice_for(mechanism))
            .ok_or(AuthError::MissingCredentials(mechanism))
    }

    fn begin_attempt(&mut self) -> &mut Attempt {
        self.attempts += 1;
        self.mechanism = None;
        self.outcome = None;
        self.current.insert(Attempt::new())
    }

    fn finish(&mut self) -> Result<(), AuthError> {
        let Some(attempt) = self.current.take() else {
            return Err(AuthError::ConfirmationMismatch);
        };
        let mechanism = attempt.mechanism(self.state)?;
        let cipher = attempt.session_cipher()?;
        self.outcome = Some(Authenticated {
            mechanism,
            cipher,
            peer_identity: attempt.peer_identity,
        });
        self.transition(AuthState::Authenticated);
        self.listener.authentication_complete(mechanism, &self.peer, true);
        Ok(())
    }

    fn abort(&mut self) {
        if self.state == AuthState::Failed {
            return;
        }
        if let Some(mechanism) = self.current.take().and_then(|a| a.mechanism) {
            self.listener.authentication_complete(mechanism, &self.peer, false);
        }
        self.transition(AuthState::Failed);
    }

    fn transition(&mut self, to: AuthState) {
        debug!(peer = %self.peer, role = ?self.role, from = self.state.as_str(), to = to.as_str(), "handshake state");
        self.state = to;
    }
}
