//! Frames exchanged between a connection and the router.
//!
//! Before authentication only [`Frame::Handshake`] is meaningful. Afterwards
//! every message travels as [`Frame::Sealed`] (encrypted and authenticated)
//! or [`Frame::Signed`] (authenticated only), depending on router config. A
//! plain [`Frame::Message`] is never routed; it exists so that an
//! unauthenticated peer can be told why it was refused.
//!
//! Frames are MessagePack with named fields. Transports add their own
//! length prefix.

use meshbus_crypto::SessionCipher;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::mechanism::Mechanism;
use crate::message::Message;
use crate::types::UniqueName;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    /// Initiator's mechanisms, most preferred first.
    Offer { mechanisms: Vec<Mechanism> },
    Accept { mechanism: Mechanism },
    /// Encoded [`meshbus_crypto::KeyInfo`] of the ephemeral key, plus the
    /// long-term identity and its signature for the Ed25519 mechanism.
    KeyExchange {
        key_info: Vec<u8>,
        identity: Option<Vec<u8>>,
        signature: Option<Vec<u8>>,
    },
    /// Key-confirmation MAC over the transcript.
    Verifier { mac: Vec<u8> },
    /// Sent by the router once the peer is trusted.
    Welcome { unique_name: UniqueName },
    Failed { reason: String, retry: bool },
    /// A handshake is already in flight on this connection.
    Busy,
}

impl HandshakeMessage {
    /// Canonical bytes absorbed into the handshake transcript.
    pub fn transcript_bytes(&self) -> Result<Vec<u8>, CoreError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeMessage::Offer { .. } => "offer",
            HandshakeMessage::Accept { .. } => "accept",
            HandshakeMessage::KeyExchange { .. } => "key_exchange",
            HandshakeMessage::Verifier { .. } => "verifier",
            HandshakeMessage::Welcome { .. } => "welcome",
            HandshakeMessage::Failed { .. } => "failed",
            HandshakeMessage::Busy => "busy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Handshake(HandshakeMessage),
    Message(Message),
    Sealed(Vec<u8>),
    Signed(Vec<u8>),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Wrap a message for an authenticated connection.
    pub fn protect(message: &Message, cipher: &SessionCipher, encrypt: bool) -> Result<Self, CoreError> {
        let plain = rmp_serde::to_vec_named(message)?;
        Ok(if encrypt {
            Frame::Sealed(cipher.seal(&plain))
        } else {
            Frame::Signed(cipher.sign(&plain))
        })
    }

    /// Verify (and decrypt) a protected frame back into a message.
    pub fn unprotect(&self, cipher: &SessionCipher) -> Result<Message, CoreError> {
        let plain = match self {
            Frame::Sealed(bytes) => cipher.open(bytes)?,
            Frame::Signed(bytes) => cipher.verify(bytes)?,
            _ => return Err(CoreError::InvalidMessage("frame is not protected")),
        };
        Ok(rmp_serde::from_slice(&plain)?)
    }
}
