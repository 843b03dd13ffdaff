//! Router error types.

use meshbus_core::bus::error_names;
use meshbus_core::session_opts::Incompatible;
use meshbus_core::{BusName, CoreError, Mechanism, SessionId, SessionPort, UniqueName};
use meshbus_crypto::CryptoError;
use meshbus_transport::TransportError;

/// Handshake failures. All of them count against the endpoint's attempt budget.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no mutually supported mechanism")]
    NoCommonMechanism,

    #[error("mechanism {0} is not enabled")]
    UnsupportedMechanism(Mechanism),

    #[error("key info invalid: {0}")]
    InvalidKeyInfo(CryptoError),

    #[error("authority key id does not match public key")]
    KeyIdMismatch,

    #[error("key confirmation mismatch")]
    ConfirmationMismatch,

    #[error("no credentials available for {0}")]
    MissingCredentials(Mechanism),

    #[error("peer credentials rejected")]
    RejectedCredentials,

    #[error("identity signature invalid")]
    InvalidSignature,

    #[error("unexpected {got} while {state}")]
    UnexpectedMessage {
        state: &'static str,
        got: &'static str,
    },

    #[error("peer rejected the handshake: {reason}")]
    Rejected { reason: String, retry: bool },

    #[error("handshake already in progress")]
    Busy,

    #[error("handshake timed out")]
    Timeout,

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("encoding error: {0}")]
    Core(#[from] CoreError),
}

impl AuthError {
    /// Whether the peer may try again with another offer, budget permitting.
    ///
    /// Timeouts end the connection regardless of the remaining budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AuthError::Timeout)
    }

    /// The chosen mechanism itself cannot work with these credentials, so a
    /// retry should offer the others.
    pub fn rules_out_mechanism(&self) -> bool {
        matches!(
            self,
            AuthError::UnsupportedMechanism(_)
                | AuthError::MissingCredentials(_)
                | AuthError::RejectedCredentials
                | AuthError::InvalidSignature
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("port {0} is already bound")]
    PortInUse(SessionPort),

    #[error("no free session port")]
    PortsExhausted,

    #[error("{host} has not bound port {port}")]
    NoSuchPort { host: UniqueName, port: SessionPort },

    #[error("no such session {0}")]
    NoSuchSession(SessionId),

    #[error("{0} is not a participant of that session")]
    NotParticipant(UniqueName),

    #[error("only the host may do that")]
    NotHost,

    #[error("already joined session {0}")]
    AlreadyJoined(SessionId),

    #[error("cannot join a session hosted by yourself")]
    SelfJoin,

    #[error("session {0} is point-to-point")]
    NotMultipoint(SessionId),

    #[error("incompatible session options: {0}")]
    Incompatible(Incompatible),

    #[error("host rejected the join")]
    Rejected,

    #[error("session ids exhausted")]
    IdsExhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("router is not running")]
    Stopped,

    #[error("limit exceeded: {0}")]
    LimitsExceeded(&'static str),

    #[error("unknown endpoint {0}")]
    UnknownEndpoint(UniqueName),

    #[error("{0} has no owner")]
    ServiceUnknown(BusName),

    #[error("the name {0} is reserved")]
    ReservedName(String),

    #[error("invalid match rule: {0}")]
    InvalidMatchRule(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("cancelled by router shutdown")]
    Cancelled,

    /// An error reply from the bus or a peer.
    #[error("{name}: {text}")]
    ErrorReply { name: String, text: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl RouterError {
    /// Well-known error name used when this error is reported in a reply.
    pub fn error_name(&self) -> &str {
        match self {
            RouterError::ErrorReply { name, .. } => name.as_str(),
            RouterError::Stopped | RouterError::Cancelled => error_names::CANCELLED,
            RouterError::LimitsExceeded(_) => error_names::LIMITS_EXCEEDED,
            RouterError::UnknownEndpoint(_) | RouterError::ServiceUnknown(_) => {
                error_names::SERVICE_UNKNOWN
            }
            RouterError::ReservedName(_) => error_names::ACCESS_DENIED,
            RouterError::InvalidMatchRule(_) | RouterError::Core(_) => error_names::INVALID_ARGS,
            RouterError::Timeout(_) => error_names::TIMEOUT,
            RouterError::Auth(_) => error_names::NOT_AUTHENTICATED,
            RouterError::Transport(_) => error_names::SERVICE_UNKNOWN,
            RouterError::Session(e) => match e {
                SessionError::PortInUse(_) => error_names::PORT_IN_USE,
                SessionError::PortsExhausted | SessionError::IdsExhausted => {
                    error_names::LIMITS_EXCEEDED
                }
                SessionError::NoSuchPort { .. } => error_names::NO_SUCH_PORT,
                SessionError::NoSuchSession(_) | SessionError::NotParticipant(_) => {
                    error_names::NO_SUCH_SESSION
                }
                SessionError::NotHost => error_names::ACCESS_DENIED,
                SessionError::AlreadyJoined(_) => error_names::ALREADY_JOINED,
                SessionError::SelfJoin
                | SessionError::NotMultipoint(_)
                | SessionError::Incompatible(_) => {
                    error_names::BAD_SESSION_OPTS
                }
                SessionError::Rejected => error_names::SESSION_REJECTED,
            },
        }
    }
}
