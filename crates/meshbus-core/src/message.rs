//! The message envelope.
//!
//! The router only looks at the header fields. Bodies are opaque bytes
//! tagged with a signature string; the control plane's bodies are MessagePack
//! encodings of the types in [`crate::bus`].

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::bus::BusArgs;
use crate::error::CoreError;
use crate::types::{BusName, Serial, SessionId, UniqueName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageFlags(pub u8);

impl MessageFlags {
    pub const NO_REPLY_EXPECTED: MessageFlags = MessageFlags(0x01);
    /// Signal delivered to every matching subscriber regardless of sessions.
    pub const SESSIONLESS: MessageFlags = MessageFlags(0x02);
    pub const GLOBAL_BROADCAST: MessageFlags = MessageFlags(0x04);

    pub const fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | other.0)
    }
}

impl fmt::Debug for MessageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageFlags({:#04x})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub flags: MessageFlags,
    pub serial: Serial,
    /// Serial of the call this message answers (returns and errors only).
    pub reply_serial: Option<Serial>,
    /// Always overwritten by the router with the sending connection's name.
    pub sender: Option<UniqueName>,
    pub destination: Option<BusName>,
    pub session_id: SessionId,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub signature: String,
    pub body: Vec<u8>,
}

impl Message {
    fn empty(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            flags: MessageFlags::default(),
            serial: Serial::NONE,
            reply_serial: None,
            sender: None,
            destination: None,
            session_id: SessionId::NONE,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            signature: String::new(),
            body: Vec::new(),
        }
    }

    pub fn method_call(
        destination: impl Into<BusName>,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Self {
        Self {
            destination: Some(destination.into()),
            path: Some(path.to_owned()),
            interface: Some(interface.to_owned()),
            member: Some(member.to_owned()),
            ..Self::empty(MessageType::MethodCall)
        }
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self {
            path: Some(path.to_owned()),
            interface: Some(interface.to_owned()),
            member: Some(member.to_owned()),
            ..Self::empty(MessageType::Signal)
        }
    }

    /// A successful reply to `call`, addressed back to its sender.
    pub fn method_return(call: &Message) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone().map(BusName::Unique),
            session_id: call.session_id,
            ..Self::empty(MessageType::MethodReturn)
        }
    }

    /// An error reply to `call`. The text goes in the body as a plain string.
    pub fn error_reply(call: &Message, error_name: &str, text: &str) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone().map(BusName::Unique),
            session_id: call.session_id,
            error_name: Some(error_name.to_owned()),
            signature: "s".to_owned(),
            body: text.as_bytes().to_vec(),
            ..Self::empty(MessageType::Error)
        }
    }

    pub fn with_destination(mut self, destination: impl Into<BusName>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = self.flags.with(flags);
        self
    }

    pub fn with_body(mut self, signature: &str, body: Vec<u8>) -> Self {
        self.signature = signature.to_owned();
        self.body = body;
        self
    }

    /// Encode typed control-plane arguments into the body.
    pub fn with_args<T: BusArgs>(mut self, args: &T) -> Result<Self, CoreError> {
        self.signature = T::SIGNATURE.to_owned();
        self.body = rmp_serde::to_vec_named(args)?;
        Ok(self)
    }

    /// Decode the body as typed control-plane arguments.
    pub fn args<T: BusArgs>(&self) -> Result<T, CoreError> {
        if self.signature != T::SIGNATURE {
            return Err(CoreError::SignatureMismatch {
                expected: T::SIGNATURE,
                actual: self.signature.clone(),
            });
        }
        Ok(rmp_serde::from_slice(&self.body)?)
    }

    /// The error text of an error reply, if the body carries one.
    pub fn error_text(&self) -> Option<&str> {
        if self.msg_type != MessageType::Error || self.signature != "s" {
            return None;
        }
        core::str::from_utf8(&self.body).ok()
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.msg_type, MessageType::MethodReturn | MessageType::Error)
    }

    pub fn expects_reply(&self) -> bool {
        self.msg_type == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    /// `interface.member`, for logging.
    pub fn describe(&self) -> String {
        match (&self.interface, &self.member) {
            (Some(i), Some(m)) => format!("{i}.{m}"),
            (None, Some(m)) => m.clone(),
            _ => self
                .error_name
                .clone()
                .unwrap_or_else(|| format!("{:?}", self.msg_type)),
        }
    }

    /// Sanity checks every message must pass before routing.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self.msg_type {
            MessageType::MethodCall => {
                if self.serial == Serial::NONE {
                    return Err(CoreError::InvalidMessage("method call without serial"));
                }
                if self.member.is_none() {
                    return Err(CoreError::InvalidMessage("method call without member"));
                }
                if self.destination.is_none() {
                    return Err(CoreError::InvalidMessage("method call without destination"));
                }
            }
            MessageType::MethodReturn | MessageType::Error => {
                if self.reply_serial.is_none_or(|s| s == Serial::NONE) {
                    return Err(CoreError::InvalidMessage("reply without reply serial"));
                }
                if self.msg_type == MessageType::Error && self.error_name.is_none() {
                    return Err(CoreError::InvalidMessage("error without error name"));
                }
            }
            MessageType::Signal => {
                if self.interface.is_none() || self.member.is_none() {
                    return Err(CoreError::InvalidMessage("signal without interface or member"));
                }
            }
        }
        Ok(())
    }
}
