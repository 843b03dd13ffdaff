//! The bus control plane: well-known names, members, error names and the
//! argument types carried in control-plane message bodies.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::session_opts::SessionOpts;
use crate::types::{BusName, SessionId, SessionPort, UniqueName, WellKnownName};

/// Name the router itself answers to.
pub const BUS_NAME: &str = "org.meshbus.Bus";
pub const BUS_PATH: &str = "/org/meshbus/Bus";
pub const BUS_INTERFACE: &str = "org.meshbus.Bus";
/// Interface of the `AcceptSession` call the router makes to session hosts.
pub const SESSION_HOST_INTERFACE: &str = "org.meshbus.SessionHost";

pub mod member {
    pub const REQUEST_NAME: &str = "RequestName";
    pub const RELEASE_NAME: &str = "ReleaseName";
    pub const GET_NAME_OWNER: &str = "GetNameOwner";
    pub const NAME_HAS_OWNER: &str = "NameHasOwner";
    pub const LIST_NAMES: &str = "ListNames";
    pub const LIST_QUEUED_OWNERS: &str = "ListQueuedOwners";
    pub const ADD_MATCH: &str = "AddMatch";
    pub const REMOVE_MATCH: &str = "RemoveMatch";
    pub const BIND_SESSION_PORT: &str = "BindSessionPort";
    pub const UNBIND_SESSION_PORT: &str = "UnbindSessionPort";
    pub const JOIN_SESSION: &str = "JoinSession";
    pub const LEAVE_SESSION: &str = "LeaveSession";
    pub const REMOVE_SESSION_MEMBER: &str = "RemoveSessionMember";
    pub const GET_SESSION_MEMBERS: &str = "GetSessionMembers";
    pub const PING: &str = "Ping";

    pub const ACCEPT_SESSION: &str = "AcceptSession";

    pub const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";
    pub const NAME_LOST: &str = "NameLost";
    pub const NAME_ACQUIRED: &str = "NameAcquired";
    pub const SESSION_JOINED: &str = "SessionJoined";
    pub const SESSION_LOST: &str = "SessionLost";
    pub const SESSION_MEMBER_ADDED: &str = "SessionMemberAdded";
    pub const SESSION_MEMBER_REMOVED: &str = "SessionMemberRemoved";
}

pub mod error_names {
    pub const SERVICE_UNKNOWN: &str = "org.meshbus.Error.ServiceUnknown";
    pub const NAME_HAS_NO_OWNER: &str = "org.meshbus.Error.NameHasNoOwner";
    pub const NO_SUCH_SESSION: &str = "org.meshbus.Error.NoSuchSession";
    pub const TIMEOUT: &str = "org.meshbus.Error.Timeout";
    pub const NOT_AUTHENTICATED: &str = "org.meshbus.Error.NotAuthenticated";
    pub const CANCELLED: &str = "org.meshbus.Error.Cancelled";
    pub const INVALID_ARGS: &str = "org.meshbus.Error.InvalidArgs";
    pub const UNKNOWN_METHOD: &str = "org.meshbus.Error.UnknownMethod";
    pub const ACCESS_DENIED: &str = "org.meshbus.Error.AccessDenied";
    pub const LIMITS_EXCEEDED: &str = "org.meshbus.Error.LimitsExceeded";
    pub const PORT_IN_USE: &str = "org.meshbus.Error.PortInUse";
    pub const NO_SUCH_PORT: &str = "org.meshbus.Error.NoSuchPort";
    pub const SESSION_REJECTED: &str = "org.meshbus.Error.SessionRejected";
    pub const BAD_SESSION_OPTS: &str = "org.meshbus.Error.BadSessionOpts";
    pub const ALREADY_JOINED: &str = "org.meshbus.Error.AlreadyJoined";
}

/// `RequestName` flag bits.
pub mod name_flags {
    pub const ALLOW_REPLACEMENT: u32 = 0x01;
    pub const REPLACE_EXISTING: u32 = 0x02;
    pub const DO_NOT_QUEUE: u32 = 0x04;
}

/// A typed message body together with its signature string.
pub trait BusArgs: Serialize + DeserializeOwned {
    const SIGNATURE: &'static str;
}

macro_rules! bus_args {
    ($($ty:ident => $sig:literal,)*) => {
        $(impl BusArgs for $ty {
            const SIGNATURE: &'static str = $sig;
        })*
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestNameArgs {
    pub name: WellKnownName,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestNameCode {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestNameReply {
    pub code: RequestNameCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseNameCode {
    Released,
    NonExistent,
    NotOwner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseNameReply {
    pub code: ReleaseNameCode,
}

/// Body of `ReleaseName`, `NameLost` and `NameAcquired`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WellKnownNameArgs {
    pub name: WellKnownName,
}

/// Body of `GetNameOwner`, `NameHasOwner`, `ListQueuedOwners` and `Ping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameArgs {
    pub name: BusName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameOwnerReply {
    pub owner: UniqueName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolReply {
    pub value: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameListReply {
    pub names: Vec<BusName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRuleArgs {
    pub rule: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindSessionPortArgs {
    pub port: SessionPort,
    pub opts: SessionOpts,
}

/// Body of `BindSessionPort` replies and of `UnbindSessionPort`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPortArgs {
    pub port: SessionPort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSessionArgs {
    pub host: BusName,
    pub port: SessionPort,
    pub opts: SessionOpts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSessionReply {
    pub session_id: SessionId,
    pub opts: SessionOpts,
}

/// Body of `LeaveSession` and `GetSessionMembers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdArgs {
    pub session_id: SessionId,
}

/// Body of `RemoveSessionMember`, `SessionMemberAdded` and `SessionMemberRemoved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMemberArgs {
    pub session_id: SessionId,
    pub member: UniqueName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptSessionArgs {
    pub port: SessionPort,
    pub session_id: SessionId,
    pub joiner: UniqueName,
    pub opts: SessionOpts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameOwnerChangedArgs {
    pub name: WellKnownName,
    pub old_owner: Option<UniqueName>,
    pub new_owner: Option<UniqueName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionLostReason {
    /// The other side left voluntarily.
    RemoteEndLeft,
    /// The other side's connection went away.
    RemoteEndClosedAbruptly,
    RemovedByHost,
    /// The host left and the session could not continue without it.
    HostDeparted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLostArgs {
    pub session_id: SessionId,
    pub reason: SessionLostReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionJoinedArgs {
    pub port: SessionPort,
    pub session_id: SessionId,
    pub joiner: UniqueName,
}

/// Body of `GetSessionMembers` replies and `ListQueuedOwners` replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueNameListReply {
    pub names: Vec<UniqueName>,
}

bus_args! {
    RequestNameArgs => "su",
    RequestNameReply => "u",
    ReleaseNameReply => "u",
    WellKnownNameArgs => "s",
    NameArgs => "s",
    NameOwnerReply => "s",
    BoolReply => "b",
    NameListReply => "as",
    MatchRuleArgs => "s",
    BindSessionPortArgs => "qa{sv}",
    SessionPortArgs => "q",
    JoinSessionArgs => "sqa{sv}",
    JoinSessionReply => "ua{sv}",
    SessionIdArgs => "u",
    SessionMemberArgs => "us",
    AcceptSessionArgs => "qusa{sv}",
    NameOwnerChangedArgs => "sss",
    SessionLostArgs => "uu",
    SessionJoinedArgs => "qus",
    UniqueNameListReply => "as",
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::types::RouterGuid;

    #[test]
    fn bus_name_is_a_valid_well_known_name() {
        assert!(BUS_NAME.parse::<WellKnownName>().is_ok());
    }

    #[test]
    fn optional_owners_survive_encoding() {
        let args = NameOwnerChangedArgs {
            name: "svc.example".parse().unwrap(),
            old_owner: Some(UniqueName::new(&RouterGuid::new([2; 16]), 1)),
            new_owner: None,
        };
        let msg = Message::signal(BUS_PATH, BUS_INTERFACE, member::NAME_OWNER_CHANGED)
            .with_args(&args)
            .unwrap();
        assert_eq!(msg.args::<NameOwnerChangedArgs>().unwrap(), args);
    }

    #[test]
    fn join_args_carry_options() {
        let args = JoinSessionArgs {
            host: "svc.example".parse().unwrap(),
            port: SessionPort(25),
            opts: SessionOpts::default().multipoint(),
        };
        let bytes = rmp_serde::to_vec_named(&args).unwrap();
        let decoded: JoinSessionArgs = rmp_serde::from_slice(&bytes).unwrap();
        assert!(decoded.opts.multipoint);
        assert_eq!(decoded.port, SessionPort(25));
    }

    #[test]
    fn invalid_names_fail_to_decode() {
        #[derive(Serialize)]
        struct Raw {
            name: &'static str,
            flags: u32,
        }
        let bytes = rmp_serde::to_vec_named(&Raw {
            name: "no-dots",
            flags: 0,
        })
        .unwrap();
        assert!(rmp_serde::from_slice::<RequestNameArgs>(&bytes).is_err());
    }
}
