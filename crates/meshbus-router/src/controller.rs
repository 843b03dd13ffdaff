//! The bus controller: serves the control-plane methods addressed to the bus.
//!
//! Each method decodes its arguments, calls the matching router operation and
//! encodes the result. Failures become error replies named after
//! [`RouterError::error_name`].

use std::sync::Arc;

use meshbus_core::bus::{
    BUS_INTERFACE, BindSessionPortArgs, BoolReply, JoinSessionArgs, JoinSessionReply,
    MatchRuleArgs, NameArgs, NameListReply, NameOwnerReply, ReleaseNameCode, ReleaseNameReply,
    RequestNameArgs, RequestNameCode, RequestNameReply, SessionIdArgs, SessionMemberArgs,
    SessionPortArgs, UniqueNameListReply, WellKnownNameArgs, error_names, member,
};
use meshbus_core::{BusName, Message, UniqueName};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{RouterError, SessionError};
use crate::names::{ClaimFlags, ClaimOutcome, ReleaseOutcome};
use crate::router::RouterInner;

impl RouterInner {
    pub(crate) async fn handle_bus_call(self: &Arc<Self>, from: &Arc<Endpoint>, call: Message) {
        if call.interface.as_deref().is_some_and(|i| i != BUS_INTERFACE) {
            self.reply_unknown_method(from, &call);
            return;
        }
        let method = call.member.clone().unwrap_or_default();
        debug!(endpoint = %from.name(), method = %method, "bus call");

        let caller = from.name();
        let result = match method.as_str() {
            member::REQUEST_NAME => self.bus_request_name(caller, &call),
            member::RELEASE_NAME => self.bus_release_name(caller, &call),
            member::GET_NAME_OWNER => self.bus_get_name_owner(&call),
            member::NAME_HAS_OWNER => self.bus_name_has_owner(&call),
            member::LIST_NAMES => self
                .bus_reply(&call)
                .with_args(&NameListReply {
                    names: self.list_names(),
                })
                .map_err(RouterError::from),
            member::LIST_QUEUED_OWNERS => self.bus_list_queued_owners(&call),
            member::ADD_MATCH => call
                .args::<MatchRuleArgs>()
                .map_err(RouterError::from)
                .and_then(|args| self.add_match(caller, &args.rule))
                .map(|()| self.bus_reply(&call)),
            member::REMOVE_MATCH => call
                .args::<MatchRuleArgs>()
                .map_err(RouterError::from)
                .and_then(|args| self.remove_match(caller, &args.rule))
                .map(|()| self.bus_reply(&call)),
            member::BIND_SESSION_PORT => self.bus_bind_session_port(caller, &call),
            member::UNBIND_SESSION_PORT => call
                .args::<SessionPortArgs>()
                .map_err(RouterError::from)
                .and_then(|args| self.unbind_session_port(caller, args.port))
                .map(|()| self.bus_reply(&call)),
            member::JOIN_SESSION => {
                self.spawn_join(from, call).await;
                return;
            }
            member::LEAVE_SESSION => call
                .args::<SessionIdArgs>()
                .map_err(RouterError::from)
                .and_then(|args| self.leave_session(caller, args.session_id))
                .map(|()| self.bus_reply(&call)),
            member::REMOVE_SESSION_MEMBER => call
                .args::<SessionMemberArgs>()
                .map_err(RouterError::from)
                .and_then(|args| self.remove_session_member(caller, args.session_id, &args.member))
                .map(|()| self.bus_reply(&call)),
            member::GET_SESSION_MEMBERS => self.bus_get_session_members(caller, &call),
            member::PING => self.bus_ping(&call),
            _ => {
                self.reply_unknown_method(from, &call);
                return;
            }
        };
        self.send_result(from, &call, result);
    }

    pub(crate) fn send_result(&self, to: &Endpoint, call: &Message, result: Result<Message, RouterError>) {
        match result {
            Ok(reply) => {
                if call.expects_reply() {
                    to.send_message(reply);
                }
            }
            Err(e) => {
                debug!(endpoint = %to.name(), call = %call.describe(), error = %e, "bus call failed");
                self.reply_error(to, call, &e);
            }
        }
    }

    fn reply_unknown_method(&self, to: &Endpoint, call: &Message) {
        let err = RouterError::ErrorReply {
            name: error_names::UNKNOWN_METHOD.to_owned(),
            text: format!("no method {}", call.describe()),
        };
        self.reply_error(to, call, &err);
    }

    fn bus_request_name(&self, caller: &UniqueName, call: &Message) -> Result<Message, RouterError> {
        let args: RequestNameArgs = call.args()?;
        let code = match self.claim_name(caller, &args.name, ClaimFlags::from_bits(args.flags))? {
            ClaimOutcome::Owner => RequestNameCode::PrimaryOwner,
            ClaimOutcome::AlreadyOwner => RequestNameCode::AlreadyOwner,
            ClaimOutcome::Queued => RequestNameCode::InQueue,
            ClaimOutcome::Rejected => RequestNameCode::Exists,
        };
        Ok(self.bus_reply(call).with_args(&RequestNameReply { code })?)
    }

    fn bus_release_name(&self, caller: &UniqueName, call: &Message) -> Result<Message, RouterError> {
        let args: WellKnownNameArgs = call.args()?;
        let code = match self.release_name(caller, &args.name) {
            ReleaseOutcome::Released => ReleaseNameCode::Released,
            ReleaseOutcome::NonExistent => ReleaseNameCode::NonExistent,
            ReleaseOutcome::NotOwner => ReleaseNameCode::NotOwner,
        };
        Ok(self.bus_reply(call).with_args(&ReleaseNameReply { code })?)
    }

    fn bus_get_name_owner(&self, call: &Message) -> Result<Message, RouterError> {
        let args: NameArgs = call.args()?;
        match self.resolve_name(&args.name) {
            Some(owner) => Ok(self.bus_reply(call).with_args(&NameOwnerReply { owner })?),
            None => Err(RouterError::ErrorReply {
                name: error_names::NAME_HAS_NO_OWNER.to_owned(),
                text: format!("{} has no owner", args.name),
            }),
        }
    }

    fn bus_name_has_owner(&self, call: &Message) -> Result<Message, RouterError> {
        let args: NameArgs = call.args()?;
        let value = self.resolve_name(&args.name).is_some();
        Ok(self.bus_reply(call).with_args(&BoolReply { value })?)
    }

    fn bus_list_queued_owners(&self, call: &Message) -> Result<Message, RouterError> {
        let args: NameArgs = call.args()?;
        let names = match &args.name {
            BusName::WellKnown(name) => self.queued_owners(name),
            BusName::Unique(_) => self.resolve_name(&args.name).into_iter().collect(),
        };
        Ok(self.bus_reply(call).with_args(&UniqueNameListReply { names })?)
    }

    fn bus_bind_session_port(&self, caller: &UniqueName, call: &Message) -> Result<Message, RouterError> {
        let args: BindSessionPortArgs = call.args()?;
        let port = self.bind_session_port(caller, args.port, args.opts)?;
        Ok(self.bus_reply(call).with_args(&SessionPortArgs { port })?)
    }

    fn bus_get_session_members(&self, caller: &UniqueName, call: &Message) -> Result<Message, RouterError> {
        let args: SessionIdArgs = call.args()?;
        let names = self.session_members(args.session_id)?;
        if !names.contains(caller) {
            return Err(SessionError::NoSuchSession(args.session_id).into());
        }
        Ok(self.bus_reply(call).with_args(&UniqueNameListReply { names })?)
    }

    fn bus_ping(&self, call: &Message) -> Result<Message, RouterError> {
        let args: NameArgs = call.args()?;
        match self.resolve_name(&args.name) {
            Some(_) => Ok(self.bus_reply(call)),
            None => Err(RouterError::ServiceUnknown(args.name)),
        }
    }

    /// `JoinSession` waits on the host, so it runs as its own task.
    async fn spawn_join(self: &Arc<Self>, from: &Arc<Endpoint>, call: Message) {
        let inner = Arc::clone(self);
        let from = Arc::clone(from);
        let handle = tokio::spawn(async move {
            let result = match call.args::<JoinSessionArgs>() {
                Ok(args) => inner
                    .request_join(from.name(), &args.host, args.port, args.opts)
                    .await
                    .and_then(|(session_id, opts)| {
                        Ok(inner
                            .bus_reply(&call)
                            .with_args(&JoinSessionReply { session_id, opts })?)
                    }),
                Err(e) => Err(e.into()),
            };
            inner.send_result(&from, &call, result);
        });
        self.shutdown.add_task(handle).await;
    }
}
