//! Message dispatch.
//!
//! Every message an authenticated endpoint sends comes through
//! [`RouterInner::route`]. The sender field is overwritten with the sending
//! endpoint's unique name before anything else looks at the message.
//!
//! - Calls go to the bus controller when addressed to the bus, otherwise to
//!   the destination's owner, and are recorded until answered or expired.
//! - Replies are forwarded only when they answer a pending call and come from
//!   the endpoint that call was routed to.
//! - Signals with a destination are unicast, signals with a session id go to
//!   the other participants, and the rest go to every endpoint with a
//!   matching rule.
//!
//! Notifications the router synthesises itself (name ownership, session
//! membership) are enqueued here too, while the table that produced them is
//! still locked.

pub mod match_rule;
pub mod pending;

use std::sync::Arc;

use meshbus_core::bus::{
    BUS_INTERFACE, BUS_NAME, BUS_PATH, BusArgs, NameOwnerChangedArgs, SessionLostArgs,
    SessionMemberArgs, WellKnownNameArgs, member,
};
use meshbus_core::{BusName, Message, MessageFlags, MessageType, UniqueName};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub use match_rule::MatchRule;
pub use pending::{PendingCall, PendingCalls, ReplyWaiters};

use crate::endpoint::Endpoint;
use crate::error::{RouterError, SessionError};
use crate::listener::BusEvent;
use crate::names::NameEvent;
use crate::router::{RouterInner, lock};
use crate::session::{SessionChange, SessionEvent, SessionTable};

impl RouterInner {
    pub(crate) async fn route(self: &Arc<Self>, from: &Arc<Endpoint>, mut msg: Message) {
        if !from.is_live() {
            return;
        }
        msg.sender = Some(from.name().clone());
        if let Err(e) = msg.validate() {
            warn!(endpoint = %from.name(), error = %e, "dropping malformed message");
            if msg.msg_type == MessageType::MethodCall && msg.serial != meshbus_core::Serial::NONE {
                self.reply_error(from, &msg, &RouterError::Core(e));
            }
            return;
        }
        trace!(endpoint = %from.name(), kind = ?msg.msg_type, what = %msg.describe(), "routing");

        match msg.msg_type {
            MessageType::MethodCall => self.route_call(from, msg).await,
            MessageType::MethodReturn | MessageType::Error => self.route_reply(from, msg),
            MessageType::Signal => self.route_signal(from, msg),
        }
    }

    async fn route_call(self: &Arc<Self>, from: &Arc<Endpoint>, msg: Message) {
        let Some(destination) = msg.destination.clone() else {
            return;
        };
        if self.is_bus(&destination) {
            self.handle_bus_call(from, msg).await;
            return;
        }

        let Some(target) = self.resolve_endpoint(&destination) else {
            debug!(endpoint = %from.name(), destination = %destination, "call to unknown destination");
            self.reply_error(from, &msg, &RouterError::ServiceUnknown(destination));
            return;
        };
        if !self.shares_session(&msg, from.name(), target.name()) {
            let err = SessionError::NoSuchSession(msg.session_id);
            self.reply_error(from, &msg, &RouterError::from(err));
            return;
        }

        if msg.expects_reply() {
            let deadline = Instant::now() + self.config.call_timeout;
            lock(&self.pending).insert(&msg, target.name(), deadline);
        }
        debug!(from = %from.name(), to = %target.name(), call = %msg.describe(), serial = %msg.serial, "call");
        target.send_message(msg);
    }

    fn route_reply(&self, from: &Arc<Endpoint>, msg: Message) {
        let Some(serial) = msg.reply_serial else {
            return;
        };
        let Some(caller) = msg.destination.as_ref().and_then(BusName::as_unique).cloned() else {
            debug!(endpoint = %from.name(), "dropping reply without a unique destination");
            return;
        };
        if caller == self.bus_name {
            if !lock(&self.waiters).complete(from.name(), msg) {
                debug!(endpoint = %from.name(), serial = %serial, "dropping unsolicited reply to the bus");
            }
            return;
        }

        let pending = lock(&self.pending).take_reply(from.name(), &caller, serial);
        if pending.is_none() {
            debug!(endpoint = %from.name(), caller = %caller, serial = %serial, "dropping reply to no pending call");
            return;
        }
        if let Some(caller) = self.endpoints.get_live(&caller) {
            caller.send_message(msg);
        }
    }

    fn route_signal(&self, from: &Arc<Endpoint>, msg: Message) {
        if let Some(destination) = msg.destination.clone() {
            match self.resolve_endpoint(&destination) {
                Some(target) if self.shares_session(&msg, from.name(), target.name()) => {
                    target.send_message(msg);
                }
                _ => debug!(endpoint = %from.name(), destination = %destination, "dropping undeliverable signal"),
            }
            return;
        }

        if !msg.session_id.is_none() && !msg.flags.contains(MessageFlags::SESSIONLESS) {
            let participants = {
                let sessions = lock(&self.sessions);
                if !sessions.is_participant(msg.session_id, from.name()) {
                    debug!(endpoint = %from.name(), session = %msg.session_id, "dropping signal for foreign session");
                    return;
                }
                sessions.participants(msg.session_id).unwrap_or_default()
            };
            for member in participants.iter().filter(|m| *m != from.name()) {
                self.deliver(member, msg.clone());
            }
            return;
        }

        let owned = lock(&self.names).names_owned_by(from.name());
        let sender = from.name().as_str();
        self.broadcast(&msg, Some(from.name()), &|s| {
            s == sender || owned.iter().any(|n| n.as_str() == s)
        });
    }

    fn is_bus(&self, destination: &BusName) -> bool {
        match destination {
            BusName::Unique(u) => *u == self.bus_name,
            BusName::WellKnown(n) => n.as_str() == BUS_NAME,
        }
    }

    /// The live endpoint behind `name`. Endpoints being removed never resolve.
    pub(crate) fn resolve_endpoint(&self, name: &BusName) -> Option<Arc<Endpoint>> {
        match name {
            BusName::Unique(u) => self.endpoints.get_live(u),
            BusName::WellKnown(n) => {
                let owner = lock(&self.names).resolve(n).cloned();
                owner.and_then(|o| self.endpoints.get_live(&o))
            }
        }
    }

    /// Session-less messages always pass; session-scoped ones need both ends joined.
    fn shares_session(&self, msg: &Message, a: &UniqueName, b: &UniqueName) -> bool {
        if msg.session_id.is_none() {
            return true;
        }
        let sessions = lock(&self.sessions);
        sessions.is_participant(msg.session_id, a) && sessions.is_participant(msg.session_id, b)
    }

    pub(crate) fn deliver(&self, to: &UniqueName, msg: Message) -> bool {
        self.endpoints
            .get_live(to)
            .is_some_and(|ep| ep.send_message(msg))
    }

    fn broadcast(&self, msg: &Message, except: Option<&UniqueName>, sender_is: &dyn Fn(&str) -> bool) {
        for ep in self.endpoints.live() {
            if except == Some(ep.name()) {
                continue;
            }
            if ep.any_match(|rule| rule.matches(msg, |s| sender_is(s))) {
                ep.send_message(msg.clone());
            }
        }
    }

    /// Reply to the bus with a method return, stamped as coming from the bus.
    pub(crate) fn bus_reply(&self, call: &Message) -> Message {
        let mut reply = Message::method_return(call);
        reply.sender = Some(self.bus_name.clone());
        reply
    }

    pub(crate) fn reply_error(&self, to: &Endpoint, call: &Message, err: &RouterError) {
        if !call.expects_reply() {
            return;
        }
        let mut reply = Message::error_reply(call, err.error_name(), &err.to_string());
        reply.sender = Some(self.bus_name.clone());
        to.send_message(reply);
    }

    fn bus_signal<A: BusArgs>(&self, member: &str, args: &A) -> Option<Message> {
        match Message::signal(BUS_PATH, BUS_INTERFACE, member).with_args(args) {
            Ok(mut msg) => {
                msg.sender = Some(self.bus_name.clone());
                Some(msg)
            }
            Err(e) => {
                warn!(signal = member, error = %e, "failed to encode bus signal");
                None
            }
        }
    }

    /// A signal from the bus addressed to one endpoint.
    pub(crate) fn signal_endpoint<A: BusArgs>(&self, to: &UniqueName, member: &str, args: &A) {
        if let Some(msg) = self.bus_signal(member, args) {
            self.deliver(to, msg.with_destination(to.clone()));
        }
    }

    /// Turn name transitions into signals and listener events.
    ///
    /// Call with the name table still locked.
    pub(crate) fn publish_name_events(&self, events: Vec<NameEvent>) {
        for event in events {
            match event {
                NameEvent::OwnerChanged { name, old, new } => {
                    debug!(name = %name, old = ?old, new = ?new, "name owner changed");
                    let args = NameOwnerChangedArgs {
                        name: name.clone(),
                        old_owner: old.clone(),
                        new_owner: new.clone(),
                    };
                    if let Some(signal) = self.bus_signal(member::NAME_OWNER_CHANGED, &args) {
                        let bus_name = self.bus_name.as_str();
                        self.broadcast(&signal, None, &|s| s == BUS_NAME || s == bus_name);
                    }
                    let named = WellKnownNameArgs { name: name.clone() };
                    if let Some(old) = &old {
                        self.signal_endpoint(old, member::NAME_LOST, &named);
                    }
                    if let Some(new) = &new {
                        self.signal_endpoint(new, member::NAME_ACQUIRED, &named);
                    }
                    self.listeners.publish(BusEvent::NameOwnerChanged {
                        name,
                        old_owner: old,
                        new_owner: new,
                    });
                }
                NameEvent::Queued { name, endpoint } => {
                    debug!(name = %name, endpoint = %endpoint, "name claim queued");
                    self.listeners.publish(BusEvent::NameQueued { name, endpoint });
                }
            }
        }
    }

    pub(crate) fn publish_session_events(&self, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::Lost {
                    to,
                    session_id,
                    reason,
                } => {
                    debug!(endpoint = %to, session = %session_id, reason = ?reason, "session lost");
                    let args = SessionLostArgs { session_id, reason };
                    self.signal_endpoint(&to, member::SESSION_LOST, &args);
                    self.listeners.publish(BusEvent::SessionLost {
                        member: to,
                        session_id,
                        reason,
                    });
                }
                SessionEvent::MemberAdded {
                    to,
                    session_id,
                    member,
                } => {
                    let args = SessionMemberArgs { session_id, member };
                    self.signal_endpoint(&to, member::SESSION_MEMBER_ADDED, &args);
                }
                SessionEvent::MemberRemoved {
                    to,
                    session_id,
                    member,
                } => {
                    let args = SessionMemberArgs { session_id, member };
                    self.signal_endpoint(&to, member::SESSION_MEMBER_REMOVED, &args);
                }
            }
        }
    }

    /// Publish a session change, then let its torn-down ids be reused.
    pub(crate) fn apply_session_change(&self, sessions: &mut SessionTable, change: SessionChange) {
        self.publish_session_events(change.events);
        for id in &change.retired {
            debug!(session = %id, "session torn down");
        }
        sessions.release_retired(&change.retired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessionless_flag_is_distinct_from_broadcast() {
        assert!(!MessageFlags::SESSIONLESS.contains(MessageFlags::GLOBAL_BROADCAST));
        assert!(MatchRule::signals().matches(
            &Message::signal("/p", "a.b", "S"),
            |_| false
        ));
    }
}
