//! Reply correlation.
//!
//! [`PendingCalls`] tracks method calls routed between endpoints so that a
//! reply is only forwarded if it answers an outstanding call and comes from
//! the endpoint the call went to. [`ReplyWaiters`] does the same for calls the
//! router itself makes, such as `AcceptSession` to a session host.

use std::collections::HashMap;

use meshbus_core::{Message, Serial, UniqueName};
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct PendingCall {
    pub caller: UniqueName,
    pub callee: UniqueName,
    pub deadline: Instant,
    /// The call's header, kept to address the synthetic error reply.
    pub call: Message,
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: HashMap<(UniqueName, Serial), PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `call`, already stamped with its sender, as routed to `callee`.
    ///
    /// A caller reusing a serial that is still pending replaces the old entry.
    pub fn insert(&mut self, call: &Message, callee: &UniqueName, deadline: Instant) {
        let Some(caller) = call.sender.clone() else {
            return;
        };
        let mut header = call.clone();
        header.body.clear();
        self.calls.insert(
            (caller.clone(), call.serial),
            PendingCall {
                caller,
                callee: callee.clone(),
                deadline,
                call: header,
            },
        );
    }

    /// Match a reply from `replier` to `caller`'s call `serial`.
    ///
    /// A reply from anyone but the callee leaves the entry in place.
    pub fn take_reply(
        &mut self,
        replier: &UniqueName,
        caller: &UniqueName,
        serial: Serial,
    ) -> Option<PendingCall> {
        let key = (caller.clone(), serial);
        match self.calls.get(&key) {
            Some(pending) if &pending.callee == replier => self.calls.remove(&key),
            _ => None,
        }
    }

    /// Remove and return every call whose deadline is at or before `now`,
    /// earliest first.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingCall> {
        self.drain_where(|p| p.deadline <= now)
    }

    /// Calls that can no longer be answered because `callee` went away.
    pub fn fail_callee(&mut self, callee: &UniqueName) -> Vec<PendingCall> {
        self.drain_where(|p| &p.callee == callee)
    }

    /// Forget calls made by an endpoint that went away.
    pub fn drop_caller(&mut self, caller: &UniqueName) -> usize {
        let before = self.calls.len();
        self.calls.retain(|(c, _), _| c != caller);
        before - self.calls.len()
    }

    fn drain_where(&mut self, pred: impl Fn(&PendingCall) -> bool) -> Vec<PendingCall> {
        let keys: Vec<(UniqueName, Serial)> = self
            .calls
            .iter()
            .filter(|(_, p)| pred(p))
            .map(|(k, _)| k.clone())
            .collect();
        let mut out: Vec<PendingCall> = keys.iter().filter_map(|k| self.calls.remove(k)).collect();
        out.sort_by_key(|p| p.deadline);
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Outstanding calls made by the router, keyed by the router's own serials.
#[derive(Debug)]
pub struct ReplyWaiters {
    last: Serial,
    waiting: HashMap<Serial, (UniqueName, oneshot::Sender<Message>)>,
}

impl ReplyWaiters {
    pub fn new() -> Self {
        Self {
            last: Serial::NONE,
            waiting: HashMap::new(),
        }
    }

    /// Reserve a serial for a call to `callee` and the receiver its reply lands in.
    pub fn register(&mut self, callee: &UniqueName) -> (Serial, oneshot::Receiver<Message>) {
        let mut serial = self.last.next();
        while self.waiting.contains_key(&serial) {
            serial = serial.next();
        }
        self.last = serial;
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(serial, (callee.clone(), tx));
        (serial, rx)
    }

    /// Deliver a reply. Returns false if nothing from `replier` awaited it.
    pub fn complete(&mut self, replier: &UniqueName, reply: Message) -> bool {
        let Some(serial) = reply.reply_serial else {
            return false;
        };
        match self.waiting.get(&serial) {
            Some((callee, _)) if callee == replier => {}
            _ => return false,
        }
        match self.waiting.remove(&serial) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&mut self, serial: Serial) {
        self.waiting.remove(&serial);
    }

    /// Drop every waiter on `callee`; their receivers observe the closed channel.
    pub fn fail_callee(&mut self, callee: &UniqueName) {
        self.waiting.retain(|_, (c, _)| c != callee);
    }

    pub fn cancel_all(&mut self) {
        self.waiting.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

impl Default for ReplyWaiters {
    fn default() -> Self {
        Self::new()
    }
}
