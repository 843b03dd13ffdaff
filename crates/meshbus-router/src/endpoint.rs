//! Connected endpoints.
//!
//! An [`Endpoint`] is the router's handle on one connection. It owns the
//! sending half of that connection's outbound queue; the writer task drains
//! the queue, protects each message with the session cipher and hands the
//! frame to the transport. Routing never awaits: it enqueues with `try_send`,
//! and an endpoint whose queue is full is kicked rather than waited on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use dashmap::DashMap;
use meshbus_core::{HandshakeMessage, Message, TransportMask, UniqueName};
use meshbus_crypto::SessionCipher;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::dispatch::MatchRule;
use crate::error::RouterError;

/// An item on an endpoint's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Handshake(HandshakeMessage),
    /// Routed traffic. Sent protected once a cipher is installed.
    Message(Message),
    /// Refusal sent in the clear to a peer that never authenticated.
    Plain(Message),
}

pub struct Endpoint {
    name: UniqueName,
    peer: String,
    transport: TransportMask,
    outbound: mpsc::Sender<Outbound>,
    kick: watch::Sender<bool>,
    cipher: OnceLock<SessionCipher>,
    authenticated: AtomicBool,
    removing: AtomicBool,
    match_rules: Mutex<Vec<MatchRule>>,
}

impl Endpoint {
    pub fn new(
        name: UniqueName,
        peer: impl Into<String>,
        transport: TransportMask,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        let (kick, _) = watch::channel(false);
        Self {
            name,
            peer: peer.into(),
            transport,
            outbound,
            kick,
            cipher: OnceLock::new(),
            authenticated: AtomicBool::new(false),
            removing: AtomicBool::new(false),
            match_rules: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &UniqueName {
        &self.name
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn transport(&self) -> TransportMask {
        self.transport
    }

    /// Install the session keys and open the endpoint for routing.
    ///
    /// Returns false if keys were already installed.
    pub fn authenticate(&self, cipher: SessionCipher) -> bool {
        if self.cipher.set(cipher).is_err() {
            return false;
        }
        self.authenticated.store(true, Ordering::SeqCst);
        true
    }

    pub fn cipher(&self) -> Option<&SessionCipher> {
        self.cipher.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Mark the endpoint as going away. Returns true for the first caller only.
    pub fn begin_removal(&self) -> bool {
        !self.removing.swap(true, Ordering::SeqCst)
    }

    pub fn is_removing(&self) -> bool {
        self.removing.load(Ordering::SeqCst)
    }

    /// Authenticated and not being removed: the only state traffic may flow in.
    pub fn is_live(&self) -> bool {
        self.is_authenticated() && !self.is_removing()
    }

    /// Queue an item without waiting. A full queue kicks the endpoint.
    pub fn enqueue(&self, item: Outbound) -> bool {
        match self.outbound.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(endpoint = %self.name, peer = %self.peer, "outbound queue full, disconnecting");
                self.kick();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_message(&self, message: Message) -> bool {
        self.enqueue(Outbound::Message(message))
    }

    /// Ask the connection's tasks to wind down.
    pub fn kick(&self) {
        self.kick.send_replace(true);
    }

    pub fn kicked(&self) -> watch::Receiver<bool> {
        self.kick.subscribe()
    }

    /// Resolve once [`kick`](Self::kick) has been called.
    pub async fn wait_kicked(&self) {
        let mut rx = self.kick.subscribe();
        let _ = rx.wait_for(|kicked| *kicked).await;
    }

    pub fn add_match(&self, rule: MatchRule, limit: usize) -> Result<(), RouterError> {
        let mut rules = self.match_rules.lock().unwrap_or_else(PoisonError::into_inner);
        if rules.len() >= limit {
            return Err(RouterError::LimitsExceeded("match rules"));
        }
        rules.push(rule);
        Ok(())
    }

    /// Remove one rule equal to `rule`. Returns whether one was found.
    pub fn remove_match(&self, rule: &MatchRule) -> bool {
        let mut rules = self.match_rules.lock().unwrap_or_else(PoisonError::into_inner);
        match rules.iter().position(|r| r == rule) {
            Some(pos) => {
                rules.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn any_match(&self, predicate: impl Fn(&MatchRule) -> bool) -> bool {
        self.match_rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(predicate)
    }
}

impl core::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("peer", &self.peer)
            .field("authenticated", &self.is_authenticated())
            .field("removing", &self.is_removing())
            .finish_non_exhaustive()
    }
}

/// Every endpoint the router knows, keyed by unique name.
///
/// Sharded, so lookups for one endpoint never wait on a handshake or a
/// removal touching another.
#[derive(Default)]
pub struct EndpointTable {
    entries: DashMap<UniqueName, Arc<Endpoint>>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, endpoint: Arc<Endpoint>) {
        self.entries.insert(endpoint.name().clone(), endpoint);
    }

    /// Any endpoint, authenticated or not.
    pub fn get(&self, name: &UniqueName) -> Option<Arc<Endpoint>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    /// An endpoint traffic may be routed to.
    pub fn get_live(&self, name: &UniqueName) -> Option<Arc<Endpoint>> {
        self.get(name).filter(|e| e.is_live())
    }

    pub fn remove(&self, name: &UniqueName) -> Option<Arc<Endpoint>> {
        self.entries.remove(name).map(|(_, e)| e)
    }

    /// Snapshot of every live endpoint, sorted by name.
    pub fn live(&self) -> Vec<Arc<Endpoint>> {
        let mut live: Vec<Arc<Endpoint>> = self
            .entries
            .iter()
            .filter(|e| e.value().is_live())
            .map(|e| Arc::clone(e.value()))
            .collect();
        live.sort_by(|a, b| a.name().cmp(b.name()));
        live
    }

    pub fn all(&self) -> Vec<Arc<Endpoint>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbus_core::RouterGuid;

    fn endpoint(n: u64, depth: usize) -> (Arc<Endpoint>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(depth);
        let name = UniqueName::new(&RouterGuid::new([4; 16]), n);
        (Arc::new(Endpoint::new(name, "mem:test", TransportMask::LOCAL, tx)), rx)
    }

    #[test]
    fn only_authenticated_endpoints_are_live() {
        let (ep, _rx) = endpoint(1, 4);
        let table = EndpointTable::new();
        table.insert(ep.clone());
        assert!(table.get(ep.name()).is_some());
        assert!(table.get_live(ep.name()).is_none());

        assert!(ep.authenticate(SessionCipher::new(&[1; 64])));
        assert!(!ep.authenticate(SessionCipher::new(&[2; 64])));
        assert!(table.get_live(ep.name()).is_some());
        assert_eq!(table.live().len(), 1);
    }

    #[test]
    fn removal_is_claimed_once_and_hides_the_endpoint() {
        let (ep, _rx) = endpoint(1, 4);
        ep.authenticate(SessionCipher::new(&[1; 64]));
        let table = EndpointTable::new();
        table.insert(ep.clone());

        assert!(ep.begin_removal());
        assert!(!ep.begin_removal());
        assert!(table.get_live(ep.name()).is_none());
        assert!(table.get(ep.name()).is_some());
        assert!(table.remove(ep.name()).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn full_queue_kicks_the_endpoint() {
        let (ep, mut rx) = endpoint(1, 1);
        let kicked = ep.kicked();
        let signal = Message::signal("/p", "a.b", "S");
        assert!(ep.send_message(signal.clone()));
        assert!(!*kicked.borrow());
        assert!(!ep.send_message(signal));
        assert!(*kicked.borrow());
        assert!(matches!(rx.try_recv(), Ok(Outbound::Message(_))));
    }

    #[test]
    fn match_rules_are_capped() {
        let (ep, _rx) = endpoint(1, 1);
        ep.add_match(MatchRule::signals(), 1).unwrap();
        assert!(matches!(
            ep.add_match(MatchRule::default(), 1),
            Err(RouterError::LimitsExceeded(_))
        ));
        assert!(ep.any_match(|r| r == &MatchRule::signals()));
        assert!(ep.remove_match(&MatchRule::signals()));
        assert!(!ep.remove_match(&MatchRule::signals()));
    }
}
