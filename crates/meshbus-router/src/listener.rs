//! Bus listeners registered by the hosting process.
//!
//! Events are published while the table that produced them is still locked,
//! so their order matches the order of the state changes. They are delivered
//! on a single dispatcher task, so callbacks never run under a router lock and
//! may call back into the router. Listeners see events in registration order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use meshbus_core::bus::SessionLostReason;
use meshbus_core::{SessionId, SessionPort, UniqueName, WellKnownName};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Callbacks for router-wide events. Every method defaults to doing nothing.
pub trait BusListener: Send + Sync + 'static {
    fn endpoint_connected(&self, _endpoint: &UniqueName) {}

    fn endpoint_disconnected(&self, _endpoint: &UniqueName) {}

    fn name_owner_changed(
        &self,
        _name: &WellKnownName,
        _old_owner: Option<&UniqueName>,
        _new_owner: Option<&UniqueName>,
    ) {
    }

    fn name_queued(&self, _name: &WellKnownName, _endpoint: &UniqueName) {}

    fn session_joined(&self, _host: &UniqueName, _port: SessionPort, _session_id: SessionId, _joiner: &UniqueName) {}

    /// `member` lost the session.
    fn session_lost(&self, _member: &UniqueName, _session_id: SessionId, _reason: SessionLostReason) {}

    /// The router is shutting down. Always the last event.
    fn stopping(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    EndpointConnected(UniqueName),
    EndpointDisconnected(UniqueName),
    NameOwnerChanged {
        name: WellKnownName,
        old_owner: Option<UniqueName>,
        new_owner: Option<UniqueName>,
    },
    NameQueued {
        name: WellKnownName,
        endpoint: UniqueName,
    },
    SessionJoined {
        host: UniqueName,
        port: SessionPort,
        session_id: SessionId,
        joiner: UniqueName,
    },
    SessionLost {
        member: UniqueName,
        session_id: SessionId,
        reason: SessionLostReason,
    },
    Stopping,
}

impl BusEvent {
    fn deliver(&self, listener: &dyn BusListener) {
        match self {
            BusEvent::EndpointConnected(ep) => listener.endpoint_connected(ep),
            BusEvent::EndpointDisconnected(ep) => listener.endpoint_disconnected(ep),
            BusEvent::NameOwnerChanged {
                name,
                old_owner,
                new_owner,
            } => listener.name_owner_changed(name, old_owner.as_ref(), new_owner.as_ref()),
            BusEvent::NameQueued { name, endpoint } => listener.name_queued(name, endpoint),
            BusEvent::SessionJoined {
                host,
                port,
                session_id,
                joiner,
            } => listener.session_joined(host, *port, *session_id, joiner),
            BusEvent::SessionLost {
                member,
                session_id,
                reason,
            } => listener.session_lost(member, *session_id, *reason),
            BusEvent::Stopping => listener.stopping(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listeners = Arc<Mutex<Vec<(ListenerId, Arc<dyn BusListener>)>>>;

pub struct ListenerRegistry {
    listeners: Listeners,
    next_id: AtomicU64,
    started: AtomicBool,
    tx: Mutex<Option<mpsc::UnboundedSender<BusEvent>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<BusEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn register(&self, listener: Arc<dyn BusListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Returns whether the listener was registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Queue `event` for delivery. Events published before [`start`](Self::start)
    /// are dropped, so an idle registry never accumulates a backlog.
    pub fn publish(&self, event: BusEvent) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        if let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Start delivering events. Only the first call has any effect.
    pub fn start(&self) {
        let Some(mut rx) = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        let listeners = Arc::clone(&self.listeners);
        self.started.store(true, Ordering::Release);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let snapshot: Vec<Arc<dyn BusListener>> = listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|(_, l)| Arc::clone(l))
                    .collect();
                for listener in snapshot {
                    event.deliver(listener.as_ref());
                }
            }
        });
        *self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop accepting events and wait until every queued one was delivered.
    pub async fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let handle = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbus_core::RouterGuid;

    struct Recorder {
        tag: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl BusListener for Recorder {
        fn endpoint_connected(&self, endpoint: &UniqueName) {
            self.seen.lock().unwrap().push(format!("{}:connected:{endpoint}", self.tag));
        }

        fn stopping(&self) {
            self.seen.lock().unwrap().push(format!("{}:stopping", self.tag));
        }
    }

    fn ep() -> UniqueName {
        UniqueName::new(&RouterGuid::new([6; 16]), 1)
    }

    #[tokio::test]
    async fn events_fan_out_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        registry.register(Arc::new(Recorder { tag: "a", seen: seen.clone() }));
        let b = registry.register(Arc::new(Recorder { tag: "b", seen: seen.clone() }));
        registry.start();

        registry.publish(BusEvent::EndpointConnected(ep()));
        registry.publish(BusEvent::Stopping);
        registry.close().await;

        let name = ep();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                format!("a:connected:{name}"),
                format!("b:connected:{name}"),
                "a:stopping".to_owned(),
                "b:stopping".to_owned(),
            ]
        );
        assert!(registry.unregister(b));
        assert!(!registry.unregister(b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn events_before_start_are_dropped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        registry.register(Arc::new(Recorder { tag: "a", seen: seen.clone() }));
        registry.publish(BusEvent::EndpointConnected(ep()));

        registry.start();
        registry.publish(BusEvent::Stopping);
        registry.close().await;
        assert_eq!(*seen.lock().unwrap(), vec!["a:stopping".to_owned()]);
    }

    #[tokio::test]
    async fn nothing_is_delivered_after_close() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        registry.register(Arc::new(Recorder { tag: "a", seen: seen.clone() }));
        registry.start();
        registry.close().await;
        registry.publish(BusEvent::Stopping);
        tokio::task::yield_now().await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
