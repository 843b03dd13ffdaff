//! The router.
//!
//! [`Router`] is a cheap handle on shared state: the endpoint, name and
//! session tables, call correlation and the listener registry. Each attached
//! connection gets a reader task (handshake, then routing) and a writer task
//! (drains the endpoint's outbound queue). Both are tracked by the router's
//! [`ShutdownToken`], so [`Router::join`] returns only once every one of them
//! has finished.
//!
//! Table locks are plain `std` mutexes and are never held across an await.
//! When both are needed the name table is locked before the session table,
//! and never while the other is held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use meshbus_core::bus::{
    AcceptSessionArgs, BUS_NAME, BUS_PATH, BoolReply, SESSION_HOST_INTERFACE, SessionJoinedArgs,
    error_names, member,
};
use meshbus_core::{
    BusName, Frame, HandshakeMessage, Message, MessageType, RouterGuid, Serial, SessionId,
    SessionOpts, SessionPort, UniqueName, WellKnownName,
};
use meshbus_transport::{Connection, ShutdownToken, Transport, TransportError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::RouterConfig;
use crate::dispatch::{MatchRule, PendingCalls, ReplyWaiters};
use crate::endpoint::{Endpoint, EndpointTable, Outbound};
use crate::error::{AuthError, RouterError};
use crate::listener::{BusEvent, BusListener, ListenerId, ListenerRegistry};
use crate::names::{ClaimFlags, ClaimOutcome, NameTable, ReleaseOutcome};
use crate::security::{AuthListener, Handshake, Role};
use crate::session::{JoinTicket, SessionTable};

const REAP_INTERVAL: Duration = Duration::from_millis(250);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct RouterInner {
    pub(crate) config: RouterConfig,
    pub(crate) guid: RouterGuid,
    /// The router's own unique name, used as sender of everything it originates.
    pub(crate) bus_name: UniqueName,
    auth_listener: Arc<dyn AuthListener>,
    pub(crate) endpoints: EndpointTable,
    pub(crate) names: Mutex<NameTable>,
    pub(crate) sessions: Mutex<SessionTable>,
    pub(crate) pending: Mutex<PendingCalls>,
    pub(crate) waiters: Mutex<ReplyWaiters>,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) shutdown: ShutdownToken,
    next_endpoint: AtomicU64,
}

/// A message bus router. Clones share the same router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// A router with a random GUID. Call [`start`](Self::start) before attaching connections.
    pub fn new(config: RouterConfig, auth_listener: Arc<dyn AuthListener>) -> Self {
        Self::with_guid(config, auth_listener, RouterGuid::new(rand::random()))
    }

    pub fn with_guid(config: RouterConfig, auth_listener: Arc<dyn AuthListener>, guid: RouterGuid) -> Self {
        let sessions = SessionTable::new(config.max_sessions);
        Self {
            inner: Arc::new(RouterInner {
                bus_name: UniqueName::new(&guid, 0),
                guid,
                auth_listener,
                endpoints: EndpointTable::new(),
                names: Mutex::new(NameTable::new()),
                sessions: Mutex::new(sessions),
                pending: Mutex::new(PendingCalls::new()),
                waiters: Mutex::new(ReplyWaiters::new()),
                listeners: ListenerRegistry::new(),
                shutdown: ShutdownToken::new(),
                next_endpoint: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn guid(&self) -> RouterGuid {
        self.inner.guid
    }

    pub fn bus_name(&self) -> &UniqueName {
        &self.inner.bus_name
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.inner.shutdown.is_online() && !self.inner.shutdown.is_stopped()
    }

    /// Start the call reaper and listener delivery. Calling it twice is harmless.
    pub async fn start(&self) -> Result<(), RouterError> {
        self.inner.start().await
    }

    /// Accept connections from `transport` until the router stops.
    pub async fn listen<T: Transport>(&self, transport: T) -> Result<(), RouterError> {
        self.inner.listen(transport).await
    }

    /// Serve one already-established connection. Returns the unique name the
    /// endpoint will carry once it authenticates.
    pub async fn attach<C: Connection>(&self, conn: C) -> Result<UniqueName, RouterError> {
        self.inner.attach(conn).await
    }

    /// Signal every task to wind down. Does not wait; see [`join`](Self::join).
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Wait for [`stop`](Self::stop) and for every task to finish. No listener
    /// callback runs after this returns.
    pub async fn join(&self) {
        self.inner.join().await;
    }

    pub fn register_listener(&self, listener: Arc<dyn BusListener>) -> ListenerId {
        self.inner.listeners.register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.unregister(id)
    }

    /// Authenticated endpoints, sorted by name.
    pub fn endpoints(&self) -> Vec<UniqueName> {
        self.inner
            .endpoints
            .live()
            .iter()
            .map(|e| e.name().clone())
            .collect()
    }

    /// Disconnect an endpoint and release everything it held. Returns false
    /// if it was unknown or already going away.
    pub fn remove_endpoint(&self, endpoint: &UniqueName) -> bool {
        self.inner.remove_endpoint(endpoint)
    }

    pub fn claim_name(
        &self,
        endpoint: &UniqueName,
        name: &WellKnownName,
        flags: ClaimFlags,
    ) -> Result<ClaimOutcome, RouterError> {
        self.inner.claim_name(endpoint, name, flags)
    }

    pub fn release_name(&self, endpoint: &UniqueName, name: &WellKnownName) -> ReleaseOutcome {
        self.inner.release_name(endpoint, name)
    }

    /// The live unique name behind `name`.
    pub fn resolve_name(&self, name: &BusName) -> Option<UniqueName> {
        self.inner.resolve_name(name)
    }

    pub fn list_names(&self) -> Vec<BusName> {
        self.inner.list_names()
    }

    pub fn queued_owners(&self, name: &WellKnownName) -> Vec<UniqueName> {
        self.inner.queued_owners(name)
    }

    pub fn bind_session_port(
        &self,
        host: &UniqueName,
        port: SessionPort,
        opts: SessionOpts,
    ) -> Result<SessionPort, RouterError> {
        self.inner.bind_session_port(host, port, opts)
    }

    pub fn unbind_session_port(&self, host: &UniqueName, port: SessionPort) -> Result<(), RouterError> {
        self.inner.unbind_session_port(host, port)
    }

    /// Join `joiner` to the session `host` offers on `port`, asking the host first.
    pub async fn request_join(
        &self,
        joiner: &UniqueName,
        host: &BusName,
        port: SessionPort,
        opts: SessionOpts,
    ) -> Result<(SessionId, SessionOpts), RouterError> {
        self.inner.request_join(joiner, host, port, opts).await
    }

    pub fn leave_session(&self, endpoint: &UniqueName, session_id: SessionId) -> Result<(), RouterError> {
        self.inner.leave_session(endpoint, session_id)
    }

    pub fn remove_session_member(
        &self,
        host: &UniqueName,
        session_id: SessionId,
        member: &UniqueName,
    ) -> Result<(), RouterError> {
        self.inner.remove_session_member(host, session_id, member)
    }

    pub fn session_members(&self, session_id: SessionId) -> Result<Vec<UniqueName>, RouterError> {
        self.inner.session_members(session_id)
    }

    /// Routed method calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }
}

impl core::fmt::Debug for Router {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Router")
            .field("bus_name", &self.inner.bus_name)
            .field("endpoints", &self.inner.endpoints.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl RouterInner {
    async fn start(self: &Arc<Self>) -> Result<(), RouterError> {
        if self.shutdown.is_stopped() {
            return Err(RouterError::Stopped);
        }
        if self.shutdown.is_online() {
            return Ok(());
        }
        self.shutdown.set_online();
        self.listeners.start();
        let reaper = self.spawn_reaper();
        self.shutdown.add_task(reaper).await;
        info!(bus = %self.bus_name, guid = %self.guid, "router started");
        Ok(())
    }

    fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = inner.shutdown.stopped() => break,
                    _ = interval.tick() => inner.expire_calls(Instant::now()),
                }
            }
        })
    }

    /// Fail every routed call whose deadline has passed.
    pub(crate) fn expire_calls(&self, now: Instant) {
        let expired = lock(&self.pending).expire(now);
        for call in expired {
            debug!(caller = %call.caller, callee = %call.callee, serial = %call.call.serial, "method call timed out");
            if let Some(caller) = self.endpoints.get_live(&call.caller) {
                self.reply_error(&caller, &call.call, &RouterError::Timeout("method reply"));
            }
        }
    }

    fn stop(&self) {
        if self.shutdown.is_stopped() {
            return;
        }
        info!(bus = %self.bus_name, "router stopping");
        self.shutdown.signal_stop_and_go_offline();
        lock(&self.waiters).cancel_all();
        for ep in self.endpoints.all() {
            ep.kick();
        }
    }

    async fn join(&self) {
        self.shutdown.stopped().await;
        self.shutdown.join_all().await;
        for ep in self.endpoints.all() {
            self.remove_endpoint(ep.name());
        }
        self.listeners.publish(BusEvent::Stopping);
        self.listeners.close().await;
        info!(bus = %self.bus_name, "router stopped");
    }

    async fn listen<T: Transport>(self: &Arc<Self>, transport: T) -> Result<(), RouterError> {
        if self.shutdown.is_stopped() {
            return Err(RouterError::Stopped);
        }
        info!(transport = transport.name(), "listening");
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    biased;
                    () = inner.shutdown.stopped() => break,
                    accepted = transport.accept() => accepted,
                };
                match accepted {
                    Ok(conn) => {
                        let peer = conn.peer().to_owned();
                        if let Err(e) = inner.attach(conn).await {
                            warn!(transport = transport.name(), peer = %peer, error = %e, "refused connection");
                        }
                    }
                    Err(TransportError::Stopped) => break,
                    Err(e) => {
                        warn!(transport = transport.name(), error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            if let Err(e) = transport.stop().await {
                warn!(transport = transport.name(), error = %e, "failed to stop transport");
            }
            debug!(transport = transport.name(), "accept loop finished");
        });
        self.shutdown.add_task(handle).await;
        Ok(())
    }

    async fn attach<C: Connection>(self: &Arc<Self>, conn: C) -> Result<UniqueName, RouterError> {
        if !self.shutdown.is_online() || self.shutdown.is_stopped() {
            let _ = conn.disconnect().await;
            return Err(RouterError::Stopped);
        }
        if self.endpoints.len() >= self.config.max_endpoints {
            warn!(peer = %conn.peer(), limit = self.config.max_endpoints, "endpoint limit reached");
            let _ = conn.disconnect().await;
            return Err(RouterError::LimitsExceeded("endpoints"));
        }

        let name = UniqueName::new(&self.guid, self.next_endpoint.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.outbound_queue.max(1));
        let endpoint = Arc::new(Endpoint::new(name.clone(), conn.peer(), conn.transport(), tx));
        self.endpoints.insert(Arc::clone(&endpoint));
        debug!(endpoint = %name, peer = %conn.peer(), "connection attached");

        let conn = Arc::new(conn);
        let writer = tokio::spawn(write_loop(
            Arc::clone(self),
            Arc::clone(&endpoint),
            Arc::clone(&conn),
            rx,
        ));
        let reader = tokio::spawn(read_loop(Arc::clone(self), endpoint, conn));
        self.shutdown.add_task(writer).await;
        self.shutdown.add_task(reader).await;
        Ok(name)
    }

    /// Release everything `name` held and forget it. Idempotent.
    pub(crate) fn remove_endpoint(&self, name: &UniqueName) -> bool {
        let Some(ep) = self.endpoints.get(name) else {
            return false;
        };
        if !ep.begin_removal() {
            return false;
        }
        ep.kick();

        {
            let mut names = lock(&self.names);
            let mut events = Vec::new();
            names.endpoint_removed(name, &mut events);
            self.publish_name_events(events);
        }
        {
            let mut sessions = lock(&self.sessions);
            let change = sessions.endpoint_removed(name);
            self.apply_session_change(&mut sessions, change);
        }

        let orphaned = {
            let mut pending = lock(&self.pending);
            pending.drop_caller(name);
            pending.fail_callee(name)
        };
        let gone = RouterError::ServiceUnknown(name.clone().into());
        for call in orphaned {
            if let Some(caller) = self.endpoints.get_live(&call.caller) {
                self.reply_error(&caller, &call.call, &gone);
            }
        }
        lock(&self.waiters).fail_callee(name);
        self.endpoints.remove(name);

        if ep.is_authenticated() {
            self.listeners
                .publish(BusEvent::EndpointDisconnected(name.clone()));
            info!(endpoint = %name, peer = %ep.peer(), "endpoint disconnected");
        } else {
            debug!(endpoint = %name, peer = %ep.peer(), "unauthenticated connection closed");
        }
        true
    }

    fn live_endpoint(&self, name: &UniqueName) -> Result<Arc<Endpoint>, RouterError> {
        self.endpoints
            .get_live(name)
            .ok_or_else(|| RouterError::UnknownEndpoint(name.clone()))
    }

    pub(crate) fn claim_name(
        &self,
        endpoint: &UniqueName,
        name: &WellKnownName,
        flags: ClaimFlags,
    ) -> Result<ClaimOutcome, RouterError> {
        if name.as_str() == BUS_NAME {
            return Err(RouterError::ReservedName(name.to_string()));
        }
        let mut names = lock(&self.names);
        // Checked under the lock so a concurrent removal cannot miss the claim.
        self.live_endpoint(endpoint)?;
        let mut events = Vec::new();
        let outcome = names.claim(endpoint, name, flags, &mut events);
        self.publish_name_events(events);
        debug!(endpoint = %endpoint, name = %name, outcome = ?outcome, "name claim");
        Ok(outcome)
    }

    pub(crate) fn release_name(&self, endpoint: &UniqueName, name: &WellKnownName) -> ReleaseOutcome {
        let mut names = lock(&self.names);
        let mut events = Vec::new();
        let outcome = names.release(endpoint, name, &mut events);
        self.publish_name_events(events);
        outcome
    }

    pub(crate) fn resolve_name(&self, name: &BusName) -> Option<UniqueName> {
        self.resolve_endpoint(name).map(|ep| ep.name().clone())
    }

    /// Live unique names, then owned well-known names.
    pub(crate) fn list_names(&self) -> Vec<BusName> {
        let mut names: Vec<BusName> = self
            .endpoints
            .live()
            .iter()
            .map(|ep| BusName::Unique(ep.name().clone()))
            .collect();
        names.extend(lock(&self.names).list_names().into_iter().map(BusName::WellKnown));
        names
    }

    pub(crate) fn queued_owners(&self, name: &WellKnownName) -> Vec<UniqueName> {
        lock(&self.names).queued_owners(name)
    }

    pub(crate) fn add_match(&self, endpoint: &UniqueName, rule: &str) -> Result<(), RouterError> {
        let rule: MatchRule = rule.parse()?;
        self.live_endpoint(endpoint)?
            .add_match(rule, self.config.max_match_rules)
    }

    pub(crate) fn remove_match(&self, endpoint: &UniqueName, rule: &str) -> Result<(), RouterError> {
        let rule: MatchRule = rule.parse()?;
        if self.live_endpoint(endpoint)?.remove_match(&rule) {
            Ok(())
        } else {
            Err(RouterError::InvalidMatchRule(format!("no rule {rule} registered")))
        }
    }

    pub(crate) fn bind_session_port(
        &self,
        host: &UniqueName,
        port: SessionPort,
        opts: SessionOpts,
    ) -> Result<SessionPort, RouterError> {
        let mut sessions = lock(&self.sessions);
        self.live_endpoint(host)?;
        let port = sessions.bind(host, port, opts)?;
        info!(endpoint = %host, port = %port, multipoint = opts.multipoint, "session port bound");
        Ok(port)
    }

    pub(crate) fn unbind_session_port(&self, host: &UniqueName, port: SessionPort) -> Result<(), RouterError> {
        lock(&self.sessions).unbind(host, port)?;
        debug!(endpoint = %host, port = %port, "session port unbound");
        Ok(())
    }

    pub(crate) fn leave_session(&self, endpoint: &UniqueName, session_id: SessionId) -> Result<(), RouterError> {
        let mut sessions = lock(&self.sessions);
        let change = sessions.leave(endpoint, session_id)?;
        self.apply_session_change(&mut sessions, change);
        debug!(endpoint = %endpoint, session = %session_id, "left session");
        Ok(())
    }

    pub(crate) fn remove_session_member(
        &self,
        host: &UniqueName,
        session_id: SessionId,
        member: &UniqueName,
    ) -> Result<(), RouterError> {
        let mut sessions = lock(&self.sessions);
        let change = sessions.remove_member(host, session_id, member)?;
        self.apply_session_change(&mut sessions, change);
        debug!(host = %host, session = %session_id, member = %member, "session member removed");
        Ok(())
    }

    pub(crate) fn session_members(&self, session_id: SessionId) -> Result<Vec<UniqueName>, RouterError> {
        Ok(lock(&self.sessions).participants(session_id)?)
    }

    pub(crate) async fn request_join(
        &self,
        joiner: &UniqueName,
        host: &BusName,
        port: SessionPort,
        opts: SessionOpts,
    ) -> Result<(SessionId, SessionOpts), RouterError> {
        let host_ep = self
            .resolve_endpoint(host)
            .ok_or_else(|| RouterError::ServiceUnknown(host.clone()))?;
        let ticket = {
            let mut sessions = lock(&self.sessions);
            // Under the lock: a removal that already purged the table must not
            // see the joiner queued afterwards.
            self.live_endpoint(joiner)?;
            sessions.begin_join(joiner, host_ep.name(), port, &opts)?
        };
        debug!(joiner = %joiner, host = %ticket.host, port = %port, session = %ticket.session_id, "asking host to accept");

        let accepted = match self.ask_host(&host_ep, &ticket).await {
            Ok(accepted) => accepted,
            Err(e) => {
                let _ = lock(&self.sessions).complete_join(&ticket, false);
                return Err(e);
            }
        };

        let mut sessions = lock(&self.sessions);
        let both_live = self.endpoints.get_live(joiner).is_some()
            && self.endpoints.get_live(&ticket.host).is_some();
        let established = sessions.complete_join(&ticket, accepted && both_live)?;
        self.publish_session_events(established.events);
        let joined = SessionJoinedArgs {
            port,
            session_id: established.session_id,
            joiner: joiner.clone(),
        };
        self.signal_endpoint(&ticket.host, member::SESSION_JOINED, &joined);
        self.listeners.publish(BusEvent::SessionJoined {
            host: ticket.host.clone(),
            port,
            session_id: established.session_id,
            joiner: joiner.clone(),
        });
        drop(sessions);

        info!(
            session = %established.session_id,
            host = %ticket.host,
            joiner = %joiner,
            multipoint = established.opts.multipoint,
            "session joined"
        );
        Ok((established.session_id, established.opts))
    }

    /// Send `AcceptSession` to the host and wait for its verdict.
    async fn ask_host(&self, host: &Endpoint, ticket: &JoinTicket) -> Result<bool, RouterError> {
        let (serial, rx) = lock(&self.waiters).register(host.name());
        let args = AcceptSessionArgs {
            port: ticket.port,
            session_id: ticket.session_id,
            joiner: ticket.joiner.clone(),
            opts: ticket.opts,
        };
        let mut call = Message::method_call(
            host.name().clone(),
            BUS_PATH,
            SESSION_HOST_INTERFACE,
            member::ACCEPT_SESSION,
        )
        .with_args(&args)?;
        call.serial = serial;
        call.sender = Some(self.bus_name.clone());
        if !host.send_message(call) {
            lock(&self.waiters).cancel(serial);
            return Ok(false);
        }

        let outcome = tokio::select! {
            reply = tokio::time::timeout(self.config.join_timeout, rx) => reply,
            () = self.shutdown.stopped() => {
                lock(&self.waiters).cancel(serial);
                return Err(RouterError::Cancelled);
            }
        };
        match outcome {
            Err(_elapsed) => {
                lock(&self.waiters).cancel(serial);
                warn!(host = %host.name(), session = %ticket.session_id, "host did not answer AcceptSession");
                Err(RouterError::Timeout("AcceptSession"))
            }
            Ok(Err(_closed)) if self.shutdown.is_stopped() => Err(RouterError::Cancelled),
            Ok(Err(_closed)) => Ok(false),
            Ok(Ok(reply)) => Ok(reply.msg_type == MessageType::MethodReturn
                && reply.args::<BoolReply>().is_ok_and(|r| r.value)),
        }
    }

    fn refuse_unauthenticated(&self, ep: &Endpoint, msg: &Message) {
        debug!(endpoint = %ep.name(), what = %msg.describe(), "refusing traffic before authentication");
        if !msg.expects_reply() || msg.serial == Serial::NONE {
            return;
        }
        let mut reply = Message::error_reply(msg, error_names::NOT_AUTHENTICATED, "authenticate first");
        reply.sender = Some(self.bus_name.clone());
        ep.enqueue(Outbound::Plain(reply));
    }
}

async fn write_loop<C: Connection>(
    inner: Arc<RouterInner>,
    ep: Arc<Endpoint>,
    conn: Arc<C>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    loop {
        tokio::select! {
            biased;
            () = ep.wait_kicked() => break,
            () = inner.shutdown.stopped() => break,
            item = rx.recv() => match item {
                Some(item) => {
                    if let Err(e) = send_item(&inner, &ep, conn.as_ref(), item).await {
                        debug!(endpoint = %ep.name(), error = %e, "write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Flush what is already queued: a final `Failed`, or replies to the last calls.
    let _ = tokio::time::timeout(FLUSH_TIMEOUT, async {
        while let Ok(item) = rx.try_recv() {
            if send_item(&inner, &ep, conn.as_ref(), item).await.is_err() {
                break;
            }
        }
    })
    .await;
    let _ = conn.disconnect().await;
    inner.remove_endpoint(ep.name());
}

async fn send_item<C: Connection>(
    inner: &RouterInner,
    ep: &Endpoint,
    conn: &C,
    item: Outbound,
) -> Result<(), RouterError> {
    let frame = match item {
        Outbound::Handshake(msg) => Frame::Handshake(msg),
        Outbound::Plain(msg) => Frame::Message(msg),
        Outbound::Message(msg) => {
            let Some(cipher) = ep.cipher() else {
                debug!(endpoint = %ep.name(), "dropping message for unauthenticated endpoint");
                return Ok(());
            };
            Frame::protect(&msg, cipher, inner.config.encrypt_traffic)?
        }
    };
    conn.send(&frame.encode()?).await?;
    Ok(())
}

async fn read_loop<C: Connection>(inner: Arc<RouterInner>, ep: Arc<Endpoint>, conn: Arc<C>) {
    if authenticate(&inner, &ep, conn.as_ref()).await {
        serve(&inner, &ep, conn.as_ref()).await;
    }
    inner.remove_endpoint(ep.name());
}

/// Run the responder side of the handshake. Returns true once the endpoint is live.
async fn authenticate<C: Connection>(inner: &Arc<RouterInner>, ep: &Arc<Endpoint>, conn: &C) -> bool {
    let mut handshake = Handshake::new(
        Role::Responder,
        ep.peer(),
        inner.config.mechanisms.clone(),
        inner.config.max_auth_attempts,
        Arc::clone(&inner.auth_listener),
    );
    let deadline = tokio::time::sleep(inner.config.auth_timeout);
    tokio::pin!(deadline);

    loop {
        let received = tokio::select! {
            biased;
            () = ep.wait_kicked() => return false,
            () = inner.shutdown.stopped() => return false,
            () = &mut deadline => {
                warn!(endpoint = %ep.name(), peer = %ep.peer(), state = handshake.state().as_str(), "authentication timed out");
                let report = handshake.fail(&AuthError::Timeout);
                ep.enqueue(Outbound::Handshake(report.message));
                return false;
            }
            received = conn.receive() => received,
        };
        let bytes = match received {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(endpoint = %ep.name(), error = %e, "connection closed during handshake");
                return false;
            }
        };
        let msg = match Frame::decode(&bytes) {
            Ok(Frame::Handshake(msg)) => msg,
            Ok(Frame::Message(msg)) => {
                inner.refuse_unauthenticated(ep, &msg);
                continue;
            }
            Ok(Frame::Sealed(_) | Frame::Signed(_)) => {
                debug!(endpoint = %ep.name(), "dropping protected frame before authentication");
                continue;
            }
            Err(e) => {
                warn!(endpoint = %ep.name(), error = %e, "dropping undecodable frame");
                continue;
            }
        };
        trace!(endpoint = %ep.name(), kind = msg.kind(), "handshake message");

        match handshake.receive(msg) {
            Ok(replies) => {
                for reply in replies {
                    ep.enqueue(Outbound::Handshake(reply));
                }
            }
            Err(e) => {
                let peer_gave_up = matches!(e, AuthError::Rejected { .. });
                let report = handshake.fail(&e);
                warn!(
                    endpoint = %ep.name(),
                    peer = %ep.peer(),
                    error = %e,
                    attempts = handshake.attempts(),
                    evict = report.evict,
                    "authentication attempt failed"
                );
                if !peer_gave_up {
                    ep.enqueue(Outbound::Handshake(report.message));
                }
                if report.evict {
                    return false;
                }
                continue;
            }
        }

        if let Some(done) = handshake.complete() {
            // Welcome must precede anything sealed with the new keys.
            ep.enqueue(Outbound::Handshake(HandshakeMessage::Welcome {
                unique_name: ep.name().clone(),
            }));
            if !ep.authenticate(done.cipher) {
                return false;
            }
            inner
                .listeners
                .publish(BusEvent::EndpointConnected(ep.name().clone()));
            info!(endpoint = %ep.name(), peer = %ep.peer(), mechanism = %done.mechanism, "endpoint authenticated");
            return true;
        }
    }
}

async fn serve<C: Connection>(inner: &Arc<RouterInner>, ep: &Arc<Endpoint>, conn: &C) {
    loop {
        let received = tokio::select! {
            biased;
            () = ep.wait_kicked() => return,
            () = inner.shutdown.stopped() => return,
            received = conn.receive() => received,
        };
        let bytes = match received {
            Ok(bytes) => bytes,
            Err(TransportError::Disconnected) => {
                debug!(endpoint = %ep.name(), "peer disconnected");
                return;
            }
            Err(e) => {
                warn!(endpoint = %ep.name(), error = %e, "receive failed");
                return;
            }
        };
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(endpoint = %ep.name(), error = %e, "dropping undecodable frame");
                continue;
            }
        };
        match frame {
            Frame::Handshake(HandshakeMessage::Offer { .. }) => {
                ep.enqueue(Outbound::Handshake(HandshakeMessage::Busy));
            }
            Frame::Handshake(HandshakeMessage::Failed { reason, .. }) => {
                warn!(endpoint = %ep.name(), reason = %reason, "peer abandoned the handshake after welcome");
                return;
            }
            Frame::Handshake(other) => {
                debug!(endpoint = %ep.name(), kind = other.kind(), "ignoring handshake message after authentication");
            }
            Frame::Message(_) => {
                warn!(endpoint = %ep.name(), "dropping unprotected message");
            }
            protected @ (Frame::Sealed(_) | Frame::Signed(_)) => {
                let Some(cipher) = ep.cipher() else {
                    return;
                };
                match protected.unprotect(cipher) {
                    Ok(msg) => inner.route(ep, msg).await,
                    Err(e) => warn!(endpoint = %ep.name(), error = %e, "dropping frame that failed verification"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AttachOptions, Attachment, SessionAcceptor};
    use crate::security::StaticCredentials;
    use meshbus_core::Mechanism;
    use meshbus_transport::MemoryConnection;

    struct AcceptAll;

    impl SessionAcceptor for AcceptAll {
        fn accept_session(&self, _: SessionPort, _: SessionId, _: &UniqueName, _: &SessionOpts) -> bool {
            true
        }
    }

    fn anonymous() -> AttachOptions {
        AttachOptions::new(Arc::new(StaticCredentials::new())).with_mechanisms(vec![Mechanism::EcdheNull])
    }

    async fn attach_client(router: &Router, options: AttachOptions) -> Attachment<MemoryConnection> {
        let (server, client) = MemoryConnection::pair("router", "client");
        router.attach(server).await.unwrap();
        Attachment::connect(client, options).await.unwrap()
    }

    fn router() -> Router {
        Router::with_guid(
            RouterConfig::default(),
            Arc::new(StaticCredentials::new()),
            RouterGuid::new([0xab; 16]),
        )
    }

    #[test]
    fn bus_name_is_index_zero() {
        let router = router();
        assert_eq!(router.bus_name().as_str(), ":abababab.0");
        assert!(!router.is_running());
    }

    #[tokio::test]
    async fn attach_requires_a_started_router() {
        let router = router();
        let (server, _client) = MemoryConnection::pair("router", "client");
        assert!(matches!(router.attach(server).await, Err(RouterError::Stopped)));

        router.start().await.unwrap();
        let (server, _client) = MemoryConnection::pair("router", "client");
        let name = router.attach(server).await.unwrap();
        assert_eq!(name.as_str(), ":abababab.1");
        // Not authenticated yet, so not listed.
        assert!(router.endpoints().is_empty());

        router.stop();
        router.join().await;
        assert!(matches!(router.start().await, Err(RouterError::Stopped)));
    }

    #[tokio::test]
    async fn endpoint_limit_refuses_connections() {
        let config = RouterConfig {
            max_endpoints: 1,
            ..RouterConfig::default()
        };
        let router = Router::new(config, Arc::new(StaticCredentials::new()));
        router.start().await.unwrap();
        let (a, _a) = MemoryConnection::pair("router", "a");
        let (b, _b) = MemoryConnection::pair("router", "b");
        router.attach(a).await.unwrap();
        assert!(matches!(
            router.attach(b).await,
            Err(RouterError::LimitsExceeded("endpoints"))
        ));
        router.stop();
        router.join().await;
    }

    #[tokio::test]
    async fn join_from_an_endpoint_being_removed_reserves_nothing() {
        let config = RouterConfig {
            max_sessions: 1,
            ..RouterConfig::default()
        };
        let router = Router::with_guid(
            config,
            Arc::new(StaticCredentials::new()),
            RouterGuid::new([0xab; 16]),
        );
        router.start().await.unwrap();
        let host = attach_client(&router, anonymous().with_acceptor(Arc::new(AcceptAll))).await;
        let leaving = attach_client(&router, anonymous()).await;
        let staying = attach_client(&router, anonymous()).await;
        let port = router
            .bind_session_port(host.unique_name(), SessionPort(5), SessionOpts::default())
            .unwrap();
        let host_name = BusName::Unique(host.unique_name().clone());

        // Removal has begun but has not reached the session table yet.
        let ep = router.inner.endpoints.get(leaving.unique_name()).unwrap();
        assert!(ep.begin_removal());
        let refused = router
            .request_join(leaving.unique_name(), &host_name, port, SessionOpts::default())
            .await;
        assert!(matches!(refused, Err(RouterError::UnknownEndpoint(_))), "{refused:?}");

        // Room for a single session: only free if the refused join reserved nothing.
        let (id, _) = router
            .request_join(staying.unique_name(), &host_name, port, SessionOpts::default())
            .await
            .unwrap();
        assert_eq!(
            router.session_members(id).unwrap(),
            vec![host.unique_name().clone(), staying.unique_name().clone()]
        );
        assert!(!lock(&router.inner.sessions).is_participant(id, leaving.unique_name()));

        router.stop();
        router.join().await;
    }

    #[tokio::test]
    async fn removal_of_unknown_endpoint_is_a_no_op() {
        let router = router();
        let stranger = UniqueName::new(&RouterGuid::new([1; 16]), 9);
        assert!(!router.remove_endpoint(&stranger));
        assert!(matches!(
            router.claim_name(&stranger, &"org.example.A".parse().unwrap(), ClaimFlags::default()),
            Err(RouterError::UnknownEndpoint(_))
        ));
        assert!(matches!(
            router.claim_name(&stranger, &BUS_NAME.parse().unwrap(), ClaimFlags::default()),
            Err(RouterError::ReservedName(_))
        ));
    }
}
