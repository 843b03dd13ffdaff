//! The client side of a router connection.
//!
//! [`Attachment::connect`] runs the initiator handshake over any
//! [`Connection`], then spawns a reader task that correlates replies with
//! outstanding calls, queues signals and answers calls made to the
//! application: `AcceptSession` from the router, and anything else through an
//! optional [`MethodHandler`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshbus_core::bus::{
    AcceptSessionArgs, BUS_NAME, BUS_PATH, BUS_INTERFACE, BindSessionPortArgs, BoolReply, BusArgs,
    JoinSessionArgs, JoinSessionReply, MatchRuleArgs, NameArgs, NameListReply, NameOwnerReply,
    ReleaseNameCode, ReleaseNameReply, RequestNameArgs, RequestNameCode, RequestNameReply,
    SESSION_HOST_INTERFACE, SessionIdArgs, SessionMemberArgs, SessionPortArgs,
    UniqueNameListReply, WellKnownNameArgs, error_names, member,
};
use meshbus_core::{
    BusName, Frame, HandshakeMessage, Mechanism, Message, MessageType, Serial, SessionId,
    SessionOpts, SessionPort, UniqueName, WellKnownName,
};
use meshbus_crypto::SessionCipher;
use meshbus_transport::{Connection, TransportError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{AuthError, RouterError};
use crate::router::lock;
use crate::security::{AuthListener, AuthState, Handshake, Role};

/// Decides whether to admit a joiner to a session this client hosts.
pub trait SessionAcceptor: Send + Sync + 'static {
    fn accept_session(
        &self,
        port: SessionPort,
        session_id: SessionId,
        joiner: &UniqueName,
        opts: &SessionOpts,
    ) -> bool;
}

/// Answers method calls addressed to this client.
///
/// Returning `None` sends nothing back; the caller will see a timeout.
pub trait MethodHandler: Send + Sync + 'static {
    fn handle(&self, call: &Message) -> Option<Message>;
}

#[derive(Clone)]
pub struct AttachOptions {
    /// Mechanisms to offer, most preferred first.
    pub mechanisms: Vec<Mechanism>,
    pub credentials: Arc<dyn AuthListener>,
    pub max_attempts: u32,
    /// Time allowed from the first offer to `Welcome`.
    pub timeout: Duration,
    /// Default timeout of [`Attachment::call`] and the bus wrappers.
    pub call_timeout: Duration,
    /// Seal outgoing traffic rather than only MAC it.
    pub encrypt: bool,
    /// Signals buffered before new ones are dropped.
    pub signal_queue: usize,
    pub acceptor: Option<Arc<dyn SessionAcceptor>>,
    pub handler: Option<Arc<dyn MethodHandler>>,
}

impl AttachOptions {
    pub fn new(credentials: Arc<dyn AuthListener>) -> Self {
        Self {
            mechanisms: Mechanism::ALL.to_vec(),
            credentials,
            max_attempts: 3,
            timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            encrypt: true,
            signal_queue: 256,
            acceptor: None,
            handler: None,
        }
    }

    pub fn with_mechanisms(mut self, mechanisms: Vec<Mechanism>) -> Self {
        self.mechanisms = mechanisms;
        self
    }

    pub fn with_acceptor(mut self, acceptor: Arc<dyn SessionAcceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn MethodHandler>) -> Self {
        self.handler = Some(handler);
        self
    }
}

struct Shared<C> {
    conn: C,
    unique_name: UniqueName,
    cipher: SessionCipher,
    encrypt: bool,
    replies: Mutex<HashMap<Serial, oneshot::Sender<Message>>>,
    acceptor: Option<Arc<dyn SessionAcceptor>>,
    handler: Option<Arc<dyn MethodHandler>>,
    closing: watch::Sender<bool>,
    next_serial: AtomicU32,
}

impl<C> Shared<C> {
    fn next_serial(&self) -> Serial {
        loop {
            let serial = Serial(self.next_serial.fetch_add(1, Ordering::Relaxed));
            if serial != Serial::NONE {
                return serial;
            }
        }
    }
}

impl<C: Connection> Shared<C> {
    async fn send(&self, msg: &Message) -> Result<(), RouterError> {
        let frame = Frame::protect(msg, &self.cipher, self.encrypt)?;
        self.conn.send(&frame.encode()?).await?;
        Ok(())
    }
}

/// An authenticated connection to a router.
pub struct Attachment<C: Connection> {
    shared: Arc<Shared<C>>,
    call_timeout: Duration,
    signals: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connection> Attachment<C> {
    /// Authenticate over `conn` and start serving it.
    pub async fn connect(conn: C, options: AttachOptions) -> Result<Self, RouterError> {
        let outcome = tokio::time::timeout(options.timeout, handshake(&conn, &options)).await;
        let (unique_name, cipher) = match outcome {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                let _ = conn.disconnect().await;
                return Err(e);
            }
            Err(_elapsed) => {
                let _ = conn.disconnect().await;
                return Err(AuthError::Timeout.into());
            }
        };
        debug!(name = %unique_name, peer = conn.peer(), "attached to router");

        let (closing, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            conn,
            unique_name,
            cipher,
            encrypt: options.encrypt,
            replies: Mutex::new(HashMap::new()),
            acceptor: options.acceptor,
            handler: options.handler,
            closing,
            next_serial: AtomicU32::new(1),
        });
        let (signal_tx, signal_rx) = mpsc::channel(options.signal_queue.max(1));
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), signal_tx));
        Ok(Self {
            shared,
            call_timeout: options.call_timeout,
            signals: tokio::sync::Mutex::new(signal_rx),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// The unique name the router assigned.
    pub fn unique_name(&self) -> &UniqueName {
        &self.shared.unique_name
    }

    pub fn is_connected(&self) -> bool {
        self.shared.conn.is_connected()
    }

    /// Send without waiting for anything back. Assigns a serial if `msg` has none.
    pub async fn send(&self, mut msg: Message) -> Result<Serial, RouterError> {
        if msg.serial == Serial::NONE {
            msg.serial = self.shared.next_serial();
        }
        self.shared.send(&msg).await?;
        Ok(msg.serial)
    }

    /// Emit a signal.
    pub async fn signal(&self, msg: Message) -> Result<(), RouterError> {
        self.send(msg).await.map(|_| ())
    }

    /// Make a call and wait for the reply. Error replies come back as
    /// [`RouterError::ErrorReply`].
    pub async fn call(&self, msg: Message) -> Result<Message, RouterError> {
        self.call_with_timeout(msg, self.call_timeout).await
    }

    pub async fn call_with_timeout(&self, mut msg: Message, timeout: Duration) -> Result<Message, RouterError> {
        msg.serial = self.shared.next_serial();
        let serial = msg.serial;
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.replies).insert(serial, tx);

        if let Err(e) = self.shared.send(&msg).await {
            lock(&self.shared.replies).remove(&serial);
            return Err(e);
        }
        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_closed)) => return Err(TransportError::Disconnected.into()),
            Err(_elapsed) => {
                lock(&self.shared.replies).remove(&serial);
                return Err(RouterError::Timeout("method reply"));
            }
        };
        if reply.msg_type == MessageType::Error {
            return Err(RouterError::ErrorReply {
                name: reply.error_name.clone().unwrap_or_default(),
                text: reply.error_text().unwrap_or_default().to_owned(),
            });
        }
        Ok(reply)
    }

    /// The next signal delivered to this client, or `None` once disconnected.
    pub async fn next_signal(&self) -> Option<Message> {
        self.signals.lock().await.recv().await
    }

    /// A signal that is already queued, if any.
    pub fn try_next_signal(&self) -> Option<Message> {
        self.signals.try_lock().ok()?.try_recv().ok()
    }

    pub async fn disconnect(&self) {
        self.shared.closing.send_replace(true);
        let _ = self.shared.conn.disconnect().await;
        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }

    async fn bus_call<A: BusArgs>(&self, method: &str, args: &A) -> Result<Message, RouterError> {
        let call = bus_method(method)?.with_args(args)?;
        self.call(call).await
    }

    pub async fn request_name(&self, name: &WellKnownName, flags: u32) -> Result<RequestNameCode, RouterError> {
        let args = RequestNameArgs {
            name: name.clone(),
            flags,
        };
        let reply: RequestNameReply = self.bus_call(member::REQUEST_NAME, &args).await?.args()?;
        Ok(reply.code)
    }

    pub async fn release_name(&self, name: &WellKnownName) -> Result<ReleaseNameCode, RouterError> {
        let args = WellKnownNameArgs { name: name.clone() };
        let reply: ReleaseNameReply = self.bus_call(member::RELEASE_NAME, &args).await?.args()?;
        Ok(reply.code)
    }

    pub async fn get_name_owner(&self, name: impl Into<BusName>) -> Result<UniqueName, RouterError> {
        let args = NameArgs { name: name.into() };
        let reply: NameOwnerReply = self.bus_call(member::GET_NAME_OWNER, &args).await?.args()?;
        Ok(reply.owner)
    }

    pub async fn name_has_owner(&self, name: impl Into<BusName>) -> Result<bool, RouterError> {
        let args = NameArgs { name: name.into() };
        let reply: BoolReply = self.bus_call(member::NAME_HAS_OWNER, &args).await?.args()?;
        Ok(reply.value)
    }

    pub async fn list_names(&self) -> Result<Vec<BusName>, RouterError> {
        let reply: NameListReply = self.call(bus_method(member::LIST_NAMES)?).await?.args()?;
        Ok(reply.names)
    }

    pub async fn list_queued_owners(&self, name: impl Into<BusName>) -> Result<Vec<UniqueName>, RouterError> {
        let args = NameArgs { name: name.into() };
        let reply: UniqueNameListReply = self.bus_call(member::LIST_QUEUED_OWNERS, &args).await?.args()?;
        Ok(reply.names)
    }

    pub async fn add_match(&self, rule: &str) -> Result<(), RouterError> {
        let args = MatchRuleArgs { rule: rule.to_owned() };
        self.bus_call(member::ADD_MATCH, &args).await.map(|_| ())
    }

    pub async fn remove_match(&self, rule: &str) -> Result<(), RouterError> {
        let args = MatchRuleArgs { rule: rule.to_owned() };
        self.bus_call(member::REMOVE_MATCH, &args).await.map(|_| ())
    }

    pub async fn bind_session_port(&self, port: SessionPort, opts: SessionOpts) -> Result<SessionPort, RouterError> {
        let args = BindSessionPortArgs { port, opts };
        let reply: SessionPortArgs = self.bus_call(member::BIND_SESSION_PORT, &args).await?.args()?;
        Ok(reply.port)
    }

    pub async fn unbind_session_port(&self, port: SessionPort) -> Result<(), RouterError> {
        let args = SessionPortArgs { port };
        self.bus_call(member::UNBIND_SESSION_PORT, &args).await.map(|_| ())
    }

    pub async fn join_session(
        &self,
        host: impl Into<BusName>,
        port: SessionPort,
        opts: SessionOpts,
    ) -> Result<(SessionId, SessionOpts), RouterError> {
        let args = JoinSessionArgs {
            host: host.into(),
            port,
            opts,
        };
        let reply: JoinSessionReply = self.bus_call(member::JOIN_SESSION, &args).await?.args()?;
        Ok((reply.session_id, reply.opts))
    }

    pub async fn leave_session(&self, session_id: SessionId) -> Result<(), RouterError> {
        let args = SessionIdArgs { session_id };
        self.bus_call(member::LEAVE_SESSION, &args).await.map(|_| ())
    }

    pub async fn remove_session_member(&self, session_id: SessionId, member: &UniqueName) -> Result<(), RouterError> {
        let args = SessionMemberArgs {
            session_id,
            member: member.clone(),
        };
        self.bus_call(member::REMOVE_SESSION_MEMBER, &args).await.map(|_| ())
    }

    pub async fn session_members(&self, session_id: SessionId) -> Result<Vec<UniqueName>, RouterError> {
        let args = SessionIdArgs { session_id };
        let reply: UniqueNameListReply = self.bus_call(member::GET_SESSION_MEMBERS, &args).await?.args()?;
        Ok(reply.names)
    }

    pub async fn ping(&self, name: impl Into<BusName>) -> Result<(), RouterError> {
        let args = NameArgs { name: name.into() };
        self.bus_call(member::PING, &args).await.map(|_| ())
    }
}

impl<C: Connection> Drop for Attachment<C> {
    fn drop(&mut self) {
        self.shared.closing.send_replace(true);
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

impl<C: Connection> core::fmt::Debug for Attachment<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Attachment")
            .field("unique_name", &self.shared.unique_name)
            .field("peer", &self.shared.conn.peer())
            .finish_non_exhaustive()
    }
}

fn bus_method(method: &str) -> Result<Message, RouterError> {
    let bus: BusName = BUS_NAME.parse()?;
    Ok(Message::method_call(bus, BUS_PATH, BUS_INTERFACE, method))
}

async fn send_handshake<C: Connection>(conn: &C, msg: HandshakeMessage) -> Result<(), RouterError> {
    trace!(kind = msg.kind(), "sending handshake message");
    conn.send(&Frame::Handshake(msg).encode()?).await?;
    Ok(())
}

/// Run the initiator side until `Welcome`.
///
/// A rejection the router marks as retryable drops the mechanism that failed
/// and offers the rest. Failures detected here are reported with
/// `Failed{retry: true}` and followed by a fresh offer while the attempt budget
/// lasts.
async fn handshake<C: Connection>(
    conn: &C,
    options: &AttachOptions,
) -> Result<(UniqueName, SessionCipher), RouterError> {
    let mut hs = Handshake::new(
        Role::Initiator,
        conn.peer(),
        options.mechanisms.clone(),
        options.max_attempts,
        Arc::clone(&options.credentials),
    );
    send_handshake(conn, hs.offer()?).await?;
    let mut cipher = None;

    loop {
        let msg = match Frame::decode(&conn.receive().await?)? {
            Frame::Handshake(msg) => msg,
            _ => {
                debug!("ignoring traffic frame while authenticating");
                continue;
            }
        };
        if let HandshakeMessage::Welcome { unique_name } = msg {
            return match cipher.take() {
                Some(cipher) => Ok((unique_name, cipher)),
                None => Err(AuthError::UnexpectedMessage {
                    state: hs.state().as_str(),
                    got: "welcome",
                }
                .into()),
            };
        }

        let stage = hs.state();
        match hs.receive(msg) {
            Ok(replies) => {
                for reply in replies {
                    send_handshake(conn, reply).await?;
                }
                if let Some(done) = hs.complete() {
                    debug!(mechanism = %done.mechanism, "handshake complete, awaiting welcome");
                    cipher = Some(done.cipher);
                }
            }
            Err(AuthError::Rejected { reason, retry: true }) => {
                // Refused before a mechanism was chosen: the same offer would fail again.
                let Some(failed) = hs.mechanism() else {
                    return Err(AuthError::Rejected { reason, retry: true }.into());
                };
                hs.drop_mechanism(failed);
                warn!(reason = %reason, attempts = hs.attempts(), "router rejected the attempt, retrying");
                send_handshake(conn, hs.offer()?).await?;
            }
            Err(e @ (AuthError::Rejected { .. } | AuthError::Busy)) => return Err(e.into()),
            Err(e) => {
                if e.rules_out_mechanism() {
                    if let Some(failed) = hs.mechanism() {
                        hs.drop_mechanism(failed);
                    }
                }
                let report = hs.fail(&e);
                // The router is already authenticated once its verifier is
                // sent, so that attempt cannot be repeated on this connection.
                if report.evict || stage == AuthState::VerifyingPeer || hs.mechanisms().is_empty() {
                    let failed = HandshakeMessage::Failed {
                        reason: e.to_string(),
                        retry: false,
                    };
                    let _ = send_handshake(conn, failed).await;
                    return Err(e.into());
                }
                warn!(error = %e, attempts = hs.attempts(), "handshake attempt failed, retrying");
                send_handshake(conn, report.message).await?;
                send_handshake(conn, hs.offer()?).await?;
            }
        }
    }
}

async fn read_loop<C: Connection>(shared: Arc<Shared<C>>, signals: mpsc::Sender<Message>) {
    let mut closing = shared.closing.subscribe();
    loop {
        let received = tokio::select! {
            biased;
            _ = closing.wait_for(|c| *c) => break,
            received = shared.conn.receive() => received,
        };
        let bytes = match received {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(name = %shared.unique_name, error = %e, "router connection closed");
                break;
            }
        };
        let msg = match Frame::decode(&bytes) {
            Ok(frame @ (Frame::Sealed(_) | Frame::Signed(_))) => match frame.unprotect(&shared.cipher) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(name = %shared.unique_name, error = %e, "dropping frame that failed verification");
                    continue;
                }
            },
            Ok(Frame::Handshake(msg)) => {
                debug!(kind = msg.kind(), "ignoring handshake message");
                continue;
            }
            Ok(Frame::Message(msg)) => {
                debug!(what = %msg.describe(), "ignoring unprotected message");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                continue;
            }
        };
        dispatch(&shared, &signals, msg).await;
    }
    // Outstanding calls see their reply channel close.
    lock(&shared.replies).clear();
}

async fn dispatch<C: Connection>(shared: &Shared<C>, signals: &mpsc::Sender<Message>, msg: Message) {
    match msg.msg_type {
        MessageType::MethodReturn | MessageType::Error => {
            let waiter = msg
                .reply_serial
                .and_then(|serial| lock(&shared.replies).remove(&serial));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => debug!(what = %msg.describe(), "dropping reply nobody waits for"),
            }
        }
        MessageType::Signal => {
            if signals.try_send(msg).is_err() {
                warn!(name = %shared.unique_name, "signal queue full, dropping signal");
            }
        }
        MessageType::MethodCall => {
            let reply = if msg.interface.as_deref() == Some(SESSION_HOST_INTERFACE)
                && msg.member.as_deref() == Some(member::ACCEPT_SESSION)
            {
                accept_session(shared, &msg)
            } else if let Some(handler) = &shared.handler {
                handler.handle(&msg)
            } else {
                Some(Message::error_reply(
                    &msg,
                    error_names::UNKNOWN_METHOD,
                    &format!("no handler for {}", msg.describe()),
                ))
            };
            if let Some(mut reply) = reply.filter(|_| msg.expects_reply()) {
                if reply.serial == Serial::NONE {
                    reply.serial = shared.next_serial();
                }
                if let Err(e) = shared.send(&reply).await {
                    debug!(error = %e, "failed to send reply");
                }
            }
        }
    }
}

fn accept_session<C>(shared: &Shared<C>, call: &Message) -> Option<Message> {
    let value = match call.args::<AcceptSessionArgs>() {
        Ok(args) => shared.acceptor.as_ref().is_some_and(|acceptor| {
            acceptor.accept_session(args.port, args.session_id, &args.joiner, &args.opts)
        }),
        Err(e) => {
            warn!(error = %e, "malformed AcceptSession call");
            false
        }
    };
    Message::method_return(call).with_args(&BoolReply { value }).ok()
}
