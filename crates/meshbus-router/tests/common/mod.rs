//! Shared fixtures: a started router and clients attached to it over
//! in-memory connections.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshbus_core::bus::{BUS_INTERFACE, BUS_NAME, BUS_PATH, NameListReply, SessionLostReason, member};
use meshbus_core::{
    BusName, Frame, HandshakeMessage, Mechanism, Message, RouterGuid, Serial, SessionId, SessionPort,
    UniqueName, WellKnownName,
};
use meshbus_crypto::SessionCipher;
use meshbus_router::security::{Handshake, Role};
use meshbus_router::{
    AttachOptions, Attachment, BusEvent, BusListener, Router, RouterConfig, StaticCredentials,
};
use meshbus_transport::{Connection, MemoryConnection};

pub type Client = Attachment<MemoryConnection>;

/// Generous bound for anything that should happen "soon".
pub const SOON: Duration = Duration::from_secs(5);

pub async fn started_router(config: RouterConfig) -> Router {
    let router = Router::with_guid(
        config,
        Arc::new(StaticCredentials::new()),
        RouterGuid::new([0xab; 16]),
    );
    router.start().await.unwrap();
    router
}

pub fn anonymous() -> AttachOptions {
    AttachOptions::new(Arc::new(StaticCredentials::new())).with_mechanisms(vec![Mechanism::EcdheNull])
}

pub async fn attach_with(router: &Router, options: AttachOptions) -> Client {
    let (server, client) = MemoryConnection::pair("router", "client");
    router.attach(server).await.unwrap();
    Attachment::connect(client, options).await.unwrap()
}

pub async fn attach(router: &Router) -> Client {
    attach_with(router, anonymous()).await
}

/// Wait for the next signal named `member`, skipping any others.
pub async fn signal_named(client: &Client, member: &str) -> Message {
    tokio::time::timeout(SOON, async {
        loop {
            let signal = client.next_signal().await.expect("client disconnected");
            if signal.member.as_deref() == Some(member) {
                return signal;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {member} signal arrived"))
}

/// Drain already-delivered signals and count those named `member`.
pub fn count_queued(client: &Client, member: &str) -> usize {
    std::iter::from_fn(|| client.try_next_signal())
        .filter(|s| s.member.as_deref() == Some(member))
        .count()
}

pub async fn shutdown(router: &Router) {
    router.stop();
    tokio::time::timeout(SOON, router.join()).await.unwrap();
}

pub async fn send_handshake(conn: &MemoryConnection, msg: HandshakeMessage) {
    conn.send(&Frame::Handshake(msg).encode().unwrap()).await.unwrap();
}

pub async fn recv_frame(conn: &MemoryConnection) -> Frame {
    let bytes = tokio::time::timeout(SOON, conn.receive())
        .await
        .expect("router went quiet")
        .unwrap();
    Frame::decode(&bytes).unwrap()
}

pub async fn recv_handshake(conn: &MemoryConnection) -> HandshakeMessage {
    match recv_frame(conn).await {
        Frame::Handshake(msg) => msg,
        other => panic!("expected a handshake frame, got {other:?}"),
    }
}

/// Drive an anonymous initiator handshake step by step until `Welcome`.
pub async fn handshake_by_hand(conn: &MemoryConnection) -> (UniqueName, SessionCipher) {
    let mut hs = Handshake::new(
        Role::Initiator,
        "router",
        vec![Mechanism::EcdheNull],
        3,
        Arc::new(StaticCredentials::new()),
    );
    send_handshake(conn, hs.offer().unwrap()).await;
    let mut cipher = None;
    loop {
        match recv_handshake(conn).await {
            HandshakeMessage::Welcome { unique_name } => {
                return (unique_name, cipher.expect("welcome before key confirmation"));
            }
            msg => {
                for reply in hs.receive(msg).unwrap() {
                    send_handshake(conn, reply).await;
                }
                if let Some(done) = hs.complete() {
                    cipher = Some(done.cipher);
                }
            }
        }
    }
}

/// An authenticated peer that speaks frames directly, for behaviour the
/// client library would not produce: silence, stray replies, forged fields.
pub struct RawPeer {
    pub conn: MemoryConnection,
    pub name: UniqueName,
    cipher: SessionCipher,
    next_serial: u32,
}

impl RawPeer {
    pub async fn connect(router: &Router) -> Self {
        let (server, conn) = MemoryConnection::pair("router", "raw");
        router.attach(server).await.unwrap();
        let (name, cipher) = handshake_by_hand(&conn).await;
        Self::authenticated(conn, name, cipher)
    }

    pub fn authenticated(conn: MemoryConnection, name: UniqueName, cipher: SessionCipher) -> Self {
        Self {
            conn,
            name,
            cipher,
            next_serial: 1,
        }
    }

    /// Names the router lists, fetched over this connection.
    pub async fn list_names(&mut self) -> Vec<BusName> {
        let bus: BusName = BUS_NAME.parse().unwrap();
        let call = Message::method_call(bus, BUS_PATH, BUS_INTERFACE, member::LIST_NAMES);
        let reply: NameListReply = self.call(call).await.args().unwrap();
        reply.names
    }

    pub async fn send(&self, msg: &Message) {
        let frame = Frame::protect(msg, &self.cipher, true).unwrap();
        self.conn.send(&frame.encode().unwrap()).await.unwrap();
    }

    /// The next routed message, skipping handshake chatter.
    pub async fn recv(&self) -> Message {
        loop {
            match recv_frame(&self.conn).await {
                frame @ (Frame::Sealed(_) | Frame::Signed(_)) => return frame.unprotect(&self.cipher).unwrap(),
                _ => continue,
            }
        }
    }

    /// Send a call and wait for its reply, dropping anything else that arrives first.
    pub async fn call(&mut self, mut msg: Message) -> Message {
        msg.serial = Serial(self.next_serial);
        self.next_serial += 1;
        self.send(&msg).await;
        loop {
            let reply = self.recv().await;
            if reply.reply_serial == Some(msg.serial) {
                return reply;
            }
        }
    }
}

/// Records every listener event in delivery order.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<BusEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: BusEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl BusListener for Recorder {
    fn endpoint_connected(&self, endpoint: &UniqueName) {
        self.push(BusEvent::EndpointConnected(endpoint.clone()));
    }

    fn endpoint_disconnected(&self, endpoint: &UniqueName) {
        self.push(BusEvent::EndpointDisconnected(endpoint.clone()));
    }

    fn name_owner_changed(
        &self,
        name: &WellKnownName,
        old_owner: Option<&UniqueName>,
        new_owner: Option<&UniqueName>,
    ) {
        self.push(BusEvent::NameOwnerChanged {
            name: name.clone(),
            old_owner: old_owner.cloned(),
            new_owner: new_owner.cloned(),
        });
    }

    fn name_queued(&self, name: &WellKnownName, endpoint: &UniqueName) {
        self.push(BusEvent::NameQueued {
            name: name.clone(),
            endpoint: endpoint.clone(),
        });
    }

    fn session_joined(
        &self,
        host: &UniqueName,
        port: SessionPort,
        session_id: SessionId,
        joiner: &UniqueName,
    ) {
        self.push(BusEvent::SessionJoined {
            host: host.clone(),
            port,
            session_id,
            joiner: joiner.clone(),
        });
    }

    fn session_lost(
        &self,
        member: &UniqueName,
        session_id: SessionId,
        reason: SessionLostReason,
    ) {
        self.push(BusEvent::SessionLost {
            member: member.clone(),
            session_id,
            reason,
        });
    }

    fn stopping(&self) {
        self.push(BusEvent::Stopping);
    }
}
