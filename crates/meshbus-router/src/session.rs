//! Session ports, joins and membership.
//!
//! A join runs in two halves around the host's `AcceptSession` answer:
//! [`SessionTable::begin_join`] validates the request and reserves a session
//! id, [`SessionTable::complete_join`] either establishes the session or
//! releases the reservation. The router awaits the host between the two
//! without holding the session lock.
//!
//! Torn-down session ids are parked as retiring until the router has queued
//! every `SessionLost` for them and calls [`SessionTable::release_retired`].

use std::collections::{HashMap, HashSet};

use meshbus_core::bus::SessionLostReason;
use meshbus_core::{SessionId, SessionOpts, SessionPort, UniqueName};

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub port: SessionPort,
    pub host: UniqueName,
    /// False once the host has left a multipoint session that outlived it.
    pub host_joined: bool,
    /// Joiners in join order.
    pub members: Vec<UniqueName>,
    pub opts: SessionOpts,
}

impl Session {
    /// Host (while joined) followed by the members.
    pub fn participants(&self) -> Vec<UniqueName> {
        let host = self.host_joined.then(|| self.host.clone());
        host.into_iter().chain(self.members.iter().cloned()).collect()
    }

    pub fn is_participant(&self, endpoint: &UniqueName) -> bool {
        (self.host_joined && &self.host == endpoint) || self.members.contains(endpoint)
    }
}

/// A join that passed validation and holds a reserved id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTicket {
    pub session_id: SessionId,
    pub host: UniqueName,
    pub joiner: UniqueName,
    pub port: SessionPort,
    /// Negotiated options the session will carry.
    pub opts: SessionOpts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Lost {
        to: UniqueName,
        session_id: SessionId,
        reason: SessionLostReason,
    },
    MemberAdded {
        to: UniqueName,
        session_id: SessionId,
        member: UniqueName,
    },
    MemberRemoved {
        to: UniqueName,
        session_id: SessionId,
        member: UniqueName,
    },
}

/// Notifications to deliver and ids to release once they are queued.
#[derive(Debug, Default)]
pub struct SessionChange {
    pub events: Vec<SessionEvent>,
    pub retired: Vec<SessionId>,
}

#[derive(Debug)]
pub struct Established {
    pub session_id: SessionId,
    pub opts: SessionOpts,
    /// `MemberAdded` for the participants already in a multipoint session.
    pub events: Vec<SessionEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    Left,
    Closed,
    Removed,
}

pub struct SessionTable {
    bindings: HashMap<(UniqueName, SessionPort), SessionOpts>,
    sessions: HashMap<SessionId, Session>,
    /// The one multipoint session of each multipoint binding, live or being joined.
    shared: HashMap<(UniqueName, SessionPort), SessionId>,
    /// Joiners waiting on the host, by reserved id.
    joining: HashMap<SessionId, Vec<UniqueName>>,
    retiring: HashSet<SessionId>,
    last_id: u32,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            bindings: HashMap::new(),
            sessions: HashMap::new(),
            shared: HashMap::new(),
            joining: HashMap::new(),
            retiring: HashSet::new(),
            last_id: 0,
            max_sessions,
        }
    }

    /// Advertise `port` on `host`. [`SessionPort::ANY`] picks the lowest free port.
    pub fn bind(
        &mut self,
        host: &UniqueName,
        port: SessionPort,
        opts: SessionOpts,
    ) -> Result<SessionPort, SessionError> {
        let port = if port == SessionPort::ANY {
            (1..=u16::MAX)
                .map(SessionPort)
                .find(|p| !self.bindings.contains_key(&(host.clone(), *p)))
                .ok_or(SessionError::PortsExhausted)?
        } else {
            port
        };
        let key = (host.clone(), port);
        if self.bindings.contains_key(&key) {
            return Err(SessionError::PortInUse(port));
        }
        self.bindings.insert(key, opts);
        Ok(port)
    }

    /// Withdraw a port. Sessions already established on it are unaffected.
    pub fn unbind(&mut self, host: &UniqueName, port: SessionPort) -> Result<(), SessionError> {
        let key = (host.clone(), port);
        if self.bindings.remove(&key).is_none() {
            return Err(SessionError::NoSuchPort {
                host: host.clone(),
                port,
            });
        }
        self.shared.remove(&key);
        Ok(())
    }

    pub fn binding(&self, host: &UniqueName, port: SessionPort) -> Option<&SessionOpts> {
        self.bindings.get(&(host.clone(), port))
    }

    pub fn begin_join(
        &mut self,
        joiner: &UniqueName,
        host: &UniqueName,
        port: SessionPort,
        requested: &SessionOpts,
    ) -> Result<JoinTicket, SessionError> {
        if joiner == host {
            return Err(SessionError::SelfJoin);
        }
        let key = (host.clone(), port);
        let bound = self.bindings.get(&key).ok_or_else(|| SessionError::NoSuchPort {
            host: host.clone(),
            port,
        })?;
        let mut opts = SessionOpts::negotiate(bound, requested).map_err(SessionError::Incompatible)?;

        let existing = if opts.multipoint {
            self.shared.get(&key).copied()
        } else {
            None
        };
        let session_id = match existing {
            Some(id) => {
                let already = self.sessions.get(&id).is_some_and(|s| s.is_participant(joiner))
                    || self.joining.get(&id).is_some_and(|j| j.contains(joiner));
                if already {
                    return Err(SessionError::AlreadyJoined(id));
                }
                if let Some(session) = self.sessions.get(&id) {
                    opts = SessionOpts::negotiate(&session.opts, requested)
                        .map_err(SessionError::Incompatible)?;
                }
                id
            }
            None => {
                let id = self.allocate_id()?;
                if opts.multipoint {
                    self.shared.insert(key, id);
                }
                id
            }
        };
        self.joining.entry(session_id).or_default().push(joiner.clone());

        Ok(JoinTicket {
            session_id,
            host: host.clone(),
            joiner: joiner.clone(),
            port,
            opts,
        })
    }

    /// Finish a join once the host has answered.
    ///
    /// Fails with [`SessionError::Rejected`] if the host said no or either side
    /// went away meanwhile, and with [`SessionError::NoSuchPort`] if the port
    /// was unbound.
    pub fn complete_join(
        &mut self,
        ticket: &JoinTicket,
        accepted: bool,
    ) -> Result<Established, SessionError> {
        let id = ticket.session_id;
        let was_waiting = match self.joining.get_mut(&id) {
            Some(waiting) => {
                let before = waiting.len();
                waiting.retain(|j| j != &ticket.joiner);
                let removed = waiting.len() != before;
                if waiting.is_empty() {
                    self.joining.remove(&id);
                }
                removed
            }
            None => false,
        };

        if !was_waiting || !accepted {
            self.abandon(id);
            return Err(SessionError::Rejected);
        }
        if !self.bindings.contains_key(&(ticket.host.clone(), ticket.port)) {
            self.abandon(id);
            return Err(SessionError::NoSuchPort {
                host: ticket.host.clone(),
                port: ticket.port,
            });
        }

        let mut events = Vec::new();
        let opts = match self.sessions.get_mut(&id) {
            Some(session) => {
                for to in session.participants() {
                    events.push(SessionEvent::MemberAdded {
                        to,
                        session_id: id,
                        member: ticket.joiner.clone(),
                    });
                }
                session.members.push(ticket.joiner.clone());
                session.opts
            }
            None => {
                self.sessions.insert(
                    id,
                    Session {
                        id,
                        port: ticket.port,
                        host: ticket.host.clone(),
                        host_joined: true,
                        members: vec![ticket.joiner.clone()],
                        opts: ticket.opts,
                    },
                );
                ticket.opts
            }
        };
        Ok(Established {
            session_id: id,
            opts,
            events,
        })
    }

    /// Forget a reserved id nobody ended up using.
    fn abandon(&mut self, id: SessionId) {
        if !self.sessions.contains_key(&id) && !self.joining.contains_key(&id) {
            self.shared.retain(|_, shared| *shared != id);
        }
    }

    pub fn leave(&mut self, endpoint: &UniqueName, id: SessionId) -> Result<SessionChange, SessionError> {
        let session = self.sessions.get(&id).ok_or(SessionError::NoSuchSession(id))?;
        if !session.is_participant(endpoint) {
            return Err(SessionError::NotParticipant(endpoint.clone()));
        }
        let mut change = SessionChange::default();
        self.depart(id, endpoint, Departure::Left, &mut change);
        Ok(change)
    }

    /// The host evicts a member of a multipoint session.
    pub fn remove_member(
        &mut self,
        host: &UniqueName,
        id: SessionId,
        member: &UniqueName,
    ) -> Result<SessionChange, SessionError> {
        let session = self.sessions.get(&id).ok_or(SessionError::NoSuchSession(id))?;
        if !(session.host_joined && &session.host == host) {
            return Err(SessionError::NotHost);
        }
        if !session.opts.multipoint {
            return Err(SessionError::NotMultipoint(id));
        }
        if !session.members.contains(member) {
            return Err(SessionError::NotParticipant(member.clone()));
        }
        let mut change = SessionChange::default();
        self.depart(id, member, Departure::Removed, &mut change);
        Ok(change)
    }

    /// Drop everything `endpoint` held: bindings, pending joins, memberships.
    pub fn endpoint_removed(&mut self, endpoint: &UniqueName) -> SessionChange {
        self.bindings.retain(|(host, _), _| host != endpoint);
        self.shared.retain(|(host, _), _| host != endpoint);

        let mut emptied = Vec::new();
        for (id, waiting) in self.joining.iter_mut() {
            waiting.retain(|j| j != endpoint);
            if waiting.is_empty() {
                emptied.push(*id);
            }
        }
        for id in emptied {
            self.joining.remove(&id);
            self.abandon(id);
        }

        let mut ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_participant(endpoint))
            .map(|s| s.id)
            .collect();
        ids.sort();

        let mut change = SessionChange::default();
        for id in ids {
            self.depart(id, endpoint, Departure::Closed, &mut change);
        }
        change
    }

    fn depart(&mut self, id: SessionId, leaver: &UniqueName, how: Departure, change: &mut SessionChange) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let was_host = session.host_joined && &session.host == leaver;
        if was_host {
            session.host_joined = false;
        } else {
            session.members.retain(|m| m != leaver);
        }
        if how == Departure::Removed {
            change.events.push(SessionEvent::Lost {
                to: leaver.clone(),
                session_id: id,
                reason: SessionLostReason::RemovedByHost,
            });
        }

        let remaining = session.participants();
        if session.opts.multipoint && remaining.len() >= 2 {
            for to in remaining {
                change.events.push(SessionEvent::MemberRemoved {
                    to,
                    session_id: id,
                    member: leaver.clone(),
                });
            }
            return;
        }

        let reason = if was_host && session.opts.multipoint {
            SessionLostReason::HostDeparted
        } else {
            match how {
                Departure::Closed => SessionLostReason::RemoteEndClosedAbruptly,
                Departure::Left | Departure::Removed => SessionLostReason::RemoteEndLeft,
            }
        };
        for to in remaining {
            change.events.push(SessionEvent::Lost {
                to,
                session_id: id,
                reason,
            });
        }
        let key = (session.host.clone(), session.port);
        if self.shared.get(&key) == Some(&id) {
            self.shared.remove(&key);
        }
        self.sessions.remove(&id);
        self.retiring.insert(id);
        change.retired.push(id);
    }

    /// Make torn-down ids available again. Call after their notifications are queued.
    pub fn release_retired(&mut self, ids: &[SessionId]) {
        for id in ids {
            self.retiring.remove(id);
        }
    }

    fn allocate_id(&mut self) -> Result<SessionId, SessionError> {
        let reserved_only = self
            .joining
            .keys()
            .filter(|id| !self.sessions.contains_key(id))
            .count();
        let in_use = self.sessions.len() + reserved_only + self.retiring.len();
        if in_use >= self.max_sessions {
            return Err(SessionError::IdsExhausted);
        }
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            let id = SessionId(self.last_id);
            if id.is_none() {
                continue;
            }
            if !self.sessions.contains_key(&id)
                && !self.joining.contains_key(&id)
                && !self.retiring.contains(&id)
            {
                return Ok(id);
            }
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn participants(&self, id: SessionId) -> Result<Vec<UniqueName>, SessionError> {
        self.sessions
            .get(&id)
            .map(Session::participants)
            .ok_or(SessionError::NoSuchSession(id))
    }

    pub fn is_participant(&self, id: SessionId, endpoint: &UniqueName) -> bool {
        self.sessions.get(&id).is_some_and(|s| s.is_participant(endpoint))
    }

    pub fn is_retiring(&self, id: SessionId) -> bool {
        self.retiring.contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
