//! Well-known name ownership.
//!
//! Each name has an ordered list of claimants; the head is the primary owner
//! and the rest wait in claim order. The table is plain data: callers hold
//! it behind the router's name lock and turn the returned [`NameEvent`]s into
//! signals once the lock is released.

use std::collections::{BTreeMap, VecDeque};

use meshbus_core::bus::name_flags;
use meshbus_core::{UniqueName, WellKnownName};

/// Flags a claimant attaches to its claim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimFlags {
    /// Another claimant asking for replacement may take the name from us.
    pub allow_replacement: bool,
    /// Take the name if the current primary allows replacement.
    pub replace_existing: bool,
    /// Fail rather than wait in the queue (and leave it when displaced).
    pub do_not_queue: bool,
}

impl ClaimFlags {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            allow_replacement: bits & name_flags::ALLOW_REPLACEMENT != 0,
            replace_existing: bits & name_flags::REPLACE_EXISTING != 0,
            do_not_queue: bits & name_flags::DO_NOT_QUEUE != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The claimant is now primary owner.
    Owner,
    /// The claimant already was primary owner; its flags were updated.
    AlreadyOwner,
    Queued,
    /// The name is owned and the claim could neither replace nor queue.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotOwner,
    NonExistent,
}

/// An ownership transition, emitted in the order the transitions happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameEvent {
    OwnerChanged {
        name: WellKnownName,
        old: Option<UniqueName>,
        new: Option<UniqueName>,
    },
    Queued {
        name: WellKnownName,
        endpoint: UniqueName,
    },
}

#[derive(Debug, Clone)]
struct Claimant {
    endpoint: UniqueName,
    allow_replacement: bool,
    do_not_queue: bool,
}

impl Claimant {
    fn new(endpoint: &UniqueName, flags: ClaimFlags) -> Self {
        Self {
            endpoint: endpoint.clone(),
            allow_replacement: flags.allow_replacement,
            do_not_queue: flags.do_not_queue,
        }
    }
}

/// Claimants of one name. Never empty while stored in the table.
#[derive(Debug)]
struct NameRecord {
    claimants: VecDeque<Claimant>,
}

impl NameRecord {
    fn primary(&self) -> Option<&Claimant> {
        self.claimants.front()
    }

    fn position(&self, endpoint: &UniqueName) -> Option<usize> {
        self.claimants.iter().position(|c| &c.endpoint == endpoint)
    }
}

pub struct NameTable {
    records: BTreeMap<WellKnownName, NameRecord>,
}

impl NameTable {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    pub fn claim(
        &mut self,
        endpoint: &UniqueName,
        name: &WellKnownName,
        flags: ClaimFlags,
        events: &mut Vec<NameEvent>,
    ) -> ClaimOutcome {
        let Some(record) = self.records.get_mut(name) else {
            self.records.insert(
                name.clone(),
                NameRecord {
                    claimants: VecDeque::from([Claimant::new(endpoint, flags)]),
                },
            );
            events.push(NameEvent::OwnerChanged {
                name: name.clone(),
                old: None,
                new: Some(endpoint.clone()),
            });
            return ClaimOutcome::Owner;
        };

        let claimant = Claimant::new(endpoint, flags);
        let existing = record.position(endpoint);

        if existing == Some(0) {
            record.claimants[0] = claimant;
            return ClaimOutcome::AlreadyOwner;
        }

        let primary_replaceable = record.primary().is_some_and(|p| p.allow_replacement);
        if flags.replace_existing && primary_replaceable {
            if let Some(pos) = existing {
                record.claimants.remove(pos);
            }
            let mut old_endpoint = None;
            if let Some(old) = record.claimants.pop_front() {
                old_endpoint = Some(old.endpoint.clone());
                if !old.do_not_queue {
                    record.claimants.push_back(old);
                }
            }
            record.claimants.push_front(claimant);
            events.push(NameEvent::OwnerChanged {
                name: name.clone(),
                old: old_endpoint,
                new: Some(endpoint.clone()),
            });
            return ClaimOutcome::Owner;
        }

        if flags.do_not_queue {
            if let Some(pos) = existing {
                record.claimants.remove(pos);
            }
            return ClaimOutcome::Rejected;
        }

        match existing {
            Some(pos) => record.claimants[pos] = claimant,
            None => {
                record.claimants.push_back(claimant);
                events.push(NameEvent::Queued {
                    name: name.clone(),
                    endpoint: endpoint.clone(),
                });
            }
        }
        ClaimOutcome::Queued
    }

    pub fn release(
        &mut self,
        endpoint: &UniqueName,
        name: &WellKnownName,
        events: &mut Vec<NameEvent>,
    ) -> ReleaseOutcome {
        let Some(record) = self.records.get_mut(name) else {
            return ReleaseOutcome::NonExistent;
        };
        match record.position(endpoint) {
            Some(0) => {
                self.drop_primary(name, events);
                ReleaseOutcome::Released
            }
            Some(pos) => {
                record.claimants.remove(pos);
                ReleaseOutcome::Released
            }
            None => ReleaseOutcome::NotOwner,
        }
    }

    /// Purge `endpoint` from every record, promoting queued claimants where
    /// it was primary.
    pub fn endpoint_removed(&mut self, endpoint: &UniqueName, events: &mut Vec<NameEvent>) {
        let mut primaries = Vec::new();
        for (name, record) in self.records.iter_mut() {
            match record.position(endpoint) {
                Some(0) => primaries.push(name.clone()),
                Some(pos) => {
                    record.claimants.remove(pos);
                }
                None => {}
            }
        }
        for name in primaries {
            self.drop_primary(&name, events);
        }
    }

    fn drop_primary(&mut self, name: &WellKnownName, events: &mut Vec<NameEvent>) {
        let Some(record) = self.records.get_mut(name) else {
            return;
        };
        let old = record.claimants.pop_front().map(|c| c.endpoint);
        let new = record.primary().map(|c| c.endpoint.clone());
        if new.is_none() {
            self.records.remove(name);
        }
        events.push(NameEvent::OwnerChanged {
            name: name.clone(),
            old,
            new,
        });
    }

    pub fn resolve(&self, name: &WellKnownName) -> Option<&UniqueName> {
        self.records
            .get(name)
            .and_then(NameRecord::primary)
            .map(|c| &c.endpoint)
    }

    /// Every name with an owner, in sorted order.
    pub fn list_names(&self) -> Vec<WellKnownName> {
        self.records.keys().cloned().collect()
    }

    /// Primary owner followed by the queue, in promotion order.
    pub fn queued_owners(&self, name: &WellKnownName) -> Vec<UniqueName> {
        self.records
            .get(name)
            .map(|r| r.claimants.iter().map(|c| c.endpoint.clone()).collect())
            .unwrap_or_default()
    }

    /// Names for which `endpoint` is primary owner.
    pub fn names_owned_by(&self, endpoint: &UniqueName) -> Vec<WellKnownName> {
        self.records
            .iter()
            .filter(|(_, r)| r.primary().is_some_and(|p| &p.endpoint == endpoint))
            .map(|(name, _)| name.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for NameTable {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use meshbus_core::RouterGuid;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Claim(u8, u8, u32),
        Release(u8, u8),
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u8..5, 0u8..3, 0u32..8).prop_map(|(e, n, f)| Op::Claim(e, n, f)),
            2 => (0u8..5, 0u8..3).prop_map(|(e, n)| Op::Release(e, n)),
            1 => (0u8..5).prop_map(Op::Remove),
        ]
    }

    fn endpoint(n: u8) -> UniqueName {
        UniqueName::new(&RouterGuid::new([1; 16]), u64::from(n))
    }

    fn name(n: u8) -> WellKnownName {
        format!("svc.n{n}").parse().unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Replaying the event stream reproduces the table's owners, every
        /// claimant appears at most once per name, and no name is left
        /// without a primary.
        #[test]
        fn events_track_a_single_primary(ops in proptest::collection::vec(op(), 1..64)) {
            let mut table = NameTable::new();
            let mut owners: BTreeMap<WellKnownName, UniqueName> = BTreeMap::new();
            for op in ops {
                let mut events = Vec::new();
                match op {
                    Op::Claim(e, n, f) => {
                        let outcome = table.claim(&endpoint(e), &name(n), ClaimFlags::from_bits(f), &mut events);
                        let is_primary = table.resolve(&name(n)) == Some(&endpoint(e));
                        prop_assert_eq!(
                            is_primary,
                            matches!(outcome, ClaimOutcome::Owner | ClaimOutcome::AlreadyOwner)
                        );
                    }
                    Op::Release(e, n) => {
                        table.release(&endpoint(e), &name(n), &mut events);
                    }
                    Op::Remove(e) => {
                        table.endpoint_removed(&endpoint(e), &mut events);
                        prop_assert!(table.names_owned_by(&endpoint(e)).is_empty());
                    }
                }
                for event in events {
                    if let NameEvent::OwnerChanged { name, old, new } = event {
                        prop_assert_eq!(owners.get(&name).cloned(), old);
                        match new {
                            Some(owner) => owners.insert(name, owner),
                            None => owners.remove(&name),
                        };
                    }
                }
                for n in 0..3 {
                    prop_assert_eq!(table.resolve(&name(n)), owners.get(&name(n)));
                    let claimants = table.queued_owners(&name(n));
                    let mut dedup = claimants.clone();
                    dedup.sort();
                    dedup.dedup();
                    prop_assert_eq!(dedup.len(), claimants.len());
                }
            }
        }
    }
}
