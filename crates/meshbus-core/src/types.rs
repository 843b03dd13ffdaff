//! Strongly typed identifiers.
//!
//! Every connection gets a router-assigned [`UniqueName`] (`:<guid>.<n>`).
//! Endpoints may additionally own any number of [`WellKnownName`]s. Both are
//! accepted wherever a destination is expected, through [`BusName`].

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Longest permitted bus name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Random per-router identifier, embedded in every unique name it hands out.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouterGuid([u8; 16]);

impl RouterGuid {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The first four bytes as hex, the form used inside unique names.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for RouterGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RouterGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterGuid({}..)", self.short())
    }
}

/// Per-connection identity assigned by the router, e.g. `:1a2b3c4d.7`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UniqueName(String);

impl UniqueName {
    pub fn new(guid: &RouterGuid, serial: u64) -> Self {
        Self(format!(":{}.{serial}", guid.short()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UniqueName {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let valid = s.len() <= MAX_NAME_LEN
            && s.strip_prefix(':').is_some_and(|rest| {
                let mut parts = rest.split('.');
                matches!(
                    (parts.next(), parts.next(), parts.next()),
                    (Some(guid), Some(n), None)
                        if !guid.is_empty()
                            && guid.bytes().all(|b| b.is_ascii_alphanumeric())
                            && !n.is_empty()
                            && n.bytes().all(|b| b.is_ascii_digit())
                )
            });
        if valid {
            Ok(Self(s))
        } else {
            Err(CoreError::InvalidUniqueName(s))
        }
    }
}

impl From<UniqueName> for String {
    fn from(name: UniqueName) -> Self {
        name.0
    }
}

impl FromStr for UniqueName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl fmt::Display for UniqueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for UniqueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueName({})", self.0)
    }
}

/// A claimable, human-readable name such as `org.example.Svc`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WellKnownName(String);

impl WellKnownName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_well_known(s: &str) -> Result<(), &'static str> {
    if s.is_empty() {
        return Err("empty");
    }
    if s.len() > MAX_NAME_LEN {
        return Err("longer than 255 bytes");
    }
    if s.starts_with(':') {
        return Err("unique names cannot be claimed");
    }
    let mut elements = 0;
    for element in s.split('.') {
        elements += 1;
        let Some(first) = element.bytes().next() else {
            return Err("empty element");
        };
        if first.is_ascii_digit() {
            return Err("element starts with a digit");
        }
        if !element
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err("invalid character");
        }
    }
    if elements < 2 {
        return Err("needs at least two elements");
    }
    Ok(())
}

impl TryFrom<String> for WellKnownName {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match validate_well_known(&s) {
            Ok(()) => Ok(Self(s)),
            Err(reason) => Err(CoreError::InvalidName { name: s, reason }),
        }
    }
}

impl From<WellKnownName> for String {
    fn from(name: WellKnownName) -> Self {
        name.0
    }
}

impl FromStr for WellKnownName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl fmt::Display for WellKnownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for WellKnownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WellKnownName({})", self.0)
    }
}

/// Either kind of bus name. Parsed by the leading `:`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BusName {
    Unique(UniqueName),
    WellKnown(WellKnownName),
}

impl BusName {
    pub fn as_str(&self) -> &str {
        match self {
            BusName::Unique(n) => n.as_str(),
            BusName::WellKnown(n) => n.as_str(),
        }
    }

    pub fn as_unique(&self) -> Option<&UniqueName> {
        match self {
            BusName::Unique(n) => Some(n),
            BusName::WellKnown(_) => None,
        }
    }
}

impl TryFrom<String> for BusName {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.starts_with(':') {
            UniqueName::try_from(s).map(BusName::Unique)
        } else {
            WellKnownName::try_from(s).map(BusName::WellKnown)
        }
    }
}

impl From<BusName> for String {
    fn from(name: BusName) -> Self {
        match name {
            BusName::Unique(n) => n.into(),
            BusName::WellKnown(n) => n.into(),
        }
    }
}

impl FromStr for BusName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl From<UniqueName> for BusName {
    fn from(n: UniqueName) -> Self {
        BusName::Unique(n)
    }
}

impl From<WellKnownName> for BusName {
    fn from(n: WellKnownName) -> Self {
        BusName::WellKnown(n)
    }
}

impl fmt::Display for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusName({})", self.as_str())
    }
}

/// Router-assigned session identifier. Zero means "no session".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl SessionId {
    pub const NONE: SessionId = SessionId(0);

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rendezvous port advertised by a session host. Zero asks the router to pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionPort(pub u16);

impl SessionPort {
    pub const ANY: SessionPort = SessionPort(0);
}

impl fmt::Display for SessionPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sender-scoped message serial. Zero is reserved for "not set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Serial(pub u32);

impl Serial {
    pub const NONE: Serial = Serial(0);

    /// The serial after this one, skipping zero on wrap-around.
    pub const fn next(self) -> Serial {
        match self.0.wrapping_add(1) {
            0 => Serial(1),
            n => Serial(n),
        }
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
