//! Authentication mechanism identifiers as they appear on the wire and in config.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mechanism {
    /// Anonymous ephemeral key agreement.
    #[serde(rename = "ECDHE_NULL")]
    EcdheNull,
    /// Key agreement bound to a pre-shared key.
    #[serde(rename = "ECDHE_PSK")]
    EcdhePsk,
    /// Key agreement authenticated by long-term Ed25519 identities.
    #[serde(rename = "ECDHE_ED25519")]
    EcdheEd25519,
}

impl Mechanism {
    pub const ALL: [Mechanism; 3] = [Mechanism::EcdheEd25519, Mechanism::EcdhePsk, Mechanism::EcdheNull];

    pub const fn as_str(self) -> &'static str {
        match self {
            Mechanism::EcdheNull => "ECDHE_NULL",
            Mechanism::EcdhePsk => "ECDHE_PSK",
            Mechanism::EcdheEd25519 => "ECDHE_ED25519",
        }
    }

    /// Whether the peer's identity is established, not only a shared key.
    pub const fn authenticates_peer(self) -> bool {
        !matches!(self, Mechanism::EcdheNull)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mechanism {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mechanism::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownMechanism(s.to_owned()))
    }
}
