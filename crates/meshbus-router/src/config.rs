//! Router tunables.

use std::time::Duration;

use meshbus_core::Mechanism;
use serde::Deserialize;

/// Router configuration. Every field has a default, so an empty TOML table
/// deserialises to [`RouterConfig::default()`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Time allowed from connect to `Welcome`.
    #[serde(with = "secs")]
    pub auth_timeout: Duration,
    /// Time a session host has to answer `AcceptSession`.
    #[serde(with = "secs")]
    pub join_timeout: Duration,
    /// Time a routed method call may stay unanswered.
    #[serde(with = "secs")]
    pub call_timeout: Duration,
    pub max_auth_attempts: u32,
    /// Enabled mechanisms. The initiator's preference order wins among these.
    pub mechanisms: Vec<Mechanism>,
    /// Seal traffic (encrypt and MAC) rather than only MAC it.
    pub encrypt_traffic: bool,
    pub max_endpoints: usize,
    pub max_sessions: usize,
    /// Frames queued towards one endpoint before it counts as stalled.
    pub outbound_queue: usize,
    pub max_match_rules: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(25),
            max_auth_attempts: 3,
            mechanisms: Mechanism::ALL.to_vec(),
            encrypt_traffic: true,
            max_endpoints: 1024,
            max_sessions: 4096,
            outbound_queue: 256,
            max_match_rules: 128,
        }
    }
}

impl RouterConfig {
    pub fn supports(&self, mechanism: Mechanism) -> bool {
        self.mechanisms.contains(&mechanism)
    }
}

/// Durations are written as whole seconds in config files.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.auth_timeout, Duration::from_secs(30));
        assert_eq!(config.call_timeout, Duration::from_secs(25));
        assert_eq!(config.max_auth_attempts, 3);
        assert_eq!(
            config.mechanisms,
            vec![Mechanism::EcdheEd25519, Mechanism::EcdhePsk, Mechanism::EcdheNull]
        );
        assert!(config.encrypt_traffic);
        assert_eq!(config.max_match_rules, 128);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: RouterConfig = toml::from_str(
            r#"
            auth_timeout = 5
            mechanisms = ["ECDHE_PSK"]
            encrypt_traffic = false
            "#,
        )
        .unwrap();
        assert_eq!(config.auth_timeout, Duration::from_secs(5));
        assert_eq!(config.join_timeout, Duration::from_secs(30));
        assert!(config.supports(Mechanism::EcdhePsk));
        assert!(!config.supports(Mechanism::EcdheNull));
        assert!(!config.encrypt_traffic);
    }
}
