//! TOML configuration for the daemon.
//!
//! ```toml
//! [router]
//! auth_timeout = 10
//! mechanisms = ["ECDHE_ED25519", "ECDHE_PSK"]
//!
//! [security]
//! psk = "6d65736862757320707363"
//! signing_key = "<64 hex digits of Ed25519 seed>"
//! trusted_keys = ["<64 hex digits of an Ed25519 public key>"]
//!
//! [logging]
//! level = "debug"
//!
//! [[listen.tcp]]
//! bind = "0.0.0.0:9955"
//! ```

use std::net::SocketAddr;
use std::path::Path;

use meshbus_crypto::ed25519::{Ed25519PrivateKey, Ed25519PublicKey};
use meshbus_router::{RouterConfig, StaticCredentials};
use meshbus_transport::TcpConfig;
use serde::Deserialize;

use crate::error::NodeError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/meshbus/config.toml";

#[derive(Debug, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub listen: ListenSection,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(format!("failed to parse config: {e}")))
    }
}

/// The `[security]` section. Keys are hex encoded.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Pre-shared key for `ECDHE_PSK`.
    pub psk: Option<String>,
    /// 32-byte Ed25519 seed for `ECDHE_ED25519`.
    pub signing_key: Option<String>,
    /// Peer public keys accepted under `ECDHE_ED25519`.
    pub trusted_keys: Vec<String>,
    pub trust_any_identity: bool,
}

impl SecuritySection {
    pub fn credentials(&self) -> Result<StaticCredentials, NodeError> {
        let mut credentials = StaticCredentials::new();
        if let Some(psk) = &self.psk {
            let psk = decode_hex("psk", psk)?;
            if psk.is_empty() {
                return Err(NodeError::Config("psk must not be empty".into()));
            }
            credentials = credentials.with_psk(psk);
        }
        if let Some(seed) = &self.signing_key {
            let seed = decode_hex("signing_key", seed)?;
            credentials = credentials.with_signing_key(Ed25519PrivateKey::from_slice(&seed)?);
        }
        for key in &self.trusted_keys {
            let key = decode_hex("trusted_keys", key)?;
            credentials = credentials.trust(Ed25519PublicKey::from_slice(&key)?);
        }
        if self.trust_any_identity {
            credentials = credentials.trust_any_identity();
        }
        Ok(credentials)
    }
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, NodeError> {
    hex::decode(value.trim()).map_err(|e| NodeError::Config(format!("{field}: invalid hex: {e}")))
}

/// The `[logging]` section. `RUST_LOG` overrides `level`.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// The `[listen]` section: one entry per listening transport.
#[derive(Debug, Default, Deserialize)]
pub struct ListenSection {
    #[serde(default)]
    pub tcp: Vec<TcpListenEntry>,
}

/// A `[[listen.tcp]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpListenEntry {
    pub bind: String,
    pub name: Option<String>,
    pub max_frame_len: Option<usize>,
}

impl TcpListenEntry {
    pub fn to_tcp_config(&self) -> Result<TcpConfig, NodeError> {
        let addr = parse_socket_addr(&self.bind)?;
        let name = self.name.clone().unwrap_or_else(|| format!("tcp {addr}"));
        let mut config = TcpConfig::new(name, addr);
        if let Some(max) = self.max_frame_len {
            config.max_frame_len = max;
        }
        Ok(config)
    }
}

pub fn parse_socket_addr(s: &str) -> Result<SocketAddr, NodeError> {
    s.parse()
        .map_err(|e| NodeError::Config(format!("invalid socket address '{s}': {e}")))
}
