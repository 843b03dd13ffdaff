//! Tracing subscriber setup for the daemon.
//!
//! Level conventions across the workspace:
//! - ERROR: faults the router cannot recover from
//! - WARN: protocol violations, evictions, dropped frames
//! - INFO: endpoints connecting, authenticating and leaving; sessions coming and going
//! - DEBUG: name transitions, handshake steps, routing decisions
//! - TRACE: frame sizes and other wire detail

use tracing_subscriber::EnvFilter;

/// Environment variable that switches output to JSON when set to `json`.
pub const FORMAT_ENV: &str = "RUST_LOG_FORMAT";

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Human-readable output. `RUST_LOG` wins over `default_level`.
pub fn init(default_level: &str) {
    tracing_subscriber::fmt().with_env_filter(filter(default_level)).init();
}

/// One JSON object per line.
pub fn init_json(default_level: &str) {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter(default_level))
        .init();
}

/// Pick [`init`] or [`init_json`] from [`FORMAT_ENV`].
pub fn init_from_env(default_level: &str) {
    if json_requested(std::env::var(FORMAT_ENV).ok().as_deref()) {
        init_json(default_level);
    } else {
        init(default_level);
    }
}

fn json_requested(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Test logging through the capturing writer. Safe to call repeatedly.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_only_when_asked() {
        assert!(json_requested(Some("json")));
        assert!(json_requested(Some("JSON")));
        assert!(!json_requested(Some("pretty")));
        assert!(!json_requested(None));
    }

    #[test]
    fn repeated_test_init_is_harmless() {
        init_for_tests();
        init_for_tests();
        tracing::debug!("still logging");
    }
}
