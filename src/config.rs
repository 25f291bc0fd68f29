//! Engine tuning knobs.
//!
//! We serialize to json because the data is small and short-lived, so
//! schema evolution isn't an important concern.  We also only expect
//! our own Rust code to deserialize the JSON we write, so we can use
//! all the flexibility offered by serde_json.

use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

/// Environment variable holding an optional JSON `EngineConfig`
/// override.
const CONFIG_VAR: &str = "CALQUE_CONFIG";

/// Size of the copier's bulk transfer buffer.
const DEFAULT_COPY_BUFFER_SIZE: usize = 1 << 20;

/// Upper bound on any single throttle sleep; the copier re-polls
/// progress at least this often, so user aborts are observed promptly
/// even during long throttled copies.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Bytes per read/write iteration in the copier's bulk loop.
    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,

    /// Milliseconds between progress polls during throttled copies;
    /// also the longest the copier will sleep in one increment.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_copy_buffer_size() -> usize {
    DEFAULT_COPY_BUFFER_SIZE
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl EngineConfig {
    /// Returns the configuration from the `CALQUE_CONFIG` environment
    /// variable, or the default when the variable is absent or does
    /// not parse.
    pub fn from_env() -> EngineConfig {
        match std::env::var(CONFIG_VAR) {
            Ok(blob) => match serde_json::from_str(&blob) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(%e, var=CONFIG_VAR, "invalid engine config; using defaults");
                    EngineConfig::default()
                }
            },
            Err(_) => EngineConfig::default(),
        }
    }

    /// The poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[test]
fn test_serialization_smoke_test() {
    let config = EngineConfig {
        copy_buffer_size: 1 << 16,
        poll_interval_ms: 250,
    };

    let expected = "{\"copy_buffer_size\":65536,\"poll_interval_ms\":250}";

    assert_eq!(
        serde_json::to_string(&config).expect("should serialize"),
        expected
    );

    assert_eq!(
        serde_json::from_str::<EngineConfig>(expected).expect("should deserialize"),
        config
    );
}

#[test]
fn test_partial_config_uses_defaults() {
    let config: EngineConfig =
        serde_json::from_str("{\"poll_interval_ms\":100}").expect("should deserialize");

    assert_eq!(config.copy_buffer_size, DEFAULT_COPY_BUFFER_SIZE);
    assert_eq!(config.poll_interval_ms, 100);
}
