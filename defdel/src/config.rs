use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Tunable constants for the deletion engine (`spec.md` §6).
///
/// All fields have defaults matching the original worker; a config file only
/// needs to set the ones it wants to override. Durations are expressed in
/// whole seconds on disk (via `humantime`-free plain integers, kept simple
/// since every interval here is sub-day) and converted to [`Duration`] at
/// load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base delay added to `next_check` after a successful step or a
    /// retryable failure.
    pub check_interval_secs: u64,

    /// Extra multiplier applied to `check_interval` after a fatal error.
    pub fatal_error_interval_multiplier: u32,

    /// Below this elapsed time, a backend call is considered "fast" and the
    /// delay rate stays at 1.0.
    pub operation_delay_threshold_secs: f64,

    /// Ceiling on the adaptive delay-rate multiplier.
    pub max_delay_rate: f64,

    /// Overall attempt budget (retryable + fatal) before an item is dropped.
    pub max_retryable_error_retries: u32,

    /// Fatal-only attempt budget before an item is dropped.
    pub max_fatal_error_retries: u32,

    /// Upper bound on items acquired from one group in a single phase.
    pub max_deletions_at_once: usize,

    /// Polls to wait, while STOPPING/DELETING, before re-issuing the
    /// stop/delete command.
    pub retries_to_retry: u32,

    /// How often `run()` is invoked by the binary's scheduler loop.
    pub tick_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            fatal_error_interval_multiplier: 4,
            operation_delay_threshold_secs: 5.0,
            max_delay_rate: 10.0,
            max_retryable_error_retries: 14,
            max_fatal_error_retries: 3,
            max_deletions_at_once: 50,
            retries_to_retry: 3,
            tick_interval_secs: 7,
        }
    }
}

impl EngineConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Load overrides from a TOML file, falling back to defaults for any
    /// field the file omits. Unknown keys in the file are ignored rather
    /// than rejected, matching the "read tolerantly" posture the engine
    /// applies to its own persisted records.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config: EngineConfig = toml::from_str("max_deletions_at_once = 5\n").unwrap();
        assert_eq!(config.max_deletions_at_once, 5);
        assert_eq!(
            config.check_interval_secs,
            EngineConfig::default().check_interval_secs
        );
    }
}
