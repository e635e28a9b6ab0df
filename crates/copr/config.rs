use serde::Deserialize;
use std::time::Duration;

/// Batch reads stream for as long as the analytical plan runs, so the
/// single-RPC deadline is measured in hours, not seconds.
pub const DEFAULT_ULTRA_LONG_READ_TIMEOUT_SECS: u64 = 3_600;
pub const DEFAULT_BUILD_TASK_MAX_BACKOFF_MS: u64 = 5_000;
pub const DEFAULT_NEXT_MAX_BACKOFF_MS: u64 = 20_000;

/// Tunables of the batch coprocessor client.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoprConfig {
    /// Total backoff budget while rebuilding the task set against a stale
    /// region map.
    pub max_build_backoff_ms: u64,
    /// Total backoff budget a worker may spend on broken response streams.
    pub max_next_backoff_ms: u64,
    /// Deadline for one batch RPC.
    pub ultra_long_read_timeout_secs: u64,
}

impl CoprConfig {
    pub fn build_backoff(&self) -> Duration {
        Duration::from_millis(self.max_build_backoff_ms)
    }

    pub fn next_backoff(&self) -> Duration {
        Duration::from_millis(self.max_next_backoff_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.ultra_long_read_timeout_secs)
    }
}

impl Default for CoprConfig {
    fn default() -> Self {
        Self {
            max_build_backoff_ms: DEFAULT_BUILD_TASK_MAX_BACKOFF_MS,
            max_next_backoff_ms: DEFAULT_NEXT_MAX_BACKOFF_MS,
            ultra_long_read_timeout_secs: DEFAULT_ULTRA_LONG_READ_TIMEOUT_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: CoprConfig =
            serde_json::from_str(r#"{"max_next_backoff_ms": 1000}"#).expect("valid config");
        assert_eq!(config.max_next_backoff_ms, 1_000);
        assert_eq!(config.max_build_backoff_ms, DEFAULT_BUILD_TASK_MAX_BACKOFF_MS);
        assert_eq!(config.read_timeout(), Duration::from_secs(3_600));
    }
}
