//! Tunables for the sync core.
//!
//! All durations serialize as integer milliseconds so config files stay
//! readable (`"persistDebounce": 800`).

use crate::action_queue::RetryPolicy;
use crate::change_tracker::{DEFAULT_LOCK_TTL, DEFAULT_MAX_HOLD};
use crate::optimistic::DEFAULT_SNAPSHOT_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Quiet period before a burst of edits is persisted.
    #[serde(with = "duration_ms")]
    pub persist_debounce: Duration,

    /// How long a field stays locked after the last unlock.
    #[serde(with = "duration_ms")]
    pub lock_ttl: Duration,

    /// Upper bound on a held lock, for abandoned edit sessions.
    #[serde(with = "duration_ms")]
    pub lock_max_hold: Duration,

    /// Open snapshots older than this are treated as committed.
    #[serde(with = "duration_ms")]
    pub snapshot_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub autosave_interval: Duration,

    pub retry: RetryPolicy,

    /// Minimum live task count for a local-only project to count as
    /// substantial (and therefore never deleted by a download).
    pub substantial_task_threshold: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_millis(800),
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_max_hold: DEFAULT_MAX_HOLD,
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT,
            autosave_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            substantial_task_threshold: 1,
        }
    }
}

/// Serde adapter for `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.persist_debounce, Duration::from_millis(800));
        assert_eq!(config.lock_ttl, Duration::from_secs(10));
        assert_eq!(config.snapshot_timeout, Duration::from_secs(30));
        assert_eq!(config.substantial_task_threshold, 1);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"persistDebounce": 50, "lockTtl": 2000}"#).unwrap();
        assert_eq!(config.persist_debounce, Duration::from_millis(50));
        assert_eq!(config.lock_ttl, Duration::from_secs(2));
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let json = serde_json::to_value(SyncConfig::default()).unwrap();
        assert_eq!(json["persistDebounce"], 800);
        assert_eq!(json["retry"]["initialDelay"], 1000);
    }
}
