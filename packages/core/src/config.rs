//! Runtime configuration for locking, requeueing and queue polling.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default logical lock lifetime, one hour.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 3600;
/// Extra physical lifetime kept on a lock key beyond its logical expiry.
pub const DEFAULT_HARD_EXPIRY_MARGIN_SECS: u64 = 600;
/// Delay applied when a job is requeued because its worker lock is held.
pub const DEFAULT_REQUEUE_DELAY_SECS: u64 = 1;
/// Weight of queues declared without an explicit weight.
pub const DEFAULT_QUEUE_WEIGHT: u32 = 100;

/// Configuration shared by the lock manager, job client and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Logical lifetime of queue locks (seconds).
    pub queue_lock_ttl_secs: u64,
    /// Logical lifetime of worker locks (seconds).
    pub worker_lock_ttl_secs: u64,
    /// Physical expiry margin added on top of `ttl + 1`.
    pub hard_expiry_margin_secs: u64,
    /// Backoff before a contended job is retried.
    pub requeue_delay_secs: u64,
    /// Weight used for queues without a declared weight.
    pub default_queue_weight: u32,
    /// Skip the "queue will not be worked" check on enqueue.
    pub skip_queue_check: bool,
    /// How often an idle worker polls its queues (milliseconds).
    pub poll_interval_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            queue_lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            worker_lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            hard_expiry_margin_secs: DEFAULT_HARD_EXPIRY_MARGIN_SECS,
            requeue_delay_secs: DEFAULT_REQUEUE_DELAY_SECS,
            default_queue_weight: DEFAULT_QUEUE_WEIGHT,
            skip_queue_check: false,
            poll_interval_ms: 100,
        }
    }
}

impl CoordinationConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// - `COORD_QUEUE_LOCK_TTL` (default: 3600)
    /// - `COORD_WORKER_LOCK_TTL` (default: 3600)
    /// - `COORD_LOCK_EXPIRY_MARGIN` (default: 600)
    /// - `COORD_REQUEUE_DELAY` (default: 1)
    /// - `COORD_DEFAULT_QUEUE_WEIGHT` (default: 100)
    /// - `COORD_SKIP_QUEUE_CHECK` (`true`/`false`, default: false)
    /// - `COORD_POLL_INTERVAL_MS` (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            queue_lock_ttl_secs: env_or("COORD_QUEUE_LOCK_TTL", defaults.queue_lock_ttl_secs)?,
            worker_lock_ttl_secs: env_or("COORD_WORKER_LOCK_TTL", defaults.worker_lock_ttl_secs)?,
            hard_expiry_margin_secs: env_or(
                "COORD_LOCK_EXPIRY_MARGIN",
                defaults.hard_expiry_margin_secs,
            )?,
            requeue_delay_secs: env_or("COORD_REQUEUE_DELAY", defaults.requeue_delay_secs)?,
            default_queue_weight: env_or(
                "COORD_DEFAULT_QUEUE_WEIGHT",
                defaults.default_queue_weight,
            )?,
            skip_queue_check: parse_bool_env("COORD_SKIP_QUEUE_CHECK")?
                .unwrap_or(defaults.skip_queue_check),
            poll_interval_ms: env_or("COORD_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
        })
    }

    /// Set both lock lifetimes.
    pub fn with_lock_ttl(mut self, secs: u64) -> Self {
        self.queue_lock_ttl_secs = secs;
        self.worker_lock_ttl_secs = secs;
        self
    }

    pub fn with_queue_lock_ttl(mut self, secs: u64) -> Self {
        self.queue_lock_ttl_secs = secs;
        self
    }

    pub fn with_worker_lock_ttl(mut self, secs: u64) -> Self {
        self.worker_lock_ttl_secs = secs;
        self
    }

    pub fn with_hard_expiry_margin(mut self, secs: u64) -> Self {
        self.hard_expiry_margin_secs = secs;
        self
    }

    pub fn with_requeue_delay(mut self, secs: u64) -> Self {
        self.requeue_delay_secs = secs;
        self
    }

    pub fn with_default_queue_weight(mut self, weight: u32) -> Self {
        self.default_queue_weight = weight;
        self
    }

    pub fn with_skip_queue_check(mut self, skip: bool) -> Self {
        self.skip_queue_check = skip;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }
}

/// Whether the current process is acting as a queue worker.
///
/// Deferred calls made outside a worker are always queued; inside a worker
/// they run in-process unless a future `run_at` or `force` was requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerEnv {
    pub is_worker: bool,
}

impl WorkerEnv {
    /// Detect worker mode from the `QUEUE` / `QUEUES` variables.
    pub fn detect() -> Self {
        let is_worker = ["QUEUE", "QUEUES"]
            .iter()
            .any(|var| std::env::var(var).ok().and_then(non_empty).is_some());
        Self { is_worker }
    }

    pub fn worker() -> Self {
        Self { is_worker: true }
    }

    pub fn client() -> Self {
        Self { is_worker: false }
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_or<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var).ok().and_then(non_empty) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = std::env::var(var).ok().and_then(non_empty) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_lock_protocol_constants() {
        let config = CoordinationConfig::default();
        assert_eq!(config.queue_lock_ttl_secs, 3600);
        assert_eq!(config.worker_lock_ttl_secs, 3600);
        assert_eq!(config.hard_expiry_margin_secs, 600);
        assert_eq!(config.requeue_delay_secs, 1);
        assert_eq!(config.default_queue_weight, 100);
    }

    #[test]
    fn deserializes_partial_config() -> Result<(), serde_json::Error> {
        let config: CoordinationConfig =
            serde_json::from_str(r#"{"worker_lock_ttl_secs": 30, "requeue_delay_secs": 5}"#)?;
        assert_eq!(config.worker_lock_ttl_secs, 30);
        assert_eq!(config.requeue_delay_secs, 5);
        assert_eq!(config.queue_lock_ttl_secs, 3600);
        Ok(())
    }

    #[test]
    fn builders_override_fields() {
        let config = CoordinationConfig::default()
            .with_lock_ttl(10)
            .with_requeue_delay(0)
            .with_skip_queue_check(true);
        assert_eq!(config.queue_lock_ttl_secs, 10);
        assert_eq!(config.worker_lock_ttl_secs, 10);
        assert_eq!(config.requeue_delay_secs, 0);
        assert!(config.skip_queue_check);
    }
}
