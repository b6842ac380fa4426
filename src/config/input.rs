//! Input pipeline and backfill configuration.

use serde::Deserialize;
use std::time::Duration;

/// Tuning for the event input pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Bounded queue length of each per-room input actor (default: 100).
    #[serde(default = "default_room_queue_capacity")]
    pub room_queue_capacity: usize,
    /// Seconds a room actor may sit idle before it shuts down (default: 300).
    #[serde(default = "default_actor_idle_secs")]
    pub actor_idle_secs: u64,
    /// Attempts at fetching missing prev/auth events before giving up (default: 3).
    #[serde(default = "default_max_missing_retries")]
    pub max_missing_retries: u32,
    /// Base of the exponential backoff between attempts, in milliseconds (default: 250).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Maximum events requested per missing-events call (default: 20).
    #[serde(default = "default_max_missing_events")]
    pub max_missing_events: usize,
    /// Queue length for asynchronous input batches (default: 1024).
    #[serde(default = "default_async_queue_capacity")]
    pub async_queue_capacity: usize,
}

impl InputConfig {
    pub fn actor_idle(&self) -> Duration {
        Duration::from_secs(self.actor_idle_secs)
    }

    /// Backoff before retry number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            room_queue_capacity: default_room_queue_capacity(),
            actor_idle_secs: default_actor_idle_secs(),
            max_missing_retries: default_max_missing_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_missing_events: default_max_missing_events(),
            async_queue_capacity: default_async_queue_capacity(),
        }
    }
}

/// Backfill limits.
#[derive(Debug, Clone, Deserialize)]
pub struct BackfillConfig {
    /// Upper bound on events returned by one backfill request (default: 100).
    #[serde(default = "default_backfill_max_limit")]
    pub max_limit: usize,
    /// Seconds to wait on one remote server before trying the next (default: 30).
    #[serde(default = "default_backfill_server_timeout_secs")]
    pub server_timeout_secs: u64,
}

impl BackfillConfig {
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_limit: default_backfill_max_limit(),
            server_timeout_secs: default_backfill_server_timeout_secs(),
        }
    }
}

fn default_room_queue_capacity() -> usize {
    100
}

fn default_actor_idle_secs() -> u64 {
    300
}

fn default_max_missing_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_max_missing_events() -> usize {
    20
}

fn default_async_queue_capacity() -> usize {
    1024
}

fn default_backfill_max_limit() -> usize {
    100
}

fn default_backfill_server_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let config = InputConfig {
            retry_backoff_ms: 100,
            ..InputConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
    }
}
