//! `[queue]` section configuration.
//!
//! ```toml
//! [queue]
//! tick_ms = 50
//! max_len = 1000          # Lowest-priority entry is evicted beyond this
//! max_retries = 3
//! retry_base_ms = 200     # Doubles per retry, capped at retry_max_ms
//! retry_max_ms = 5000
//! write_timeout_ms = 10000
//! max_concurrent = 4      # Writes in flight across projects
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::types::{ConfigDiagnostics, FieldPath};

/// Change queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub tick_ms: u64,
    pub max_len: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub write_timeout_ms: u64,
    pub max_concurrent: usize,
    /// Completed/failed records kept for status queries.
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            max_len: 1000,
            max_retries: 3,
            retry_base_ms: 200,
            retry_max_ms: 5_000,
            write_timeout_ms: 10_000,
            max_concurrent: 4,
            history_limit: 1024,
        }
    }
}

impl QueueConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        let ms = self.retry_base_ms.saturating_mul(factor).min(self.retry_max_ms);
        Duration::from_millis(ms)
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.max_len == 0 {
            diag.error(FieldPath::new("queue.max_len"), "must be at least 1");
        }
        if self.max_concurrent == 0 {
            diag.error(FieldPath::new("queue.max_concurrent"), "must be at least 1");
        }
    }
}
