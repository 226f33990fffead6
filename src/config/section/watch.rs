//! `[watch]` section configuration.
//!
//! ```toml
//! [watch]
//! debounce_ms = 100
//! ignore = ["*.log", "tmp"]   # Added to the built-in ignore set
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// File watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period before a coalesced change is emitted.
    pub debounce_ms: u64,

    /// Extra ignore patterns (never replaces the built-in set).
    pub ignore: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            ignore: Vec::new(),
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::test_parse_config;

    #[test]
    fn test_watch_config() {
        let config = test_parse_config("[watch]\ndebounce_ms = 250\nignore = [\"*.log\"]");
        assert_eq!(config.watch.debounce_ms, 250);
        assert_eq!(config.watch.ignore, vec!["*.log"]);
    }
}
