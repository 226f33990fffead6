//! `[runtime]` section configuration.
//!
//! # Example
//!
//! ```toml
//! [runtime]
//! command = ["npm", "run", "dev", "--", "--port", "$PREVIEW_PORT"]
//! port_start = 5200           # First port of the pool
//! pool_size = 8               # Max concurrently running runtimes
//! readiness_path = "/"        # Probed until it answers 2xx
//! startup_timeout_ms = 60000
//! stop_grace_ms = 5000
//! ```
//!
//! `$PREVIEW_PORT`, `$PREVIEW_ROOT` and `$PREVIEW_PROJECT` are substituted in
//! `command` and exported to the child environment.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::types::{ConfigDiagnostics, FieldPath};

/// Runtime process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Program and arguments used to launch one runtime.
    pub command: Vec<String>,

    /// Extra environment variables for the runtime.
    pub env: BTreeMap<String, String>,

    /// Host the runtime binds to (and the probe dials).
    pub host: String,

    /// First port of the pool.
    pub port_start: u16,

    /// Number of ports, i.e. max concurrently running runtimes.
    pub pool_size: u16,

    /// HTTP path probed for readiness.
    pub readiness_path: String,

    /// Hard bound on `start`.
    pub startup_timeout_ms: u64,

    /// Delay between readiness probes.
    pub readiness_interval_ms: u64,

    /// Socket timeout of a single probe.
    pub probe_timeout_ms: u64,

    /// Wait after the graceful signal before force-kill.
    pub stop_grace_ms: u64,

    /// How often running processes are checked for unexpected exit.
    pub exit_poll_ms: u64,

    /// Pass runtime stdout/stderr through to the daemon's terminal.
    pub inherit_output: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: ["npm", "run", "dev", "--", "--port", "$PREVIEW_PORT", "--strictPort"]
                .into_iter()
                .map(String::from)
                .collect(),
            env: BTreeMap::new(),
            host: "127.0.0.1".into(),
            port_start: 5200,
            pool_size: 8,
            readiness_path: "/".into(),
            startup_timeout_ms: 60_000,
            readiness_interval_ms: 250,
            probe_timeout_ms: 1_000,
            stop_grace_ms: 5_000,
            exit_poll_ms: 500,
            inherit_output: false,
        }
    }
}

impl RuntimeConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn exit_poll(&self) -> Duration {
        Duration::from_millis(self.exit_poll_ms.max(1))
    }

    /// All ports of the pool, in allocation order.
    pub fn ports(&self) -> Vec<u16> {
        (0..self.pool_size)
            .filter_map(|offset| self.port_start.checked_add(offset))
            .collect()
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            diag.error(FieldPath::new("runtime.command"), "must name a program");
        } else if which::which(&self.command[0]).is_err() {
            diag.warn(
                FieldPath::new("runtime.command"),
                format!("`{}` not found in PATH", self.command[0]),
            );
        }

        if self.pool_size == 0 {
            diag.error(FieldPath::new("runtime.pool_size"), "must be at least 1");
        } else if (self.ports().len() as u16) < self.pool_size {
            diag.error_with_hint(
                FieldPath::new("runtime.port_start"),
                "port pool overflows 65535",
                "lower `port_start` or `pool_size`",
            );
        }

        if self.startup_timeout_ms == 0 {
            diag.error(
                FieldPath::new("runtime.startup_timeout_ms"),
                "must be greater than 0",
            );
        }

        if !self.readiness_path.starts_with('/') {
            diag.error(
                FieldPath::new("runtime.readiness_path"),
                "must start with `/`",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::test_parse_config;

    #[test]
    fn test_runtime_defaults() {
        let config = test_parse_config("");
        assert_eq!(config.runtime.port_start, 5200);
        assert_eq!(config.runtime.pool_size, 8);
        assert_eq!(config.runtime.command[0], "npm");
        assert_eq!(config.runtime.ports().len(), 8);
    }

    #[test]
    fn test_runtime_override() {
        let config = test_parse_config(
            "[runtime]\ncommand = [\"node\", \"server.js\"]\nport_start = 7000\npool_size = 2",
        );
        assert_eq!(config.runtime.command, vec!["node", "server.js"]);
        assert_eq!(config.runtime.ports(), vec![7000, 7001]);
    }

    #[test]
    fn test_pool_overflow_truncated() {
        let config = test_parse_config("[runtime]\nport_start = 65534\npool_size = 4");
        assert_eq!(config.runtime.ports(), vec![65534, 65535]);
    }
}
