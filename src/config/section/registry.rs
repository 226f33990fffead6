//! `[registry]` section configuration.
//!
//! ```toml
//! [registry]
//! max_projects = 32
//! idle_timeout_secs = 1800   # Runtimes idle longer than this are stopped
//! idle_sweep_secs = 60
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::types::{ConfigDiagnostics, FieldPath};

/// Project registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_projects: usize,
    pub idle_timeout_secs: u64,
    pub idle_sweep_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_projects: 32,
            idle_timeout_secs: 1800,
            idle_sweep_secs: 60,
        }
    }
}

impl RegistryConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_sweep(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_secs.max(1))
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.max_projects == 0 {
            diag.error(FieldPath::new("registry.max_projects"), "must be at least 1");
        }
    }
}
