//! `[conflict]` section configuration.
//!
//! ```toml
//! [conflict]
//! default_strategy = "merge"   # keep-local | keep-remote | merge | manual
//! expiry_secs = 300
//! escalate_collisions = false  # true: merge collisions produce manual markers
//! ```
//!
//! Removing `default_strategy` makes unresolved conflicts an error unless a
//! strategy is passed explicitly or a prompt is registered.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conflict::ResolutionStrategy;

/// Conflict resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub default_strategy: Option<ResolutionStrategy>,
    pub expiry_secs: u64,
    pub escalate_collisions: bool,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            default_strategy: Some(ResolutionStrategy::Merge),
            expiry_secs: 300,
            escalate_collisions: false,
        }
    }
}

impl ConflictConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}
