//! Conflict resolver.
//!
//! A write whose base no longer matches disk is checked here. Real
//! conflicts (both sides diverged) stay pending until resolved with a
//! strategy: explicit, prompted, or configured default. Nothing is ever
//! resolved with a strategy nobody chose.

mod merge;

pub use merge::{MARKER_LOCAL, MARKER_REMOTE, MARKER_SPLIT, Merged, diverged, manual, merge};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::ConflictConfig;
use crate::core::EventBus;
use crate::{debug, log};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    KeepLocal,
    KeepRemote,
    Merge,
    Manual,
}

impl ResolutionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep-local",
            Self::KeepRemote => "keep-remote",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("conflict in `{0}` unresolved: no strategy given, prompted or configured")]
    Unresolved(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub file_path: String,
    /// Proposed content.
    pub local: String,
    /// Content on disk.
    pub remote: String,
    pub base: Option<String>,
    pub detected_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConflict {
    pub conflict: Conflict,
    pub strategy: ResolutionStrategy,
    pub content: String,
    pub resolved_at: Instant,
    pub collisions: Vec<usize>,
}

#[derive(Debug, Clone)]
pub enum ConflictEvent {
    Detected {
        file_path: String,
    },
    Resolved {
        file_path: String,
        strategy: ResolutionStrategy,
        collisions: usize,
    },
    Expired {
        file_path: String,
    },
}

/// Future returned by a strategy prompt.
pub type PromptFuture = Pin<Box<dyn Future<Output = Option<ResolutionStrategy>> + Send>>;

/// Asks someone which strategy to apply. `None` declines.
pub trait StrategyPrompt: Send + Sync {
    fn choose(&self, conflict: Conflict) -> PromptFuture;
}

impl<F, Fut> StrategyPrompt for F
where
    F: Fn(Conflict) -> Fut + Send + Sync,
    Fut: Future<Output = Option<ResolutionStrategy>> + Send + 'static,
{
    fn choose(&self, conflict: Conflict) -> PromptFuture {
        Box::pin(self(conflict))
    }
}

pub struct ConflictResolver {
    config: ConflictConfig,
    pending: Mutex<FxHashMap<String, Conflict>>,
    history: Mutex<Vec<ResolvedConflict>>,
    prompt: RwLock<Option<Arc<dyn StrategyPrompt>>>,
    events: EventBus<ConflictEvent>,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(FxHashMap::default()),
            history: Mutex::new(Vec::new()),
            prompt: RwLock::new(None),
            events: EventBus::new(),
        }
    }

    /// Record a pending conflict if both sides diverged.
    pub fn detect_conflict(
        &self,
        file_path: &str,
        local: &str,
        remote: &str,
        base: Option<&str>,
    ) -> bool {
        if !diverged(local, remote, base) {
            return false;
        }

        debug!("conflict"; "detected in {}", file_path);
        self.pending.lock().insert(
            file_path.to_owned(),
            Conflict {
                file_path: file_path.to_owned(),
                local: local.to_owned(),
                remote: remote.to_owned(),
                base: base.map(str::to_owned),
                detected_at: Instant::now(),
            },
        );
        self.events.emit(ConflictEvent::Detected {
            file_path: file_path.to_owned(),
        });
        true
    }

    /// Resolve the pending conflict for `file_path`.
    ///
    /// `Ok(None)` when nothing is pending there.
    pub async fn resolve_conflict(
        &self,
        file_path: &str,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<Option<String>, ConflictError> {
        let Some(conflict) = self.pending.lock().get(file_path).cloned() else {
            return Ok(None);
        };

        let strategy = match strategy {
            Some(strategy) => Some(strategy),
            None => self.ask(&conflict).await,
        }
        .or(self.config.default_strategy)
        .ok_or_else(|| ConflictError::Unresolved(file_path.to_owned()))?;

        let (strategy, content, collisions) = self.apply(&conflict, strategy);
        if !collisions.is_empty() {
            log!("conflict"; "{}: lines {:?} changed on both sides, kept local", file_path, collisions);
        }

        self.pending.lock().remove(file_path);
        self.events.emit(ConflictEvent::Resolved {
            file_path: file_path.to_owned(),
            strategy,
            collisions: collisions.len(),
        });
        self.history.lock().push(ResolvedConflict {
            conflict,
            strategy,
            content: content.clone(),
            resolved_at: Instant::now(),
            collisions,
        });
        Ok(Some(content))
    }

    async fn ask(&self, conflict: &Conflict) -> Option<ResolutionStrategy> {
        let prompt = self.prompt.read().clone()?;
        prompt.choose(conflict.clone()).await
    }

    fn apply(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
    ) -> (ResolutionStrategy, String, Vec<usize>) {
        let (local, remote) = (&conflict.local, &conflict.remote);
        match strategy {
            ResolutionStrategy::KeepLocal => (strategy, local.clone(), Vec::new()),
            ResolutionStrategy::KeepRemote => (strategy, remote.clone(), Vec::new()),
            ResolutionStrategy::Manual => (strategy, manual(local, remote), Vec::new()),
            ResolutionStrategy::Merge => {
                let merged = merge(local, remote, conflict.base.as_deref());
                if !merged.collisions.is_empty() && self.config.escalate_collisions {
                    (
                        ResolutionStrategy::Manual,
                        manual(local, remote),
                        merged.collisions,
                    )
                } else {
                    (strategy, merged.content, merged.collisions)
                }
            }
        }
    }

    pub fn set_prompt(&self, prompt: Arc<dyn StrategyPrompt>) {
        *self.prompt.write() = Some(prompt);
    }

    pub fn clear_prompt(&self) {
        *self.prompt.write() = None;
    }

    pub fn pending(&self) -> Vec<Conflict> {
        let mut pending: Vec<_> = self.pending.lock().values().cloned().collect();
        pending.sort_by_key(|c| c.detected_at);
        pending
    }

    pub fn history(&self) -> Vec<ResolvedConflict> {
        self.history.lock().clone()
    }

    pub fn clear_history(&self) -> usize {
        let mut history = self.history.lock();
        let count = history.len();
        history.clear();
        count
    }

    /// Drop pending conflicts older than the configured expiry.
    pub fn cleanup_expired(&self) -> usize {
        let expiry = self.config.expiry();
        let mut expired = Vec::new();
        self.pending.lock().retain(|path, conflict| {
            let keep = conflict.detected_at.elapsed() < expiry;
            if !keep {
                expired.push(path.clone());
            }
            keep
        });

        for file_path in &expired {
            debug!("conflict"; "expired {}", file_path);
            self.events.emit(ConflictEvent::Expired {
                file_path: file_path.clone(),
            });
        }
        expired.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConflictEvent> {
        self.events.subscribe()
    }
}
