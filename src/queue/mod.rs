//! Change queue.
//!
//! Pending file writes, ordered by priority then arrival. One queued entry
//! per `(project, path)`; a newer intent replaces it in place. A tick task
//! dispatches eligible entries to the processor on the blocking pool, at
//! most one in flight per project and `max_concurrent` overall.
//!
//! ```text
//! enqueue ─► [dedup | evict] ─► Queued ─► tick ─► Processing ─┬─► Completed
//!                                  ▲                           │
//!                                  └── retry (backoff, -1 prio)┴─► Failed
//! ```

mod edit;
mod state;


pub use edit::{EditAction, SourceLocation};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::core::{ChangeKind, EventBus, Priority, ProjectId};
use crate::{debug, log};
use state::{Admission, QueueState, Settled};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("write timed out after {}ms", .0.as_millis())]
    WriteTimeout(Duration),

    #[error("evicted")]
    Evicted,

    #[error("invalid path `{0}`")]
    InvalidPath(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeId(pub u64);

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Unknown,
}

impl ChangeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

/// A write intent as submitted by a code source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChange {
    pub project_id: ProjectId,
    pub file_path: String,
    pub kind: ChangeKind,
    /// `None` for deletes.
    pub content: Option<String>,
    pub priority: Priority,
    /// Content the author believed was on disk.
    pub base: Option<String>,
}

impl NewChange {
    pub fn new(
        project_id: ProjectId,
        file_path: impl Into<String>,
        kind: ChangeKind,
        content: Option<String>,
    ) -> Self {
        Self {
            project_id,
            file_path: file_path.into(),
            kind,
            content,
            priority: Priority::NORMAL,
            base: None,
        }
    }

    pub fn update(
        project_id: ProjectId,
        file_path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(project_id, file_path, ChangeKind::Update, Some(content.into()))
    }

    pub fn delete(project_id: ProjectId, file_path: impl Into<String>) -> Self {
        Self::new(project_id, file_path, ChangeKind::Delete, None)
    }

    /// One file of a bulk regeneration.
    pub fn bulk(
        project_id: ProjectId,
        file_path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::update(project_id, file_path, content).with_priority(Priority::BULK)
    }

    /// A visual editor write, based on what the editor saw.
    pub fn editor(
        project_id: ProjectId,
        file_path: impl Into<String>,
        content: impl Into<String>,
        base: impl Into<String>,
    ) -> Self {
        Self::update(project_id, file_path, content)
            .with_priority(Priority::EDITOR)
            .with_base(base)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedChange {
    pub id: ChangeId,
    pub project_id: ProjectId,
    pub file_path: String,
    pub kind: ChangeKind,
    pub content: Option<String>,
    pub base: Option<String>,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub retries: u32,
    /// Arrival order among equal priorities.
    pub seq: u64,
    /// Backoff: not eligible before this instant.
    pub not_before: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedChange {
    pub change: QueuedChange,
    pub error: QueueError,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued { id: ChangeId, project_id: ProjectId, file_path: String },
    Replaced { id: ChangeId },
    Processing { id: ChangeId },
    Completed { id: ChangeId, project_id: ProjectId, file_path: String },
    Retrying { id: ChangeId, retries: u32, error: QueueError },
    Failed { id: ChangeId, error: QueueError },
    Evicted { id: ChangeId, project_id: ProjectId, file_path: String },
}

/// Applies one change. Runs on the blocking pool.
pub trait ChangeProcessor: Send + Sync {
    fn process(&self, change: &QueuedChange) -> Result<(), QueueError>;
}

impl<F> ChangeProcessor for F
where
    F: Fn(&QueuedChange) -> Result<(), QueueError> + Send + Sync,
{
    fn process(&self, change: &QueuedChange) -> Result<(), QueueError> {
        self(change)
    }
}

// ============================================================================
// ChangeQueue
// ============================================================================

/// Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct ChangeQueue {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    processor: RwLock<Option<Arc<dyn ChangeProcessor>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    events: EventBus<QueueEvent>,
}

impl ChangeQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(QueueState::default()),
                processor: RwLock::new(None),
                ticker: Mutex::new(None),
                events: EventBus::with_capacity(1024),
            }),
        }
    }

    pub fn set_processor(&self, processor: Arc<dyn ChangeProcessor>) {
        *self.inner.processor.write() = Some(processor);
    }

    /// Accept a write intent. Never waits on processing.
    pub fn enqueue(&self, change: NewChange) -> ChangeId {
        let project_id = change.project_id.clone();
        let file_path = change.file_path.clone();
        let config = &self.inner.config;

        let (id, admission) = self.inner.state.lock().enqueue(
            change,
            config.max_len,
            config.history_limit,
            Instant::now(),
        );

        match admission {
            Admission::Queued => {
                debug!("queue"; "{} {} {}", id, project_id, file_path);
                self.inner.events.emit(QueueEvent::Enqueued {
                    id,
                    project_id,
                    file_path,
                });
            }
            Admission::Replaced => {
                debug!("queue"; "{} replaced by newer write to {}", id, file_path);
                self.inner.events.emit(QueueEvent::Replaced { id });
            }
            Admission::Evicted(victim) => {
                log!("queue"; "full, evicted {} ({} {})", victim.id, victim.project_id, victim.file_path);
                self.inner.events.emit(QueueEvent::Evicted {
                    id: victim.id,
                    project_id: victim.project_id,
                    file_path: victim.file_path,
                });
                self.inner.events.emit(QueueEvent::Enqueued {
                    id,
                    project_id,
                    file_path,
                });
            }
        }
        id
    }

    /// Spawn the tick task. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut ticker = self.inner.ticker.lock();
        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.tick());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                inner.tick();
            }
        }));
    }

    /// Stop dispatching. In-flight writes finish on their own.
    pub fn stop(&self) {
        if let Some(ticker) = self.inner.ticker.lock().take() {
            ticker.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .ticker
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn get_status(&self, id: ChangeId) -> ChangeStatus {
        self.inner.state.lock().status(id)
    }

    pub fn retry_count(&self, id: ChangeId) -> Option<u32> {
        self.inner.state.lock().retry_count(id)
    }

    pub fn failure(&self, id: ChangeId) -> Option<FailedChange> {
        self.inner.state.lock().failure(id)
    }

    /// Snapshot of a queued or in-flight change.
    pub fn get(&self, id: ChangeId) -> Option<QueuedChange> {
        self.inner.state.lock().get(id)
    }

    /// Remove a project's queued entries; in-flight writes finish.
    pub fn drop_project(&self, project_id: &ProjectId) -> usize {
        let dropped = self.inner.state.lock().drop_project(project_id);
        if dropped > 0 {
            debug!("queue"; "dropped {} queued change(s) of {}", dropped, project_id);
        }
        dropped
    }

    /// Queued entries, not counting in-flight ones.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queued_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight_len()
    }

    pub fn queued_for(&self, project_id: &ProjectId) -> usize {
        self.inner.state.lock().queued_for(project_id)
    }

    /// Forget completed and failed records.
    pub fn clear_finished(&self) -> usize {
        self.inner.state.lock().clear_finished()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn tick(self: &Arc<Self>) {
        let Some(processor) = self.processor.read().clone() else {
            return;
        };

        let batch = self
            .state
            .lock()
            .take_ready(Instant::now(), self.config.max_concurrent);

        for change in batch {
            self.events.emit(QueueEvent::Processing { id: change.id });
            tokio::spawn(Arc::clone(self).run(Arc::clone(&processor), change));
        }
    }

    async fn run(self: Arc<Self>, processor: Arc<dyn ChangeProcessor>, change: QueuedChange) {
        let id = change.id;
        let limit = self.config.write_timeout();
        let mut task = tokio::task::spawn_blocking(move || processor.process(&change));

        let result = match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(QueueError::WriteFailed(format!(
                "processor panicked: {join_err}"
            ))),
            Err(_) => {
                log!("queue"; "{} exceeded {}ms, waiting for it to return", id, limit.as_millis());
                // A blocking write cannot be cancelled. The entry stays in
                // flight, and its project busy, until the write returns.
                let _ = task.await;
                Err(QueueError::WriteTimeout(limit))
            }
        };

        self.settle(id, result);
    }

    fn settle(&self, id: ChangeId, result: Result<(), QueueError>) {
        let config = &self.config;
        let settled = {
            let mut state = self.state.lock();
            match result {
                Ok(()) => state.complete(id, config.history_limit),
                Err(error) => state.fail(
                    id,
                    error,
                    config.max_retries,
                    |retry| config.backoff(retry),
                    config.history_limit,
                    Instant::now(),
                ),
            }
        };

        match settled {
            Settled::Completed(change) => {
                debug!("queue"; "{} wrote {} {}", id, change.project_id, change.file_path);
                self.events.emit(QueueEvent::Completed {
                    id,
                    project_id: change.project_id,
                    file_path: change.file_path,
                });
            }
            Settled::Retrying {
                change,
                error,
                backoff,
            } => {
                log!("queue"; "{} {} failed ({}), retry {} in {}ms", id, change.file_path, error, change.retries, backoff.as_millis());
                self.events.emit(QueueEvent::Retrying {
                    id,
                    retries: change.retries,
                    error,
                });
            }
            Settled::Failed(failed) => {
                log!("error"; "{} {} {}: {}", id, failed.change.project_id, failed.change.file_path, failed.error);
                self.events.emit(QueueEvent::Failed {
                    id,
                    error: failed.error,
                });
            }
            Settled::Unknown => {}
        }
    }
}
