//! File change watcher.
//!
//! One notify watcher per project, bridged into tokio and debounced per
//! `(project, path)`:
//!
//! ```text
//! notify thread ─► mpsc ─► pump task ─► classify ─► ignore ─► Debouncer ─► ChangeEvent
//! ```

mod classify;
mod debouncer;
mod ignore;


pub use classify::{classify, is_temp_file};
pub use ignore::{DEFAULT_IGNORES, IgnoreSet};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::WatchConfig;
use crate::core::{ChangeKind, EventBus, ProjectId};
use crate::utils::path::relative_to;
use crate::{debug, log};
use debouncer::Debouncer;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("project root `{}` does not exist", .0.display())]
    MissingRoot(PathBuf),
}

/// A coalesced change to one file of a watched project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub project_id: ProjectId,
    /// Relative to the project root, `/`-separated.
    pub file_path: String,
    pub kind: ChangeKind,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub debounce: Duration,
    /// Added to the built-in ignore set.
    pub ignore: Vec<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for WatchOptions {
    fn from(config: &WatchConfig) -> Self {
        Self {
            debounce: config.debounce(),
            ignore: config.ignore.clone(),
        }
    }
}

struct WatchSession {
    root: PathBuf,
    /// Dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
    /// Cleared on drop; the debouncer refuses pushes after that.
    open: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Release);
        self.pump.abort();
    }
}

pub struct FileWatcher {
    sessions: DashMap<ProjectId, WatchSession>,
    debouncer: Debouncer,
    events: EventBus<ChangeEvent>,
}

impl FileWatcher {
    pub fn new() -> Self {
        let events = EventBus::new();
        Self {
            sessions: DashMap::new(),
            debouncer: Debouncer::new(events.clone()),
            events,
        }
    }

    /// Start watching a project's root, replacing any existing session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch(
        &self,
        project_id: &ProjectId,
        root: &Path,
        options: WatchOptions,
    ) -> Result<(), WatchError> {
        let root = root
            .canonicalize()
            .map_err(|_| WatchError::MissingRoot(root.to_path_buf()))?;

        if self.sessions.contains_key(project_id) {
            self.unwatch(project_id);
        }

        // notify delivers on its own thread; unbounded send needs no runtime.
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(err) => log!("watch"; "notify error: {}", err),
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let ignore = IgnoreSet::new(&options.ignore);
        let open = Arc::new(AtomicBool::new(true));
        debug!("watch"; "watching {} at {} ({} ignore glob(s))", project_id, root.display(), ignore.glob_count());
        let pump = tokio::spawn(pump(
            rx,
            Arc::clone(&open),
            project_id.clone(),
            root.clone(),
            ignore,
            options.debounce,
            self.debouncer.clone(),
        ));

        self.sessions.insert(
            project_id.clone(),
            WatchSession {
                root,
                _watcher: watcher,
                open,
                pump,
            },
        );
        Ok(())
    }

    /// Stop watching and discard the project's buffered events.
    pub fn unwatch(&self, project_id: &ProjectId) -> bool {
        // Dropping the session closes it before the cancel below.
        let removed = self.sessions.remove(project_id).is_some();
        let discarded = self.debouncer.cancel_project(project_id);
        if removed {
            debug!("watch"; "unwatched {} ({} pending discarded)", project_id, discarded);
        }
        removed
    }

    /// Emit every buffered event immediately.
    pub fn flush_all(&self) -> usize {
        self.debouncer.flush_all()
    }

    pub fn is_watching(&self, project_id: &ProjectId) -> bool {
        self.sessions.contains_key(project_id)
    }

    pub fn watched_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn watched_root(&self, project_id: &ProjectId) -> Option<PathBuf> {
        self.sessions.get(project_id).map(|s| s.root.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

impl Default for FileWatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn pump(
    mut rx: mpsc::UnboundedReceiver<notify::Event>,
    open: Arc<AtomicBool>,
    project_id: ProjectId,
    root: PathBuf,
    ignore: IgnoreSet,
    window: Duration,
    debouncer: Debouncer,
) {
    while let Some(event) = rx.recv().await {
        for (path, kind) in classify(&event) {
            if is_temp_file(&path) {
                continue;
            }
            let Some(relative) = relative_to(&path, &root) else {
                continue;
            };
            if ignore.is_ignored(&relative) {
                continue;
            }
            if !debouncer.push(&open, &project_id, relative, kind, window) {
                return;
            }
        }
    }
}
