//! Project registry.
//!
//! The one component callers talk to. Owns every project's lifecycle and
//! drives the orchestrator, watcher and change queue on its behalf.
//!
//! ```text
//!              register
//! (none) ───────────────► Stopped ──start──► Starting ──ok──► Running
//!                            ▲                   │               │
//!                            │                   └─fail─► Error ◄┘ exited
//!                            └──── Stopped ◄── Stopping ◄──stop──┘
//! ```

mod writer;

#[cfg(test)]
mod tests;

pub use writer::DiskWriter;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{HostConfig, RegistryConfig};
use crate::conflict::{ConflictError, ConflictResolver, ResolutionStrategy};
use crate::core::{EventBus, Priority, ProjectId};
use crate::queue::{ChangeId, ChangeQueue, EditAction, NewChange, QueueError};
use crate::runtime::{Orchestrator, RuntimeError, RuntimeEvent, RuntimeProcessRecord};
use crate::utils::path::{join_within, relative_to};
use crate::watch::{ChangeEvent, FileWatcher, WatchError, WatchOptions};
use crate::{debug, log};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry full ({0} projects) and nothing idle to evict")]
    CapacityExceeded(usize),

    #[error("project `{0}` is not registered")]
    NotFound(ProjectId),

    #[error("project root `{}` is not a directory", .0.display())]
    InvalidRoot(PathBuf),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ProjectState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }

    /// A runtime may exist for the project.
    const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

#[derive(Debug, Clone)]
struct Project {
    id: ProjectId,
    root: PathBuf,
    name: String,
    created_at: SystemTime,
    last_accessed: Instant,
    state: ProjectState,
    last_error: Option<String>,
}

/// Point-in-time view of a project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectInfo {
    pub id: ProjectId,
    pub name: String,
    pub root: PathBuf,
    pub state: ProjectState,
    pub last_error: Option<String>,
    pub port: Option<u16>,
    /// Unix seconds.
    pub created_at: u64,
    pub idle_secs: u64,
    pub queued_changes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub stopped: usize,
    pub starting: usize,
    pub running: usize,
    pub stopping: usize,
    pub error: usize,
    pub running_runtimes: usize,
    pub free_ports: usize,
    pub pool_capacity: usize,
    pub queued_changes: usize,
    pub in_flight_changes: usize,
    pub watched: usize,
}

/// A conflict waiting for a strategy, located in its project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingConflict {
    pub project_id: ProjectId,
    /// Relative to the project root.
    pub file_path: String,
    pub age_secs: u64,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered {
        project_id: ProjectId,
    },
    StateChanged {
        project_id: ProjectId,
        state: ProjectState,
    },
    Unregistered {
        project_id: ProjectId,
    },
}

// ============================================================================
// ProjectRegistry
// ============================================================================

/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct ProjectRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    config: RegistryConfig,
    watch_options: WatchOptions,
    orchestrator: Orchestrator,
    watcher: FileWatcher,
    queue: ChangeQueue,
    resolver: Arc<ConflictResolver>,
    projects: DashMap<ProjectId, Project>,
    /// Roots only, shared with the disk writer.
    roots: Arc<DashMap<ProjectId, PathBuf>>,
    /// Serializes admission so the cap holds under concurrent registers.
    admission: tokio::sync::Mutex<()>,
    /// Per-project lock held across start, stop and unregister.
    lifecycle: DashMap<ProjectId, Arc<tokio::sync::Mutex<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    exit_listener: Mutex<Option<JoinHandle<()>>>,
    events: EventBus<RegistryEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in [self.sweeper.get_mut().take(), self.exit_listener.get_mut().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

impl ProjectRegistry {
    /// Wire the registry to its services and start the change queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: RegistryConfig,
        watch_options: WatchOptions,
        orchestrator: Orchestrator,
        queue: ChangeQueue,
        resolver: Arc<ConflictResolver>,
    ) -> Self {
        let roots = Arc::new(DashMap::new());
        queue.set_processor(Arc::new(DiskWriter::new(
            Arc::clone(&roots),
            Arc::clone(&resolver),
        )));
        queue.start();

        let registry = Self {
            inner: Arc::new(Inner {
                config,
                watch_options,
                orchestrator,
                watcher: FileWatcher::new(),
                queue,
                resolver,
                projects: DashMap::new(),
                roots,
                admission: tokio::sync::Mutex::new(()),
                lifecycle: DashMap::new(),
                sweeper: Mutex::new(None),
                exit_listener: Mutex::new(None),
                events: EventBus::new(),
            }),
        };
        registry.spawn_exit_listener();
        registry
    }

    /// Registry with real processes, built from the host config.
    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(
            config.registry.clone(),
            WatchOptions::from(&config.watch),
            Orchestrator::from_config(config.runtime.clone()),
            ChangeQueue::new(config.queue.clone()),
            Arc::new(ConflictResolver::new(config.conflict.clone())),
        )
    }

    // ------------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------------

    /// Register a project, or refresh and return an existing one.
    pub async fn register_project(
        &self,
        id: ProjectId,
        root: impl AsRef<Path>,
        name: Option<String>,
    ) -> Result<ProjectInfo, RegistryError> {
        if self.touch(&id) {
            return self.info_or_not_found(&id);
        }

        let root = root.as_ref();
        let root = root
            .canonicalize()
            .ok()
            .filter(|r| r.is_dir())
            .ok_or_else(|| RegistryError::InvalidRoot(root.to_path_buf()))?;

        let _admission = self.inner.admission.lock().await;
        if self.touch(&id) {
            return self.info_or_not_found(&id);
        }
        if self.inner.projects.len() >= self.inner.config.max_projects {
            self.make_room().await;
        }
        if self.inner.projects.len() >= self.inner.config.max_projects {
            return Err(RegistryError::CapacityExceeded(self.inner.config.max_projects));
        }

        let project = Project {
            name: name.unwrap_or_else(|| id.to_string()),
            id: id.clone(),
            root: root.clone(),
            created_at: SystemTime::now(),
            last_accessed: Instant::now(),
            state: ProjectState::Stopped,
            last_error: None,
        };
        self.inner.roots.insert(id.clone(), root.clone());
        self.inner.projects.insert(id.clone(), project);

        log!("registry"; "registered {} at {}", id, root.display());
        self.inner.events.emit(RegistryEvent::Registered {
            project_id: id.clone(),
        });
        self.info_or_not_found(&id)
    }

    /// Stop idle runtimes, then evict stopped projects idle past the timeout.
    async fn make_room(&self) {
        self.cleanup_idle().await;

        let timeout = self.inner.config.idle_timeout();
        let evictable: Vec<ProjectId> = self
            .inner
            .projects
            .iter()
            .filter(|p| {
                matches!(p.state, ProjectState::Stopped | ProjectState::Error)
                    && p.last_accessed.elapsed() >= timeout
            })
            .map(|p| p.id.clone())
            .collect();

        for id in evictable {
            log!("registry"; "evicting idle project {}", id);
            if let Err(e) = self.unregister_project(&id).await {
                debug!("registry"; "evict {}: {}", id, e);
            }
        }
    }

    /// Start a project's runtime and begin watching its files.
    pub async fn start_project(&self, id: &ProjectId) -> Result<RuntimeProcessRecord, RegistryError> {
        let lock = self.inner.lifecycle_lock(id);
        let _guard = lock.lock().await;

        let root = self.root_of(id)?;
        self.touch(id);
        self.set_state(id, ProjectState::Starting, None);

        let record = match self.inner.orchestrator.start(id, &root).await {
            Ok(record) => record,
            Err(err) => {
                log!("error"; "{} failed to start: {}", id, err);
                self.set_state(id, ProjectState::Error, Some(err.to_string()));
                return Err(err.into());
            }
        };

        if let Err(err) = self
            .inner
            .watcher
            .watch(id, &root, self.inner.watch_options.clone())
        {
            log!("error"; "{} started but cannot be watched: {}", id, err);
            let _ = self.inner.orchestrator.stop(id).await;
            self.set_state(id, ProjectState::Error, Some(err.to_string()));
            return Err(err.into());
        }

        self.set_state(id, ProjectState::Running, None);
        Ok(record)
    }

    /// Stop watching and stop the runtime. Stopping a stopped project is a no-op.
    pub async fn stop_project(&self, id: &ProjectId) -> Result<(), RegistryError> {
        let lock = self.inner.lifecycle_lock(id);
        let _guard = lock.lock().await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: &ProjectId) -> Result<(), RegistryError> {
        self.root_of(id)?;
        self.set_state(id, ProjectState::Stopping, None);
        self.inner.watcher.unwatch(id);

        match self.inner.orchestrator.stop(id).await {
            Ok(()) | Err(RuntimeError::NotRunning(_)) => {}
            Err(err) => {
                self.set_state(id, ProjectState::Error, Some(err.to_string()));
                return Err(err.into());
            }
        }
        self.set_state(id, ProjectState::Stopped, None);
        Ok(())
    }

    /// Stop if active, drop queued changes, forget the project.
    pub async fn unregister_project(&self, id: &ProjectId) -> Result<(), RegistryError> {
        let lock = self.inner.lifecycle_lock(id);
        let _guard = lock.lock().await;

        let state = self
            .inner
            .projects
            .get(id)
            .map(|p| p.state)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        if state.is_active() || self.inner.orchestrator.get_record(id).is_some() {
            self.stop_locked(id).await?;
        }
        self.inner.watcher.unwatch(id);
        let dropped = self.inner.queue.drop_project(id);

        self.inner.projects.remove(id);
        self.inner.roots.remove(id);
        log!("registry"; "unregistered {} ({} queued change(s) dropped)", id, dropped);
        self.inner.events.emit(RegistryEvent::Unregistered {
            project_id: id.clone(),
        });
        Ok(())
    }

    /// Stop every runtime and the background tasks.
    pub async fn shutdown(&self) {
        self.stop_idle_cleanup();
        self.inner.watcher.flush_all();

        let ids: Vec<ProjectId> = self.inner.projects.iter().map(|p| p.id.clone()).collect();
        for id in &ids {
            self.inner.watcher.unwatch(id);
        }
        self.inner.orchestrator.shutdown().await;
        self.inner.queue.stop();

        for id in &ids {
            if self.state_of(id).is_some_and(ProjectState::is_active) {
                self.set_state(id, ProjectState::Stopped, None);
            }
        }
        if let Some(task) = self.inner.exit_listener.lock().take() {
            task.abort();
        }
    }

    // ------------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------------

    pub fn get_project_info(&self, id: &ProjectId) -> Option<ProjectInfo> {
        let project = self.inner.projects.get(id)?.clone();
        Some(self.info(&project))
    }

    /// All projects, ordered by id.
    pub fn get_all_projects(&self) -> Vec<ProjectInfo> {
        let mut projects: Vec<Project> = self.inner.projects.iter().map(|p| p.clone()).collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        projects.iter().map(|p| self.info(p)).collect()
    }

    pub fn get_stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for project in self.inner.projects.iter() {
            stats.total += 1;
            match project.state {
                ProjectState::Stopped => stats.stopped += 1,
                ProjectState::Starting => stats.starting += 1,
                ProjectState::Running => stats.running += 1,
                ProjectState::Stopping => stats.stopping += 1,
                ProjectState::Error => stats.error += 1,
            }
        }
        let orchestrator = &self.inner.orchestrator;
        stats.running_runtimes = orchestrator.running_count();
        stats.free_ports = orchestrator.available_ports();
        stats.pool_capacity = orchestrator.capacity();
        stats.queued_changes = self.inner.queue.len();
        stats.in_flight_changes = self.inner.queue.in_flight();
        stats.watched = self.inner.watcher.watched_count();
        stats
    }

    pub fn contains(&self, id: &ProjectId) -> bool {
        self.inner.projects.contains_key(id)
    }

    /// Refresh last-accessed time. `false` for unknown projects.
    pub fn touch(&self, id: &ProjectId) -> bool {
        let Some(mut project) = self.inner.projects.get_mut(id) else {
            return false;
        };
        project.last_accessed = Instant::now();
        drop(project);
        self.inner.orchestrator.touch(id);
        true
    }

    // ------------------------------------------------------------------------
    // idle cleanup
    // ------------------------------------------------------------------------

    /// Stop running projects idle past the timeout. Returns the ones stopped.
    pub async fn cleanup_idle(&self) -> Vec<ProjectId> {
        let timeout = self.inner.config.idle_timeout();
        let idle: Vec<ProjectId> = self
            .inner
            .projects
            .iter()
            .filter(|p| p.state == ProjectState::Running && p.last_accessed.elapsed() >= timeout)
            .map(|p| p.id.clone())
            .collect();

        let mut stopped = Vec::with_capacity(idle.len());
        for id in idle {
            log!("registry"; "stopping idle project {}", id);
            match self.stop_project(&id).await {
                Ok(()) => stopped.push(id),
                Err(e) => log!("error"; "idle stop of {}: {}", id, e),
            }
        }
        stopped
    }

    /// Sweep for idle projects and expired conflicts periodically.
    pub fn start_idle_cleanup(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.idle_sweep();
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let registry = ProjectRegistry { inner };
                let stopped = registry.cleanup_idle().await;
                if !stopped.is_empty() {
                    debug!("registry"; "idle sweep stopped {} project(s)", stopped.len());
                }
                let expired = registry.inner.resolver.cleanup_expired();
                if expired > 0 {
                    debug!("registry"; "dropped {} expired conflict(s)", expired);
                }
            }
        }));
    }

    pub fn stop_idle_cleanup(&self) {
        if let Some(task) = self.inner.sweeper.lock().take() {
            task.abort();
        }
    }

    // ------------------------------------------------------------------------
    // changes
    // ------------------------------------------------------------------------

    /// Queue a write. Paths leaving the project root are refused here
    /// rather than at write time.
    pub fn enqueue_change(&self, change: NewChange) -> Result<ChangeId, RegistryError> {
        let root = self.root_of(&change.project_id)?;
        if join_within(&root, Path::new(&change.file_path)).is_none() {
            return Err(QueueError::InvalidPath(change.file_path).into());
        }
        self.touch(&change.project_id);
        Ok(self.inner.queue.enqueue(change))
    }

    /// Queue several writes, all or none. Every path is checked first.
    pub fn enqueue_changes(&self, changes: Vec<NewChange>) -> Result<Vec<ChangeId>, RegistryError> {
        for change in &changes {
            let root = self.root_of(&change.project_id)?;
            if join_within(&root, Path::new(&change.file_path)).is_none() {
                return Err(QueueError::InvalidPath(change.file_path.clone()).into());
            }
        }
        changes
            .into_iter()
            .map(|change| self.enqueue_change(change))
            .collect()
    }

    /// Turn a visual edit into a high-priority write of the whole file.
    pub fn apply_edit(&self, id: &ProjectId, edit: EditAction) -> Result<ChangeId, RegistryError> {
        let root = self.root_of(id)?;
        let path = join_within(&root, Path::new(&edit.file_path))
            .ok_or_else(|| QueueError::InvalidPath(edit.file_path.clone()))?;
        let current = fs::read_to_string(&path).map_err(|source| RegistryError::Io {
            path: path.clone(),
            source,
        })?;

        let change = edit.into_change(id.clone(), &current)?;
        self.enqueue_change(change)
    }

    /// Settle the pending conflict of one project file and queue the
    /// result as an editor write. `Ok(None)` when nothing is pending there.
    pub async fn resolve_conflict(
        &self,
        id: &ProjectId,
        file_path: &str,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<Option<ChangeId>, RegistryError> {
        let root = self.root_of(id)?;
        let path = join_within(&root, Path::new(file_path))
            .ok_or_else(|| QueueError::InvalidPath(file_path.to_owned()))?;

        // Same key the disk writer detects conflicts under.
        let key = path.display().to_string();
        let Some(content) = self.inner.resolver.resolve_conflict(&key, strategy).await? else {
            return Ok(None);
        };
        let change = NewChange::update(id.clone(), file_path, content).with_priority(Priority::EDITOR);
        self.enqueue_change(change).map(Some)
    }

    /// Pending conflicts inside registered projects, oldest first.
    pub fn pending_conflicts(&self) -> Vec<PendingConflict> {
        let roots: Vec<(ProjectId, PathBuf)> = self
            .inner
            .roots
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        self.inner
            .resolver
            .pending()
            .into_iter()
            .filter_map(|conflict| {
                let path = Path::new(&conflict.file_path);
                roots.iter().find_map(|(id, root)| {
                    relative_to(path, root).map(|file_path| PendingConflict {
                        project_id: id.clone(),
                        file_path,
                        age_secs: conflict.detected_at.elapsed().as_secs(),
                    })
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // services
    // ------------------------------------------------------------------------

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    pub fn queue(&self) -> &ChangeQueue {
        &self.inner.queue
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.inner.resolver
    }

    pub fn flush_watcher(&self) -> usize {
        self.inner.watcher.flush_all()
    }

    /// File changes observed in running projects.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.watcher.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    // ------------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------------

    fn root_of(&self, id: &ProjectId) -> Result<PathBuf, RegistryError> {
        self.inner
            .projects
            .get(id)
            .map(|p| p.root.clone())
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    fn state_of(&self, id: &ProjectId) -> Option<ProjectState> {
        self.inner.projects.get(id).map(|p| p.state)
    }

    fn info_or_not_found(&self, id: &ProjectId) -> Result<ProjectInfo, RegistryError> {
        self.get_project_info(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    fn info(&self, project: &Project) -> ProjectInfo {
        ProjectInfo {
            id: project.id.clone(),
            name: project.name.clone(),
            root: project.root.clone(),
            state: project.state,
            last_error: project.last_error.clone(),
            port: self
                .inner
                .orchestrator
                .get_record(&project.id)
                .map(|r| r.port),
            created_at: project
                .created_at
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            idle_secs: project.last_accessed.elapsed().as_secs(),
            queued_changes: self.inner.queue.queued_for(&project.id),
        }
    }

    /// `error` replaces the stored message only when moving to `Error`.
    fn set_state(&self, id: &ProjectId, state: ProjectState, error: Option<String>) {
        self.inner.set_state(id, state, error);
    }

    fn spawn_exit_listener(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut events = self.inner.orchestrator.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log!("registry"; "missed {} runtime event(s)", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let RuntimeEvent::Exited { project_id, error } = event {
                    log!("error"; "{} runtime exited: {}", project_id, error);
                    inner.watcher.unwatch(&project_id);
                    inner.set_state(&project_id, ProjectState::Error, Some(error.to_string()));
                }
            }
        });
        *self.inner.exit_listener.lock() = Some(task);
    }
}

impl Inner {
    fn lifecycle_lock(&self, id: &ProjectId) -> Arc<tokio::sync::Mutex<()>> {
        self.lifecycle.entry(id.clone()).or_default().value().clone()
    }

    fn set_state(&self, id: &ProjectId, state: ProjectState, error: Option<String>) {
        let Some(mut project) = self.projects.get_mut(id) else {
            return;
        };
        if project.state == state && error.is_none() {
            return;
        }
        project.state = state;
        match state {
            ProjectState::Error => project.last_error = error,
            ProjectState::Running => project.last_error = None,
            _ => {}
        }
        drop(project);

        debug!("registry"; "{} -> {}", id, state.as_str());
        self.events.emit(RegistryEvent::StateChanged {
            project_id: id.clone(),
            state,
        });
    }
}
