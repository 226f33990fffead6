//! Runtime process orchestrator.
//!
//! Owns one dev-server process per running project, each bound to a port
//! from a fixed [`PortPool`]. Operations on the same project are serialized
//! by a per-project async lock; different projects never wait on each other.
//!
//! # Lifecycle
//!
//! ```text
//! start ─► allocate port ─► launch ─► Starting ─► probe... ─► Running
//!                                         │                     │
//!                          timeout / exit └─► cleanup     exit ─┴─► Exited event
//! stop ──► Stopping ─► SIGTERM ─► grace ─► SIGKILL ─► cleanup ─► Stopped event
//! ```

mod launch;
mod pool;
mod probe;

#[cfg(test)]
pub(crate) mod fake;
#[cfg(test)]
mod tests;

pub use launch::{
    CommandLauncher, LaunchSpec, Launcher, RuntimeHandle, resolve_args, runtime_vars,
};
pub use pool::PortPool;
pub use probe::{HttpProbe, Readiness, ReadinessProbe};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::RuntimeConfig;
use crate::core::{EventBus, ProjectId};
use crate::{debug, log};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("port pool exhausted ({0} runtimes running)")]
    PoolExhausted(usize),

    #[error("`{project}` was not ready after {}ms", .timeout.as_millis())]
    StartupTimeout {
        project: ProjectId,
        timeout: Duration,
    },

    #[error("`{project}` exited unexpectedly ({})", describe_exit(.code))]
    ProcessExitedUnexpectedly {
        project: ProjectId,
        code: Option<i32>,
    },

    #[error("failed to spawn runtime for `{project}`: {message}")]
    Spawn { project: ProjectId, message: String },

    #[error("`{0}` has no running runtime")]
    NotRunning(ProjectId),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(-1) => "killed by signal".into(),
        Some(code) => format!("exit code {code}"),
        None => "exit status unknown".into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl RuntimeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

/// Bookkeeping for one spawned runtime. The process handle lives next to it.
#[derive(Debug, Clone)]
pub struct RuntimeProcessRecord {
    pub project_id: ProjectId,
    pub root: PathBuf,
    pub port: u16,
    pub pid: Option<u32>,
    pub started_at: Instant,
    pub last_active: Instant,
    pub status: RuntimeStatus,
    pub last_error: Option<String>,
    /// Distinguishes one spawn of a project from the next.
    pub instance: u64,
}

impl RuntimeProcessRecord {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }
}

#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Started { project_id: ProjectId, port: u16 },
    Stopped { project_id: ProjectId },
    Exited { project_id: ProjectId, error: RuntimeError },
}

type SharedHandle = Arc<Mutex<Box<dyn RuntimeHandle>>>;

// ============================================================================
// Orchestrator
// ============================================================================

/// Cheap to clone; all clones share the same pool and records.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: RuntimeConfig,
    pool: PortPool,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn ReadinessProbe>,
    records: DashMap<ProjectId, RuntimeProcessRecord>,
    handles: DashMap<ProjectId, SharedHandle>,
    locks: DashMap<ProjectId, Arc<tokio::sync::Mutex<()>>>,
    next_instance: AtomicU64,
    events: EventBus<RuntimeEvent>,
}

impl Orchestrator {
    pub fn new(
        config: RuntimeConfig,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        let pool = PortPool::new(config.ports());
        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                launcher,
                probe,
                records: DashMap::new(),
                handles: DashMap::new(),
                locks: DashMap::new(),
                next_instance: AtomicU64::new(1),
                events: EventBus::new(),
            }),
        }
    }

    /// Orchestrator that spawns the configured command and probes over HTTP.
    pub fn from_config(config: RuntimeConfig) -> Self {
        let launcher = Arc::new(CommandLauncher::new(config.clone()));
        let probe = Arc::new(HttpProbe::new(
            config.readiness_path.clone(),
            config.probe_timeout(),
        ));
        Self::new(config, launcher, probe)
    }

    /// Start the runtime for a project, or return the running one.
    pub async fn start(
        &self,
        project_id: &ProjectId,
        root: &Path,
    ) -> Result<RuntimeProcessRecord, RuntimeError> {
        let lock = self.inner.op_lock(project_id);
        let _guard = lock.lock().await;

        if let Some(record) = self.get_record(project_id)
            && record.status == RuntimeStatus::Running
        {
            return Ok(record);
        }

        let port = self
            .inner
            .pool
            .allocate()
            .ok_or_else(|| RuntimeError::PoolExhausted(self.inner.pool.in_use()))?;

        let spec = LaunchSpec {
            project_id: project_id.clone(),
            root: root.to_path_buf(),
            port,
        };
        let handle = match self.inner.launcher.launch(&spec) {
            Ok(handle) => handle,
            Err(err) => {
                self.inner.pool.release(port);
                return Err(err);
            }
        };

        let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        self.inner.records.insert(
            project_id.clone(),
            RuntimeProcessRecord {
                project_id: project_id.clone(),
                root: spec.root,
                port,
                pid: handle.pid(),
                started_at: now,
                last_active: now,
                status: RuntimeStatus::Starting,
                last_error: None,
                instance,
            },
        );
        let handle: SharedHandle = Arc::new(Mutex::new(handle));
        self.inner
            .handles
            .insert(project_id.clone(), Arc::clone(&handle));

        log!("runtime"; "starting {} on port {}", project_id, port);

        let timeout = self.inner.config.startup_timeout();
        let ready = match tokio::time::timeout(timeout, self.wait_ready(project_id, port, &handle))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::StartupTimeout {
                project: project_id.clone(),
                timeout,
            }),
        };

        if let Err(err) = ready {
            let killed = handle.lock().kill();
            if let Err(kill_err) = killed {
                debug!("runtime"; "kill after failed start of {}: {}", project_id, kill_err);
            }
            self.inner.remove(project_id);
            log!("error"; "{}", err);
            return Err(err);
        }

        let record = {
            let Some(mut record) = self.inner.records.get_mut(project_id) else {
                return Err(RuntimeError::NotRunning(project_id.clone()));
            };
            record.status = RuntimeStatus::Running;
            record.last_active = Instant::now();
            record.clone()
        };

        log!("runtime"; "{} ready on port {} ({}ms)", project_id, port, record.uptime().as_millis());
        self.inner.events.emit(RuntimeEvent::Started {
            project_id: project_id.clone(),
            port,
        });
        self.spawn_exit_monitor(project_id.clone(), instance, handle);

        Ok(record)
    }

    /// Probe until ready. Bounded by the caller's timeout.
    async fn wait_ready(
        &self,
        project_id: &ProjectId,
        port: u16,
        handle: &SharedHandle,
    ) -> Result<(), RuntimeError> {
        let interval = self.inner.config.readiness_interval();
        loop {
            let exited = handle.lock().try_wait();
            match exited {
                Ok(Some(code)) => {
                    return Err(RuntimeError::ProcessExitedUnexpectedly {
                        project: project_id.clone(),
                        code: Some(code),
                    });
                }
                Ok(None) => {}
                Err(err) => debug!("runtime"; "try_wait {}: {}", project_id, err),
            }

            let probe = Arc::clone(&self.inner.probe);
            let host = self.inner.config.host.clone();
            let readiness = tokio::task::spawn_blocking(move || probe.probe(&host, port))
                .await
                .unwrap_or(Readiness::Unreachable);

            match readiness {
                Readiness::Ready => return Ok(()),
                Readiness::NotReady(status) => {
                    debug!("runtime"; "{} answered {}, waiting", project_id, status);
                }
                Readiness::Unreachable => {}
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Stop a project's runtime. No record means nothing to do.
    ///
    /// Cleanup always happens; a failure to terminate is only logged.
    pub async fn stop(&self, project_id: &ProjectId) -> Result<(), RuntimeError> {
        let lock = self.inner.op_lock(project_id);
        let _guard = lock.lock().await;

        let Some(handle) = self.inner.handles.get(project_id).map(|h| h.value().clone()) else {
            return Ok(());
        };
        if let Some(mut record) = self.inner.records.get_mut(project_id) {
            record.status = RuntimeStatus::Stopping;
        }

        log!("runtime"; "stopping {}", project_id);
        if let Err(err) = self.terminate(&handle).await {
            log!("error"; "terminating {}: {}", project_id, err);
        }

        self.inner.remove(project_id);
        self.inner.events.emit(RuntimeEvent::Stopped {
            project_id: project_id.clone(),
        });
        Ok(())
    }

    /// Graceful signal, bounded wait, then force-kill.
    async fn terminate(&self, handle: &SharedHandle) -> io::Result<()> {
        let already = handle.lock().try_wait()?;
        if already.is_some() {
            return Ok(());
        }

        let graceful = handle.lock().terminate();
        if graceful.is_ok() && wait_exit(handle, self.inner.config.stop_grace()).await {
            return Ok(());
        }

        let killed = handle.lock().kill();
        killed?;
        wait_exit(handle, Duration::from_secs(1)).await;
        graceful
    }

    pub async fn restart(
        &self,
        project_id: &ProjectId,
    ) -> Result<RuntimeProcessRecord, RuntimeError> {
        let root = self
            .get_record(project_id)
            .map(|record| record.root)
            .ok_or_else(|| RuntimeError::NotRunning(project_id.clone()))?;
        self.stop(project_id).await?;
        self.start(project_id, &root).await
    }

    /// Stop every runtime concurrently.
    pub async fn shutdown(&self) {
        let ids: Vec<ProjectId> = self.inner.records.iter().map(|r| r.key().clone()).collect();
        if ids.is_empty() {
            return;
        }
        log!("runtime"; "stopping {} runtime(s)", ids.len());

        let mut tasks = tokio::task::JoinSet::new();
        for id in ids {
            let this = self.clone();
            tasks.spawn(async move { this.stop(&id).await });
        }
        while tasks.join_next().await.is_some() {}
    }

    pub fn get_record(&self, project_id: &ProjectId) -> Option<RuntimeProcessRecord> {
        self.inner.records.get(project_id).map(|r| r.clone())
    }

    pub fn is_running(&self, project_id: &ProjectId) -> bool {
        self.inner
            .records
            .get(project_id)
            .is_some_and(|r| r.status == RuntimeStatus::Running)
    }

    /// Refresh a runtime's last-active time.
    pub fn touch(&self, project_id: &ProjectId) {
        if let Some(mut record) = self.inner.records.get_mut(project_id) {
            record.last_active = Instant::now();
        }
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .records
            .iter()
            .filter(|r| r.status == RuntimeStatus::Running)
            .count()
    }

    pub fn available_ports(&self) -> usize {
        self.inner.pool.available()
    }

    pub fn capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    /// Watch a running process and clean up if it dies on its own.
    fn spawn_exit_monitor(&self, project_id: ProjectId, instance: u64, handle: SharedHandle) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let poll = self.inner.config.exit_poll();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.is_current(&project_id, instance) {
                    return;
                }
                let status = handle.lock().try_wait();
                match status {
                    Ok(Some(code)) => {
                        inner.handle_exit(&project_id, instance, code).await;
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => debug!("runtime"; "exit poll {}: {}", project_id, err),
                }
            }
        });
    }
}

impl Inner {
    fn op_lock(&self, project_id: &ProjectId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(project_id.clone()).or_default().value().clone()
    }

    fn is_current(&self, project_id: &ProjectId, instance: u64) -> bool {
        self.records
            .get(project_id)
            .is_some_and(|r| r.instance == instance)
    }

    /// Drop record and handle, return the port.
    fn remove(&self, project_id: &ProjectId) {
        self.handles.remove(project_id);
        if let Some((_, record)) = self.records.remove(project_id) {
            self.pool.release(record.port);
        }
    }

    async fn handle_exit(&self, project_id: &ProjectId, instance: u64, code: i32) {
        let lock = self.op_lock(project_id);
        let _guard = lock.lock().await;

        let still_running = self
            .records
            .get(project_id)
            .is_some_and(|r| r.instance == instance && r.status == RuntimeStatus::Running);
        if !still_running {
            return;
        }

        self.remove(project_id);
        let error = RuntimeError::ProcessExitedUnexpectedly {
            project: project_id.clone(),
            code: Some(code),
        };
        log!("error"; "{}", error);
        self.events.emit(RuntimeEvent::Exited {
            project_id: project_id.clone(),
            error,
        });
    }
}

/// Poll until the process exits or `limit` elapses. True if it exited.
async fn wait_exit(handle: &SharedHandle, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        let status = handle.lock().try_wait();
        if matches!(status, Ok(Some(_))) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
