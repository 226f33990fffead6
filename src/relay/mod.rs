//! Live update relay.
//!
//! Bridges each running runtime's live-update socket to its viewers:
//!
//! ```text
//! runtime ◄──upstream──► Hub(project) ◄──► viewer 1..n
//! ```
//!
//! One hub per project, each behind its own lock. The first viewer dials
//! the upstream and the last one leaving closes it. Frames are never
//! rewritten.

mod link;
mod message;
mod server;


pub use link::{Frame, RelayLink, UpstreamConnector, WsConnector};
pub use message::{LiveUpdateMessage, UpdatePayload};
pub use server::{ViewerServer, project_from_query};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::core::{EventBus, ProjectId};
use crate::runtime::{Orchestrator, RuntimeStatus};
use crate::{debug, log};

/// Upper bound on frames read from one link per pass.
const MAX_FRAMES_PER_PASS: usize = 64;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("`{0}` has no running runtime")]
    RuntimeNotRunning(ProjectId),

    #[error("upstream of `{project}`: {message}")]
    Upstream { project: ProjectId, message: String },

    #[error("connection closed")]
    Closed,

    #[error("websocket: {0}")]
    WebSocket(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(pub u64);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum RelayEvent {
    ViewerJoined {
        project_id: ProjectId,
        viewer_id: ViewerId,
        viewers: usize,
    },
    ViewerLeft {
        project_id: ProjectId,
        viewer_id: ViewerId,
        viewers: usize,
    },
    UpstreamAttached {
        project_id: ProjectId,
    },
    UpstreamDetached {
        project_id: ProjectId,
        /// `None` when detached because the last viewer left.
        error: Option<String>,
    },
    Update {
        project_id: ProjectId,
        message: LiveUpdateMessage,
    },
}

/// Where a project's runtime listens, if it is running.
pub trait PortLookup: Send + Sync {
    fn port_of(&self, project_id: &ProjectId) -> Option<u16>;
}

impl PortLookup for Orchestrator {
    fn port_of(&self, project_id: &ProjectId) -> Option<u16> {
        self.get_record(project_id)
            .filter(|r| r.status == RuntimeStatus::Running)
            .map(|r| r.port)
    }
}

impl<F> PortLookup for F
where
    F: Fn(&ProjectId) -> Option<u16> + Send + Sync,
{
    fn port_of(&self, project_id: &ProjectId) -> Option<u16> {
        self(project_id)
    }
}

pub type ActivityHook = Arc<dyn Fn(&ProjectId) + Send + Sync>;

struct Hub {
    upstream: Box<dyn RelayLink>,
    viewers: Vec<(ViewerId, Box<dyn RelayLink>)>,
    /// Set once torn down; a late `add_viewer` must dial again.
    closed: bool,
}

impl Hub {
    fn teardown(&mut self) {
        self.upstream.close();
        for (_, viewer) in &mut self.viewers {
            viewer.close();
        }
        self.viewers.clear();
        self.closed = true;
    }
}

type SharedHub = Arc<Mutex<Hub>>;

/// Cheap to clone; clones share the same hubs.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

struct Inner {
    config: RelayConfig,
    ports: Arc<dyn PortLookup>,
    connector: Arc<dyn UpstreamConnector>,
    hubs: DashMap<ProjectId, SharedHub>,
    next_viewer: AtomicU64,
    activity: RwLock<Option<ActivityHook>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    events: EventBus<RelayEvent>,
}

enum Pass {
    Active(usize),
    /// Hub torn down, with the upstream error if there was one.
    Gone(Option<String>),
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        ports: Arc<dyn PortLookup>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                ports,
                connector,
                hubs: DashMap::new(),
                next_viewer: AtomicU64::new(1),
                activity: RwLock::new(None),
                pump: Mutex::new(None),
                events: EventBus::new(),
            }),
        }
    }

    /// Relay dialing runtimes of `orchestrator` over WebSocket.
    pub fn from_config(config: RelayConfig, orchestrator: Orchestrator) -> Self {
        let connector = Arc::new(WsConnector::new(
            config.upstream_path.clone(),
            config.upstream_protocol.clone(),
        ));
        Self::new(config, Arc::new(orchestrator), connector)
    }

    /// Called with the project id on every viewer join and relayed frame.
    pub fn set_activity_hook(&self, hook: ActivityHook) {
        *self.inner.activity.write() = Some(hook);
    }

    /// Attach a viewer, dialing the upstream if it is the first one.
    pub fn add_viewer(
        &self,
        project_id: &ProjectId,
        link: Box<dyn RelayLink>,
    ) -> Result<ViewerId, RelayError> {
        let viewer_id = ViewerId(self.inner.next_viewer.fetch_add(1, Ordering::Relaxed));
        let mut link = Some(link);

        // A hub found closed was torn down concurrently; dial a new one.
        loop {
            if let Some(hub) = self.hub(project_id) {
                let mut guard = hub.lock();
                if !guard.closed {
                    if let Some(link) = link.take() {
                        guard.viewers.push((viewer_id, link));
                    }
                    let viewers = guard.viewers.len();
                    drop(guard);
                    self.joined(project_id, viewer_id, viewers);
                    return Ok(viewer_id);
                }
                drop(guard);
                self.inner
                    .hubs
                    .remove_if(project_id, |_, h| Arc::ptr_eq(h, &hub));
                continue;
            }

            let dialed = self
                .inner
                .ports
                .port_of(project_id)
                .ok_or_else(|| RelayError::RuntimeNotRunning(project_id.clone()))
                .and_then(|port| Ok((port, self.inner.connector.connect(project_id, port)?)));
            let (port, mut upstream) = match dialed {
                Ok(dialed) => dialed,
                Err(err) => {
                    if let Some(mut link) = link.take() {
                        link.close();
                    }
                    return Err(err);
                }
            };

            match self.inner.hubs.entry(project_id.clone()) {
                Entry::Occupied(_) => {
                    // Lost a race with another first viewer.
                    upstream.close();
                    continue;
                }
                Entry::Vacant(slot) => {
                    let viewers = link.take().map(|l| vec![(viewer_id, l)]).unwrap_or_default();
                    slot.insert(Arc::new(Mutex::new(Hub {
                        upstream,
                        viewers,
                        closed: false,
                    })));
                }
            }

            log!("relay"; "attached upstream of {} on port {}", project_id, port);
            self.inner.events.emit(RelayEvent::UpstreamAttached {
                project_id: project_id.clone(),
            });
            self.joined(project_id, viewer_id, 1);
            return Ok(viewer_id);
        }
    }

    fn joined(&self, project_id: &ProjectId, viewer_id: ViewerId, viewers: usize) {
        debug!("relay"; "{} joined {} ({} viewer(s))", viewer_id, project_id, viewers);
        self.inner.touch(project_id);
        self.inner.events.emit(RelayEvent::ViewerJoined {
            project_id: project_id.clone(),
            viewer_id,
            viewers,
        });
    }

    /// Detach a viewer. The last one leaving closes the upstream.
    pub fn remove_viewer(&self, project_id: &ProjectId, viewer_id: ViewerId) -> bool {
        let Some(hub) = self.hub(project_id) else {
            return false;
        };

        let mut guard = hub.lock();
        let Some(index) = guard.viewers.iter().position(|(id, _)| *id == viewer_id) else {
            return false;
        };
        let (_, mut link) = guard.viewers.remove(index);
        link.close();
        let viewers = guard.viewers.len();
        if viewers == 0 {
            guard.teardown();
        }
        drop(guard);

        self.inner.left(project_id, viewer_id, viewers);
        if viewers == 0 {
            self.inner.detach(project_id, &hub, None);
        }
        true
    }

    /// One non-blocking relay pass over every project. Returns frames moved.
    pub fn pump(&self) -> usize {
        self.inner.pump()
    }

    /// Run [`Relay::pump`] on an interval. Must be called within a runtime.
    pub fn spawn_pump(&self) {
        let mut pump = self.inner.pump.lock();
        if pump.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *pump = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.pump_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                inner.pump();
            }
        }));
    }

    pub fn stop_pump(&self) {
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
    }

    /// Close every hub. Used on shutdown.
    pub fn close_all(&self) {
        self.stop_pump();
        for (project_id, hub) in self.inner.snapshot() {
            hub.lock().teardown();
            self.inner.detach(&project_id, &hub, None);
        }
    }

    pub fn viewer_count(&self, project_id: &ProjectId) -> usize {
        self.hub(project_id)
            .map(|hub| hub.lock().viewers.len())
            .unwrap_or(0)
    }

    pub fn has_upstream(&self, project_id: &ProjectId) -> bool {
        self.hub(project_id).is_some_and(|hub| !hub.lock().closed)
    }

    pub fn project_count(&self) -> usize {
        self.inner.hubs.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    fn hub(&self, project_id: &ProjectId) -> Option<SharedHub> {
        self.inner.hubs.get(project_id).map(|h| Arc::clone(h.value()))
    }
}

impl Inner {
    fn snapshot(&self) -> Vec<(ProjectId, SharedHub)> {
        self.hubs
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    fn pump(&self) -> usize {
        let mut moved = 0;
        for (project_id, hub) in self.snapshot() {
            let pass = self.pump_hub(&project_id, &hub);
            match pass {
                Pass::Active(0) => {}
                Pass::Active(n) => {
                    moved += n;
                    self.touch(&project_id);
                }
                Pass::Gone(error) => self.detach(&project_id, &hub, error),
            }
        }
        moved
    }

    fn pump_hub(&self, project_id: &ProjectId, hub: &SharedHub) -> Pass {
        let mut guard = hub.lock();
        if guard.closed {
            return Pass::Gone(None);
        }
        let Hub {
            upstream, viewers, ..
        } = &mut *guard;
        let mut moved = 0;
        let mut dropped = Vec::new();

        // upstream -> every viewer
        for _ in 0..MAX_FRAMES_PER_PASS {
            let frame = match upstream.try_recv() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    let error = match err {
                        RelayError::Closed => "upstream closed".to_owned(),
                        other => other.to_string(),
                    };
                    log!("relay"; "{}: {}, closing {} viewer(s)", project_id, error, viewers.len());
                    guard.teardown();
                    return Pass::Gone(Some(error));
                }
            };

            if let Frame::Text(text) = &frame
                && let Some(message) = LiveUpdateMessage::parse(text)
            {
                debug!("relay"; "{} {}", project_id, message.summary());
                self.events.emit(RelayEvent::Update {
                    project_id: project_id.clone(),
                    message,
                });
            }

            viewers.retain_mut(|(id, viewer)| match viewer.send(frame.clone()) {
                Ok(()) => true,
                Err(err) => {
                    debug!("relay"; "{} of {} dropped: {}", id, project_id, err);
                    viewer.close();
                    dropped.push(*id);
                    false
                }
            });
            moved += 1;
        }

        // each viewer -> upstream
        let mut upstream_error = None;
        viewers.retain_mut(|(id, viewer)| {
            for _ in 0..MAX_FRAMES_PER_PASS {
                match viewer.try_recv() {
                    Ok(Some(frame)) => {
                        if upstream_error.is_none()
                            && let Err(err) = upstream.send(frame)
                        {
                            upstream_error = Some(err.to_string());
                        }
                        moved += 1;
                    }
                    Ok(None) => return true,
                    Err(err) => {
                        debug!("relay"; "{} of {} left: {}", id, project_id, err);
                        viewer.close();
                        dropped.push(*id);
                        return false;
                    }
                }
            }
            true
        });

        if let Some(error) = upstream_error {
            log!("relay"; "{}: upstream write failed: {}", project_id, error);
            guard.teardown();
            return Pass::Gone(Some(error));
        }

        let remaining = guard.viewers.len();
        let empty = remaining == 0;
        if empty {
            guard.teardown();
        }
        drop(guard);

        for id in dropped {
            self.left(project_id, id, remaining);
        }
        if empty { Pass::Gone(None) } else { Pass::Active(moved) }
    }

    fn left(&self, project_id: &ProjectId, viewer_id: ViewerId, viewers: usize) {
        debug!("relay"; "{} left {} ({} viewer(s))", viewer_id, project_id, viewers);
        self.events.emit(RelayEvent::ViewerLeft {
            project_id: project_id.clone(),
            viewer_id,
            viewers,
        });
    }

    /// Forget a torn-down hub, unless it was already replaced.
    fn detach(&self, project_id: &ProjectId, hub: &SharedHub, error: Option<String>) {
        let removed = self
            .hubs
            .remove_if(project_id, |_, h| Arc::ptr_eq(h, hub))
            .is_some();
        if removed {
            if error.is_none() {
                debug!("relay"; "detached upstream of {}", project_id);
            }
            self.events.emit(RelayEvent::UpstreamDetached {
                project_id: project_id.clone(),
                error,
            });
        }
    }

    fn touch(&self, project_id: &ProjectId) {
        let hook = self.activity.read().clone();
        if let Some(hook) = hook {
            hook(project_id);
        }
    }
}
