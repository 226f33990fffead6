//! Per-key debounce timers.
//!
//! Every `(project, path)` key owns at most one pending timer task. A new raw
//! event for the key aborts the timer and schedules a fresh one carrying the
//! latest kind. The generation check covers a timer that already woke up
//! when it was replaced.
//!
//! Each watch session pushes through its own `open` flag. The flag is read
//! under the pending lock, so a push racing with `cancel_project` either
//! lands first and is discarded by it, or sees the closed flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;

use super::ChangeEvent;
use crate::core::{ChangeKind, EventBus, ProjectId};

type Key = (ProjectId, String);

struct Pending {
    kind: ChangeKind,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Clone)]
pub(super) struct Debouncer {
    pending: Arc<Mutex<FxHashMap<Key, Pending>>>,
    generation: Arc<AtomicU64>,
    events: EventBus<ChangeEvent>,
}

impl Debouncer {
    pub(super) fn new(events: EventBus<ChangeEvent>) -> Self {
        Self {
            pending: Arc::default(),
            generation: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    /// Record a raw event, restarting the key's quiet period. `false` once
    /// the session's `open` flag is cleared.
    pub(super) fn push(
        &self,
        open: &AtomicBool,
        project_id: &ProjectId,
        path: String,
        kind: ChangeKind,
        window: Duration,
    ) -> bool {
        let key = (project_id.clone(), path);

        let mut pending = self.pending.lock();
        if !open.load(Ordering::Acquire) {
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = pending.remove(&key) {
            old.timer.abort();
        }

        let timer = {
            let pending = Arc::clone(&self.pending);
            let events = self.events.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let fired = {
                    let mut map = pending.lock();
                    match map.get(&key) {
                        Some(p) if p.generation == generation => map.remove(&key),
                        _ => None,
                    }
                };
                if let Some(p) = fired {
                    emit(&events, key, p.kind);
                }
            })
        };

        pending.insert(
            key,
            Pending {
                kind,
                generation,
                timer,
            },
        );
        true
    }

    /// Drop every buffered event of a project without emitting.
    pub(super) fn cancel_project(&self, project_id: &ProjectId) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|(id, _), p| {
            if id == project_id {
                p.timer.abort();
                false
            } else {
                true
            }
        });
        before - pending.len()
    }

    /// Emit every buffered event now.
    pub(super) fn flush_all(&self) -> usize {
        let drained: Vec<(Key, Pending)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (key, p) in drained {
            p.timer.abort();
            emit(&self.events, key, p.kind);
        }
        count
    }

    pub(super) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

fn emit(events: &EventBus<ChangeEvent>, (project_id, file_path): Key, kind: ChangeKind) {
    crate::debug!("watch"; "{} {} {}", project_id, kind.label(), file_path);
    events.emit(ChangeEvent {
        project_id,
        file_path,
        kind,
        timestamp: SystemTime::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(40);
    static OPEN: AtomicBool = AtomicBool::new(true);

    fn setup() -> (Debouncer, tokio::sync::broadcast::Receiver<ChangeEvent>) {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        (Debouncer::new(bus), rx)
    }

    #[tokio::test]
    async fn test_burst_coalesces_to_last_kind() {
        let (debouncer, mut rx) = setup();
        let id = ProjectId::new("a");

        debouncer.push(&OPEN, &id, "src/App.tsx".into(), ChangeKind::Create, WINDOW);
        debouncer.push(&OPEN, &id, "src/App.tsx".into(), ChangeKind::Update, WINDOW);
        debouncer.push(&OPEN, &id, "src/App.tsx".into(), ChangeKind::Delete, WINDOW);
        assert_eq!(debouncer.pending_count(), 1);

        tokio::time::sleep(WINDOW * 4).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.file_path, "src/App.tsx");
        assert_eq!(event.kind, ChangeKind::Delete);
        assert!(rx.try_recv().is_err());
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (debouncer, mut rx) = setup();
        let a = ProjectId::new("a");
        let b = ProjectId::new("b");

        debouncer.push(&OPEN, &a, "index.html".into(), ChangeKind::Update, WINDOW);
        debouncer.push(&OPEN, &b, "index.html".into(), ChangeKind::Update, WINDOW);
        debouncer.push(&OPEN, &a, "main.ts".into(), ChangeKind::Update, WINDOW);

        tokio::time::sleep(WINDOW * 4).await;
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push((event.project_id.to_string(), event.file_path));
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), "index.html".to_string()),
                ("a".to_string(), "main.ts".to_string()),
                ("b".to_string(), "index.html".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_extends_quiet_period() {
        let (debouncer, mut rx) = setup();
        let id = ProjectId::new("a");

        for _ in 0..4 {
            debouncer.push(&OPEN, &id, "a.css".into(), ChangeKind::Update, WINDOW);
            tokio::time::sleep(WINDOW / 4).await;
        }
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(WINDOW * 4).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_project_discards() {
        let (debouncer, mut rx) = setup();
        let a = ProjectId::new("a");
        let b = ProjectId::new("b");

        debouncer.push(&OPEN, &a, "x".into(), ChangeKind::Update, WINDOW);
        debouncer.push(&OPEN, &a, "y".into(), ChangeKind::Update, WINDOW);
        debouncer.push(&OPEN, &b, "x".into(), ChangeKind::Update, WINDOW);
        assert_eq!(debouncer.cancel_project(&a), 2);

        tokio::time::sleep(WINDOW * 4).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.project_id, b);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flush_all_emits_immediately() {
        let (debouncer, mut rx) = setup();
        let id = ProjectId::new("a");

        debouncer.push(&OPEN, &id, "x".into(), ChangeKind::Create, Duration::from_secs(60));
        debouncer.push(&OPEN, &id, "y".into(), ChangeKind::Delete, Duration::from_secs(60));
        assert_eq!(debouncer.flush_all(), 2);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_session_cannot_push() {
        let (debouncer, mut rx) = setup();
        let id = ProjectId::new("a");
        let open = AtomicBool::new(true);

        assert!(debouncer.push(&open, &id, "x".into(), ChangeKind::Update, WINDOW));
        open.store(false, Ordering::Release);
        assert_eq!(debouncer.cancel_project(&id), 1);

        // A pump still inside its batch when the session closed.
        assert!(!debouncer.push(&open, &id, "y".into(), ChangeKind::Update, WINDOW));
        assert_eq!(debouncer.pending_count(), 0);

        tokio::time::sleep(WINDOW * 4).await;
        assert!(rx.try_recv().is_err());
    }
}
