use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::config::{ConflictConfig, QueueConfig, RuntimeConfig};
use crate::conflict::ConflictResolver;
use crate::core::{ChangeKind, Priority};
use crate::queue::{ChangeStatus, SourceLocation};
use crate::runtime::fake::{FakeLauncher, FakeProbe, ProbeMode};

struct Fixture {
    registry: ProjectRegistry,
    launcher: Arc<FakeLauncher>,
    dirs: Vec<TempDir>,
}

fn fixture(config: RegistryConfig, mode: ProbeMode) -> Fixture {
    let runtime = RuntimeConfig {
        command: vec!["fake".into()],
        port_start: 6200,
        pool_size: 2,
        startup_timeout_ms: 200,
        readiness_interval_ms: 10,
        stop_grace_ms: 50,
        exit_poll_ms: 10,
        ..RuntimeConfig::default()
    };
    let launcher = Arc::new(FakeLauncher::default());
    let orchestrator = Orchestrator::new(
        runtime,
        Arc::clone(&launcher) as Arc<dyn crate::runtime::Launcher>,
        Arc::new(FakeProbe::new(mode)),
    );
    let queue = ChangeQueue::new(QueueConfig {
        tick_ms: 5,
        retry_base_ms: 5,
        ..QueueConfig::default()
    });
    let registry = ProjectRegistry::new(
        config,
        WatchOptions {
            debounce: Duration::from_millis(50),
            ignore: Vec::new(),
        },
        orchestrator,
        queue,
        Arc::new(ConflictResolver::new(ConflictConfig::default())),
    );
    Fixture {
        registry,
        launcher,
        dirs: Vec::new(),
    }
}

fn default_fixture() -> Fixture {
    fixture(RegistryConfig::default(), ProbeMode::Ready)
}

impl Fixture {
    async fn register(&mut self, id: &str) -> ProjectId {
        let dir = TempDir::new().unwrap();
        let project = ProjectId::new(id);
        self.registry
            .register_project(project.clone(), dir.path(), None)
            .await
            .unwrap();
        self.dirs.push(dir);
        project
    }

    fn root(&self, id: &ProjectId) -> PathBuf {
        self.registry.get_project_info(id).unwrap().root
    }

    fn state(&self, id: &ProjectId) -> ProjectState {
        self.registry.get_project_info(id).unwrap().state
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_to_end_write_is_observed() {
    let mut f = default_fixture();
    let id = f.register("shop").await;
    // Existing before the watch starts, so the recursive watch covers it.
    fs::create_dir(f.root(&id).join("src")).unwrap();
    let mut changes = f.registry.subscribe_changes();

    f.registry.start_project(&id).await.unwrap();
    assert_eq!(f.state(&id), ProjectState::Running);

    let change = f
        .registry
        .enqueue_change(NewChange::update(id.clone(), "src/App.txt", "v1"))
        .unwrap();
    let queue = f.registry.queue().clone();
    assert!(wait_for(|| queue.get_status(change) == ChangeStatus::Completed).await);

    let file = f.root(&id).join("src/App.txt");
    assert_eq!(fs::read_to_string(file).unwrap(), "v1");

    let mut seen = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(600), changes.recv()).await {
        seen.push(event);
    }
    let app: Vec<_> = seen.iter().filter(|e| e.file_path == "src/App.txt").collect();
    assert_eq!(app.len(), 1, "events: {seen:?}");
    assert_eq!(app[0].project_id, id);
}

#[tokio::test]
async fn test_register_is_idempotent() {
    let mut f = default_fixture();
    let id = f.register("a").await;
    let root = f.root(&id);

    let again = f
        .registry
        .register_project(id.clone(), "/somewhere/else", Some("Other".into()))
        .await
        .unwrap();
    assert_eq!(again.root, root);
    assert_eq!(again.name, "a");
    assert_eq!(f.registry.get_stats().total, 1);
}

#[tokio::test]
async fn test_register_rejects_missing_root() {
    let f = default_fixture();
    let err = f
        .registry
        .register_project(ProjectId::new("a"), "/no/such/previewd/root", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::InvalidRoot(_)));
}

#[tokio::test]
async fn test_capacity_exceeded() {
    let mut f = fixture(
        RegistryConfig {
            max_projects: 2,
            ..RegistryConfig::default()
        },
        ProbeMode::Ready,
    );
    f.register("a").await;
    f.register("b").await;

    let dir = TempDir::new().unwrap();
    let err = f
        .registry
        .register_project(ProjectId::new("c"), dir.path(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::CapacityExceeded(2)));
}

#[tokio::test]
async fn test_full_registry_evicts_idle_projects() {
    let mut f = fixture(
        RegistryConfig {
            max_projects: 2,
            idle_timeout_secs: 0,
            ..RegistryConfig::default()
        },
        ProbeMode::Ready,
    );
    let a = f.register("a").await;
    let b = f.register("b").await;
    f.registry.start_project(&a).await.unwrap();

    let dir = TempDir::new().unwrap();
    f.registry
        .register_project(ProjectId::new("c"), dir.path(), None)
        .await
        .unwrap();

    // `a` was stopped by the sweep and both idle projects made room.
    assert!(!f.registry.contains(&a));
    assert!(!f.registry.contains(&b));
    assert!(f.registry.contains(&ProjectId::new("c")));
    assert_eq!(f.registry.orchestrator().running_count(), 0);
}

#[tokio::test]
async fn test_failed_start_keeps_error() {
    let mut f = fixture(RegistryConfig::default(), ProbeMode::Never);
    let id = f.register("a").await;
    let other = f.register("b").await;

    let err = f.registry.start_project(&id).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Runtime(RuntimeError::StartupTimeout { .. })
    ));

    let info = f.registry.get_project_info(&id).unwrap();
    assert_eq!(info.state, ProjectState::Error);
    assert!(info.last_error.unwrap().contains("not ready"));
    assert_eq!(f.state(&other), ProjectState::Stopped);
    assert_eq!(f.registry.get_stats().free_ports, 2);
}

#[tokio::test]
async fn test_stop_and_unregister() {
    let mut f = default_fixture();
    let id = f.register("a").await;
    f.registry.start_project(&id).await.unwrap();
    assert_eq!(f.registry.get_stats().watched, 1);

    f.registry.stop_project(&id).await.unwrap();
    assert_eq!(f.state(&id), ProjectState::Stopped);
    assert_eq!(f.registry.get_stats().watched, 0);
    assert_eq!(f.registry.get_stats().free_ports, 2);

    f.registry.start_project(&id).await.unwrap();
    f.registry.unregister_project(&id).await.unwrap();
    assert!(f.registry.get_project_info(&id).is_none());
    assert_eq!(f.registry.orchestrator().running_count(), 0);
    assert!(matches!(
        f.registry.unregister_project(&id).await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unregister_during_start_leaves_nothing_behind() {
    let mut f = fixture(RegistryConfig::default(), ProbeMode::ReadyAfter(5));
    let id = f.register("a").await;

    let registry = f.registry.clone();
    let starting = id.clone();
    let start = tokio::spawn(async move { registry.start_project(&starting).await });

    // Still polling readiness.
    tokio::time::sleep(Duration::from_millis(15)).await;
    f.registry.unregister_project(&id).await.unwrap();

    // The start that was in progress finished before the unregister ran.
    assert!(start.await.unwrap().is_ok());
    assert!(!f.registry.contains(&id));
    let stats = f.registry.get_stats();
    assert_eq!(stats.watched, 0);
    assert_eq!(stats.running_runtimes, 0);
    assert_eq!(stats.free_ports, 2);

    // A start for the removed project now fails fast.
    assert!(matches!(
        f.registry.start_project(&id).await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_unregister_drops_queued_changes() {
    let mut f = default_fixture();
    let id = f.register("a").await;
    f.registry.queue().stop();

    f.registry
        .enqueue_change(NewChange::update(id.clone(), "a.txt", "x"))
        .unwrap();
    f.registry
        .enqueue_change(NewChange::update(id.clone(), "b.txt", "x"))
        .unwrap();
    assert_eq!(f.registry.get_stats().queued_changes, 2);

    f.registry.unregister_project(&id).await.unwrap();
    assert_eq!(f.registry.get_stats().queued_changes, 0);
}

#[tokio::test]
async fn test_unexpected_exit_marks_error() {
    let mut f = default_fixture();
    let id = f.register("a").await;
    f.registry.start_project(&id).await.unwrap();

    f.launcher.latest("a").crash(3);
    let registry = f.registry.clone();
    let watched_id = id.clone();
    assert!(
        wait_for(|| registry
            .get_project_info(&watched_id)
            .is_some_and(|p| p.state == ProjectState::Error))
        .await
    );

    let info = f.registry.get_project_info(&id).unwrap();
    assert!(info.last_error.unwrap().contains("exit code 3"));
    assert_eq!(f.registry.get_stats().watched, 0);
    assert_eq!(f.launcher.launch_count(), 1);
}

#[tokio::test]
async fn test_idle_cleanup_returns_ports() {
    let mut f = fixture(
        RegistryConfig {
            idle_timeout_secs: 0,
            ..RegistryConfig::default()
        },
        ProbeMode::Ready,
    );
    let a = f.register("a").await;
    let b = f.register("b").await;
    let c = f.register("c").await;

    f.registry.start_project(&a).await.unwrap();
    f.registry.start_project(&b).await.unwrap();
    assert!(matches!(
        f.registry.start_project(&c).await,
        Err(RegistryError::Runtime(RuntimeError::PoolExhausted(_)))
    ));

    let mut stopped = f.registry.cleanup_idle().await;
    stopped.sort();
    assert_eq!(stopped, vec![a.clone(), b.clone()]);
    assert_eq!(f.registry.get_stats().free_ports, 2);

    f.registry.start_project(&b).await.unwrap();
    f.registry.start_project(&c).await.unwrap();
    assert_eq!(f.registry.get_stats().running_runtimes, 2);
}

#[tokio::test]
async fn test_idle_sweep_task() {
    let mut f = fixture(
        RegistryConfig {
            idle_timeout_secs: 0,
            idle_sweep_secs: 1,
            ..RegistryConfig::default()
        },
        ProbeMode::Ready,
    );
    let id = f.register("a").await;
    f.registry.start_project(&id).await.unwrap();

    f.registry.start_idle_cleanup();
    let registry = f.registry.clone();
    let check = id.clone();
    assert!(
        wait_for(|| registry
            .get_project_info(&check)
            .is_some_and(|p| p.state == ProjectState::Stopped))
        .await
    );
    f.registry.stop_idle_cleanup();
}

#[tokio::test]
async fn test_unknown_project_rejected() {
    let f = default_fixture();
    let missing = ProjectId::new("ghost");
    assert!(matches!(
        f.registry
            .enqueue_change(NewChange::update(missing.clone(), "a", "b")),
        Err(RegistryError::NotFound(_))
    ));
    assert!(matches!(
        f.registry.start_project(&missing).await,
        Err(RegistryError::NotFound(_))
    ));
    assert!(!f.registry.touch(&missing));
}

#[tokio::test]
async fn test_escaping_paths_rejected_before_queueing() {
    let mut f = default_fixture();
    let id = f.register("a").await;
    f.registry.queue().stop();

    let err = f
        .registry
        .enqueue_change(NewChange::update(id.clone(), "../evil", "x"))
        .unwrap_err();
    assert!(matches!(err, RegistryError::Queue(QueueError::InvalidPath(_))));

    let err = f
        .registry
        .enqueue_changes(vec![
            NewChange::bulk(id.clone(), "ok.html", "x"),
            NewChange::bulk(id.clone(), "/etc/passwd", "x"),
        ])
        .unwrap_err();
    assert!(matches!(err, RegistryError::Queue(QueueError::InvalidPath(_))));
    assert!(f.registry.queue().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resolve_pending_conflict_queues_write() {
    let mut f = default_fixture();
    let id = f.register("a").await;
    let root = f.root(&id);
    fs::write(root.join("page.html"), "disk\n").unwrap();

    let key = root.join("page.html").display().to_string();
    assert!(f.registry.resolver().detect_conflict(&key, "mine\n", "disk\n", Some("base\n")));
    assert!(f.registry.resolver().detect_conflict("/elsewhere/x.html", "a", "b", None));

    let pending = f.registry.pending_conflicts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].project_id, id);
    assert_eq!(pending[0].file_path, "page.html");

    let change = f
        .registry
        .resolve_conflict(&id, "page.html", Some(ResolutionStrategy::KeepLocal))
        .await
        .unwrap()
        .unwrap();
    assert!(wait_for(|| f.registry.queue().get_status(change) == ChangeStatus::Completed).await);
    assert_eq!(fs::read_to_string(root.join("page.html")).unwrap(), "mine\n");
    assert!(f.registry.pending_conflicts().is_empty());

    let nothing = f
        .registry
        .resolve_conflict(&id, "page.html", None)
        .await
        .unwrap();
    assert_eq!(nothing, None);
}

#[tokio::test]
async fn test_apply_edit_enqueues_editor_write() {
    let mut f = default_fixture();
    let id = f.register("a").await;
    f.registry.queue().stop();
    fs::write(f.root(&id).join("index.html"), "<h1>Hello</h1>\n").unwrap();

    let change_id = f
        .registry
        .apply_edit(
            &id,
            EditAction {
                file_path: "index.html".into(),
                old_value: "Hello".into(),
                new_value: "Bonjour".into(),
                location: Some(SourceLocation {
                    line: 1,
                    column: None,
                }),
            },
        )
        .unwrap();

    let queued = f.registry.queue().get(change_id).unwrap();
    assert_eq!(queued.priority, Priority::EDITOR);
    assert_eq!(queued.kind, ChangeKind::Update);
    assert_eq!(queued.content.as_deref(), Some("<h1>Bonjour</h1>\n"));
    assert_eq!(queued.base.as_deref(), Some("<h1>Hello</h1>\n"));
}

#[tokio::test]
async fn test_apply_edit_missing_file() {
    let mut f = default_fixture();
    let id = f.register("a").await;
    let err = f
        .registry
        .apply_edit(
            &id,
            EditAction {
                file_path: "nope.html".into(),
                old_value: "a".into(),
                new_value: "b".into(),
                location: None,
            },
        )
        .unwrap_err();
    assert!(matches!(err, RegistryError::Io { .. }));
}

#[tokio::test]
async fn test_stats_and_listing() {
    let mut f = default_fixture();
    let b = f.register("b").await;
    f.register("a").await;
    f.registry.start_project(&b).await.unwrap();

    let ids: Vec<_> = f
        .registry
        .get_all_projects()
        .into_iter()
        .map(|p| p.id.to_string())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);

    let stats = f.registry.get_stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.stopped, 1);
    assert_eq!(stats.running_runtimes, 1);
    assert_eq!(stats.free_ports, 1);
    assert_eq!(stats.pool_capacity, 2);

    f.registry.shutdown().await;
    assert_eq!(f.state(&b), ProjectState::Stopped);
    assert_eq!(f.registry.orchestrator().running_count(), 0);
}
