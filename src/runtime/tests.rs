use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rustc_hash::FxHashSet;

use super::fake::{FakeLauncher, FakeProbe, ProbeMode};
use super::*;

fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        command: vec!["fake".into()],
        port_start: 5200,
        pool_size: 3,
        startup_timeout_ms: 300,
        readiness_interval_ms: 10,
        stop_grace_ms: 100,
        exit_poll_ms: 10,
        ..RuntimeConfig::default()
    }
}

fn orchestrator(launcher: Arc<FakeLauncher>, mode: ProbeMode) -> Orchestrator {
    Orchestrator::new(test_config(), launcher, Arc::new(FakeProbe::new(mode)))
}

fn id(s: &str) -> ProjectId {
    ProjectId::new(s)
}

const ROOT: &str = "/srv/preview";

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_start_running_record() {
    let launcher = Arc::new(FakeLauncher::default());
    let orch = orchestrator(Arc::clone(&launcher), ProbeMode::ReadyAfter(2));
    let mut events = orch.subscribe();

    let record = orch.start(&id("a"), Path::new(ROOT)).await.unwrap();
    assert_eq!(record.status, RuntimeStatus::Running);
    assert_eq!(record.port, 5200);
    assert!(record.pid.is_some());
    assert!(orch.is_running(&id("a")));
    assert_eq!(orch.running_count(), 1);
    assert_eq!(orch.available_ports(), 2);

    let (spec, _) = &launcher.launches.lock()[0];
    assert_eq!(spec.port, 5200);
    assert_eq!(spec.root, Path::new(ROOT));

    match events.recv().await.unwrap() {
        RuntimeEvent::Started { project_id, port } => {
            assert_eq!(project_id, id("a"));
            assert_eq!(port, 5200);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let launcher = Arc::new(FakeLauncher::default());
    let orch = orchestrator(Arc::clone(&launcher), ProbeMode::Ready);

    let first = orch.start(&id("a"), Path::new(ROOT)).await.unwrap();
    let second = orch.start(&id("a"), Path::new(ROOT)).await.unwrap();
    assert_eq!(first.port, second.port);
    assert_eq!(first.instance, second.instance);
    assert_eq!(launcher.launch_count(), 1);
    assert_eq!(orch.available_ports(), 2);
}

#[tokio::test]
async fn test_unique_ports_until_exhausted() {
    let launcher = Arc::new(FakeLauncher::default());
    let orch = orchestrator(launcher, ProbeMode::Ready);

    let mut ports = FxHashSet::default();
    for name in ["a", "b", "c"] {
        let record = orch.start(&id(name), Path::new(ROOT)).await.unwrap();
        assert!(ports.insert(record.port));
    }

    let err = orch.start(&id("d"), Path::new(ROOT)).await.unwrap_err();
    assert!(matches!(err, RuntimeError::PoolExhausted(3)));

    orch.stop(&id("b")).await.unwrap();
    let record = orch.start(&id("d"), Path::new(ROOT)).await.unwrap();
    assert!(ports.contains(&record.port));
    assert_eq!(orch.running_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_get_distinct_ports() {
    let launcher = Arc::new(FakeLauncher::default());
    let orch = orchestrator(launcher, ProbeMode::ReadyAfter(1));

    let mut tasks = tokio::task::JoinSet::new();
    for name in ["a", "b", "c"] {
        let orch = orch.clone();
        tasks.spawn(async move { orch.start(&id(name), Path::new(ROOT)).await });
    }

    let mut ports = FxHashSet::default();
    while let Some(result) = tasks.join_next().await {
        let record = result.unwrap().unwrap();
        assert!(ports.insert(record.port), "port {} reused", record.port);
    }
    assert_eq!(ports.len(), 3);
    assert_eq!(orch.available_ports(), 0);
}

#[tokio::test]
async fn test_startup_timeout_cleans_up() {
    let launcher = Arc::new(FakeLauncher::default());
    let orch = orchestrator(Arc::clone(&launcher), ProbeMode::Never);

    let err = orch.start(&id("slow"), Path::new(ROOT)).await.unwrap_err();
    assert!(matches!(err, RuntimeError::StartupTimeout { .. }));
    assert!(orch.get_record(&id("slow")).is_none());
    assert_eq!(orch.available_ports(), 3);
    assert!(launcher.latest("slow").killed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_exit_during_startup() {
    let launcher = Arc::new(FakeLauncher {
        crash_on_launch: true,
        ..FakeLauncher::default()
    });
    let orch = orchestrator(launcher, ProbeMode::Never);

    let err = orch.start(&id("bad"), Path::new(ROOT)).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ProcessExitedUnexpectedly { code: Some(1), .. }
    ));
    assert!(orch.get_record(&id("bad")).is_none());
    assert_eq!(orch.available_ports(), 3);
}

#[tokio::test]
async fn test_stop_graceful() {
    let launcher = Arc::new(FakeLauncher::default());
    let orch = orchestrator(Arc::clone(&launcher), ProbeMode::Ready);
    orch.start(&id("a"), Path::new(ROOT)).await.unwrap();
    let mut events = orch.subscribe();

    orch.stop(&id("a")).await.unwrap();
    let process = launcher.latest("a");
    assert!(process.terminated.load(Ordering::SeqCst));
    assert!(!process.killed.load(Ordering::SeqCst));
    assert!(!orch.is_running(&id("a")));
    assert_eq!(orch.available_ports(), 3);
    assert!(matches!(
        events.recv().await.unwrap(),
        RuntimeEvent::Stopped { .. }
    ));
}

#[tokio::test]
async fn test_stop_force_kills_after_grace() {
    let launcher = Arc::new(FakeLauncher {
        ignore_term: true,
        ..FakeLauncher::default()
    });
    let orch = orchestrator(Arc::clone(&launcher), ProbeMode::Ready);
    orch.start(&id("stubborn"), Path::new(ROOT)).await.unwrap();

    orch.stop(&id("stubborn")).await.unwrap();
    let process = launcher.latest("stubborn");
    assert!(process.terminated.load(Ordering::SeqCst));
    assert!(process.killed.load(Ordering::SeqCst));
    assert_eq!(orch.available_ports(), 3);
}

#[tokio::test]
async fn test_stop_without_record_is_noop() {
    let orch = orchestrator(Arc::new(FakeLauncher::default()), ProbeMode::Ready);
    orch.stop(&id("ghost")).await.unwrap();
    assert_eq!(orch.available_ports(), 3);
}

#[tokio::test]
async fn test_unexpected_exit_emits_event() {
    let launcher = Arc::new(FakeLauncher::default());
    let orch = orchestrator(Arc::clone(&launcher), ProbeMode::Ready);
    orch.start(&id("a"), Path::new(ROOT)).await.unwrap();
    let mut events = orch.subscribe();

    launcher.latest("a").crash(137);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        RuntimeEvent::Exited { project_id, error } => {
            assert_eq!(project_id, id("a"));
            assert!(matches!(
                error,
                RuntimeError::ProcessExitedUnexpectedly { code: Some(137), .. }
            ));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(orch.get_record(&id("a")).is_none());
    assert_eq!(orch.available_ports(), 3);
}

#[tokio::test]
async fn test_stale_monitor_ignores_new_instance() {
    let launcher = Arc::new(FakeLauncher::default());
    let orch = orchestrator(Arc::clone(&launcher), ProbeMode::Ready);

    let first = orch.start(&id("a"), Path::new(ROOT)).await.unwrap();
    orch.stop(&id("a")).await.unwrap();
    let second = orch.start(&id("a"), Path::new(ROOT)).await.unwrap();
    assert!(second.instance > first.instance);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(orch.is_running(&id("a")));
    assert!(!launcher.latest("a").is_dead());
}

#[tokio::test]
async fn test_restart_and_touch() {
    let launcher = Arc::new(FakeLauncher::default());
    let orch = orchestrator(Arc::clone(&launcher), ProbeMode::Ready);

    assert!(matches!(
        orch.restart(&id("a")).await,
        Err(RuntimeError::NotRunning(_))
    ));

    let first = orch.start(&id("a"), Path::new(ROOT)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    orch.touch(&id("a"));
    let touched = orch.get_record(&id("a")).unwrap();
    assert!(touched.last_active > first.last_active);

    let restarted = orch.restart(&id("a")).await.unwrap();
    assert_eq!(restarted.root, Path::new(ROOT));
    assert_eq!(launcher.launch_count(), 2);
    assert_eq!(orch.running_count(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let launcher = Arc::new(FakeLauncher::default());
    let orch = orchestrator(Arc::clone(&launcher), ProbeMode::Ready);
    for name in ["a", "b", "c"] {
        orch.start(&id(name), Path::new(ROOT)).await.unwrap();
    }

    orch.shutdown().await;
    assert_eq!(orch.running_count(), 0);
    assert_eq!(orch.available_ports(), 3);
    for name in ["a", "b", "c"] {
        assert!(launcher.latest(name).is_dead());
    }
}

#[test]
fn test_error_messages() {
    let err = RuntimeError::ProcessExitedUnexpectedly {
        project: id("a"),
        code: Some(-1),
    };
    assert_eq!(err.to_string(), "`a` exited unexpectedly (killed by signal)");

    let err = RuntimeError::StartupTimeout {
        project: id("a"),
        timeout: Duration::from_millis(1500),
    };
    assert_eq!(err.to_string(), "`a` was not ready after 1500ms");
}
