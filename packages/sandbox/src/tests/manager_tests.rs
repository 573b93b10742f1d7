use crate::execution_log::ExecutionLog;
use crate::manager::{ManagerError, SandboxManager, SandboxState};
use crate::providers::ProviderCapabilities;
use crate::test_utils::{mock_manager, test_settings, MockProvider};
use branchlab_core::ExecutionStatus;
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn setup(max_sandboxes: usize) -> (TempDir, Arc<MockProvider>, Arc<SandboxManager>) {
    let home = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new());
    let manager = mock_manager(provider.clone(), test_settings(home.path()), max_sandboxes);
    (home, provider, Arc::new(manager))
}

async fn wait_for_state(manager: &SandboxManager, session_id: &str, state: SandboxState) {
    for _ in 0..100 {
        if manager.get(session_id).await.map(|s| s.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never reached {}", session_id, state);
}

#[tokio::test]
async fn test_create_is_idempotent() {
    let (_home, provider, manager) = setup(3);

    let first = manager.create("s1").await.unwrap();
    let second = manager.create("s1").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(provider.created(), 1);
    assert_eq!(manager.governor().active(), 1);
    let summary = manager.get("s1").await.unwrap();
    assert_eq!(summary.state, SandboxState::Idle);
    assert!(summary.isolated);
}

#[tokio::test]
async fn test_invalid_session_id_rejected() {
    let (_home, provider, manager) = setup(3);
    let err = manager.create("../escape").await.unwrap_err();
    assert!(matches!(err, ManagerError::InvalidSession(_)));
    assert_eq!(provider.created(), 0);
    assert!(manager.list_sandboxes().await.is_empty());
}

#[tokio::test]
async fn test_execute_collects_output_and_keeps_state() {
    let (_home, _provider, manager) = setup(3);

    let first = manager
        .execute("s1", "print hello\neprint careful\ndisplay <b>x</b>\nset x 41", None)
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Ok);
    assert_eq!(first.stdout, "hello\n");
    assert_eq!(first.stderr, "careful\n");
    assert_eq!(first.display_artifacts.len(), 1);
    assert_eq!(first.execution_count, 1);

    let second = manager.execute("s1", "get x", None).await.unwrap();
    assert_eq!(second.stdout, "41\n");
    assert_eq!(second.execution_count, 2);
    assert_ne!(first.execution_id, second.execution_id);

    assert_eq!(manager.get("s1").await.unwrap().execution_count, 2);
    assert_eq!(manager.governor().usage("s1").executions, 2);
}

#[tokio::test]
async fn test_error_status_keeps_sandbox_idle() {
    let (_home, provider, manager) = setup(3);

    let execution = manager
        .execute("s1", "print before\nraise ValueError: bad value", None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Error);
    assert_eq!(execution.stdout, "before\n");
    let error = execution.first_error().unwrap();
    assert_eq!(error.kind, "ValueError");
    assert_eq!(error.message, "bad value");
    assert_eq!(manager.get("s1").await.unwrap().state, SandboxState::Idle);
    assert_eq!(provider.created(), 1);
}

#[tokio::test]
async fn test_timeout_interrupts_and_sandbox_survives() {
    let (_home, provider, manager) = setup(3);
    manager.execute("s1", "set x 7", None).await.unwrap();

    let execution = manager
        .execute("s1", "print start\nsleep 5000", Some(Duration::from_millis(100)))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert_eq!(execution.stdout, "start\n");
    assert_eq!(execution.errors.len(), 1);
    assert_eq!(execution.errors[0].kind, "TimeoutError");
    assert!(execution.duration_ms < 5000);

    let after = manager.execute("s1", "get x", None).await.unwrap();
    assert_eq!(after.stdout, "7\n");
    assert_eq!(provider.created(), 1);
    assert_eq!(provider.killed(), 0);
}

#[tokio::test]
async fn test_unresponsive_cell_replaces_sandbox() {
    let (_home, provider, manager) = setup(3);
    manager.execute("s1", "set x 7", None).await.unwrap();

    let execution = manager
        .execute("s1", "hang 5000", Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert_eq!(manager.get("s1").await.unwrap().state, SandboxState::Dead);
    assert_eq!(provider.killed(), 1);
    assert_eq!(manager.governor().active(), 0);

    let fresh = manager.execute("s1", "get x", None).await.unwrap();
    assert_eq!(fresh.status, ExecutionStatus::Error);
    assert_eq!(fresh.errors[0].kind, "NameError");
    assert_eq!(fresh.execution_count, 1);
    assert_eq!(provider.created(), 2);
}

#[tokio::test]
async fn test_interrupt_grace_never_exceeds_timeout() {
    let home = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new());
    let mut settings = test_settings(home.path());
    settings.interrupt_grace = Duration::from_secs(5);
    let manager = mock_manager(provider.clone(), settings, 3);

    let started = std::time::Instant::now();
    let execution = manager
        .execute("s1", "hang 10000", Some(Duration::from_secs(1)))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(provider.killed(), 1);
}

#[tokio::test]
async fn test_capacity_exceeded_has_no_side_effects() {
    let (_home, provider, manager) = setup(2);
    manager.create("a").await.unwrap();
    manager.create("b").await.unwrap();

    let err = manager.create("c").await.unwrap_err();
    assert!(matches!(
        err,
        ManagerError::CapacityExceeded {
            active: 2,
            capacity: 2
        }
    ));
    assert!(err.is_retryable());

    let err = manager.execute("c", "print x", None).await.unwrap_err();
    assert!(err.is_retryable());

    assert_eq!(provider.created(), 2);
    assert_eq!(manager.list_sandboxes().await.len(), 2);
    assert!(manager.get("c").await.is_none());
}

#[tokio::test]
async fn test_cap_reached_reaps_expired_idle_sandbox() {
    let home = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new());
    let mut settings = test_settings(home.path());
    settings.idle_timeout = Duration::ZERO;
    let manager = mock_manager(provider.clone(), settings, 1);

    manager.create("a").await.unwrap();
    manager.create("b").await.unwrap();

    assert!(manager.get("a").await.is_none());
    assert_eq!(manager.get("b").await.unwrap().state, SandboxState::Idle);
    assert_eq!(provider.live(), 1);
}

#[tokio::test]
async fn test_concurrent_executes_are_serialized() {
    let (_home, provider, manager) = setup(3);

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute("s1", &format!("sleep 20\nprint {}", i), None)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut counts = Vec::new();
    for task in tasks {
        counts.push(task.await.unwrap().execution_count);
    }
    counts.sort_unstable();

    assert_eq!(counts, vec![1, 2, 3, 4]);
    assert_eq!(provider.created(), 1);
}

#[tokio::test]
async fn test_interrupt_running_cell() {
    let (_home, _provider, manager) = setup(3);
    manager.create("s1").await.unwrap();
    assert!(!manager.interrupt("s1").await.unwrap());

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute("s1", "sleep 5000", None).await })
    };
    wait_for_state(&manager, "s1", SandboxState::Busy).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(manager.interrupt("s1").await.unwrap());
    let execution = running.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Interrupted);
    assert_eq!(manager.get("s1").await.unwrap().state, SandboxState::Idle);

    let err = manager.interrupt("unknown").await.unwrap_err();
    assert!(matches!(err, ManagerError::NotFound(_)));
}

#[tokio::test]
async fn test_panic_kill_all() {
    let (_home, provider, manager) = setup(5);
    manager.create("a").await.unwrap();
    manager.create("b").await.unwrap();
    manager.create("c").await.unwrap();

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute("c", "sleep 5000", None).await })
    };
    wait_for_state(&manager, "c", SandboxState::Busy).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(manager.panic_kill_all().await, 3);
    assert_eq!(provider.live(), 0);
    assert_eq!(manager.governor().active(), 0);
    for summary in manager.list_sandboxes().await {
        assert_eq!(summary.state, SandboxState::Dead);
    }

    let execution = running.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Interrupted);

    // Next use of a killed session brings up a fresh sandbox
    let after = manager.execute("a", "print back", None).await.unwrap();
    assert_eq!(after.stdout, "back\n");
    assert_eq!(provider.created(), 4);
}

#[tokio::test]
async fn test_failed_panic_kill_is_retried_before_reuse() {
    let (_home, provider, manager) = setup(1);
    manager.create("a").await.unwrap();

    provider.fail_kill.store(true, Ordering::SeqCst);
    assert_eq!(manager.panic_kill_all().await, 0);
    assert_eq!(manager.get("a").await.unwrap().state, SandboxState::Dead);
    assert_eq!(manager.governor().active(), 1);

    // Still failing: no second sandbox may appear next to the stale one
    assert!(manager.execute("a", "print x", None).await.is_err());
    assert_eq!(provider.created(), 1);

    provider.fail_kill.store(false, Ordering::SeqCst);
    let execution = manager.execute("a", "print x", None).await.unwrap();
    assert_eq!(execution.stdout, "x\n");
    assert_eq!(provider.killed(), 1);
    assert_eq!(provider.live(), 1);
    assert_eq!(manager.governor().active(), 1);
}

#[tokio::test]
async fn test_panic_kill_reaches_sandbox_still_starting() {
    let (_home, provider, manager) = setup(3);
    provider.create_delay_ms.store(300, Ordering::SeqCst);

    let creating = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.create("s1").await })
    };
    wait_for_state(&manager, "s1", SandboxState::Starting).await;

    manager.panic_kill_all().await;
    assert_eq!(manager.get("s1").await.unwrap().state, SandboxState::Dead);

    let err = creating.await.unwrap().unwrap_err();
    assert!(matches!(err, ManagerError::KilledWhileStarting(_)));
    assert!(!err.is_retryable());
    assert_eq!(provider.live(), 0);
    assert_eq!(provider.killed(), 1);
    assert_eq!(manager.governor().active(), 0);
    assert!(manager.get("s1").await.is_none());

    // A create issued after the kill is unaffected
    provider.create_delay_ms.store(0, Ordering::SeqCst);
    manager.create("s1").await.unwrap();
    assert_eq!(manager.get("s1").await.unwrap().state, SandboxState::Idle);
    assert_eq!(provider.live(), 1);
}

#[tokio::test]
async fn test_panic_kill_during_restart() {
    let (_home, provider, manager) = setup(3);
    manager.create("s1").await.unwrap();
    provider.create_delay_ms.store(300, Ordering::SeqCst);

    let restarting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.restart("s1").await })
    };
    wait_for_state(&manager, "s1", SandboxState::Starting).await;
    manager.panic_kill_all().await;

    let err = restarting.await.unwrap().unwrap_err();
    assert!(matches!(err, ManagerError::KilledWhileStarting(_)));
    assert_eq!(provider.live(), 0);
    assert_eq!(manager.governor().active(), 0);
}

#[tokio::test]
async fn test_restart_keeps_workspace_but_not_state() {
    let (home, _provider, manager) = setup(3);
    let original = manager.create("s1").await.unwrap();
    manager
        .execute("s1", "write data/out.txt hello\nset x 1", None)
        .await
        .unwrap();

    let restarted = manager.restart("s1").await.unwrap();
    assert_ne!(original, restarted);

    let file = home.path().join("s1/workspace/data/out.txt");
    assert_eq!(std::fs::read_to_string(file).unwrap(), "hello");

    let execution = manager.execute("s1", "get x", None).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Error);
    assert_eq!(execution.execution_count, 1);
    assert_eq!(manager.governor().active(), 1);
}

#[tokio::test]
async fn test_replay_rebuilds_state_without_logging() {
    let (_home, _provider, manager) = setup(3);
    let paths = manager.session_paths("s1").unwrap();

    let cells = vec![
        "set x 1".to_string(),
        "raise ValueError: skipped".to_string(),
        "set y 2".to_string(),
    ];
    assert_eq!(manager.replay("s1", &cells, None).await.unwrap(), 2);

    let execution = manager.execute("s1", "get x\nget y", None).await.unwrap();
    assert_eq!(execution.stdout, "1\n2\n");

    let records = ExecutionLog::for_session(&paths).read_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].execution.execution_id, execution.execution_id);
}

#[tokio::test]
async fn test_shutdown_releases_slot_and_is_noop_when_missing() {
    let (_home, provider, manager) = setup(3);
    manager.shutdown("never-created").await.unwrap();

    manager.create("s1").await.unwrap();
    manager.shutdown("s1").await.unwrap();
    manager.shutdown("s1").await.unwrap();

    assert!(manager.get("s1").await.is_none());
    assert_eq!(manager.governor().active(), 0);
    assert_eq!(provider.stopped(), 1);
    assert_eq!(provider.live(), 0);
}

#[tokio::test]
async fn test_shutdown_interrupts_running_cell_first() {
    let (_home, provider, manager) = setup(3);
    manager.create("s1").await.unwrap();

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute("s1", "print start\nsleep 5000", None).await })
    };
    wait_for_state(&manager, "s1", SandboxState::Busy).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    manager.shutdown("s1").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let execution = running.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Interrupted);
    assert_eq!(execution.stdout, "start\n");
    assert_eq!(provider.live(), 0);
    assert_eq!(provider.stopped(), 1);
    assert_eq!(provider.killed(), 0);
    assert!(manager.get("s1").await.is_none());
    assert_eq!(manager.governor().active(), 0);
}

#[tokio::test]
async fn test_shutdown_all() {
    let (_home, provider, manager) = setup(3);
    manager.create("a").await.unwrap();
    manager.create("b").await.unwrap();

    assert_eq!(manager.shutdown_all().await, 2);
    assert!(manager.list_sandboxes().await.is_empty());
    assert_eq!(provider.live(), 0);
}

#[tokio::test]
async fn test_policy_fails_closed() {
    let home = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::with_capabilities(ProviderCapabilities {
        isolated: true,
        network_isolation: true,
        resource_limits: true,
        seccomp: false,
    }));
    let manager = mock_manager(provider.clone(), test_settings(home.path()), 3);

    let err = manager.create("s1").await.unwrap_err();
    assert!(matches!(err, ManagerError::PolicyUnsupported(_)));
    assert!(!err.is_retryable());
    assert_eq!(provider.created(), 0);
    assert_eq!(manager.governor().active(), 0);
    assert!(manager.list_sandboxes().await.is_empty());
}

#[tokio::test]
async fn test_runtime_failure_leaves_no_sandbox() {
    let (_home, provider, manager) = setup(3);
    provider.fail_create.store(true, Ordering::SeqCst);

    let err = manager.create("s1").await.unwrap_err();
    assert!(matches!(err, ManagerError::RuntimeFailure(_)));
    assert!(manager.get("s1").await.is_none());
    assert_eq!(manager.governor().active(), 0);
}

#[tokio::test]
async fn test_every_execution_is_logged() {
    let (_home, _provider, manager) = setup(3);
    let first = manager.execute("s1", "print 1", None).await.unwrap();
    let second = manager
        .execute("s1", "raise KeyError: k", None)
        .await
        .unwrap();

    let paths = manager.session_paths("s1").unwrap();
    let records = ExecutionLog::for_session(&paths).read_all().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].execution, first);
    assert_eq!(records[1].execution, second);
    assert_eq!(records[0].sandbox_id, records[1].sandbox_id);
    assert_eq!(records[1].session_id, "s1");
}
