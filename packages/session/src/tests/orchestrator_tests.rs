use crate::orchestrator::{RestoreMode, SessionOrchestrator};
use branchlab_core::ExecutionStatus;
use branchlab_history::{
    CommitMetadata, HistorySettings, LocalArtifactStore, MergeStatus, VersionControlEngine,
};
use branchlab_sandbox::test_utils::{mock_manager, test_settings, MockProvider};
use branchlab_sandbox::SandboxState;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn setup(max_sandboxes: usize) -> (TempDir, Arc<MockProvider>, SessionOrchestrator) {
    let home = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new());
    let manager = mock_manager(provider.clone(), test_settings(home.path()), max_sandboxes);

    let settings = HistorySettings {
        home: home.path().to_path_buf(),
        main_branch: "main".to_string(),
        author: "Test Lab".to_string(),
        email: "lab@test.local".to_string(),
        large_file_bytes: 10 * 1024 * 1024,
    };
    let store = Arc::new(LocalArtifactStore::new(settings.artifact_root()));
    let history = VersionControlEngine::new(settings, store);

    let orchestrator = SessionOrchestrator::new(Arc::new(manager), Arc::new(history));
    (home, provider, orchestrator)
}

async fn exec(orchestrator: &SessionOrchestrator, session_id: &str, code: &str) -> crate::ExecuteOutcome {
    orchestrator
        .execute(session_id, code, TIMEOUT, CommitMetadata::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_branch_isolation_scenario() {
    let (_home, _provider, lab) = setup(3);
    let session = lab.open_session("S1").await.unwrap();
    let initial = session.head.sha.clone();

    let c1 = exec(&lab, "S1", "set x 1").await;
    assert_eq!(c1.execution.status, ExecutionStatus::Ok);
    assert_eq!(c1.commit.parent_sha.as_deref(), Some(initial.as_str()));

    lab.create_branch("S1", "explore", Some(&c1.commit.sha))
        .await
        .unwrap();
    let c2 = exec(&lab, "S1", "get x").await;
    assert_eq!(c2.execution.stdout, "1\n");
    assert_eq!(c2.commit.parent_sha.as_deref(), Some(c1.commit.sha.as_str()));
    assert_eq!(c2.commit.branch.as_deref(), Some("explore"));

    let main: Vec<String> = lab
        .history("S1", Some("main"), 50)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.sha)
        .collect();
    assert_eq!(main, vec![c1.commit.sha, initial]);
}

#[tokio::test]
async fn test_latest_history_matches_execution() {
    let (_home, _provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();

    let outcome = exec(&lab, "s1", "print hello\ndisplay <b>hi</b>").await;
    let latest = lab.history("s1", None, 1).await.unwrap();

    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].sha, outcome.commit.sha);
    assert_eq!(latest[0].execution_info.as_ref(), Some(&outcome.execution));
}

#[tokio::test]
async fn test_failed_code_is_still_committed() {
    let (_home, _provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();

    let outcome = exec(&lab, "s1", "raise ValueError: bad input").await;

    assert_eq!(outcome.execution.status, ExecutionStatus::Error);
    assert!(outcome.commit.message.starts_with("[ERROR] Execute:"));
    let error = outcome.execution.first_error().unwrap();
    assert_eq!(error.kind, "ValueError");
}

#[tokio::test]
async fn test_timeout_is_committed_and_sandbox_recovers() {
    let (_home, _provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();

    let started = std::time::Instant::now();
    let outcome = lab
        .execute(
            "s1",
            "print before\nsleep 5000",
            Some(Duration::from_secs(1)),
            CommitMetadata::new(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(outcome.execution.status, ExecutionStatus::Timeout);
    assert_eq!(outcome.execution.stdout, "before\n");
    assert!(outcome.commit.message.starts_with("[TIMEOUT] Execute:"));

    let next = exec(&lab, "s1", "print after").await;
    assert_eq!(next.execution.status, ExecutionStatus::Ok);
}

#[tokio::test]
async fn test_workspace_files_are_committed() {
    let (home, _provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();

    let outcome = exec(&lab, "s1", "write outputs/result.txt 42").await;

    assert!(outcome
        .commit
        .files_changed
        .contains(&"outputs/result.txt".to_string()));
    let content = lab
        .history_engine()
        .file_content("s1", "outputs/result.txt", Some(&outcome.commit.sha))
        .await
        .unwrap();
    assert_eq!(content, b"42".to_vec());
    assert!(home.path().join("s1/executions.jsonl").exists());
}

#[tokio::test]
async fn test_switch_branch_restarts_interpreter() {
    let (_home, provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();
    exec(&lab, "s1", "set x 1").await;

    // Branching at the current head keeps the interpreter
    lab.create_branch("s1", "explore", None).await.unwrap();
    assert_eq!(provider.created(), 1);
    assert_eq!(exec(&lab, "s1", "get x").await.execution.stdout, "1\n");

    lab.switch_branch("s1", "main").await.unwrap();
    assert_eq!(provider.created(), 2);
    let stale = exec(&lab, "s1", "get x").await;
    assert_eq!(stale.execution.status, ExecutionStatus::Error);
    assert_eq!(stale.commit.branch.as_deref(), Some("main"));
}

#[tokio::test]
async fn test_branch_from_older_commit_restarts() {
    let (_home, provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();
    let c1 = exec(&lab, "s1", "set x 1").await;
    exec(&lab, "s1", "set x 2").await;

    lab.create_branch("s1", "retry", Some(&c1.commit.sha))
        .await
        .unwrap();

    assert_eq!(provider.created(), 2);
    let head = lab.current_head("s1").await.unwrap();
    assert_eq!(head.sha, c1.commit.sha);
    assert_eq!(head.branch.as_deref(), Some("retry"));
}

#[tokio::test]
async fn test_checkout_restore_modes() {
    let (_home, _provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();
    let c1 = exec(&lab, "s1", "set a 1").await;
    let c2 = exec(&lab, "s1", "set a 2").await;

    let kept = lab
        .checkout_commit("s1", &c1.commit.sha, RestoreMode::None, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(kept.replayed, 0);
    assert_eq!(exec(&lab, "s1", "get a").await.execution.stdout, "2\n");

    let replay = lab
        .checkout_commit("s1", &c1.commit.sha, RestoreMode::Replay, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(replay.replayed, 1);
    assert_eq!(replay.commit.sha, c1.commit.sha);
    assert!(lab.current_head("s1").await.unwrap().branch.is_none());
    let restored = exec(&lab, "s1", "get a").await;
    assert_eq!(restored.execution.stdout, "1\n");
    assert_eq!(restored.commit.branch, None);

    lab.checkout_commit("s1", &c2.commit.sha, RestoreMode::Restart, TIMEOUT)
        .await
        .unwrap();
    let fresh = exec(&lab, "s1", "get a").await;
    assert_eq!(fresh.execution.status, ExecutionStatus::Error);
}

#[tokio::test]
async fn test_merge_conflict_keeps_target() {
    let (_home, _provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();
    exec(&lab, "s1", "write data/notes.txt base").await;
    lab.create_branch("s1", "alt", None).await.unwrap();
    exec(&lab, "s1", "write data/notes.txt alt").await;
    lab.switch_branch("s1", "main").await.unwrap();
    let main_tip = exec(&lab, "s1", "write data/notes.txt main").await;

    let outcome = lab.merge("s1", "alt", None).await.unwrap();

    assert_eq!(outcome.status, MergeStatus::Conflict);
    assert_eq!(outcome.conflicts, vec!["data/notes.txt"]);
    let head = lab.current_head("s1").await.unwrap();
    assert_eq!(head.sha, main_tip.commit.sha);
}

#[tokio::test]
async fn test_panic_kill_all_sessions() {
    let (_home, _provider, lab) = setup(3);
    for session in ["a", "b", "c"] {
        lab.open_session(session).await.unwrap();
    }

    assert_eq!(lab.panic_kill_all().await, 3);

    let sandboxes = lab.list_sandboxes().await;
    assert!(sandboxes.iter().all(|s| s.state == SandboxState::Dead));

    // History survives and the next execution brings up a fresh sandbox
    let outcome = exec(&lab, "a", "print back").await;
    assert_eq!(outcome.execution.status, ExecutionStatus::Ok);
    assert_eq!(lab.history("a", None, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_capacity_exhaustion_is_retryable_without_side_effects() {
    let (_home, _provider, lab) = setup(1);
    lab.open_session("s1").await.unwrap();

    let err = lab.open_session("s2").await.unwrap_err();

    assert!(err.is_retryable());
    assert!(!lab.history_engine().exists("s2").await.unwrap());
    assert_eq!(lab.list_sandboxes().await.len(), 1);
}

#[tokio::test]
async fn test_unknown_branch_is_not_found() {
    let (_home, provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();

    let err = lab.switch_branch("s1", "nope").await.unwrap_err();

    assert!(err.is_not_found());
    assert!(!err.is_retryable());
    assert_eq!(provider.created(), 1);
}

#[tokio::test]
async fn test_close_and_delete_session() {
    let (home, _provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();
    exec(&lab, "s1", "set x 1").await;

    lab.close_session("s1").await.unwrap();
    assert!(lab.list_sandboxes().await.is_empty());
    assert_eq!(lab.history("s1", None, 10).await.unwrap().len(), 2);

    lab.delete_session("s1").await.unwrap();
    assert!(!home.path().join("s1").exists());
    let err = lab.history("s1", None, 10).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_notebook_export_through_orchestrator() {
    let (_home, _provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();
    exec(&lab, "s1", "print one").await;
    exec(&lab, "s1", "raise KeyError: k").await;

    let notebook = lab.export_notebook("s1", None).await.unwrap();
    let cells = notebook["cells"].as_array().unwrap();

    assert_eq!(cells.len(), 3);
    assert_eq!(cells[1]["outputs"][0]["text"][0], "one\n");
    assert_eq!(cells[2]["outputs"][0]["output_type"], "error");
    assert_eq!(cells[2]["outputs"][0]["ename"], "KeyError");
}

#[tokio::test]
async fn test_reaper_lifecycle() {
    let (_home, _provider, lab) = setup(3);
    lab.open_session("s1").await.unwrap();

    lab.start_reaper().await;
    lab.start_reaper().await;
    assert!(lab.reaper_running().await);

    assert_eq!(lab.shutdown().await, 1);
    assert!(!lab.reaper_running().await);
    assert!(lab.list_sandboxes().await.is_empty());
}
