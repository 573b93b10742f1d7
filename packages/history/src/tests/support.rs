use crate::artifacts::{ArtifactStore, LocalArtifactStore};
use crate::engine::VersionControlEngine;
use crate::settings::HistorySettings;
use crate::types::{CommitInfo, CommitMetadata};
use branchlab_core::{new_execution_id, Execution, ExecutionError, ExecutionStatus, SessionPaths};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LARGE_FILE_BYTES: u64 = 1024;

pub fn test_settings(home: &Path) -> HistorySettings {
    HistorySettings {
        home: home.to_path_buf(),
        main_branch: "main".to_string(),
        author: "Test Lab".to_string(),
        email: "lab@test.local".to_string(),
        large_file_bytes: LARGE_FILE_BYTES,
    }
}

pub fn test_engine(home: &Path) -> VersionControlEngine {
    let settings = test_settings(home);
    let store = Arc::new(LocalArtifactStore::new(settings.artifact_root()));
    VersionControlEngine::new(settings, store)
}

pub fn engine_with_store(home: &Path, store: Arc<dyn ArtifactStore>) -> VersionControlEngine {
    VersionControlEngine::new(test_settings(home), store)
}

pub fn workspace(home: &Path, session_id: &str) -> PathBuf {
    SessionPaths::new(home, session_id).unwrap().workspace()
}

pub fn execution(code: &str, status: ExecutionStatus) -> Execution {
    Execution {
        execution_id: new_execution_id(),
        code: code.to_string(),
        stdout: format!("ran {}\n", code.len()),
        stderr: String::new(),
        display_artifacts: Vec::new(),
        errors: if status == ExecutionStatus::Error {
            vec![ExecutionError::new("ZeroDivisionError", "division by zero")]
        } else {
            Vec::new()
        },
        status,
        execution_count: 1,
        duration_ms: 12,
        started_at: Utc::now(),
    }
}

/// Write `files` into the workspace, then commit an ok execution of `code`
pub async fn run(
    engine: &VersionControlEngine,
    session_id: &str,
    code: &str,
    files: &[(&str, &str)],
) -> CommitInfo {
    let workdir = workspace(&engine.settings().home, session_id);
    for (path, content) in files {
        let target = workdir.join(path);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(target, content).unwrap();
    }
    engine
        .commit_execution(
            session_id,
            code,
            &execution(code, ExecutionStatus::Ok),
            CommitMetadata::new(),
        )
        .await
        .unwrap()
}
