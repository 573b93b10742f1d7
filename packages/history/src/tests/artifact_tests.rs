use super::support::{engine_with_store, execution, workspace};
use crate::artifacts::ArtifactStore;
use crate::error::{HistoryError, Result};
use crate::types::{ArtifactRef, CommitMetadata};
use async_trait::async_trait;
use branchlab_core::ExecutionStatus;
use mockall::mock;
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

mock! {
    Store {}

    #[async_trait]
    impl ArtifactStore for Store {
        async fn put(&self, session_id: &str, path: &Path, relative: &str) -> Result<ArtifactRef>;
        async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>>;
    }
}

fn write_large(home: &Path, relative: &str) {
    let target = workspace(home, "s1").join(relative);
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(target, vec![7u8; 8 * 1024]).unwrap();
}

#[tokio::test]
async fn test_commit_stores_only_the_reference() {
    let home = TempDir::new().unwrap();
    let mut store = MockStore::new();
    store
        .expect_put()
        .times(1)
        .withf(|session_id, path, relative| {
            session_id == "s1"
                && relative == "outputs/frames.bin"
                && path.ends_with("outputs/frames.bin")
        })
        .returning(|_, _, relative| {
            Ok(ArtifactRef {
                hash: "ab".repeat(32),
                url: "s3://lab-artifacts/abab".to_string(),
                size: 8 * 1024,
                path: relative.to_string(),
            })
        });
    store.expect_get().never();

    let engine = engine_with_store(home.path(), Arc::new(store));
    engine.init("s1").await.unwrap();
    write_large(home.path(), "outputs/frames.bin");

    let exec = execution("render()", ExecutionStatus::Ok);
    let commit = engine
        .commit_execution("s1", "render()", &exec, CommitMetadata::new())
        .await
        .unwrap();

    assert!(commit
        .files_changed
        .contains(&"outputs/frames.bin.artifact.json".to_string()));
    assert!(!commit
        .files_changed
        .contains(&"outputs/frames.bin".to_string()));

    let raw = engine
        .file_content("s1", "outputs/frames.bin.artifact.json", Some(&commit.sha))
        .await
        .unwrap();
    let reference: ArtifactRef = serde_json::from_slice(&raw).unwrap();
    assert_eq!(reference.url, "s3://lab-artifacts/abab");
}

#[tokio::test]
async fn test_store_failure_creates_no_commit() {
    let home = TempDir::new().unwrap();
    let mut store = MockStore::new();
    store
        .expect_put()
        .returning(|_, _, _| Err(HistoryError::Artifact("store offline".to_string())));

    let engine = engine_with_store(home.path(), Arc::new(store));
    let initial = engine.init("s1").await.unwrap();
    write_large(home.path(), "data/raw.bin");

    let exec = execution("load()", ExecutionStatus::Ok);
    let err = engine
        .commit_execution("s1", "load()", &exec, CommitMetadata::new())
        .await
        .unwrap_err();

    assert!(matches!(err, HistoryError::Artifact(_)));
    assert_eq!(engine.current_head("s1").await.unwrap(), initial);
    assert_eq!(engine.history("s1", None, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_ignored_large_files_are_not_offloaded() {
    let home = TempDir::new().unwrap();
    let mut store = MockStore::new();
    store.expect_put().never();
    store.expect_get().never();

    let engine = engine_with_store(home.path(), Arc::new(store));
    engine.init("s1").await.unwrap();
    write_large(home.path(), "outputs/scratch.tmp");
    write_large(home.path(), "__pycache__/helpers.cpython-311.pyc");
    write_large(home.path(), "data/raw.bak");

    let exec = execution("clean()", ExecutionStatus::Ok);
    let commit = engine
        .commit_execution("s1", "clean()", &exec, CommitMetadata::new())
        .await
        .unwrap();

    assert!(commit
        .files_changed
        .iter()
        .all(|path| !path.ends_with(".artifact.json")));
    assert!(!workspace(home.path(), "s1")
        .join("outputs/scratch.tmp.artifact.json")
        .exists());
}
