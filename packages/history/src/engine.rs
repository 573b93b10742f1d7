// ABOUTME: Async version-control engine over per-session git repositories
// ABOUTME: Serializes work per session, runs git2 on the blocking pool and caches notebook exports

use crate::artifacts::{ArtifactStore, LocalArtifactStore};
use crate::error::{HistoryError, Result};
use crate::notebook::build_notebook;
use crate::repository::SessionRepository;
use crate::settings::HistorySettings;
use crate::types::{
    BranchInfo, CommitInfo, CommitMetadata, DiffSummary, HeadState, HistoryTree, MergeOutcome,
    RepositoryStatistics,
};
use branchlab_config::LabConfig;
use branchlab_core::{Execution, SessionPaths};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// (session, branch label, head sha)
type NotebookKey = (String, String, String);
type NotebookCache = Arc<Mutex<HashMap<NotebookKey, Value>>>;

pub struct VersionControlEngine {
    settings: HistorySettings,
    artifacts: Arc<dyn ArtifactStore>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    notebooks: NotebookCache,
}

impl VersionControlEngine {
    pub fn new(settings: HistorySettings, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            settings,
            artifacts,
            locks: Mutex::new(HashMap::new()),
            notebooks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Engine with the local content-addressed artifact store under the lab home
    pub fn from_config(config: &LabConfig) -> Self {
        let settings = HistorySettings::from_config(config);
        let artifacts = Arc::new(LocalArtifactStore::new(settings.artifact_root()));
        Self::new(settings, artifacts)
    }

    pub fn settings(&self) -> &HistorySettings {
        &self.settings
    }

    fn paths(&self, session_id: &str) -> Result<SessionPaths> {
        Ok(SessionPaths::new(&self.settings.home, session_id)?)
    }

    fn session_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn invalidate_notebooks(&self, session_id: &str) {
        let mut cache = self.notebooks.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|(session, _, _), _| session != session_id);
    }

    /// Run `f` against the opened repository on the blocking pool. Callers hold the session lock.
    async fn blocking<F, T>(&self, paths: SessionPaths, f: F) -> Result<T>
    where
        F: FnOnce(&SessionRepository) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || {
            let repo = SessionRepository::open(&paths, &settings)?;
            f(&repo)
        })
        .await
        .map_err(|e| HistoryError::Task(e.to_string()))?
    }

    async fn with_repo<F, T>(&self, session_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&SessionRepository) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let paths = self.paths(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        self.blocking(paths, f).await
    }

    /// Same as `with_repo` for operations that move HEAD or create commits
    async fn with_repo_mut<F, T>(&self, session_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&SessionRepository) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let result = self.with_repo(session_id, f).await;
        self.invalidate_notebooks(session_id);
        result
    }

    /// Create the session repository with its initial commit. Idempotent.
    pub async fn init(&self, session_id: &str) -> Result<HeadState> {
        let paths = self.paths(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || {
            SessionRepository::init(&paths, &settings)?.current_head()
        })
        .await
        .map_err(|e| HistoryError::Task(e.to_string()))?
    }

    pub async fn exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.paths(session_id)?.workspace().join(".git").exists())
    }

    /// Record an execution as a new commit on the current branch
    pub async fn commit_execution(
        &self,
        session_id: &str,
        code: &str,
        execution: &Execution,
        metadata: CommitMetadata,
    ) -> Result<CommitInfo> {
        let paths = self.paths(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let (workdir, large) = self
            .blocking(paths.clone(), |repo| {
                Ok((repo.workdir().to_path_buf(), repo.large_files()))
            })
            .await?;

        let mut artifacts = Vec::with_capacity(large.len());
        for relative in large {
            let artifact = self
                .artifacts
                .put(session_id, &workdir.join(&relative), &relative)
                .await?;
            info!(
                "Offloaded {} ({} bytes) to artifact {} for session {}",
                relative, artifact.size, artifact.hash, session_id
            );
            artifacts.push(artifact);
        }

        let code = code.to_string();
        let execution = execution.clone();
        let commit = self
            .blocking(paths, move |repo| {
                repo.commit_execution(&code, &execution, metadata, artifacts)
            })
            .await;
        self.invalidate_notebooks(session_id);
        commit
    }

    /// Create `name` at `from_commit` (default HEAD) and check it out
    pub async fn create_branch(
        &self,
        session_id: &str,
        name: &str,
        from_commit: Option<&str>,
    ) -> Result<BranchInfo> {
        let name = name.to_string();
        let from_commit = from_commit.map(str::to_string);
        self.with_repo_mut(session_id, move |repo| {
            repo.create_branch(&name, from_commit.as_deref())
        })
        .await
    }

    pub async fn switch_branch(&self, session_id: &str, name: &str) -> Result<BranchInfo> {
        let name = name.to_string();
        self.with_repo_mut(session_id, move |repo| repo.switch_branch(&name))
            .await
    }

    /// Detach HEAD at `sha` and move the working tree there
    pub async fn checkout_commit(&self, session_id: &str, sha: &str) -> Result<CommitInfo> {
        let sha = sha.to_string();
        self.with_repo_mut(session_id, move |repo| repo.checkout_commit(&sha))
            .await
    }

    pub async fn history(
        &self,
        session_id: &str,
        branch: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommitInfo>> {
        let branch = branch.map(str::to_string);
        self.with_repo(session_id, move |repo| repo.history(branch.as_deref(), limit))
            .await
    }

    pub async fn history_tree(&self, session_id: &str) -> Result<HistoryTree> {
        self.with_repo(session_id, |repo| repo.history_tree()).await
    }

    /// Changes from `sha2` (default: parent of `sha1`) to `sha1`
    pub async fn diff(
        &self,
        session_id: &str,
        sha1: &str,
        sha2: Option<&str>,
    ) -> Result<DiffSummary> {
        let sha1 = sha1.to_string();
        let sha2 = sha2.map(str::to_string);
        self.with_repo(session_id, move |repo| repo.diff(&sha1, sha2.as_deref()))
            .await
    }

    /// Merge `source` into `target` (default main)
    pub async fn merge(
        &self,
        session_id: &str,
        source: &str,
        target: Option<&str>,
    ) -> Result<MergeOutcome> {
        let source = source.to_string();
        let target = target
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.main_branch.clone());
        self.with_repo_mut(session_id, move |repo| repo.merge(&source, &target))
            .await
    }

    pub async fn list_branches(&self, session_id: &str) -> Result<Vec<BranchInfo>> {
        self.with_repo(session_id, |repo| repo.list_branches()).await
    }

    pub async fn current_head(&self, session_id: &str) -> Result<HeadState> {
        self.with_repo(session_id, |repo| repo.current_head()).await
    }

    /// Code of every execution on the first-parent chain up to `sha`, oldest first
    pub async fn executed_code(&self, session_id: &str, sha: &str) -> Result<Vec<String>> {
        let sha = sha.to_string();
        self.with_repo(session_id, move |repo| {
            Ok(repo
                .executions_on(&sha)?
                .into_iter()
                .map(|(_, execution)| execution.code)
                .collect())
        })
        .await
    }

    /// Notebook of the executions on `branch` (default: the checked-out head)
    pub async fn export_notebook(&self, session_id: &str, branch: Option<&str>) -> Result<Value> {
        let session = session_id.to_string();
        let branch = branch.map(str::to_string);
        let cache = Arc::clone(&self.notebooks);

        self.with_repo(session_id, move |repo| {
            let (label, head) = repo.tip(branch.as_deref())?;
            let key = (session.clone(), label.clone(), head.clone());
            if let Some(notebook) = cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&key)
            {
                debug!("Notebook cache hit for {} at {}", session, head);
                return Ok(notebook.clone());
            }

            let cells = repo.executions_on(&head)?;
            let notebook = build_notebook(&session, &label, &head, Utc::now(), &cells);
            cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key, notebook.clone());
            Ok(notebook)
        })
        .await
    }

    /// File bytes at `sha`, or from the working tree when `sha` is `None`
    pub async fn file_content(
        &self,
        session_id: &str,
        path: &str,
        sha: Option<&str>,
    ) -> Result<Vec<u8>> {
        let path = path.to_string();
        let sha = sha.map(str::to_string);
        self.with_repo(session_id, move |repo| repo.file_content(&path, sha.as_deref()))
            .await
    }

    pub async fn restore_file(&self, session_id: &str, path: &str, sha: &str) -> Result<CommitInfo> {
        let path = path.to_string();
        let sha = sha.to_string();
        self.with_repo_mut(session_id, move |repo| repo.restore_file(&path, &sha))
            .await
    }

    pub async fn statistics(&self, session_id: &str) -> Result<RepositoryStatistics> {
        self.with_repo(session_id, |repo| repo.statistics()).await
    }

    /// Remove the session directory with its repository. Missing sessions are a no-op.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let paths = self.paths(session_id)?;
        let lock = self.session_lock(session_id);
        {
            let _guard = lock.lock().await;
            match tokio::fs::remove_dir_all(paths.session_dir()).await {
                Ok(()) => info!("Deleted history for session {}", session_id),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("No history to delete for session {}", session_id)
                }
                Err(e) => {
                    warn!("Failed to delete session {}: {}", session_id, e);
                    return Err(e.into());
                }
            }
        }

        self.invalidate_notebooks(session_id);
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        Ok(())
    }
}
