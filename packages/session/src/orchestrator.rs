// ABOUTME: Coordinates the sandbox manager and the version-control engine per session
// ABOUTME: Executes then commits, and restarts or replays the sandbox when the working tree moves

use crate::error::Result;
use branchlab_config::LabConfig;
use branchlab_core::Execution;
use branchlab_history::{
    BranchInfo, CommitInfo, CommitMetadata, DiffSummary, HeadState, HistoryTree, MergeOutcome,
    RepositoryStatistics, VersionControlEngine,
};
use branchlab_sandbox::{IdleReaper, SandboxManager, SandboxSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// What to do with the interpreter after checking out an older commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Keep the running interpreter as is
    #[default]
    None,
    /// Fresh interpreter, empty state
    Restart,
    /// Fresh interpreter, then re-run every execution up to the commit
    Replay,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub sandbox_id: String,
    pub head: HeadState,
    pub isolated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteOutcome {
    pub execution: Execution,
    pub commit: CommitInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutOutcome {
    pub commit: CommitInfo,
    pub restore: RestoreMode,
    /// Cells re-run without error; zero unless replaying
    pub replayed: usize,
}

pub struct SessionOrchestrator {
    sandboxes: Arc<SandboxManager>,
    history: Arc<VersionControlEngine>,
    sessions: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    reaper: AsyncMutex<Option<IdleReaper>>,
}

impl SessionOrchestrator {
    pub fn new(sandboxes: Arc<SandboxManager>, history: Arc<VersionControlEngine>) -> Self {
        Self {
            sandboxes,
            history,
            sessions: Mutex::new(HashMap::new()),
            reaper: AsyncMutex::new(None),
        }
    }

    pub async fn from_config(config: &LabConfig) -> Result<Self> {
        let sandboxes = Arc::new(SandboxManager::from_config(config).await?);
        let history = Arc::new(VersionControlEngine::from_config(config));
        Ok(Self::new(sandboxes, history))
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    pub fn history_engine(&self) -> &Arc<VersionControlEngine> {
        &self.history
    }

    /// Held across execute+commit and every operation that moves HEAD, so a commit
    /// always lands on the branch its execution ran against.
    fn session_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn restart_if_running(&self, session_id: &str) -> Result<()> {
        if self.sandboxes.get(session_id).await.is_some() {
            self.sandboxes.restart(session_id).await?;
        }
        Ok(())
    }

    /// Create the repository and the sandbox. Idempotent.
    pub async fn open_session(&self, session_id: &str) -> Result<SessionInfo> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        // No repository is created when no sandbox slot is free
        let sandbox_id = self.sandboxes.create(session_id).await?;
        let head = self.history.init(session_id).await?;
        info!(
            "Opened session {} on {} (sandbox {})",
            session_id,
            head.branch.as_deref().unwrap_or("detached HEAD"),
            sandbox_id
        );
        Ok(SessionInfo {
            session_id: session_id.to_string(),
            sandbox_id,
            head,
            isolated: self.sandboxes.is_isolated(),
        })
    }

    /// Run `code` in the session sandbox and record the result as a commit.
    /// Failing user code is still committed; infrastructure failures create no commit.
    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
        timeout: Option<Duration>,
        mut metadata: CommitMetadata,
    ) -> Result<ExecuteOutcome> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        if !self.history.exists(session_id).await? {
            self.history.init(session_id).await?;
        }
        let execution = self.sandboxes.execute(session_id, code, timeout).await?;

        metadata
            .entry("isolated".to_string())
            .or_insert_with(|| Value::Bool(self.sandboxes.is_isolated()));
        let commit = self
            .history
            .commit_execution(session_id, code, &execution, metadata)
            .await?;
        debug!(
            "Execution {} in {} committed as {}",
            execution.execution_id, session_id, commit.short_sha
        );
        Ok(ExecuteOutcome { execution, commit })
    }

    pub async fn interrupt(&self, session_id: &str) -> Result<bool> {
        Ok(self.sandboxes.interrupt(session_id).await?)
    }

    /// Branch from `from_commit` (default HEAD) and switch to it. Branching from
    /// anywhere but the current head restarts the interpreter.
    pub async fn create_branch(
        &self,
        session_id: &str,
        name: &str,
        from_commit: Option<&str>,
    ) -> Result<BranchInfo> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let before = self.history.current_head(session_id).await?;
        let branch = self
            .history
            .create_branch(session_id, name, from_commit)
            .await?;
        if branch.head_sha != before.sha {
            self.restart_if_running(session_id).await?;
        }
        Ok(branch)
    }

    /// Check out `name`; the interpreter is always restarted
    pub async fn switch_branch(&self, session_id: &str, name: &str) -> Result<BranchInfo> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let branch = self.history.switch_branch(session_id, name).await?;
        self.restart_if_running(session_id).await?;
        Ok(branch)
    }

    pub async fn checkout_commit(
        &self,
        session_id: &str,
        sha: &str,
        restore: RestoreMode,
        timeout: Option<Duration>,
    ) -> Result<CheckoutOutcome> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let commit = self.history.checkout_commit(session_id, sha).await?;
        let replayed = match restore {
            RestoreMode::None => 0,
            RestoreMode::Restart => {
                self.sandboxes.restart(session_id).await?;
                0
            }
            RestoreMode::Replay => {
                let cells = self.history.executed_code(session_id, &commit.sha).await?;
                self.sandboxes.restart(session_id).await?;
                let replayed = self.sandboxes.replay(session_id, &cells, timeout).await?;
                if replayed < cells.len() {
                    warn!(
                        "Only {}/{} cells replayed cleanly for {} at {}",
                        replayed,
                        cells.len(),
                        session_id,
                        commit.short_sha
                    );
                }
                replayed
            }
        };

        Ok(CheckoutOutcome {
            commit,
            restore,
            replayed,
        })
    }

    pub async fn history(
        &self,
        session_id: &str,
        branch: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommitInfo>> {
        Ok(self.history.history(session_id, branch, limit).await?)
    }

    pub async fn history_tree(&self, session_id: &str) -> Result<HistoryTree> {
        Ok(self.history.history_tree(session_id).await?)
    }

    pub async fn diff(
        &self,
        session_id: &str,
        sha1: &str,
        sha2: Option<&str>,
    ) -> Result<DiffSummary> {
        Ok(self.history.diff(session_id, sha1, sha2).await?)
    }

    pub async fn merge(
        &self,
        session_id: &str,
        source: &str,
        target: Option<&str>,
    ) -> Result<MergeOutcome> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        Ok(self.history.merge(session_id, source, target).await?)
    }

    pub async fn list_branches(&self, session_id: &str) -> Result<Vec<BranchInfo>> {
        Ok(self.history.list_branches(session_id).await?)
    }

    pub async fn current_head(&self, session_id: &str) -> Result<HeadState> {
        Ok(self.history.current_head(session_id).await?)
    }

    pub async fn statistics(&self, session_id: &str) -> Result<RepositoryStatistics> {
        Ok(self.history.statistics(session_id).await?)
    }

    pub async fn export_notebook(&self, session_id: &str, branch: Option<&str>) -> Result<Value> {
        Ok(self.history.export_notebook(session_id, branch).await?)
    }

    pub async fn list_sandboxes(&self) -> Vec<SandboxSummary> {
        self.sandboxes.list_sandboxes().await
    }

    /// Emergency stop for every session. Returns the number of sandboxes killed.
    pub async fn panic_kill_all(&self) -> usize {
        self.sandboxes.panic_kill_all().await
    }

    /// Stop the sandbox; the history stays on disk
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        Ok(self.sandboxes.shutdown(session_id).await?)
    }

    /// Stop the sandbox and delete the repository with the session directory
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let lock = self.session_lock(session_id);
        {
            let _guard = lock.lock().await;
            self.sandboxes.shutdown(session_id).await?;
            self.history.delete(session_id).await?;
            self.sandboxes.governor().forget(session_id);
        }
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        info!("Deleted session {}", session_id);
        Ok(())
    }

    /// Start the idle reaper if it is not already running
    pub async fn start_reaper(&self) {
        let mut reaper = self.reaper.lock().await;
        if reaper.as_ref().map(IdleReaper::is_running).unwrap_or(false) {
            return;
        }
        let interval = self.sandboxes.settings().reap_interval;
        *reaper = Some(IdleReaper::start(Arc::clone(&self.sandboxes), interval));
    }

    pub async fn reaper_running(&self) -> bool {
        self.reaper
            .lock()
            .await
            .as_ref()
            .map(IdleReaper::is_running)
            .unwrap_or(false)
    }

    /// Stop the reaper and every sandbox. Returns how many sandboxes were shut down.
    pub async fn shutdown(&self) -> usize {
        if let Some(reaper) = self.reaper.lock().await.take() {
            reaper.stop().await;
        }
        let stopped = self.sandboxes.shutdown_all().await;
        info!("Orchestrator shut down ({} sandboxes stopped)", stopped);
        stopped
    }
}
