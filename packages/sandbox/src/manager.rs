// ABOUTME: Sandbox manager owning one sandbox per session through its full lifecycle
// ABOUTME: Serializes executions per session, enforces timeouts, reaps idle sandboxes, panic-kills

use crate::backend::SandboxBackend;
use crate::execution_log::{ExecutionLog, ExecutionLogRecord};
use crate::governor::{GovernorConfig, GovernorError, ResourceGovernor, SandboxPermit};
use crate::providers::{
    CellRequest, CompletionStatus, ContainerConfig, ExecFrame, ProviderCapabilities,
    ProviderError, RuntimeHandle,
};
use crate::settings::SandboxSettings;
use branchlab_config::LabConfig;
use branchlab_core::{
    new_execution_id, DisplayData, Execution, ExecutionError, ExecutionStatus, SessionPaths,
    ValidationError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Sandbox capacity exceeded ({active}/{capacity} in use), retry later")]
    CapacityExceeded { active: usize, capacity: usize },

    #[error("Sandbox runtime failure: {0}")]
    RuntimeFailure(#[from] ProviderError),

    #[error("No sandbox for session: {0}")]
    NotFound(String),

    #[error("Invalid session: {0}")]
    InvalidSession(#[from] ValidationError),

    #[error("Resource limits rejected: {0}")]
    ResourceLimit(#[from] GovernorError),

    #[error("Security policy cannot be enforced: {0}")]
    PolicyUnsupported(String),

    #[error("Sandbox for session {0} was killed while starting")]
    KilledWhileStarting(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: SandboxState, to: SandboxState },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    /// Capacity exhaustion is the only condition worth retrying unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, ManagerError::CapacityExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Starting,
    Idle,
    Busy,
    Restarting,
    ShuttingDown,
    Dead,
}

impl SandboxState {
    pub fn is_live(&self) -> bool {
        !matches!(self, SandboxState::Dead)
    }

    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (_, Dead) => true,
            (Starting, Idle) => true,
            (Idle, Busy) | (Idle, Restarting) | (Idle, ShuttingDown) => true,
            (Busy, Idle) | (Busy, ShuttingDown) => true,
            (Restarting, Starting) => true,
            (Dead, Starting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Starting => "starting",
            SandboxState::Idle => "idle",
            SandboxState::Busy => "busy",
            SandboxState::Restarting => "restarting",
            SandboxState::ShuttingDown => "shutting_down",
            SandboxState::Dead => "dead",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSummary {
    pub session_id: String,
    pub sandbox_id: String,
    pub state: SandboxState,
    pub execution_count: u64,
    pub isolated: bool,
    pub backend: String,
    pub workspace_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

struct SandboxRecord {
    sandbox_id: String,
    handle: Option<RuntimeHandle>,
    state: SandboxState,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    execution_count: u64,
    permit: Option<SandboxPermit>,
    killed: bool,
    /// Set once the entry is dropped from the registry
    removed: bool,
}

impl SandboxRecord {
    fn placeholder() -> Self {
        let now = Utc::now();
        Self {
            sandbox_id: String::new(),
            handle: None,
            state: SandboxState::Dead,
            created_at: now,
            last_activity_at: now,
            execution_count: 0,
            permit: None,
            killed: false,
            removed: false,
        }
    }

    fn transition(&mut self, next: SandboxState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ManagerError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

struct SandboxEntry {
    paths: SessionPaths,
    /// Held for the whole of every execute and lifecycle change of this session
    lifecycle: Arc<AsyncMutex<()>>,
    record: Mutex<SandboxRecord>,
}

impl SandboxEntry {
    fn session_id(&self) -> &str {
        self.paths.session_id()
    }

    fn record(&self) -> MutexGuard<'_, SandboxRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Returns a sandbox to idle however the execution ended, including cancellation of the
/// execute future itself.
struct BusyGuard<'a> {
    entry: &'a SandboxEntry,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut record = self.entry.record();
        if record.state == SandboxState::Busy {
            record.state = SandboxState::Idle;
            record.last_activity_at = Utc::now();
        }
    }
}

enum CellOutcome {
    Completed(CompletionStatus),
    TimedOut { recovered: bool },
    Killed,
}

#[derive(Default)]
struct OutputCollector {
    stdout: String,
    stderr: String,
    display_artifacts: Vec<DisplayData>,
    errors: Vec<ExecutionError>,
}

impl OutputCollector {
    fn push(&mut self, frame: ExecFrame) {
        match frame {
            ExecFrame::Stdout(text) => self.stdout.push_str(&text),
            ExecFrame::Stderr(text) => self.stderr.push_str(&text),
            ExecFrame::Display(display) => self.display_artifacts.push(display),
            ExecFrame::Error(error) => self.errors.push(error),
            ExecFrame::Complete(_) => {}
        }
    }
}

pub struct SandboxManager {
    backend: SandboxBackend,
    governor: Arc<ResourceGovernor>,
    settings: SandboxSettings,
    sandboxes: RwLock<HashMap<String, Arc<SandboxEntry>>>,
    /// Bumped by every panic kill; a sandbox whose creation spans a bump is killed on arrival
    panic_epoch: AtomicU64,
}

impl SandboxManager {
    pub fn new(
        backend: SandboxBackend,
        governor: Arc<ResourceGovernor>,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            backend,
            governor,
            settings,
            sandboxes: RwLock::new(HashMap::new()),
            panic_epoch: AtomicU64::new(0),
        }
    }

    /// Select a backend and build the governor from environment-derived configuration
    pub async fn from_config(config: &LabConfig) -> Result<Self> {
        let settings = SandboxSettings::from_config(config);
        let backend = SandboxBackend::select(&settings).await?;
        let governor = Arc::new(ResourceGovernor::new(GovernorConfig::from_config(config)));
        Ok(Self::new(backend, governor, settings))
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    pub fn backend(&self) -> &SandboxBackend {
        &self.backend
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.backend.capabilities()
    }

    pub fn is_isolated(&self) -> bool {
        self.backend.is_isolated()
    }

    pub fn session_paths(&self, session_id: &str) -> Result<SessionPaths> {
        Ok(SessionPaths::new(&self.settings.home, session_id)?)
    }

    /// Create the session's sandbox, or return the live one.
    pub async fn create(&self, session_id: &str) -> Result<String> {
        let (entry, _guard) = self.lock_entry(session_id).await?;
        let result = self.ensure_live(&entry).await;
        if result.is_err() {
            self.discard_if_unused(&entry).await;
        }
        result
    }

    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<Execution> {
        let (entry, _guard) = self.lock_entry(session_id).await?;
        let sandbox_id = match self.ensure_live(&entry).await {
            Ok(id) => id,
            Err(e) => {
                self.discard_if_unused(&entry).await;
                return Err(e);
            }
        };

        let execution = self.run_locked(&entry, code, timeout).await?;

        let record = ExecutionLogRecord {
            session_id: session_id.to_string(),
            sandbox_id,
            recorded_at: Utc::now(),
            execution: execution.clone(),
        };
        ExecutionLog::for_session(&entry.paths)
            .append(&record)
            .await?;

        self.governor
            .record_execution(session_id, execution.duration(), execution.status);
        Ok(execution)
    }

    /// Re-run earlier cells to rebuild interpreter state. Nothing is logged.
    /// Returns how many cells completed without error.
    pub async fn replay(
        &self,
        session_id: &str,
        cells: &[String],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let (entry, _guard) = self.lock_entry(session_id).await?;
        self.ensure_live(&entry).await?;

        let mut succeeded = 0;
        for code in cells {
            let execution = self.run_locked(&entry, code, timeout).await?;
            if execution.status.is_ok() {
                succeeded += 1;
            } else {
                debug!(
                    "Replayed cell in {} finished with {}",
                    session_id, execution.status
                );
            }
        }
        info!(
            "Replayed {}/{} cells for session {}",
            succeeded,
            cells.len(),
            session_id
        );
        Ok(succeeded)
    }

    /// Interrupt the running execution, if any. Returns whether one was running.
    pub async fn interrupt(&self, session_id: &str) -> Result<bool> {
        let entry = self
            .lookup(session_id)
            .await
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;

        let handle = {
            let record = entry.record();
            if record.state != SandboxState::Busy {
                return Ok(false);
            }
            record.handle.clone()
        };

        match handle {
            Some(handle) => {
                info!("Interrupting execution in session {}", session_id);
                self.backend.provider().interrupt(&handle).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tear down and recreate the sandbox; the workspace directory is kept.
    pub async fn restart(&self, session_id: &str) -> Result<String> {
        let (entry, _guard) = self.lock_entry(session_id).await?;
        let epoch = self.panic_epoch.load(Ordering::SeqCst);

        let live = {
            let mut record = entry.record();
            if record.state.is_live() {
                record.transition(SandboxState::Restarting)?;
                true
            } else {
                false
            }
        };
        if live {
            info!("Restarting sandbox for session {}", session_id);
            if let Err(e) = self.teardown(&entry).await {
                warn!("Restart of {} could not stop old sandbox: {}", session_id, e);
            }
        }

        let result = self.provision(&entry, epoch).await;
        if result.is_err() {
            self.discard_if_unused(&entry).await;
        }
        result
    }

    /// Stop and remove the sandbox. Unknown sessions are a no-op.
    pub async fn shutdown(&self, session_id: &str) -> Result<()> {
        let entry = match self.lookup(session_id).await {
            Some(entry) => entry,
            None => return Ok(()),
        };

        // Never tear down under a running cell without interrupting it first
        let busy_handle = {
            let record = entry.record();
            if record.state == SandboxState::Busy {
                record.handle.clone()
            } else {
                None
            }
        };
        if let Some(handle) = busy_handle {
            if let Err(e) = self.backend.provider().interrupt(&handle).await {
                warn!("Interrupt before shutdown of {} failed: {}", session_id, e);
            }
        }

        let _guard = entry.lifecycle.clone().lock_owned().await;
        {
            let mut record = entry.record();
            if record.state.is_live() {
                record.transition(SandboxState::ShuttingDown)?;
            }
        }
        info!("Shutting down sandbox for session {}", session_id);
        let result = self.teardown(&entry).await;
        self.unregister(&entry).await;
        result
    }

    /// Gracefully shut down every sandbox, e.g. on process exit.
    pub async fn shutdown_all(&self) -> usize {
        let sessions: Vec<String> = self.sandboxes.read().await.keys().cloned().collect();
        let mut stopped = 0;
        for session_id in sessions {
            match self.shutdown(&session_id).await {
                Ok(()) => stopped += 1,
                Err(e) => error!("Failed to shut down sandbox for {}: {}", session_id, e),
            }
        }
        stopped
    }

    /// Force-kill every live sandbox without waiting for running cells.
    /// Returns the number of confirmed kills.
    pub async fn panic_kill_all(&self) -> usize {
        self.panic_epoch.fetch_add(1, Ordering::SeqCst);
        let entries: Vec<Arc<SandboxEntry>> =
            self.sandboxes.read().await.values().cloned().collect();
        warn!("PANIC: killing all sandboxes ({} sessions)", entries.len());

        let targets: Vec<_> = entries
            .into_iter()
            .filter_map(|entry| {
                let (handle, permit) = {
                    let mut record = entry.record();
                    if !record.state.is_live() {
                        return None;
                    }
                    record.state = SandboxState::Dead;
                    record.killed = true;
                    // Still starting: provisioning sees the new epoch and kills it on arrival
                    let handle = record.handle.take()?;
                    (handle, record.permit.take())
                };
                Some((entry, handle, permit))
            })
            .collect();

        let provider = self.backend.provider().clone();
        let results = futures::future::join_all(targets.into_iter().map(
            |(entry, handle, permit)| {
                let provider = provider.clone();
                async move {
                    let result = provider.kill(&handle).await;
                    (entry, handle, permit, result)
                }
            },
        ))
        .await;

        let mut killed = 0;
        for (entry, handle, permit, result) in results {
            match result {
                Ok(()) => {
                    killed += 1;
                    drop(permit);
                }
                Err(e) => {
                    error!(
                        "Panic kill failed for session {} ({}): {}",
                        entry.session_id(),
                        handle.name,
                        e
                    );
                    // Keep the handle so the next lifecycle operation retries the kill
                    let mut record = entry.record();
                    record.handle = Some(handle);
                    record.permit = permit;
                }
            }
        }

        warn!("PANIC: {} sandboxes killed", killed);
        killed
    }

    /// One sweep: shut down idle sandboxes whose last activity is older than the idle timeout.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = match chrono::Duration::from_std(self.settings.idle_timeout) {
            Ok(timeout) => timeout,
            Err(_) => return 0,
        };
        let entries: Vec<Arc<SandboxEntry>> =
            self.sandboxes.read().await.values().cloned().collect();

        let mut reaped = 0;
        for entry in entries {
            // Held lock means an execution or lifecycle change is in progress
            let Ok(_guard) = entry.lifecycle.try_lock() else {
                continue;
            };
            {
                let mut record = entry.record();
                if record.state != SandboxState::Idle
                    || Utc::now() - record.last_activity_at < idle_timeout
                {
                    continue;
                }
                record.state = SandboxState::ShuttingDown;
            }

            info!("Reaping idle sandbox for session {}", entry.session_id());
            match self.teardown(&entry).await {
                Ok(()) => {
                    self.unregister(&entry).await;
                    reaped += 1;
                }
                Err(e) => warn!(
                    "Failed to reap sandbox for session {}: {}",
                    entry.session_id(),
                    e
                ),
            }
        }
        reaped
    }

    pub async fn get(&self, session_id: &str) -> Option<SandboxSummary> {
        let entry = self.lookup(session_id).await?;
        Some(self.summarize(&entry))
    }

    pub async fn list_sandboxes(&self) -> Vec<SandboxSummary> {
        let mut summaries: Vec<SandboxSummary> = self
            .sandboxes
            .read()
            .await
            .values()
            .map(|entry| self.summarize(entry))
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    fn summarize(&self, entry: &SandboxEntry) -> SandboxSummary {
        let record = entry.record();
        SandboxSummary {
            session_id: entry.session_id().to_string(),
            sandbox_id: record.sandbox_id.clone(),
            state: record.state,
            execution_count: record.execution_count,
            isolated: self.backend.is_isolated(),
            backend: self.backend.kind().to_string(),
            workspace_path: entry.paths.workspace(),
            created_at: record.created_at,
            last_activity_at: record.last_activity_at,
        }
    }

    async fn lookup(&self, session_id: &str) -> Option<Arc<SandboxEntry>> {
        self.sandboxes.read().await.get(session_id).cloned()
    }

    /// Registry entry for the session with its lifecycle lock held. Retries if the entry was
    /// dropped from the registry while we waited for the lock.
    async fn lock_entry(
        &self,
        session_id: &str,
    ) -> Result<(Arc<SandboxEntry>, OwnedMutexGuard<()>)> {
        let paths = self.session_paths(session_id)?;
        loop {
            let entry = {
                let mut sandboxes = self.sandboxes.write().await;
                sandboxes
                    .entry(session_id.to_string())
                    .or_insert_with(|| {
                        Arc::new(SandboxEntry {
                            paths: paths.clone(),
                            lifecycle: Arc::new(AsyncMutex::new(())),
                            record: Mutex::new(SandboxRecord::placeholder()),
                        })
                    })
                    .clone()
            };
            let guard = entry.lifecycle.clone().lock_owned().await;
            if !entry.record().removed {
                return Ok((entry, guard));
            }
        }
    }

    async fn unregister(&self, entry: &Arc<SandboxEntry>) {
        let mut sandboxes = self.sandboxes.write().await;
        if let Some(current) = sandboxes.get(entry.session_id()) {
            if Arc::ptr_eq(current, entry) {
                sandboxes.remove(entry.session_id());
            }
        }
        entry.record().removed = true;
    }

    /// Drop a registry entry left with nothing running, so failed creations leave no trace.
    async fn discard_if_unused(&self, entry: &Arc<SandboxEntry>) {
        let unused = {
            let record = entry.record();
            !record.state.is_live() && record.handle.is_none()
        };
        if unused {
            self.unregister(entry).await;
        }
    }

    async fn ensure_live(&self, entry: &SandboxEntry) -> Result<String> {
        {
            let record = entry.record();
            if record.state.is_live() && record.handle.is_some() {
                return Ok(record.sandbox_id.clone());
            }
        }
        let epoch = self.panic_epoch.load(Ordering::SeqCst);
        self.provision(entry, epoch).await
    }

    /// Start a fresh sandbox for the entry. Caller holds the lifecycle lock.
    /// `epoch` is the panic epoch observed when the caller began.
    async fn provision(&self, entry: &SandboxEntry, epoch: u64) -> Result<String> {
        let session_id = entry.session_id().to_string();

        self.governor.validate(&self.settings.limits)?;
        self.backend
            .check_policy(&self.settings.security)
            .map_err(ManagerError::PolicyUnsupported)?;

        // A handle left behind by a failed kill must be gone before a new sandbox exists
        let (stale, stale_permit) = {
            let mut record = entry.record();
            (record.handle.take(), record.permit.take())
        };
        if let Some(stale) = stale {
            if let Err(e) = self.backend.provider().kill(&stale).await {
                error!("Stale sandbox {} for {} still alive: {}", stale.name, session_id, e);
                let mut record = entry.record();
                record.handle = Some(stale);
                record.permit = stale_permit;
                return Err(ManagerError::RuntimeFailure(e));
            }
        }
        drop(stale_permit);

        let permit = match self.governor.try_acquire() {
            Some(permit) => permit,
            None => {
                info!("Sandbox cap reached, reaping idle sandboxes before retrying");
                self.reap_idle().await;
                self.governor
                    .try_acquire()
                    .ok_or_else(|| ManagerError::CapacityExceeded {
                        active: self.governor.active(),
                        capacity: self.governor.capacity(),
                    })?
            }
        };

        let sandbox_id = uuid::Uuid::new_v4().to_string();
        {
            let mut record = entry.record();
            let now = Utc::now();
            record.sandbox_id = sandbox_id.clone();
            record.state = SandboxState::Starting;
            record.created_at = now;
            record.last_activity_at = now;
            record.execution_count = 0;
            record.killed = false;
        }

        let config = match self.container_config(entry, &sandbox_id) {
            Ok(config) => config,
            Err(e) => {
                entry.record().state = SandboxState::Dead;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(&config.workspace).await {
            entry.record().state = SandboxState::Dead;
            return Err(ManagerError::Io(e));
        }

        info!(
            "Creating {} sandbox {} for session {}",
            self.backend.kind(),
            sandbox_id,
            session_id
        );
        match self.backend.provider().create(&config).await {
            Ok(handle) if self.panic_epoch.load(Ordering::SeqCst) != epoch => {
                warn!(
                    "Sandbox {} for session {} finished starting after a panic kill, killing it",
                    sandbox_id, session_id
                );
                {
                    let mut record = entry.record();
                    record.state = SandboxState::Dead;
                    record.killed = true;
                }
                if let Err(e) = self.backend.provider().kill(&handle).await {
                    error!("Failed to kill late sandbox {}: {}", handle.name, e);
                    let mut record = entry.record();
                    record.handle = Some(handle);
                    record.permit = Some(permit);
                }
                Err(ManagerError::KilledWhileStarting(session_id))
            }
            Ok(handle) => {
                let mut record = entry.record();
                record.handle = Some(handle);
                record.permit = Some(permit);
                record.transition(SandboxState::Idle)?;
                record.last_activity_at = Utc::now();
                Ok(sandbox_id)
            }
            Err(e) => {
                error!("Failed to create sandbox for {}: {}", session_id, e);
                entry.record().state = SandboxState::Dead;
                match e {
                    ProviderError::PolicyUnsupported(reason) => {
                        Err(ManagerError::PolicyUnsupported(reason))
                    }
                    other => Err(ManagerError::RuntimeFailure(other)),
                }
            }
        }
    }

    fn container_config(&self, entry: &SandboxEntry, sandbox_id: &str) -> Result<ContainerConfig> {
        let session_id = entry.session_id();
        let mut workspace = entry.paths.workspace();
        if workspace.is_relative() {
            workspace = std::env::current_dir()?.join(workspace);
        }
        let short_id: String = sandbox_id.chars().take(8).collect();

        Ok(ContainerConfig {
            image: self.settings.image.clone(),
            name: format!("branchlab-{}-{}", session_id, short_id),
            session_id: session_id.to_string(),
            workspace,
            python: self.settings.python.clone(),
            env_vars: HashMap::from([
                ("BRANCHLAB_SESSION_ID".to_string(), session_id.to_string()),
                ("BRANCHLAB_SANDBOX_ID".to_string(), sandbox_id.to_string()),
            ]),
            labels: HashMap::from([("branchlab.sandbox.id".to_string(), sandbox_id.to_string())]),
            limits: self.settings.limits.clone(),
            security: self.settings.security.clone(),
            startup_timeout: self.settings.startup_timeout,
        })
    }

    /// Stop and remove the runtime handle, release the slot and mark the sandbox dead.
    async fn teardown(&self, entry: &SandboxEntry) -> Result<()> {
        let (handle, permit) = {
            let mut record = entry.record();
            (record.handle.take(), record.permit.take())
        };
        let provider = self.backend.provider();

        let result = match handle {
            Some(handle) => {
                let stopped = match provider.stop(&handle, self.settings.stop_grace).await {
                    Ok(()) => provider.remove(&handle).await,
                    Err(e) => {
                        warn!("Graceful stop of {} failed, killing: {}", handle.name, e);
                        provider.kill(&handle).await
                    }
                };
                if stopped.is_err() {
                    entry.record().handle = Some(handle);
                }
                stopped.map_err(ManagerError::from)
            }
            None => Ok(()),
        };

        let mut record = entry.record();
        record.state = SandboxState::Dead;
        if result.is_err() {
            record.permit = permit;
        }
        result
    }

    /// Kill a sandbox that can no longer be trusted; the next use provisions a new one.
    async fn retire(&self, entry: &SandboxEntry, reason: &str) {
        warn!(
            "Retiring sandbox for session {}: {}",
            entry.session_id(),
            reason
        );
        let (handle, permit) = {
            let mut record = entry.record();
            record.state = SandboxState::Dead;
            (record.handle.take(), record.permit.take())
        };
        if let Some(handle) = handle {
            if let Err(e) = self.backend.provider().kill(&handle).await {
                error!("Failed to kill retired sandbox {}: {}", handle.name, e);
                let mut record = entry.record();
                record.handle = Some(handle);
                record.permit = permit;
            }
        }
    }

    /// Run one cell on a live sandbox. Caller holds the lifecycle lock.
    async fn run_locked(
        &self,
        entry: &SandboxEntry,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<Execution> {
        let timeout = self.governor.clamp_timeout(timeout);
        let (handle, execution_count) = {
            let mut record = entry.record();
            let handle = record
                .handle
                .clone()
                .ok_or_else(|| ManagerError::NotFound(entry.session_id().to_string()))?;
            record.transition(SandboxState::Busy)?;
            record.execution_count += 1;
            record.last_activity_at = Utc::now();
            (handle, record.execution_count)
        };
        let busy = BusyGuard { entry };

        let execution_id = new_execution_id();
        let started_at = Utc::now();
        let started = Instant::now();
        let mut output = OutputCollector::default();

        debug!(
            "Executing cell {} in session {} (timeout: {:?})",
            execution_count,
            entry.session_id(),
            timeout
        );
        let outcome = self
            .run_cell(entry, &handle, CellRequest::new(code), timeout, &mut output)
            .await;

        let status = match outcome {
            Ok(CellOutcome::Completed(CompletionStatus::Ok)) => ExecutionStatus::Ok,
            Ok(CellOutcome::Completed(CompletionStatus::Error)) => ExecutionStatus::Error,
            Ok(CellOutcome::Completed(CompletionStatus::Interrupted)) => {
                ExecutionStatus::Interrupted
            }
            Ok(CellOutcome::Killed) => ExecutionStatus::Interrupted,
            Ok(CellOutcome::TimedOut { recovered }) => {
                output.errors.push(ExecutionError::new(
                    "TimeoutError",
                    format!(
                        "Execution exceeded timeout of {} seconds",
                        timeout.as_secs_f64()
                    ),
                ));
                if !recovered {
                    self.retire(entry, "cell did not stop after interrupt").await;
                }
                ExecutionStatus::Timeout
            }
            Err(e) => {
                self.retire(entry, &e.to_string()).await;
                drop(busy);
                return Err(ManagerError::RuntimeFailure(e));
            }
        };
        drop(busy);

        Ok(Execution {
            execution_id,
            code: code.to_string(),
            stdout: output.stdout,
            stderr: output.stderr,
            display_artifacts: output.display_artifacts,
            errors: output.errors,
            status,
            execution_count,
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
        })
    }

    async fn run_cell(
        &self,
        entry: &SandboxEntry,
        handle: &RuntimeHandle,
        request: CellRequest,
        timeout: Duration,
        output: &mut OutputCollector,
    ) -> std::result::Result<CellOutcome, ProviderError> {
        let provider = self.backend.provider();
        let mut stream = provider.exec(handle, request).await?;

        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(ExecFrame::Complete(status))) => return Ok(CellOutcome::Completed(status)),
                Ok(Some(frame)) => output.push(frame),
                Ok(None) => {
                    if entry.record().killed {
                        return Ok(CellOutcome::Killed);
                    }
                    return Err(ProviderError::KernelError(
                        "sandbox output ended before the cell completed".to_string(),
                    ));
                }
                Err(_) => break,
            }
        }

        warn!(
            "Execution in session {} exceeded {:?}, interrupting",
            entry.session_id(),
            timeout
        );
        if let Err(e) = provider.interrupt(handle).await {
            warn!("Interrupt failed for {}: {}", handle.name, e);
        }

        let grace_deadline = Instant::now() + self.settings.interrupt_grace.min(timeout);
        loop {
            match tokio::time::timeout_at(grace_deadline, stream.next()).await {
                Ok(Some(ExecFrame::Complete(_))) => {
                    return Ok(CellOutcome::TimedOut { recovered: true })
                }
                // The interrupt's own error frame is replaced by the timeout error
                Ok(Some(ExecFrame::Error(error))) if error.kind == "KeyboardInterrupt" => {}
                Ok(Some(frame)) => output.push(frame),
                Ok(None) => {
                    if entry.record().killed {
                        return Ok(CellOutcome::Killed);
                    }
                    return Ok(CellOutcome::TimedOut { recovered: false });
                }
                Err(_) => return Ok(CellOutcome::TimedOut { recovered: false }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use SandboxState::*;
        assert!(Starting.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Idle));
        assert!(Busy.can_transition_to(ShuttingDown));
        assert!(Idle.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(Starting));
        assert!(ShuttingDown.can_transition_to(Dead));

        assert!(!Busy.can_transition_to(Busy));
        assert!(!Starting.can_transition_to(Busy));
        assert!(!Dead.can_transition_to(Idle));
        assert!(!ShuttingDown.can_transition_to(Idle));
        for state in [Starting, Idle, Busy, Restarting, ShuttingDown, Dead] {
            assert!(state.can_transition_to(Dead));
        }
    }

    #[test]
    fn test_record_rejects_invalid_transition() {
        let mut record = SandboxRecord::placeholder();
        record.state = SandboxState::Starting;
        let err = record.transition(SandboxState::Busy).unwrap_err();
        assert!(matches!(
            err,
            ManagerError::InvalidStateTransition {
                from: SandboxState::Starting,
                to: SandboxState::Busy
            }
        ));
        assert_eq!(record.state, SandboxState::Starting);
    }

    #[test]
    fn test_collector_orders_output() {
        let mut output = OutputCollector::default();
        output.push(ExecFrame::Stdout("a".into()));
        output.push(ExecFrame::Stderr("warn".into()));
        output.push(ExecFrame::Stdout("b".into()));
        output.push(ExecFrame::Display(DisplayData::text("t")));
        output.push(ExecFrame::Error(ExecutionError::new("ValueError", "bad")));

        assert_eq!(output.stdout, "ab");
        assert_eq!(output.stderr, "warn");
        assert_eq!(output.display_artifacts.len(), 1);
        assert_eq!(output.errors[0].kind, "ValueError");
    }

    #[test]
    fn test_only_capacity_is_retryable() {
        assert!(ManagerError::CapacityExceeded {
            active: 1,
            capacity: 1
        }
        .is_retryable());
        assert!(!ManagerError::NotFound("s".into()).is_retryable());
    }
}
