// ABOUTME: Scripted in-memory provider and manager builders for tests
// ABOUTME: Cells are tiny line scripts so lifecycle behaviour can be driven without a runtime

use crate::backend::SandboxBackend;
use crate::governor::{GovernorConfig, ResourceGovernor, ResourceLimits};
use crate::manager::SandboxManager;
use crate::providers::{
    CellRequest, CompletionStatus, ContainerConfig, ExecFrame, FrameStream, Provider,
    ProviderCapabilities, ProviderError, Result, RuntimeHandle, SecurityProfile,
};
use crate::settings::SandboxSettings;
use async_trait::async_trait;
use branchlab_core::{DisplayData, ExecutionError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

struct MockSandbox {
    workspace: PathBuf,
    vars: Mutex<HashMap<String, String>>,
    interrupt: Notify,
    killed: watch::Sender<bool>,
}

/// Provider whose cells are line scripts:
///
/// - `print <text>` / `eprint <text>` write a line to stdout / stderr
/// - `set <name> <value>` and `get <name>` keep interpreter-like state
/// - `display <html>` emits a rich display
/// - `write <path> <content>` writes a file into the workspace
/// - `raise <Kind>: <message>` fails the cell
/// - `sleep <ms>` waits and honours interrupts, `hang <ms>` ignores them
#[derive(Default)]
pub struct MockProvider {
    capabilities: Mutex<Option<ProviderCapabilities>>,
    sandboxes: Mutex<HashMap<String, Arc<MockSandbox>>>,
    next_id: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_kill: AtomicBool,
    /// Milliseconds `create` takes, like an image pull or a slow kernel start
    pub create_delay_ms: AtomicU64,
    created: AtomicUsize,
    stopped: AtomicUsize,
    killed: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: ProviderCapabilities) -> Self {
        let provider = Self::default();
        *provider.capabilities.lock().unwrap() = Some(capabilities);
        provider
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    /// Sandboxes that exist in the runtime right now
    pub fn live(&self) -> usize {
        self.sandboxes.lock().unwrap().len()
    }

    fn sandbox(&self, handle: &RuntimeHandle) -> Result<Arc<MockSandbox>> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownHandle(handle.name.clone()))
    }

    fn take(&self, handle: &RuntimeHandle) -> Option<Arc<MockSandbox>> {
        let sandbox = self.sandboxes.lock().unwrap().remove(&handle.id)?;
        let _ = sandbox.killed.send(true);
        Some(sandbox)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(ProviderCapabilities {
                isolated: true,
                network_isolation: true,
                resource_limits: true,
                seccomp: true,
            })
    }

    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn create(&self, config: &ContainerConfig) -> Result<RuntimeHandle> {
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerError("create refused".to_string()));
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (killed, _) = watch::channel(false);
        self.sandboxes.lock().unwrap().insert(
            id.clone(),
            Arc::new(MockSandbox {
                workspace: config.workspace.clone(),
                vars: Mutex::new(HashMap::new()),
                interrupt: Notify::new(),
                killed,
            }),
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(RuntimeHandle {
            id,
            name: config.name.clone(),
        })
    }

    async fn exec(&self, handle: &RuntimeHandle, request: CellRequest) -> Result<FrameStream> {
        let sandbox = self.sandbox(handle)?;
        let killed = sandbox.killed.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_script(sandbox, killed, request.code, tx));
        Ok(FrameStream { receiver: rx })
    }

    async fn interrupt(&self, handle: &RuntimeHandle) -> Result<()> {
        self.sandbox(handle)?.interrupt.notify_waiters();
        Ok(())
    }

    async fn stop(&self, handle: &RuntimeHandle, _grace: Duration) -> Result<()> {
        if self.take(handle).is_some() {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn remove(&self, handle: &RuntimeHandle) -> Result<()> {
        self.take(handle);
        Ok(())
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<()> {
        if self.fail_kill.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerError("kill refused".to_string()));
        }
        if self.take(handle).is_some() {
            self.killed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

async fn run_script(
    sandbox: Arc<MockSandbox>,
    mut killed: watch::Receiver<bool>,
    code: String,
    tx: mpsc::UnboundedSender<ExecFrame>,
) {
    let fail = |kind: &str, message: String| {
        let _ = tx.send(ExecFrame::Error(ExecutionError::new(kind, message)));
        let _ = tx.send(ExecFrame::Complete(CompletionStatus::Error));
    };

    for line in code.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "print" => {
                let _ = tx.send(ExecFrame::Stdout(format!("{}\n", arg)));
            }
            "eprint" => {
                let _ = tx.send(ExecFrame::Stderr(format!("{}\n", arg)));
            }
            "display" => {
                let _ = tx.send(ExecFrame::Display(DisplayData::html(arg)));
            }
            "set" => {
                let (name, value) = arg.split_once(' ').unwrap_or((arg, ""));
                sandbox
                    .vars
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), value.to_string());
            }
            "get" => {
                let value = sandbox.vars.lock().unwrap().get(arg).cloned();
                match value {
                    Some(value) => {
                        let _ = tx.send(ExecFrame::Stdout(format!("{}\n", value)));
                    }
                    None => return fail("NameError", format!("name '{}' is not defined", arg)),
                }
            }
            "write" => {
                let (path, content) = arg.split_once(' ').unwrap_or((arg, ""));
                let target = sandbox.workspace.join(path);
                if let Some(parent) = target.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&target, content) {
                    return fail("OSError", e.to_string());
                }
            }
            "raise" => {
                let (kind, message) = arg.split_once(": ").unwrap_or((arg, ""));
                return fail(kind, message.to_string());
            }
            "sleep" | "hang" => {
                let millis: u64 = arg.parse().unwrap_or(0);
                let sleep = tokio::time::sleep(Duration::from_millis(millis));
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        _ = sandbox.interrupt.notified(), if command == "sleep" => {
                            let _ = tx.send(ExecFrame::Error(ExecutionError::new(
                                "KeyboardInterrupt",
                                "",
                            )));
                            let _ = tx.send(ExecFrame::Complete(CompletionStatus::Interrupted));
                            return;
                        }
                        _ = killed.changed() => return,
                    }
                }
            }
            other => return fail("SyntaxError", format!("unknown command '{}'", other)),
        }
    }
    let _ = tx.send(ExecFrame::Complete(CompletionStatus::Ok));
}

/// Settings rooted at `home` with short timings suited to tests
pub fn test_settings(home: &Path) -> SandboxSettings {
    SandboxSettings {
        home: home.to_path_buf(),
        image: "mock".to_string(),
        python: "python3".to_string(),
        limits: test_limits(),
        security: SecurityProfile::default(),
        idle_timeout: Duration::from_secs(3600),
        reap_interval: Duration::from_secs(60),
        interrupt_grace: Duration::from_millis(200),
        stop_grace: Duration::from_millis(200),
        startup_timeout: Duration::from_secs(5),
        allow_fallback: false,
    }
}

pub fn test_limits() -> ResourceLimits {
    ResourceLimits {
        memory_mb: 512,
        cpu_cores: 0.5,
        pids_limit: 100,
        nofile_limit: 1024,
    }
}

pub fn test_governor(max_sandboxes: usize) -> Arc<ResourceGovernor> {
    Arc::new(ResourceGovernor::new(GovernorConfig {
        max_sandboxes,
        max_limits: test_limits(),
        default_timeout: Duration::from_secs(5),
        max_timeout: Duration::from_secs(10),
    }))
}

pub fn mock_manager(
    provider: Arc<MockProvider>,
    settings: SandboxSettings,
    max_sandboxes: usize,
) -> SandboxManager {
    SandboxManager::new(
        SandboxBackend::from_provider(provider),
        test_governor(max_sandboxes),
        settings,
    )
}
