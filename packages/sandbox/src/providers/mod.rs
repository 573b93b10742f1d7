// ABOUTME: Provider trait and implementations for sandbox runtime backends
// ABOUTME: Contract for create/exec/interrupt/stop/remove/kill plus resource and security inputs

use async_trait::async_trait;
use branchlab_core::{DisplayData, ExecutionError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod docker;
pub mod process;

pub use docker::DockerProvider;
pub use process::ProcessProvider;

use crate::governor::ResourceLimits;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Security policy cannot be enforced: {0}")]
    PolicyUnsupported(String),

    #[error("Kernel error: {0}")]
    KernelError(String),

    #[error("Unknown runtime handle: {0}")]
    UnknownHandle(String),

    #[error("Provider not available: {0}")]
    NotAvailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Isolation controls a provider must apply or refuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityProfile {
    pub network_disabled: bool,
    pub read_only_rootfs: bool,
    /// tmpfs mounts: container path -> mount options
    pub scratch_mounts: Vec<(String, String)>,
    pub drop_all_capabilities: bool,
    pub no_new_privileges: bool,
    /// Custom seccomp profile; `None` means the runtime default profile
    pub seccomp_profile: Option<PathBuf>,
    pub require_seccomp: bool,
    /// `uid:gid` or user name; `None` keeps the image default
    pub user: Option<String>,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            network_disabled: true,
            read_only_rootfs: true,
            scratch_mounts: vec![("/tmp".to_string(), "rw,noexec,nosuid,size=100m".to_string())],
            drop_all_capabilities: true,
            no_new_privileges: true,
            seccomp_profile: None,
            require_seccomp: true,
            user: Some("1000:1000".to_string()),
        }
    }
}

/// Everything a provider needs to provision one sandbox
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    pub session_id: String,
    /// Host directory bound into the sandbox as its workspace
    pub workspace: PathBuf,
    /// Interpreter used to launch the kernel
    pub python: String,
    pub env_vars: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub limits: ResourceLimits,
    pub security: SecurityProfile,
    /// How long to wait for the kernel's ready frame
    pub startup_timeout: Duration,
}

/// Opaque reference to a provisioned sandbox, owned by exactly one Sandbox entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Runs code behind an isolation boundary (container, VM)
    pub isolated: bool,
    pub network_isolation: bool,
    pub resource_limits: bool,
    pub seccomp: bool,
}

/// One code unit submitted to a kernel
#[derive(Debug, Clone)]
pub struct CellRequest {
    pub msg_id: String,
    pub code: String,
}

impl CellRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            code: code.into(),
        }
    }
}

/// How the kernel itself finished a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok,
    Error,
    Interrupted,
}

/// Structured output frame produced while a cell runs
#[derive(Debug, Clone, PartialEq)]
pub enum ExecFrame {
    Stdout(String),
    Stderr(String),
    Display(DisplayData),
    Error(ExecutionError),
    /// Terminal frame; nothing follows it
    Complete(CompletionStatus),
}

/// Output of one cell. The stream ends after `Complete`, or early if the runtime died.
pub struct FrameStream {
    pub receiver: mpsc::UnboundedReceiver<ExecFrame>,
}

impl FrameStream {
    pub async fn next(&mut self) -> Option<ExecFrame> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Short backend name for logs and summaries
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> ProviderCapabilities;

    async fn is_available(&self) -> Result<bool>;

    /// Provision and start a sandbox; returns once its kernel reported ready.
    /// Must fail with `PolicyUnsupported` rather than start with a weaker profile.
    async fn create(&self, config: &ContainerConfig) -> Result<RuntimeHandle>;

    async fn exec(&self, handle: &RuntimeHandle, request: CellRequest) -> Result<FrameStream>;

    /// Ask the running cell to stop; the cell still completes with `Interrupted`.
    async fn interrupt(&self, handle: &RuntimeHandle) -> Result<()>;

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<()>;

    async fn remove(&self, handle: &RuntimeHandle) -> Result<()>;

    /// Hard stop and removal, skipping any graceful path
    async fn kill(&self, handle: &RuntimeHandle) -> Result<()>;
}
