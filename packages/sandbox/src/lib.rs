// ABOUTME: Sandbox management for isolated, stateful Python execution per session
// ABOUTME: Docker-backed by default with an unisolated process fallback

pub mod backend;
pub mod execution_log;
pub mod governor;
pub mod kernel;
pub mod manager;
pub mod providers;
pub mod reaper;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
mod tests;

pub use backend::{BackendKind, SandboxBackend};
pub use execution_log::{ExecutionLog, ExecutionLogRecord};
pub use governor::{
    GovernorConfig, GovernorError, ResourceGovernor, ResourceLimits, SandboxPermit, SessionUsage,
};
pub use manager::{ManagerError, SandboxManager, SandboxState, SandboxSummary};
pub use providers::{
    CellRequest, CompletionStatus, ContainerConfig, DockerProvider, ExecFrame, FrameStream,
    ProcessProvider, Provider, ProviderCapabilities, ProviderError, RuntimeHandle,
    SecurityProfile,
};
pub use reaper::IdleReaper;
pub use settings::SandboxSettings;
