// ABOUTME: Sandbox backend selection between the container runtime and the process fallback
// ABOUTME: Chosen once at startup; exposes whether sandboxes are actually isolated

use crate::providers::{
    DockerProvider, ProcessProvider, Provider, ProviderCapabilities, ProviderError,
    SecurityProfile,
};
use crate::settings::SandboxSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Container runtime enforcing the security profile
    Container,
    /// Direct child processes, no isolation
    Process,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Container => f.write_str("container"),
            BackendKind::Process => f.write_str("process"),
        }
    }
}

#[derive(Clone)]
pub struct SandboxBackend {
    kind: BackendKind,
    provider: Arc<dyn Provider>,
}

impl SandboxBackend {
    /// Classify by what the provider reports it can enforce
    pub fn from_provider(provider: Arc<dyn Provider>) -> Self {
        let kind = if provider.capabilities().isolated {
            BackendKind::Container
        } else {
            BackendKind::Process
        };
        Self { kind, provider }
    }

    /// Docker when the daemon answers, otherwise the process fallback if allowed.
    pub async fn select(settings: &SandboxSettings) -> Result<Self, ProviderError> {
        match DockerProvider::new() {
            Ok(docker) => {
                if docker.is_available().await.unwrap_or(false) {
                    info!("Using Docker sandbox backend");
                    return Ok(Self::from_provider(Arc::new(docker)));
                }
            }
            Err(e) => warn!("Docker client unavailable: {}", e),
        }

        if !settings.allow_fallback {
            return Err(ProviderError::NotAvailable(
                "container runtime unreachable and process fallback is disabled".to_string(),
            ));
        }

        let process = ProcessProvider::new(settings.python.clone());
        if !process.is_available().await? {
            return Err(ProviderError::NotAvailable(format!(
                "container runtime unreachable and interpreter {} not found",
                settings.python
            )));
        }

        warn!("Container runtime unavailable: sandboxes run as UNISOLATED local processes");
        Ok(Self::from_provider(Arc::new(process)))
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.provider.capabilities()
    }

    pub fn is_isolated(&self) -> bool {
        self.kind == BackendKind::Container && self.provider.capabilities().isolated
    }

    /// Refuse a profile an isolating backend cannot apply. The process fallback applies
    /// none of it by construction and reports that through `is_isolated`.
    pub fn check_policy(&self, security: &SecurityProfile) -> Result<(), String> {
        if self.kind == BackendKind::Process {
            return Ok(());
        }
        let caps = self.provider.capabilities();
        if !caps.isolated {
            return Err(format!("{} backend is not isolated", self.provider.kind()));
        }
        if security.network_disabled && !caps.network_isolation {
            return Err(format!(
                "{} backend cannot disable networking",
                self.provider.kind()
            ));
        }
        if !caps.resource_limits {
            return Err(format!(
                "{} backend cannot enforce resource limits",
                self.provider.kind()
            ));
        }
        if (security.require_seccomp || security.seccomp_profile.is_some()) && !caps.seccomp {
            return Err(format!(
                "{} backend cannot apply a seccomp profile",
                self.provider.kind()
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for SandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxBackend")
            .field("kind", &self.kind)
            .field("provider", &self.provider.kind())
            .finish()
    }
}
