// ABOUTME: Sandbox manager settings derived from the lab configuration
// ABOUTME: Resource limits, security profile, timeouts and fallback policy

use crate::governor::ResourceLimits;
use crate::providers::SecurityProfile;
use branchlab_config::LabConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Root holding one directory per session
    pub home: PathBuf,
    pub image: String,
    pub python: String,
    pub limits: ResourceLimits,
    pub security: SecurityProfile,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    /// How long an interrupted cell gets to report completion before the sandbox is replaced
    pub interrupt_grace: Duration,
    pub stop_grace: Duration,
    pub startup_timeout: Duration,
    pub allow_fallback: bool,
}

impl SandboxSettings {
    pub fn from_config(config: &LabConfig) -> Self {
        let security = SecurityProfile {
            network_disabled: !config.network_enabled,
            seccomp_profile: config.seccomp_profile.clone(),
            user: config.sandbox_user.clone(),
            ..SecurityProfile::default()
        };

        Self {
            home: config.home.clone(),
            image: config.image.clone(),
            python: config.python.clone(),
            limits: ResourceLimits::from_config(config),
            security,
            idle_timeout: config.idle_timeout,
            reap_interval: config.reap_interval,
            interrupt_grace: config.interrupt_grace,
            stop_grace: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(60),
            allow_fallback: config.allow_fallback,
        }
    }
}
