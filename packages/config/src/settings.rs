// ABOUTME: Runtime settings for sandboxes, the resource governor and session history
// ABOUTME: Loaded once from the environment with validated defaults

use crate::constants::*;
use crate::env::{env_string, parse_env_bool, parse_env_or_default_with_validation};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_SANDBOXES: usize = 10;
pub const DEFAULT_MEMORY_MB: u64 = 512;
pub const DEFAULT_CPU_CORES: f64 = 0.5;
pub const DEFAULT_PIDS_LIMIT: i64 = 100;
pub const DEFAULT_NOFILE_LIMIT: u64 = 1024;
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_EXECUTION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_INTERRUPT_GRACE_MS: u64 = 1000;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SANDBOX_IMAGE: &str = "python:3.11-slim";
pub const DEFAULT_SANDBOX_USER: &str = "1000:1000";
pub const DEFAULT_PYTHON: &str = "python3";
pub const DEFAULT_LARGE_FILE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_COMMIT_AUTHOR: &str = "BranchLab";
pub const DEFAULT_COMMIT_EMAIL: &str = "branchlab@localhost";

/// Everything the sandbox and history layers need, resolved from `BRANCHLAB_*` variables.
#[derive(Debug, Clone)]
pub struct LabConfig {
    /// Root directory holding one subdirectory per session
    pub home: PathBuf,
    pub max_sandboxes: usize,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub pids_limit: i64,
    pub nofile_limit: u64,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub interrupt_grace: Duration,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub image: String,
    pub sandbox_user: Option<String>,
    pub network_enabled: bool,
    pub seccomp_profile: Option<PathBuf>,
    pub allow_fallback: bool,
    pub python: String,
    pub large_file_bytes: u64,
    pub commit_author: String,
    pub commit_email: String,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            max_sandboxes: DEFAULT_MAX_SANDBOXES,
            memory_mb: DEFAULT_MEMORY_MB,
            cpu_cores: DEFAULT_CPU_CORES,
            pids_limit: DEFAULT_PIDS_LIMIT,
            nofile_limit: DEFAULT_NOFILE_LIMIT,
            default_timeout: Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS),
            max_timeout: Duration::from_secs(DEFAULT_MAX_EXECUTION_TIMEOUT_SECS),
            interrupt_grace: Duration::from_millis(DEFAULT_INTERRUPT_GRACE_MS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            reap_interval: Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS),
            image: DEFAULT_SANDBOX_IMAGE.to_string(),
            sandbox_user: Some(DEFAULT_SANDBOX_USER.to_string()),
            network_enabled: false,
            seccomp_profile: None,
            allow_fallback: true,
            python: DEFAULT_PYTHON.to_string(),
            large_file_bytes: DEFAULT_LARGE_FILE_BYTES,
            commit_author: DEFAULT_COMMIT_AUTHOR.to_string(),
            commit_email: DEFAULT_COMMIT_EMAIL.to_string(),
        }
    }
}

impl LabConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let default_timeout_secs = parse_env_or_default_with_validation(
            BRANCHLAB_EXECUTION_TIMEOUT_SECS,
            DEFAULT_EXECUTION_TIMEOUT_SECS,
            |v| v > 0,
        );
        let max_timeout_secs = parse_env_or_default_with_validation(
            BRANCHLAB_MAX_EXECUTION_TIMEOUT_SECS,
            DEFAULT_MAX_EXECUTION_TIMEOUT_SECS,
            |v| v > 0,
        )
        .max(default_timeout_secs);

        let reap_interval_secs = parse_env_or_default_with_validation(
            BRANCHLAB_REAP_INTERVAL_SECS,
            DEFAULT_REAP_INTERVAL_SECS,
            |v| v > 0,
        )
        .clamp(5, 3600);

        let sandbox_user = match env_string(BRANCHLAB_SANDBOX_USER) {
            Some(user) if user == "image" => None,
            Some(user) => Some(user),
            None => defaults.sandbox_user.clone(),
        };

        Self {
            home: env_string(BRANCHLAB_HOME)
                .map(PathBuf::from)
                .unwrap_or(defaults.home),
            max_sandboxes: parse_env_or_default_with_validation(
                BRANCHLAB_MAX_SANDBOXES,
                DEFAULT_MAX_SANDBOXES,
                |v| v > 0,
            ),
            memory_mb: parse_env_or_default_with_validation(
                BRANCHLAB_SANDBOX_MEMORY_MB,
                DEFAULT_MEMORY_MB,
                |v| v >= 64,
            ),
            cpu_cores: parse_env_or_default_with_validation(
                BRANCHLAB_SANDBOX_CPU_CORES,
                DEFAULT_CPU_CORES,
                |v| v > 0.0 && v <= 64.0,
            ),
            pids_limit: parse_env_or_default_with_validation(
                BRANCHLAB_SANDBOX_PIDS_LIMIT,
                DEFAULT_PIDS_LIMIT,
                |v| v > 0,
            ),
            nofile_limit: parse_env_or_default_with_validation(
                BRANCHLAB_SANDBOX_NOFILE_LIMIT,
                DEFAULT_NOFILE_LIMIT,
                |v| v >= 64,
            ),
            default_timeout: Duration::from_secs(default_timeout_secs),
            max_timeout: Duration::from_secs(max_timeout_secs),
            interrupt_grace: Duration::from_millis(parse_env_or_default_with_validation(
                BRANCHLAB_INTERRUPT_GRACE_MS,
                DEFAULT_INTERRUPT_GRACE_MS,
                |v| v > 0,
            )),
            idle_timeout: Duration::from_secs(parse_env_or_default_with_validation(
                BRANCHLAB_IDLE_TIMEOUT_SECS,
                DEFAULT_IDLE_TIMEOUT_SECS,
                |v| v > 0,
            )),
            reap_interval: Duration::from_secs(reap_interval_secs),
            image: env_string(BRANCHLAB_SANDBOX_IMAGE).unwrap_or(defaults.image),
            sandbox_user,
            network_enabled: parse_env_bool(BRANCHLAB_SANDBOX_NETWORK, false),
            seccomp_profile: env_string(BRANCHLAB_SECCOMP_PROFILE).map(PathBuf::from),
            allow_fallback: parse_env_bool(BRANCHLAB_ALLOW_FALLBACK, true),
            python: env_string(BRANCHLAB_PYTHON).unwrap_or(defaults.python),
            large_file_bytes: parse_env_or_default_with_validation(
                BRANCHLAB_LARGE_FILE_BYTES,
                DEFAULT_LARGE_FILE_BYTES,
                |v| v > 0,
            ),
            commit_author: env_string(BRANCHLAB_COMMIT_AUTHOR).unwrap_or(defaults.commit_author),
            commit_email: env_string(BRANCHLAB_COMMIT_EMAIL).unwrap_or(defaults.commit_email),
        }
    }

    /// Same settings rooted at a different directory
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }
}

/// `~/.branchlab`, or `./.branchlab` when no home directory can be resolved
pub fn default_home() -> PathBuf {
    std::env::var(HOME)
        .ok()
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".branchlab")
}
