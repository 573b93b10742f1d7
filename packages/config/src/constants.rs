// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across BranchLab

// Storage
pub const BRANCHLAB_HOME: &str = "BRANCHLAB_HOME";

// Resource Governor
pub const BRANCHLAB_MAX_SANDBOXES: &str = "BRANCHLAB_MAX_SANDBOXES";
pub const BRANCHLAB_SANDBOX_MEMORY_MB: &str = "BRANCHLAB_SANDBOX_MEMORY_MB";
pub const BRANCHLAB_SANDBOX_CPU_CORES: &str = "BRANCHLAB_SANDBOX_CPU_CORES";
pub const BRANCHLAB_SANDBOX_PIDS_LIMIT: &str = "BRANCHLAB_SANDBOX_PIDS_LIMIT";
pub const BRANCHLAB_SANDBOX_NOFILE_LIMIT: &str = "BRANCHLAB_SANDBOX_NOFILE_LIMIT";

// Execution Timeouts
pub const BRANCHLAB_EXECUTION_TIMEOUT_SECS: &str = "BRANCHLAB_EXECUTION_TIMEOUT_SECS";
pub const BRANCHLAB_MAX_EXECUTION_TIMEOUT_SECS: &str = "BRANCHLAB_MAX_EXECUTION_TIMEOUT_SECS";
pub const BRANCHLAB_INTERRUPT_GRACE_MS: &str = "BRANCHLAB_INTERRUPT_GRACE_MS";

// Idle Reaping
pub const BRANCHLAB_IDLE_TIMEOUT_SECS: &str = "BRANCHLAB_IDLE_TIMEOUT_SECS";
pub const BRANCHLAB_REAP_INTERVAL_SECS: &str = "BRANCHLAB_REAP_INTERVAL_SECS";

// Sandbox Runtime
pub const BRANCHLAB_SANDBOX_IMAGE: &str = "BRANCHLAB_SANDBOX_IMAGE";
pub const BRANCHLAB_SANDBOX_USER: &str = "BRANCHLAB_SANDBOX_USER";
pub const BRANCHLAB_SANDBOX_NETWORK: &str = "BRANCHLAB_SANDBOX_NETWORK";
pub const BRANCHLAB_SECCOMP_PROFILE: &str = "BRANCHLAB_SECCOMP_PROFILE";
pub const BRANCHLAB_ALLOW_FALLBACK: &str = "BRANCHLAB_ALLOW_FALLBACK";
pub const BRANCHLAB_PYTHON: &str = "BRANCHLAB_PYTHON";

// Version Control
pub const BRANCHLAB_LARGE_FILE_BYTES: &str = "BRANCHLAB_LARGE_FILE_BYTES";
pub const BRANCHLAB_COMMIT_AUTHOR: &str = "BRANCHLAB_COMMIT_AUTHOR";
pub const BRANCHLAB_COMMIT_EMAIL: &str = "BRANCHLAB_COMMIT_EMAIL";

// System Environment Variables
pub const HOME: &str = "HOME";
