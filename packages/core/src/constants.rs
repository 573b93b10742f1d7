// ABOUTME: File and directory names shared by the sandbox and history layers
// ABOUTME: Defines the on-disk layout of a session

/// Working tree inside a session directory, mounted into the sandbox
pub const WORKSPACE_DIR: &str = "workspace";

/// Append-only execution log next to the working tree
pub const EXECUTION_LOG_FILE: &str = "executions.jsonl";

/// Kernel scratch directory inside the working tree, never versioned
pub const KERNEL_DIR: &str = ".branchlab";

/// Versioned execution records inside the working tree
pub const EXECUTIONS_DIR: &str = "executions";

/// Mount point of the workspace inside a container
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Longest accepted session identifier
pub const MAX_SESSION_ID_LEN: usize = 128;
