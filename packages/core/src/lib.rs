// ABOUTME: Core types and utilities for BranchLab
// ABOUTME: Shared execution model and per-session path layout used by every package

pub mod constants;
pub mod paths;
pub mod types;

pub use constants::{EXECUTIONS_DIR, EXECUTION_LOG_FILE, KERNEL_DIR, WORKSPACE_DIR};
pub use paths::{validate_session_id, SessionPaths, ValidationError};
pub use types::{
    new_execution_id, DisplayData, Execution, ExecutionError, ExecutionStatus, ImageData,
};
