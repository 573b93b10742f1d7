// ABOUTME: Error types for the session history engine
// ABOUTME: Separates caller errors (unknown session, branch, commit) from git and I/O failures

use branchlab_core::ValidationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("No repository for session: {0}")]
    SessionNotFound(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    #[error("File '{path}' not found{}", .sha.as_deref().map(|s| format!(" in commit {}", s)).unwrap_or_default())]
    FileNotFound { path: String, sha: Option<String> },

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Invalid branch name: {0}")]
    InvalidBranchName(String),

    #[error("Invalid repository path: {0}")]
    InvalidPath(String),

    #[error("Invalid session: {0}")]
    InvalidSession(#[from] ValidationError),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Artifact store error: {0}")]
    Artifact(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl HistoryError {
    /// Unknown session, branch, commit or file: a caller error with no state change
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HistoryError::SessionNotFound(_)
                | HistoryError::BranchNotFound(_)
                | HistoryError::CommitNotFound(_)
                | HistoryError::FileNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HistoryError>;
