// ABOUTME: Error type for session orchestration
// ABOUTME: Wraps sandbox and history failures and classifies retryable and not-found conditions

use branchlab_history::HistoryError;
use branchlab_sandbox::ManagerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Sandbox(#[from] ManagerError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

impl SessionError {
    /// Only capacity exhaustion is worth retrying unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Sandbox(e) => e.is_retryable(),
            SessionError::History(_) => false,
        }
    }

    /// Unknown session, branch, commit or file
    pub fn is_not_found(&self) -> bool {
        match self {
            SessionError::Sandbox(ManagerError::NotFound(_)) => true,
            SessionError::Sandbox(_) => false,
            SessionError::History(e) => e.is_not_found(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
