// ABOUTME: Session identifier validation and per-session directory layout
// ABOUTME: Every session owns <home>/<session_id>/{workspace,executions.jsonl}

use crate::constants::{
    EXECUTIONS_DIR, EXECUTION_LOG_FILE, KERNEL_DIR, MAX_SESSION_ID_LEN, WORKSPACE_DIR,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Session id must not be empty")]
    EmptySessionId,

    #[error("Session id exceeds {max} characters")]
    SessionIdTooLong { max: usize },

    #[error("Session id contains invalid character '{0}'")]
    InvalidCharacter(char),

    #[error("Session id must not start with '.'")]
    HiddenSessionId,
}

/// Session ids become directory names, so only `[A-Za-z0-9_.-]` is allowed.
pub fn validate_session_id(session_id: &str) -> Result<(), ValidationError> {
    if session_id.is_empty() {
        return Err(ValidationError::EmptySessionId);
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(ValidationError::SessionIdTooLong {
            max: MAX_SESSION_ID_LEN,
        });
    }
    if session_id.starts_with('.') {
        return Err(ValidationError::HiddenSessionId);
    }
    if let Some(bad) = session_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(ValidationError::InvalidCharacter(bad));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    session_id: String,
    session_dir: PathBuf,
}

impl SessionPaths {
    pub fn new(home: &Path, session_id: &str) -> Result<Self, ValidationError> {
        validate_session_id(session_id)?;
        Ok(Self {
            session_id: session_id.to_string(),
            session_dir: home.join(session_id),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Git working tree and sandbox workspace
    pub fn workspace(&self) -> PathBuf {
        self.session_dir.join(WORKSPACE_DIR)
    }

    pub fn execution_log(&self) -> PathBuf {
        self.session_dir.join(EXECUTION_LOG_FILE)
    }

    pub fn kernel_dir(&self) -> PathBuf {
        self.workspace().join(KERNEL_DIR)
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.workspace().join(EXECUTIONS_DIR)
    }
}
