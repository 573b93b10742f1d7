// ABOUTME: Per-session version control of executions on git
// ABOUTME: Every execution is a commit; branches are exploration paths that can be diffed, merged and exported

pub mod artifacts;
pub mod engine;
pub mod error;
pub mod notebook;
pub mod repository;
pub mod settings;
pub mod types;

#[cfg(test)]
mod tests;

pub use artifacts::{sha256_hex, ArtifactStore, LocalArtifactStore};
pub use engine::VersionControlEngine;
pub use error::{HistoryError, Result};
pub use notebook::build_notebook;
pub use repository::{execution_message, sanitize_branch_name, SessionRepository};
pub use settings::{HistorySettings, MAIN_BRANCH};
pub use types::{
    ArtifactRef, BranchInfo, ChangeKind, CommitInfo, CommitMetadata, DiffStats, DiffSummary,
    ExecutionRecord, FileChange, HeadState, HistoryTree, MergeOutcome, MergeStatus,
    RepositoryStatistics, TreeCommit,
};
