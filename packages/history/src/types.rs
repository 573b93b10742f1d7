// ABOUTME: Data model of the session history: commits, branches, head state, diffs and merges
// ABOUTME: Also the versioned execution record stored in every execution commit

use branchlab_core::Execution;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form metadata attached by the caller to an execution commit
pub type CommitMetadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub short_sha: String,
    pub message: String,
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub parent_sha: Option<String>,
    /// Branch the commit was created on; `None` for commits made on a detached head
    pub branch: Option<String>,
    pub files_changed: Vec<String>,
    pub execution_id: Option<String>,
    pub execution_info: Option<Execution>,
}

impl CommitInfo {
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub head_sha: String,
    pub is_current: bool,
    /// Relative to the main branch; zero for main itself
    pub commits_ahead: usize,
    pub commits_behind: usize,
    pub last_message: String,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadState {
    pub sha: String,
    /// `None` when detached
    pub branch: Option<String>,
}

impl HeadState {
    pub fn is_detached(&self) -> bool {
        self.branch.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeCommit {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub parents: Vec<String>,
    /// Every branch this commit is reachable from
    pub branches: Vec<String>,
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTree {
    pub branches: Vec<BranchInfo>,
    pub commits: Vec<TreeCommit>,
    pub head: HeadState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub insertions: usize,
    pub deletions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Newer side of the comparison
    pub sha: String,
    /// Older side; `None` when diffing a root commit
    pub base_sha: Option<String>,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub files: Vec<FileChange>,
    pub stats: DiffStats,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Success,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub status: MergeStatus,
    /// New head of the target branch when it moved
    pub merge_commit: Option<String>,
    pub fast_forward: bool,
    pub message: String,
    /// Sorted paths with conflicting changes; empty on success
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStatistics {
    pub total_commits: usize,
    pub total_branches: usize,
    pub total_executions: usize,
    pub current_branch: Option<String>,
    pub is_dirty: bool,
    pub repository_size_bytes: u64,
    pub latest_activity: Option<DateTime<Utc>>,
    /// File count per lowercase extension in the working tree
    pub file_types: BTreeMap<String, usize>,
}

/// Reference to a large file kept out of the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub hash: String,
    pub url: String,
    pub size: u64,
    /// Workspace-relative path of the original file
    pub path: String,
}

/// Versioned record written to `executions/<execution_id>.json` in each execution commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub session_id: String,
    pub branch: Option<String>,
    pub committed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: CommitMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    pub execution: Execution,
}
