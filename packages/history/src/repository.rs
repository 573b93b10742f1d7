// ABOUTME: Synchronous git2 operations on one session repository (the session workspace)
// ABOUTME: Commits, branches, checkout, diffs, merges and history walks; callers run it off the async runtime

use crate::error::{HistoryError, Result};
use crate::settings::HistorySettings;
use crate::types::{
    ArtifactRef, BranchInfo, ChangeKind, CommitInfo, CommitMetadata, DiffStats, DiffSummary,
    ExecutionRecord, FileChange, HeadState, HistoryTree, MergeOutcome, MergeStatus,
    RepositoryStatistics, TreeCommit,
};
use branchlab_core::{Execution, ExecutionStatus, SessionPaths, EXECUTIONS_DIR, KERNEL_DIR};
use chrono::{DateTime, TimeZone, Utc};
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, Delta, IndexAddOption, ObjectType, Oid, Repository,
    RepositoryInitOptions, Signature, Sort, StatusOptions,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const EXECUTION_TRAILER: &str = "Execution-Id: ";
const BRANCH_TRAILER: &str = "Branch: ";
const PREVIEW_CHARS: usize = 50;
pub const ARTIFACT_SUFFIX: &str = ".artifact.json";

const GITIGNORE: &str = "\
# Kernel scratch
.branchlab/

# Python
__pycache__/
*.pyc
.ipynb_checkpoints/

# Temporary files
*.tmp
*.bak

# OS files
.DS_Store
Thumbs.db
";

/// Commit message for an execution: status tag, code preview and trailers
pub fn execution_message(
    code: &str,
    status: ExecutionStatus,
    execution_id: &str,
    branch: Option<&str>,
) -> String {
    let flat: String = code.trim().replace(['\r', '\n'], " ");
    let mut preview: String = flat.chars().take(PREVIEW_CHARS).collect();
    if flat.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }
    let tag = match status {
        ExecutionStatus::Ok => "",
        ExecutionStatus::Error => "[ERROR] ",
        ExecutionStatus::Timeout => "[TIMEOUT] ",
        ExecutionStatus::Interrupted => "[INTERRUPTED] ",
    };

    let mut message = format!("{}Execute: {}\n\n{}{}", tag, preview, EXECUTION_TRAILER, execution_id);
    if let Some(branch) = branch {
        message.push_str(&format!("\n{}{}", BRANCH_TRAILER, branch));
    }
    message
}

fn trailer<'a>(message: &'a str, key: &str) -> Option<&'a str> {
    message
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(key))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Keep `[A-Za-z0-9._-]`, map everything else to `-`, and strip what git refuses
pub fn sanitize_branch_name(name: &str) -> Result<String> {
    let mut sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    while sanitized.contains("..") {
        sanitized = sanitized.replace("..", ".");
    }
    let mut sanitized = sanitized
        .trim_start_matches(['-', '.'])
        .trim_end_matches('.')
        .to_string();
    if let Some(stripped) = sanitized.strip_suffix(".lock") {
        sanitized = stripped.to_string();
    }

    if sanitized.is_empty() || sanitized == "HEAD" {
        return Err(HistoryError::InvalidBranchName(name.to_string()));
    }
    Ok(sanitized)
}

/// Repository-relative path with no absolute or parent components
fn checked_relative(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let safe = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(HistoryError::InvalidPath(path.to_string()));
    }
    Ok(candidate.to_path_buf())
}

fn commit_time(commit: &Commit) -> DateTime<Utc> {
    Utc.timestamp_opt(commit.time().seconds(), 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn force_checkout() -> CheckoutBuilder<'static> {
    let mut checkout = CheckoutBuilder::new();
    checkout.force().remove_untracked(true);
    checkout
}

pub struct SessionRepository {
    repo: Repository,
    session_id: String,
    workdir: PathBuf,
    settings: HistorySettings,
}

impl SessionRepository {
    pub fn open(paths: &SessionPaths, settings: &HistorySettings) -> Result<Self> {
        let workdir = paths.workspace();
        if !workdir.join(".git").exists() {
            return Err(HistoryError::SessionNotFound(paths.session_id().to_string()));
        }
        Ok(Self {
            repo: Repository::open(&workdir)?,
            session_id: paths.session_id().to_string(),
            workdir,
            settings: settings.clone(),
        })
    }

    /// Create the repository with its initial commit, or open the existing one.
    pub fn init(paths: &SessionPaths, settings: &HistorySettings) -> Result<Self> {
        if paths.workspace().join(".git").exists() {
            return Self::open(paths, settings);
        }

        let workdir = paths.workspace();
        std::fs::create_dir_all(&workdir)?;
        let mut options = RepositoryInitOptions::new();
        options.initial_head(&settings.main_branch);
        let repo = Repository::init_opts(&workdir, &options)?;

        let session_id = paths.session_id();
        std::fs::write(
            workdir.join("README.md"),
            format!(
                "# BranchLab session: {}\n\nCreated: {}\n\n\
                 Every execution in this session is a commit. Branches are exploration paths.\n\n\
                 - `executions/` holds one record per execution\n\
                 - `outputs/` and `data/` hold generated and uploaded files\n",
                session_id,
                Utc::now().to_rfc3339()
            ),
        )?;
        std::fs::write(workdir.join(".gitignore"), GITIGNORE)?;
        for dir in ["outputs", "data"] {
            std::fs::create_dir_all(workdir.join(dir))?;
            std::fs::write(workdir.join(dir).join(".gitkeep"), "")?;
        }

        let session = Self {
            repo,
            session_id: session_id.to_string(),
            workdir,
            settings: settings.clone(),
        };
        let message = format!(
            "Initial session setup\n\n{}{}",
            BRANCH_TRAILER, settings.main_branch
        );
        session.stage_all(&[])?;
        session.commit_index(&message)?;
        info!("Initialized history repository for session {}", session_id);
        Ok(session)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Ok(Signature::now(&self.settings.author, &self.settings.email)?)
    }

    fn head_commit(&self) -> Result<Commit<'_>> {
        Ok(self.repo.head()?.peel_to_commit()?)
    }

    fn current_branch(&self) -> Result<Option<String>> {
        if self.repo.head_detached()? {
            return Ok(None);
        }
        Ok(self.repo.head()?.shorthand().map(str::to_string))
    }

    pub fn current_head(&self) -> Result<HeadState> {
        Ok(HeadState {
            sha: self.head_commit()?.id().to_string(),
            branch: self.current_branch()?,
        })
    }

    /// Any revision git understands (full or abbreviated sha, branch name)
    pub fn resolve_commit(&self, rev: &str) -> Result<Commit<'_>> {
        self.repo
            .revparse_single(rev)
            .and_then(|object| object.peel_to_commit())
            .map_err(|_| HistoryError::CommitNotFound(rev.to_string()))
    }

    fn branch_commit(&self, name: &str) -> Result<Commit<'_>> {
        let branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .map_err(|_| HistoryError::BranchNotFound(name.to_string()))?;
        Ok(branch.get().peel_to_commit()?)
    }

    /// Stage additions, modifications and deletions; `skip` paths are kept out of the index
    fn stage_all(&self, skip: &[String]) -> Result<Oid> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        for path in skip {
            if index.get_path(Path::new(path), 0).is_some() {
                index.remove_path(Path::new(path))?;
            }
        }
        index.write()?;
        Ok(index.write_tree()?)
    }

    fn commit_index(&self, message: &str) -> Result<Oid> {
        let mut index = self.repo.index()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;
        let signature = self.signature()?;
        let parent = self.head_commit().ok();
        let parents: Vec<&Commit> = parent.iter().collect();
        Ok(self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?)
    }

    /// Workspace files above the large-file threshold, relative to the workspace.
    /// Execution records always stay in the repository; ignored files are skipped.
    pub fn large_files(&self) -> Vec<String> {
        let limit = self.settings.large_file_bytes;
        WalkDir::new(&self.workdir)
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                entry.depth() == 0
                    || (name != ".git"
                        && name != KERNEL_DIR
                        && !(entry.depth() == 1 && name == EXECUTIONS_DIR))
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.metadata().map(|m| m.len() > limit).unwrap_or(false))
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(&self.workdir).ok()?;
                let relative = relative.to_string_lossy().replace('\\', "/");
                (!relative.ends_with(ARTIFACT_SUFFIX)).then_some(relative)
            })
            // Ignored files are not offloaded, except earlier offloads excluded by their reference
            .filter(|relative| {
                let offloaded = self
                    .workdir
                    .join(format!("{}{}", relative, ARTIFACT_SUFFIX))
                    .exists();
                offloaded
                    || !self
                        .repo
                        .status_should_ignore(Path::new(relative))
                        .unwrap_or(false)
            })
            .collect()
    }

    /// Replace large files in the commit with reference files; the originals are excluded
    fn write_artifact_refs(&self, artifacts: &[ArtifactRef]) -> Result<()> {
        if artifacts.is_empty() {
            return Ok(());
        }
        let exclude_path = self.repo.path().join("info").join("exclude");
        let mut exclude = std::fs::read_to_string(&exclude_path).unwrap_or_default();
        let existing: HashSet<String> = exclude.lines().map(str::to_string).collect();

        for artifact in artifacts {
            let reference = self
                .workdir
                .join(format!("{}{}", artifact.path, ARTIFACT_SUFFIX));
            std::fs::write(&reference, serde_json::to_string_pretty(artifact)?)?;

            let pattern = format!("/{}", artifact.path);
            if !existing.contains(&pattern) {
                if !exclude.is_empty() && !exclude.ends_with('\n') {
                    exclude.push('\n');
                }
                exclude.push_str(&pattern);
                exclude.push('\n');
            }
        }
        if let Some(parent) = exclude_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&exclude_path, exclude)?;
        Ok(())
    }

    pub fn commit_execution(
        &self,
        code: &str,
        execution: &Execution,
        metadata: CommitMetadata,
        artifacts: Vec<ArtifactRef>,
    ) -> Result<CommitInfo> {
        let branch = self.current_branch()?;
        self.write_artifact_refs(&artifacts)?;

        let record = ExecutionRecord {
            session_id: self.session_id.clone(),
            branch: branch.clone(),
            committed_at: Utc::now(),
            metadata,
            artifacts: artifacts.clone(),
            execution: execution.clone(),
        };
        let executions_dir = self.workdir.join(EXECUTIONS_DIR);
        std::fs::create_dir_all(&executions_dir)?;
        std::fs::write(
            executions_dir.join(format!("{}.json", execution.execution_id)),
            serde_json::to_string_pretty(&record)?,
        )?;

        let skip: Vec<String> = artifacts.iter().map(|a| a.path.clone()).collect();
        self.stage_all(&skip)?;
        let message = execution_message(
            code,
            execution.status,
            &execution.execution_id,
            branch.as_deref(),
        );
        let oid = self.commit_index(&message)?;
        let commit = self.repo.find_commit(oid)?;
        debug!(
            "Committed execution {} as {} in session {}",
            execution.execution_id,
            oid,
            self.session_id
        );
        self.commit_info(&commit)
    }

    fn execution_record(&self, commit: &Commit, execution_id: &str) -> Option<ExecutionRecord> {
        let path = format!("{}/{}.json", EXECUTIONS_DIR, execution_id);
        let entry = commit.tree().ok()?.get_path(Path::new(&path)).ok()?;
        let blob = entry.to_object(&self.repo).ok()?.peel_to_blob().ok()?;
        match serde_json::from_slice(blob.content()) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Unreadable execution record {} in {}: {}", path, commit.id(), e);
                None
            }
        }
    }

    fn files_changed(&self, commit: &Commit) -> Result<Vec<String>> {
        let tree = commit.tree()?;
        let parent_tree = match commit.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };
        let diff = self
            .repo
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
        Ok(diff
            .deltas()
            .filter_map(|delta| {
                delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .map(|p| p.to_string_lossy().to_string())
            })
            .collect())
    }

    pub fn commit_info(&self, commit: &Commit) -> Result<CommitInfo> {
        let message = commit.message().unwrap_or("").to_string();
        let execution_id = trailer(&message, EXECUTION_TRAILER).map(str::to_string);
        let execution_info = execution_id
            .as_deref()
            .and_then(|id| self.execution_record(commit, id))
            .map(|record| record.execution);
        let sha = commit.id().to_string();

        Ok(CommitInfo {
            short_sha: sha[..8].to_string(),
            sha,
            branch: trailer(&message, BRANCH_TRAILER).map(str::to_string),
            author: commit.author().name().unwrap_or("").to_string(),
            email: commit.author().email().unwrap_or("").to_string(),
            timestamp: commit_time(commit),
            parent_sha: commit.parent_id(0).ok().map(|id| id.to_string()),
            files_changed: self.files_changed(commit)?,
            execution_id,
            execution_info,
            message,
        })
    }

    pub fn create_branch(&self, name: &str, from_commit: Option<&str>) -> Result<BranchInfo> {
        let name = sanitize_branch_name(name)?;
        if self.repo.find_branch(&name, BranchType::Local).is_ok() {
            return Err(HistoryError::BranchExists(name));
        }
        let start = match from_commit {
            Some(rev) => self.resolve_commit(rev)?,
            None => self.head_commit()?,
        };
        self.repo.branch(&name, &start, false)?;
        self.checkout_branch(&name)?;
        info!(
            "Created branch '{}' at {} in session {}",
            name,
            start.id(),
            self.session_id
        );
        self.branch_info(&name)
    }

    pub fn switch_branch(&self, name: &str) -> Result<BranchInfo> {
        self.branch_commit(name)?;
        self.checkout_branch(name)?;
        info!("Switched to branch '{}' in session {}", name, self.session_id);
        self.branch_info(name)
    }

    fn checkout_branch(&self, name: &str) -> Result<()> {
        let refname = format!("refs/heads/{}", name);
        let target = self.repo.revparse_single(&refname)?;
        self.repo
            .checkout_tree(&target, Some(&mut force_checkout()))?;
        self.repo.set_head(&refname)?;
        Ok(())
    }

    pub fn checkout_commit(&self, rev: &str) -> Result<CommitInfo> {
        let commit = self.resolve_commit(rev)?;
        self.repo
            .checkout_tree(commit.as_object(), Some(&mut force_checkout()))?;
        self.repo.set_head_detached(commit.id())?;
        info!(
            "Checked out {} (detached) in session {}",
            commit.id(),
            self.session_id
        );
        self.commit_info(&commit)
    }

    pub fn branch_info(&self, name: &str) -> Result<BranchInfo> {
        let branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .map_err(|_| HistoryError::BranchNotFound(name.to_string()))?;
        let head = branch.get().peel_to_commit()?;

        let main = &self.settings.main_branch;
        let (commits_ahead, commits_behind) = if name == main.as_str() {
            (0, 0)
        } else {
            match self.branch_commit(main) {
                Ok(main_head) => self.repo.graph_ahead_behind(head.id(), main_head.id())?,
                Err(_) => (0, 0),
            }
        };

        Ok(BranchInfo {
            name: name.to_string(),
            head_sha: head.id().to_string(),
            is_current: branch.is_head(),
            commits_ahead,
            commits_behind,
            last_message: head.summary().unwrap_or("").to_string(),
            last_activity: commit_time(&head),
        })
    }

    fn branch_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for branch in self.repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.name()? {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn list_branches(&self) -> Result<Vec<BranchInfo>> {
        self.branch_names()?
            .iter()
            .map(|name| self.branch_info(name))
            .collect()
    }

    /// Newest first. A branch restricts the walk to its ancestry; otherwise every branch and HEAD.
    pub fn history(&self, branch: Option<&str>, limit: usize) -> Result<Vec<CommitInfo>> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        match branch {
            Some(name) => {
                let head = self.branch_commit(name)?;
                revwalk.push(head.id())?;
            }
            None => {
                revwalk.push_head()?;
                revwalk.push_glob("refs/heads/*")?;
            }
        }

        let mut commits = Vec::new();
        for oid in revwalk.take(limit) {
            let commit = self.repo.find_commit(oid?)?;
            commits.push(self.commit_info(&commit)?);
        }
        Ok(commits)
    }

    pub fn history_tree(&self) -> Result<HistoryTree> {
        let branches = self.list_branches()?;
        let head = self.current_head()?;

        // Branch tips first, then HEAD for a detached head no branch reaches
        let mut tips: Vec<(Oid, Option<&str>)> = Vec::new();
        for branch in &branches {
            tips.push((Oid::from_str(&branch.head_sha)?, Some(branch.name.as_str())));
        }
        tips.push((Oid::from_str(&head.sha)?, None));

        let mut commits: Vec<TreeCommit> = Vec::new();
        let mut positions: HashMap<Oid, usize> = HashMap::new();
        for (tip, branch) in tips {
            let mut revwalk = self.repo.revwalk()?;
            revwalk.push(tip)?;
            for oid in revwalk {
                let oid = oid?;
                if let Some(&position) = positions.get(&oid) {
                    if let Some(name) = branch {
                        commits[position].branches.push(name.to_string());
                    }
                    continue;
                }
                let commit = self.repo.find_commit(oid)?;
                let message = commit.message().unwrap_or("").to_string();
                positions.insert(oid, commits.len());
                commits.push(TreeCommit {
                    sha: oid.to_string(),
                    author: commit.author().name().unwrap_or("").to_string(),
                    timestamp: commit_time(&commit),
                    parents: commit.parent_ids().map(|id| id.to_string()).collect(),
                    branches: branch.map(|name| vec![name.to_string()]).unwrap_or_default(),
                    execution_id: trailer(&message, EXECUTION_TRAILER).map(str::to_string),
                    message,
                });
            }
        }

        commits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(HistoryTree {
            branches,
            commits,
            head,
        })
    }

    /// Changes going from `base` (default: first parent of `rev`) to `rev`
    pub fn diff(&self, rev: &str, base: Option<&str>) -> Result<DiffSummary> {
        let commit = self.resolve_commit(rev)?;
        let base_commit = match base {
            Some(base) => Some(self.resolve_commit(base)?),
            None => commit.parent(0).ok(),
        };
        let new_tree = commit.tree()?;
        let old_tree = match &base_commit {
            Some(base) => Some(base.tree()?),
            None => None,
        };

        let diff = self
            .repo
            .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), None)?;
        let mut files: Vec<FileChange> = diff
            .deltas()
            .filter_map(|delta| {
                let kind = match delta.status() {
                    Delta::Added | Delta::Copied => ChangeKind::Added,
                    Delta::Deleted => ChangeKind::Deleted,
                    Delta::Modified | Delta::Renamed | Delta::Typechange => ChangeKind::Modified,
                    _ => return None,
                };
                let path = delta.new_file().path().or_else(|| delta.old_file().path())?;
                Some(FileChange {
                    path: path.to_string_lossy().to_string(),
                    kind,
                    insertions: 0,
                    deletions: 0,
                })
            })
            .collect();

        let mut line_counts: HashMap<String, (usize, usize)> = HashMap::new();
        diff.foreach(
            &mut |_delta, _progress| true,
            None,
            None,
            Some(&mut |delta, _hunk, line| {
                if let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) {
                    let counts = line_counts
                        .entry(path.to_string_lossy().to_string())
                        .or_default();
                    match line.origin() {
                        '+' => counts.0 += 1,
                        '-' => counts.1 += 1,
                        _ => {}
                    }
                }
                true
            }),
        )?;
        for file in files.iter_mut() {
            if let Some((insertions, deletions)) = line_counts.get(&file.path) {
                file.insertions = *insertions;
                file.deletions = *deletions;
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let by_kind = |kind: ChangeKind| -> Vec<String> {
            files
                .iter()
                .filter(|f| f.kind == kind)
                .map(|f| f.path.clone())
                .collect()
        };
        let stats = diff.stats()?;

        Ok(DiffSummary {
            sha: commit.id().to_string(),
            base_sha: base_commit.map(|c| c.id().to_string()),
            added: by_kind(ChangeKind::Added),
            modified: by_kind(ChangeKind::Modified),
            deleted: by_kind(ChangeKind::Deleted),
            stats: DiffStats {
                files_changed: stats.files_changed(),
                insertions: stats.insertions(),
                deletions: stats.deletions(),
            },
            files,
        })
    }

    /// Three-way merge of `source` into `target`. A conflict leaves refs, index and files untouched.
    pub fn merge(&self, source: &str, target: &str) -> Result<MergeOutcome> {
        let source_commit = self.branch_commit(source)?;
        let target_commit = self.branch_commit(target)?;
        let target_is_current = self.current_branch()?.as_deref() == Some(target);
        let message = format!("Merge branch '{}' into {}", source, target);

        if source_commit.id() == target_commit.id()
            || self
                .repo
                .graph_descendant_of(target_commit.id(), source_commit.id())?
        {
            return Ok(MergeOutcome {
                status: MergeStatus::Success,
                merge_commit: None,
                fast_forward: false,
                message: "Already up to date".to_string(),
                conflicts: Vec::new(),
            });
        }

        let mut target_ref = self
            .repo
            .find_reference(&format!("refs/heads/{}", target))?;

        if self
            .repo
            .graph_descendant_of(source_commit.id(), target_commit.id())?
        {
            target_ref.set_target(
                source_commit.id(),
                &format!("merge {}: Fast-forward", source),
            )?;
            if target_is_current {
                self.repo
                    .checkout_tree(source_commit.as_object(), Some(&mut force_checkout()))?;
            }
            info!(
                "Fast-forwarded '{}' to '{}' in session {}",
                target, source, self.session_id
            );
            return Ok(MergeOutcome {
                status: MergeStatus::Success,
                merge_commit: Some(source_commit.id().to_string()),
                fast_forward: true,
                message,
                conflicts: Vec::new(),
            });
        }

        let mut index = self
            .repo
            .merge_commits(&target_commit, &source_commit, None)?;
        if index.has_conflicts() {
            let mut conflicts: Vec<String> = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
                if let Some(entry) = entry {
                    conflicts.push(String::from_utf8_lossy(&entry.path).to_string());
                }
            }
            conflicts.sort();
            conflicts.dedup();
            warn!(
                "Merge of '{}' into '{}' conflicts on {} paths in session {}",
                source,
                target,
                conflicts.len(),
                self.session_id
            );
            return Ok(MergeOutcome {
                status: MergeStatus::Conflict,
                merge_commit: None,
                fast_forward: false,
                message: format!("Merge conflict between '{}' and '{}'", source, target),
                conflicts,
            });
        }

        let tree = self.repo.find_tree(index.write_tree_to(&self.repo)?)?;
        let signature = self.signature()?;
        let full_message = format!("{}\n\n{}{}", message, BRANCH_TRAILER, target);
        let oid = self.repo.commit(
            Some(&format!("refs/heads/{}", target)),
            &signature,
            &signature,
            &full_message,
            &tree,
            &[&target_commit, &source_commit],
        )?;
        if target_is_current {
            let merged = self.repo.find_commit(oid)?;
            self.repo
                .checkout_tree(merged.as_object(), Some(&mut force_checkout()))?;
        }
        info!(
            "Merged '{}' into '{}' as {} in session {}",
            source, target, oid, self.session_id
        );

        Ok(MergeOutcome {
            status: MergeStatus::Success,
            merge_commit: Some(oid.to_string()),
            fast_forward: false,
            message,
            conflicts: Vec::new(),
        })
    }

    /// Display label and head commit of `branch`, or of HEAD when `None`
    pub fn tip(&self, branch: Option<&str>) -> Result<(String, String)> {
        let (label, head) = match branch {
            Some(name) => (name.to_string(), self.branch_commit(name)?),
            None => (
                self.current_branch()?.unwrap_or_else(|| "HEAD".to_string()),
                self.head_commit()?,
            ),
        };
        Ok((label, head.id().to_string()))
    }

    /// (commit sha, execution) pairs on the first-parent chain from the root to `head`
    pub fn executions_on(&self, head: &str) -> Result<Vec<(String, Execution)>> {
        let head = self.resolve_commit(head)?;
        let mut revwalk = self.repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        revwalk.push(head.id())?;
        revwalk.simplify_first_parent()?;

        let mut cells = Vec::new();
        for oid in revwalk {
            let commit = self.repo.find_commit(oid?)?;
            let message = commit.message().unwrap_or("");
            if let Some(id) = trailer(message, EXECUTION_TRAILER) {
                if let Some(record) = self.execution_record(&commit, id) {
                    cells.push((commit.id().to_string(), record.execution));
                }
            }
        }
        Ok(cells)
    }

    pub fn file_content(&self, path: &str, rev: Option<&str>) -> Result<Vec<u8>> {
        let relative = checked_relative(path)?;
        match rev {
            Some(rev) => {
                let commit = self.resolve_commit(rev)?;
                let not_found = || HistoryError::FileNotFound {
                    path: path.to_string(),
                    sha: Some(commit.id().to_string()[..8].to_string()),
                };
                let entry = commit.tree()?.get_path(&relative).map_err(|_| not_found())?;
                if entry.kind() != Some(ObjectType::Blob) {
                    return Err(not_found());
                }
                let blob = self.repo.find_blob(entry.id())?;
                Ok(blob.content().to_vec())
            }
            None => match std::fs::read(self.workdir.join(&relative)) {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(HistoryError::FileNotFound {
                        path: path.to_string(),
                        sha: None,
                    })
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Write the file as of `rev` into the working tree and commit just that path
    pub fn restore_file(&self, path: &str, rev: &str) -> Result<CommitInfo> {
        let content = self.file_content(path, Some(rev))?;
        let relative = checked_relative(path)?;
        let commit = self.resolve_commit(rev)?;

        let target = self.workdir.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content)?;

        let mut index = self.repo.index()?;
        index.add_path(&relative)?;
        index.write()?;

        let short = &commit.id().to_string()[..8];
        let mut message = format!("Restored {} from {}", path, short);
        if let Some(branch) = self.current_branch()? {
            message.push_str(&format!("\n\n{}{}", BRANCH_TRAILER, branch));
        }
        let oid = self.commit_index(&message)?;
        info!("Restored {} from {} in session {}", path, short, self.session_id);
        self.commit_info(&self.repo.find_commit(oid)?)
    }

    pub fn statistics(&self) -> Result<RepositoryStatistics> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.push_head()?;
        revwalk.push_glob("refs/heads/*")?;
        let mut total_commits = 0;
        let mut total_executions = 0;
        for oid in revwalk {
            let commit = self.repo.find_commit(oid?)?;
            total_commits += 1;
            if trailer(commit.message().unwrap_or(""), EXECUTION_TRAILER).is_some() {
                total_executions += 1;
            }
        }

        let mut options = StatusOptions::new();
        options.include_untracked(true).include_ignored(false);
        let is_dirty = !self.repo.statuses(Some(&mut options))?.is_empty();

        let mut repository_size_bytes = 0;
        let mut file_types: BTreeMap<String, usize> = BTreeMap::new();
        let files = WalkDir::new(&self.workdir)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != ".git")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file());
        for entry in files {
            repository_size_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            if let Some(ext) = entry.path().extension() {
                *file_types
                    .entry(format!(".{}", ext.to_string_lossy().to_lowercase()))
                    .or_default() += 1;
            }
        }

        let head = self.head_commit()?;
        Ok(RepositoryStatistics {
            total_commits,
            total_branches: self.branch_names()?.len(),
            total_executions,
            current_branch: self.current_branch()?,
            is_dirty,
            repository_size_bytes,
            latest_activity: Some(commit_time(&head)),
            file_types,
        })
    }
}
