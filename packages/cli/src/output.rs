// ABOUTME: Human-readable rendering of executions, history, branches, diffs and sandboxes
// ABOUTME: Colored text and tables; JSON output bypasses this module

use branchlab_core::{Execution, ExecutionStatus};
use branchlab_history::{
    BranchInfo, ChangeKind, CommitInfo, DiffSummary, HeadState, HistoryTree, MergeOutcome,
    MergeStatus, RepositoryStatistics,
};
use branchlab_sandbox::{SandboxState, SandboxSummary};
use chrono::{DateTime, Utc};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use std::fmt::Write;

pub fn short(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn status_label(status: ExecutionStatus) -> ColoredString {
    match status {
        ExecutionStatus::Ok => "ok".green(),
        ExecutionStatus::Error => "error".red().bold(),
        ExecutionStatus::Timeout => "timeout".yellow().bold(),
        ExecutionStatus::Interrupted => "interrupted".yellow(),
    }
}

fn state_label(state: SandboxState) -> ColoredString {
    let text = state.to_string();
    match state {
        SandboxState::Idle => text.green(),
        SandboxState::Busy => text.cyan(),
        SandboxState::Dead => text.red(),
        _ => text.yellow(),
    }
}

pub fn render_head(head: &HeadState) -> String {
    match &head.branch {
        Some(branch) => format!("{} ({})", branch.cyan().bold(), short(&head.sha).yellow()),
        None => format!("{} {}", "detached at".red(), short(&head.sha).yellow()),
    }
}

pub fn render_execution(execution: &Execution) -> String {
    let mut out = String::new();
    out.push_str(&execution.stdout);
    if !execution.stderr.is_empty() {
        let _ = write!(out, "{}", execution.stderr.red());
    }
    for display in &execution.display_artifacts {
        let bundle = display.to_mime_bundle();
        let kinds: Vec<&str> = bundle.keys().map(String::as_str).collect();
        let _ = writeln!(out, "{} {}", "[display]".dimmed(), kinds.join(", "));
    }
    for error in &execution.errors {
        for line in &error.trace {
            let _ = writeln!(out, "{}", line.red());
        }
        let _ = writeln!(out, "{}", format!("{}: {}", error.kind, error.message).red().bold());
    }
    let _ = writeln!(
        out,
        "{} [{}] in {} ms",
        format!("#{}", execution.execution_count).dimmed(),
        status_label(execution.status),
        execution.duration_ms
    );
    out
}

pub fn render_commit_line(commit: &CommitInfo) -> String {
    let branch = commit
        .branch
        .as_deref()
        .map(|b| format!(" ({})", b.cyan()))
        .unwrap_or_default();
    format!(
        "{}{} {}",
        short(&commit.sha).yellow(),
        branch,
        commit.summary()
    )
}

pub fn render_history(commits: &[CommitInfo]) -> String {
    if commits.is_empty() {
        return format!("{}\n", "No commits".yellow());
    }
    let mut out = String::new();
    for commit in commits {
        let status = commit
            .execution_info
            .as_ref()
            .map(|e| format!(" [{}]", status_label(e.status)))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{}{}  {}",
            render_commit_line(commit),
            status,
            timestamp(&commit.timestamp).dimmed()
        );
    }
    out
}

pub fn render_tree(tree: &HistoryTree) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "HEAD: {}", render_head(&tree.head));
    for commit in &tree.commits {
        let marker = if commit.sha == tree.head.sha { "*" } else { "o" };
        let merge = if commit.parents.len() > 1 { " (merge)" } else { "" };
        let labels = if commit.branches.is_empty() {
            String::new()
        } else {
            format!(" [{}]", commit.branches.join(", ")).cyan().to_string()
        };
        let _ = writeln!(
            out,
            "{} {}{}{} {}",
            marker,
            short(&commit.sha).yellow(),
            labels,
            merge.dimmed(),
            commit.message.lines().next().unwrap_or("")
        );
    }
    out
}

pub fn render_branches(branches: &[BranchInfo]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["", "Branch", "Head", "Ahead", "Behind", "Last commit", "Updated"]);
    for branch in branches {
        table.add_row(vec![
            (if branch.is_current { "*" } else { "" }).to_string(),
            branch.name.clone(),
            short(&branch.head_sha).to_string(),
            branch.commits_ahead.to_string(),
            branch.commits_behind.to_string(),
            branch.last_message.clone(),
            timestamp(&branch.last_activity),
        ]);
    }
    table.to_string()
}

pub fn render_diff(diff: &DiffSummary) -> String {
    let mut out = String::new();
    let base = diff.base_sha.as_deref().map(short).unwrap_or("(root)");
    let _ = writeln!(out, "{}..{}", base.yellow(), short(&diff.sha).yellow());
    if diff.is_empty() {
        let _ = writeln!(out, "{}", "No differences".dimmed());
        return out;
    }
    for file in &diff.files {
        let (mark, path) = match file.kind {
            ChangeKind::Added => ("A".green(), file.path.green()),
            ChangeKind::Modified => ("M".yellow(), file.path.normal()),
            ChangeKind::Deleted => ("D".red(), file.path.red()),
        };
        let _ = writeln!(
            out,
            "{} {} {}",
            mark,
            path,
            format!("+{} -{}", file.insertions, file.deletions).dimmed()
        );
    }
    let _ = writeln!(
        out,
        "{} files changed, {} insertions(+), {} deletions(-)",
        diff.stats.files_changed, diff.stats.insertions, diff.stats.deletions
    );
    out
}

pub fn render_merge(outcome: &MergeOutcome) -> String {
    let mut out = String::new();
    match outcome.status {
        MergeStatus::Success => {
            let how = if outcome.fast_forward {
                " (fast-forward)"
            } else {
                ""
            };
            let head = outcome
                .merge_commit
                .as_deref()
                .map(|sha| format!(" -> {}", short(sha).yellow()))
                .unwrap_or_default();
            let _ = writeln!(out, "{} {}{}{}", "✓".green(), outcome.message, how, head);
        }
        MergeStatus::Conflict => {
            let _ = writeln!(out, "{} {}", "✗".red().bold(), outcome.message);
            for path in &outcome.conflicts {
                let _ = writeln!(out, "  {} {}", "conflict:".red(), path);
            }
            let _ = writeln!(out, "{}", "Target branch left unchanged".dimmed());
        }
    }
    out
}

pub fn render_statistics(stats: &RepositoryStatistics) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {}",
        "Branch:".bold(),
        stats.current_branch.as_deref().unwrap_or("(detached)")
    );
    let _ = writeln!(out, "{} {}", "Commits:".bold(), stats.total_commits);
    let _ = writeln!(out, "{} {}", "Executions:".bold(), stats.total_executions);
    let _ = writeln!(out, "{} {}", "Branches:".bold(), stats.total_branches);
    let _ = writeln!(
        out,
        "{} {} bytes",
        "Size:".bold(),
        stats.repository_size_bytes
    );
    let _ = writeln!(
        out,
        "{} {}",
        "Working tree:".bold(),
        if stats.is_dirty {
            "modified".yellow()
        } else {
            "clean".green()
        }
    );
    if let Some(latest) = &stats.latest_activity {
        let _ = writeln!(out, "{} {}", "Last commit:".bold(), timestamp(latest));
    }
    if !stats.file_types.is_empty() {
        let types: Vec<String> = stats
            .file_types
            .iter()
            .map(|(ext, count)| format!("{} {}", ext, count))
            .collect();
        let _ = writeln!(out, "{} {}", "File types:".bold(), types.join(", "));
    }
    out
}

pub fn render_sandboxes(sandboxes: &[SandboxSummary]) -> String {
    if sandboxes.is_empty() {
        return "No live sandboxes".dimmed().to_string();
    }
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Session", "Sandbox", "State", "Runs", "Backend", "Isolated", "Last active",
    ]);
    for sandbox in sandboxes {
        table.add_row(vec![
            sandbox.session_id.clone(),
            short(&sandbox.sandbox_id).to_string(),
            state_label(sandbox.state).to_string(),
            sandbox.execution_count.to_string(),
            sandbox.backend.clone(),
            (if sandbox.isolated { "yes" } else { "no" }).to_string(),
            timestamp(&sandbox.last_activity_at),
        ]);
    }
    table.to_string()
}
