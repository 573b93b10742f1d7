// ABOUTME: Command line surface of BranchLab and its dispatch onto the session orchestrator
// ABOUTME: Every invocation opens the session it needs, runs one operation and stops the sandbox

use crate::output;
use anyhow::{Context, Result};
use branchlab_config::LabConfig;
use branchlab_history::CommitMetadata;
use branchlab_session::{RestoreMode, SessionOrchestrator};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "branchlab")]
#[command(about = "BranchLab - sandboxed, version-controlled code execution")]
#[command(version)]
pub struct Cli {
    /// Session to operate on
    #[arg(short, long, global = true, env = "BRANCHLAB_SESSION", default_value = "default")]
    pub session: String,

    /// Print machine-readable JSON instead of a summary
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute code in the session sandbox and commit the result
    Exec {
        /// Code to run; use --file to read it from disk
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        code: Option<String>,

        /// Read the code from this file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Timeout in seconds (default from BRANCHLAB_EXECUTION_TIMEOUT_SECS)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Show commits, newest first
    History {
        /// Restrict to one branch
        #[arg(short, long)]
        branch: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show the commit graph across all branches
    Tree,
    /// Manage branches
    #[command(subcommand)]
    Branch(BranchCommands),
    /// Move the working tree to a commit (detached)
    Checkout {
        sha: String,

        /// What to do with the interpreter state
        #[arg(long, value_enum, default_value = "none")]
        restore: RestoreArg,

        /// Per-cell timeout in seconds when replaying
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Compare a commit with its parent or with a second commit
    Diff {
        sha1: String,
        sha2: Option<String>,
    },
    /// Merge a branch into another (default main)
    Merge {
        source: String,

        #[arg(long)]
        into: Option<String>,
    },
    /// Export the executions on a branch as a Jupyter notebook
    Export {
        #[arg(short, long)]
        branch: Option<String>,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Repository statistics for the session
    Stats,
    /// Current head, sandbox runtime and live sandboxes
    Status,
}

#[derive(Subcommand, Debug)]
pub enum BranchCommands {
    /// Create a branch and switch to it
    Create {
        name: String,

        /// Start from this commit instead of the current head
        #[arg(long)]
        from: Option<String>,
    },
    /// Switch to an existing branch
    Switch { name: String },
    /// List branches
    List,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreArg {
    None,
    Restart,
    Replay,
}

impl From<RestoreArg> for RestoreMode {
    fn from(arg: RestoreArg) -> Self {
        match arg {
            RestoreArg::None => RestoreMode::None,
            RestoreArg::Restart => RestoreMode::Restart,
            RestoreArg::Replay => RestoreMode::Replay,
        }
    }
}

impl Commands {
    /// Commands that need a running sandbox for the session
    pub fn needs_sandbox(&self) -> bool {
        match self {
            Commands::Exec { .. } => true,
            Commands::Checkout { restore, .. } => *restore != RestoreArg::None,
            _ => false,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn seconds(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_secs)
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = LabConfig::from_env();
    debug!("Using BranchLab home {}", config.home.display());
    let lab = SessionOrchestrator::from_config(&config)
        .await
        .context("Failed to start the sandbox runtime")?;

    if cli.command.needs_sandbox() {
        let info = lab
            .open_session(&cli.session)
            .await
            .with_context(|| format!("Failed to open session '{}'", cli.session))?;
        if !info.isolated && !cli.json {
            eprintln!(
                "{} {}",
                "Warning:".yellow().bold(),
                "no container runtime, code runs without isolation"
            );
        }
    }

    let result = dispatch(&lab, &cli).await;
    lab.shutdown().await;
    result
}

async fn dispatch(lab: &SessionOrchestrator, cli: &Cli) -> Result<()> {
    let session = cli.session.as_str();
    match &cli.command {
        Commands::Exec {
            code,
            file,
            timeout,
        } => {
            let code = match (code, file) {
                (Some(code), _) => code.clone(),
                (None, Some(path)) => std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, None) => anyhow::bail!("Nothing to execute"),
            };
            let outcome = lab
                .execute(session, &code, seconds(*timeout), CommitMetadata::new())
                .await?;
            if cli.json {
                print_json(&outcome)?;
            } else {
                print!("{}", output::render_execution(&outcome.execution));
                println!("{}", output::render_commit_line(&outcome.commit));
            }
        }
        Commands::History { branch, limit } => {
            let commits = lab.history(session, branch.as_deref(), *limit).await?;
            if cli.json {
                print_json(&commits)?;
            } else {
                print!("{}", output::render_history(&commits));
            }
        }
        Commands::Tree => {
            let tree = lab.history_tree(session).await?;
            if cli.json {
                print_json(&tree)?;
            } else {
                print!("{}", output::render_tree(&tree));
            }
        }
        Commands::Branch(command) => match command {
            BranchCommands::Create { name, from } => {
                let branch = lab.create_branch(session, name, from.as_deref()).await?;
                if cli.json {
                    print_json(&branch)?;
                } else {
                    println!(
                        "{} Created branch {} at {}",
                        "✓".green(),
                        branch.name.cyan().bold(),
                        output::short(&branch.head_sha)
                    );
                }
            }
            BranchCommands::Switch { name } => {
                let branch = lab.switch_branch(session, name).await?;
                if cli.json {
                    print_json(&branch)?;
                } else {
                    println!(
                        "{} Switched to {} at {}",
                        "✓".green(),
                        branch.name.cyan().bold(),
                        output::short(&branch.head_sha)
                    );
                }
            }
            BranchCommands::List => {
                let branches = lab.list_branches(session).await?;
                if cli.json {
                    print_json(&branches)?;
                } else {
                    println!("{}", output::render_branches(&branches));
                }
            }
        },
        Commands::Checkout {
            sha,
            restore,
            timeout,
        } => {
            let outcome = lab
                .checkout_commit(session, sha, (*restore).into(), seconds(*timeout))
                .await?;
            if cli.json {
                print_json(&outcome)?;
            } else {
                println!(
                    "{} HEAD detached at {} {}",
                    "✓".green(),
                    outcome.commit.short_sha.yellow(),
                    outcome.commit.summary()
                );
                if *restore == RestoreArg::Replay {
                    println!("  replayed {} cells", outcome.replayed);
                }
            }
        }
        Commands::Diff { sha1, sha2 } => {
            let diff = lab.diff(session, sha1, sha2.as_deref()).await?;
            if cli.json {
                print_json(&diff)?;
            } else {
                print!("{}", output::render_diff(&diff));
            }
        }
        Commands::Merge { source, into } => {
            let outcome = lab.merge(session, source, into.as_deref()).await?;
            if cli.json {
                print_json(&outcome)?;
            } else {
                print!("{}", output::render_merge(&outcome));
            }
        }
        Commands::Export {
            branch,
            output: destination,
        } => {
            let notebook = lab.export_notebook(session, branch.as_deref()).await?;
            let text = serde_json::to_string_pretty(&notebook)?;
            match destination {
                Some(path) => {
                    std::fs::write(path, text)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    eprintln!("{} Notebook written to {}", "✓".green(), path.display());
                }
                None => println!("{}", text),
            }
        }
        Commands::Stats => {
            let stats = lab.statistics(session).await?;
            if cli.json {
                print_json(&stats)?;
            } else {
                print!("{}", output::render_statistics(&stats));
            }
        }
        Commands::Status => {
            let head = lab.current_head(session).await?;
            let sandboxes = lab.list_sandboxes().await;
            let manager = lab.sandboxes();
            if cli.json {
                print_json(&serde_json::json!({
                    "session_id": session,
                    "head": head,
                    "backend": manager.backend().kind().to_string(),
                    "isolated": manager.is_isolated(),
                    "capacity": manager.governor().capacity(),
                    "sandboxes": sandboxes,
                }))?;
            } else {
                println!(
                    "{} {} on {}",
                    "Session".bold(),
                    session.cyan(),
                    output::render_head(&head)
                );
                println!(
                    "{} {} (isolated: {}, capacity: {})",
                    "Runtime".bold(),
                    manager.backend().kind(),
                    manager.is_isolated(),
                    manager.governor().capacity()
                );
                println!("{}", output::render_sandboxes(&sandboxes));
            }
        }
    }
    Ok(())
}
