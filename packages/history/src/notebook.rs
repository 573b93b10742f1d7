// ABOUTME: Builds an nbformat 4.5 notebook from the executions recorded on a branch
// ABOUTME: One code cell per execution with stream, display_data and error outputs

use branchlab_core::{Execution, ExecutionStatus};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// nbformat stores multi-line text as a list of lines that keep their newlines
fn source_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

fn cell_outputs(execution: &Execution) -> Vec<Value> {
    let mut outputs = Vec::new();

    if !execution.stdout.is_empty() {
        outputs.push(json!({
            "output_type": "stream",
            "name": "stdout",
            "text": source_lines(&execution.stdout),
        }));
    }
    if !execution.stderr.is_empty() {
        outputs.push(json!({
            "output_type": "stream",
            "name": "stderr",
            "text": source_lines(&execution.stderr),
        }));
    }
    for display in &execution.display_artifacts {
        if display.is_empty() {
            continue;
        }
        outputs.push(json!({
            "output_type": "display_data",
            "data": Value::Object(display.to_mime_bundle()),
            "metadata": {},
        }));
    }
    for error in &execution.errors {
        let traceback: Vec<String> = if error.trace.is_empty() {
            vec![format!("{}: {}", error.kind, error.message)]
        } else {
            error.trace.clone()
        };
        outputs.push(json!({
            "output_type": "error",
            "ename": error.kind,
            "evalue": error.message,
            "traceback": traceback,
        }));
    }
    outputs
}

fn code_cell(index: usize, sha: &str, execution: &Execution) -> Value {
    let mut metadata = json!({
        "execution_id": execution.execution_id,
        "commit": sha,
        "started_at": execution.started_at.to_rfc3339(),
        "duration_ms": execution.duration_ms,
    });
    if execution.status != ExecutionStatus::Ok {
        metadata["status"] = json!(execution.status.as_str());
    }

    json!({
        "cell_type": "code",
        "execution_count": index + 1,
        "id": format!("cell-{}", index + 1),
        "metadata": metadata,
        "source": source_lines(&execution.code),
        "outputs": cell_outputs(execution),
    })
}

/// `cells` are (commit sha, execution) pairs in commit order
pub fn build_notebook(
    session_id: &str,
    branch: &str,
    head_sha: &str,
    generated_at: DateTime<Utc>,
    cells: &[(String, Execution)],
) -> Value {
    let mut notebook_cells = vec![json!({
        "cell_type": "markdown",
        "id": "header",
        "metadata": {},
        "source": source_lines(&format!(
            "# BranchLab session: {}\n\nBranch `{}` at `{}`, {} executions.\n\nGenerated: {}\n",
            session_id,
            branch,
            &head_sha[..head_sha.len().min(8)],
            cells.len(),
            generated_at.to_rfc3339()
        )),
    })];
    notebook_cells.extend(
        cells
            .iter()
            .enumerate()
            .map(|(index, (sha, execution))| code_cell(index, sha, execution)),
    );

    json!({
        "cells": notebook_cells,
        "metadata": {
            "kernelspec": {
                "display_name": "Python 3",
                "language": "python",
                "name": "python3",
            },
            "language_info": {
                "name": "python",
            },
            "branchlab": {
                "session_id": session_id,
                "branch": branch,
                "head": head_sha,
            },
        },
        "nbformat": 4,
        "nbformat_minor": 5,
    })
}
