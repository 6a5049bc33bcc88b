// src/taskfile/mod.rs

//! Workflow file ingestion.
//!
//! Three formats are accepted: the structured JSON form, the line-oriented
//! dependency form (explicit ids), and the legacy wait-barrier form. The
//! format is auto-detected from content and everything is normalised into a
//! [`Taskfile`] before DAG construction.

pub mod expand;
pub mod json;
pub mod line;
pub mod validate;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::errors::RushtiError;
use crate::model::Dag;

pub use expand::{expand_taskfile, needs_expansion};
pub use json::{Metadata, TaskDef, Taskfile, WorkflowSettings};
pub use validate::{topological_order, validate_remote, validate_structural, Report};

/// Detected workflow file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskfileFormat {
    Structured,
    Dependency,
    Barrier,
}

/// Auto-detect the format from file content: a JSON object is the
/// structured form; otherwise the presence of an `id=` token selects the
/// dependency form over the legacy wait-barrier form.
pub fn detect_format(content: &str) -> TaskfileFormat {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    if content.trim_start().starts_with('{') {
        return TaskfileFormat::Structured;
    }

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line
            .split_whitespace()
            .any(|token| token.starts_with("id="))
        {
            return TaskfileFormat::Dependency;
        }
    }

    TaskfileFormat::Barrier
}

/// Load a workflow file of any supported format.
///
/// The workflow name falls back to the file stem when the file carries no
/// metadata. Unknown structured-form keys are logged as warnings.
pub fn load(path: &Path) -> Result<Taskfile, RushtiError> {
    let content = fs::read_to_string(path)?;
    let format = detect_format(&content);

    let mut taskfile = match format {
        TaskfileFormat::Structured => {
            let tf: Taskfile =
                serde_json::from_str(content.strip_prefix('\u{feff}').unwrap_or(&content))
                    .map_err(|e| RushtiError::Parse {
                        path: path.to_path_buf(),
                        line: e.line(),
                        message: e.to_string(),
                    })?;
            for warning in tf.unknown_key_warnings() {
                warn!(path = %path.display(), "{warning}");
            }
            tf
        }
        TaskfileFormat::Dependency => {
            let items = line::parse_lines(&content, path)?;
            let tasks = line::assemble_dependency_form(items, path)?;
            Taskfile {
                tasks,
                ..Taskfile::default()
            }
        }
        TaskfileFormat::Barrier => {
            let items = line::parse_lines(&content, path)?;
            let tasks = line::assemble_barrier_form(items);
            Taskfile {
                tasks,
                ..Taskfile::default()
            }
        }
    };

    if taskfile.tasks.is_empty() {
        return Err(RushtiError::Parse {
            path: path.to_path_buf(),
            line: 0,
            message: "workflow contains no tasks".to_string(),
        });
    }

    if taskfile.workflow_name().is_empty() {
        taskfile.metadata.workflow = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }

    info!(
        path = %path.display(),
        format = ?format,
        tasks = taskfile.tasks.len(),
        workflow = %taskfile.workflow_name(),
        "loaded workflow file"
    );

    Ok(taskfile)
}

/// Build the validated execution DAG from a (fully expanded) taskfile.
///
/// Applies the implicit stage edges, then runs the topological pass so a
/// cyclic workflow is rejected before any work starts.
pub fn build_dag(taskfile: &Taskfile) -> Result<Dag, RushtiError> {
    let tasks = taskfile
        .tasks
        .iter()
        .cloned()
        .map(TaskDef::into_task)
        .collect();
    let mut dag = Dag::from_tasks(tasks)?;

    if let Some(stage_order) = taskfile.settings.stage_order.as_deref() {
        dag.apply_stage_ordering(stage_order);
    }

    validate::topological_order(&dag)?;
    Ok(dag)
}

/// Emit the structured form to disk.
pub fn save(taskfile: &Taskfile, path: &Path) -> Result<(), RushtiError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, taskfile.to_json_pretty())?;
    Ok(())
}

/// Archive the resolved, expanded workflow for a run so the exact DAG can
/// be rebuilt later regardless of the original source format.
pub fn archive(
    taskfile: &Taskfile,
    base_dir: &Path,
    workflow: &str,
    run_id: &str,
) -> Result<PathBuf, RushtiError> {
    let dir = base_dir.join("archive").join(sanitize(workflow));
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{run_id}.workflow"));
    fs::write(&path, taskfile.to_json_pretty())?;
    info!(path = %path.display(), "archived workflow");
    Ok(path)
}

/// Make a workflow name safe for use in a file name.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
