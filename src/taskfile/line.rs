// src/taskfile/line.rs

//! The two line-oriented workflow forms.
//!
//! Both share one tokenizer: `key=value` sequences separated by whitespace,
//! values bare or double-quoted with backslash escapes for `"` and `\`.
//! Blank lines and lines starting with `#` are comments; the literal
//! keyword `wait` is a barrier marker in the legacy form.

use std::path::Path;

use crate::errors::RushtiError;
use crate::taskfile::json::TaskDef;

/// Accepted spellings of boolean true in line values.
const TRUE_VALUES: &[&str] = &["true", "1", "yes", "y"];

/// One parsed line of a line-oriented workflow file.
#[derive(Debug, Clone)]
pub enum LineItem {
    /// Barrier marker of the legacy form.
    Wait,
    /// A task definition; `id` is empty when the line carried none.
    Task(TaskDef),
}

/// Split one line into `(key, value)` tokens.
///
/// Returns a message (without position info) on malformed input; the caller
/// attaches file and line number.
pub fn tokenize(line: &str) -> Result<Vec<(String, String)>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        // Skip inter-token whitespace.
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) if c.is_whitespace() => {
                    return Err(format!("malformed token '{key}': expected '='"));
                }
                Some(c) => key.push(c),
                None => return Err(format!("malformed token '{key}': expected '='")),
            }
        }
        if key.is_empty() {
            return Err("empty key before '='".to_string());
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped @ ('"' | '\\')) => value.push(escaped),
                        Some(other) => {
                            value.push('\\');
                            value.push(other);
                        }
                        None => return Err(format!("unclosed quote in value for '{key}'")),
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => value.push(other),
                }
            }
            if !closed {
                return Err(format!("unclosed quote in value for '{key}'"));
            }
        } else {
            while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
                value.push(chars.next().unwrap());
            }
        }

        tokens.push((key, value));
    }

    Ok(tokens)
}

fn parse_bool(value: &str) -> bool {
    TRUE_VALUES.contains(&value.to_ascii_lowercase().as_str())
}

/// Build a [`TaskDef`] from one line's tokens. Keys not recognised as task
/// attributes become process parameters, in declaration order.
fn task_from_tokens(tokens: Vec<(String, String)>) -> Result<TaskDef, String> {
    let mut def = TaskDef::new("", "", "");

    for (key, value) in tokens {
        match key.to_ascii_lowercase().as_str() {
            "id" => def.id = value,
            "instance" => def.instance = value,
            "process" => def.process = value,
            "predecessors" => {
                let preds: Vec<String> = value
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty() && p != "0")
                    .collect();
                def.predecessors = preds;
            }
            "stage" => def.stage = (!value.is_empty()).then_some(value),
            "timeout" => {
                if !value.is_empty() {
                    def.timeout = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| format!("invalid timeout value '{value}'"))?,
                    );
                }
            }
            "cancel_at_timeout" => def.cancel_at_timeout = parse_bool(&value),
            "require_predecessor_success" => def.require_predecessor_success = parse_bool(&value),
            "safe_retry" => def.safe_retry = parse_bool(&value),
            "succeed_on_minor_errors" => def.succeed_on_minor_errors = parse_bool(&value),
            _ => def.parameters.push(key, value),
        }
    }

    if def.instance.is_empty() {
        return Err("missing required key 'instance'".to_string());
    }
    if def.process.is_empty() {
        return Err("missing required key 'process'".to_string());
    }

    Ok(def)
}

/// Parse the raw content of a line-oriented file into line items.
///
/// A leading UTF-8 BOM is stripped; comments and blank lines are dropped.
pub fn parse_lines(content: &str, path: &Path) -> Result<Vec<LineItem>, RushtiError> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut items = Vec::new();

    for (line_no, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.eq_ignore_ascii_case("wait") {
            items.push(LineItem::Wait);
            continue;
        }

        let tokens = tokenize(line).map_err(|message| RushtiError::Parse {
            path: path.to_path_buf(),
            line: line_no + 1,
            message,
        })?;
        let def = task_from_tokens(tokens).map_err(|message| RushtiError::Parse {
            path: path.to_path_buf(),
            line: line_no + 1,
            message,
        })?;
        items.push(LineItem::Task(def));
    }

    Ok(items)
}

/// Wait-barrier translation: assign monotonically increasing implicit ids,
/// and give every task after a barrier all tasks of the previous non-empty
/// group as predecessors.
pub fn assemble_barrier_form(items: Vec<LineItem>) -> Vec<TaskDef> {
    let mut tasks: Vec<TaskDef> = Vec::new();
    let mut previous_group: Vec<String> = Vec::new();
    let mut current_group: Vec<String> = Vec::new();
    let mut next_id = 1u64;

    for item in items {
        match item {
            LineItem::Wait => {
                if !current_group.is_empty() {
                    previous_group = std::mem::take(&mut current_group);
                }
            }
            LineItem::Task(mut def) => {
                def.id = next_id.to_string();
                next_id += 1;
                def.predecessors = previous_group.clone();
                current_group.push(def.id.clone());
                tasks.push(def);
            }
        }
    }

    tasks
}

/// Dependency-form assembly: every line must carry an id; barriers are not
/// part of this form.
pub fn assemble_dependency_form(
    items: Vec<LineItem>,
    path: &Path,
) -> Result<Vec<TaskDef>, RushtiError> {
    let mut tasks = Vec::new();

    for item in items {
        match item {
            LineItem::Wait => {
                return Err(RushtiError::Parse {
                    path: path.to_path_buf(),
                    line: 0,
                    message: "'wait' is not valid in a file with explicit task ids".to_string(),
                });
            }
            LineItem::Task(def) => {
                if def.id.is_empty() {
                    return Err(RushtiError::Parse {
                        path: path.to_path_buf(),
                        line: 0,
                        message: format!(
                            "missing required key 'id' on task for process '{}'",
                            def.process
                        ),
                    });
                }
                tasks.push(def);
            }
        }
    }

    Ok(tasks)
}

/// Render a task back to its dependency-form line.
pub fn task_to_line(def: &TaskDef) -> String {
    let mut parts = vec![
        format!("id=\"{}\"", def.id),
        format!("predecessors=\"{}\"", def.predecessors.join(",")),
        format!("instance=\"{}\"", def.instance),
        format!("process=\"{}\"", escape(&def.process)),
    ];
    if def.require_predecessor_success {
        parts.push("require_predecessor_success=\"true\"".to_string());
    }
    if def.succeed_on_minor_errors {
        parts.push("succeed_on_minor_errors=\"true\"".to_string());
    }
    if def.safe_retry {
        parts.push("safe_retry=\"true\"".to_string());
    }
    if let Some(stage) = &def.stage {
        parts.push(format!("stage=\"{stage}\""));
    }
    if let Some(timeout) = def.timeout {
        parts.push(format!("timeout=\"{timeout}\""));
    }
    if def.cancel_at_timeout {
        parts.push("cancel_at_timeout=\"true\"".to_string());
    }
    for (key, value) in def.parameters.iter() {
        parts.push(format!("{key}=\"{}\"", escape(value)));
    }
    parts.join(" ")
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
