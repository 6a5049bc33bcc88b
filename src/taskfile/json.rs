// src/taskfile/json.rs

//! The structured workflow form.
//!
//! A JSON object with `version`, optional `metadata` and `settings`, and a
//! required `tasks` array. Unknown keys are collected and reported as
//! warnings; they round-trip untouched on emission.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::engine::queue::OrderingPolicy;
use crate::model::{Parameters, Task};

pub const SCHEMA_VERSION: &str = "2.0";

fn default_version() -> String {
    SCHEMA_VERSION.to_string()
}

/// Complete structured workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taskfile {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub metadata: Metadata,

    #[serde(default)]
    pub settings: WorkflowSettings,

    pub tasks: Vec<TaskDef>,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl Default for Taskfile {
    fn default() -> Self {
        Self {
            version: default_version(),
            metadata: Metadata::default(),
            settings: WorkflowSettings::default(),
            tasks: Vec::new(),
            unknown: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workflow: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_at: Option<String>,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

/// The workflow-level `settings` block. Every field is optional so the
/// precedence chain (CLI flag > this block > settings file > default) can
/// tell "unset" from "set to the default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive: Option<bool>,

    #[serde(default, alias = "optimize", skip_serializing_if = "Option::is_none")]
    pub ordering_policy: Option<OrderingPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_order: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_workers: Option<BTreeMap<String, usize>>,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

/// One task entry of the structured form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,

    pub instance: String,

    pub process: String,

    #[serde(default, skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predecessors: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancel_at_timeout: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub require_predecessor_success: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub safe_retry: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub succeed_on_minor_errors: bool,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl TaskDef {
    pub fn new(id: impl Into<String>, instance: impl Into<String>, process: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance: instance.into(),
            process: process.into(),
            parameters: Parameters::default(),
            predecessors: Vec::new(),
            stage: None,
            timeout: None,
            cancel_at_timeout: false,
            require_predecessor_success: false,
            safe_retry: false,
            succeed_on_minor_errors: false,
            unknown: BTreeMap::new(),
        }
    }

    pub fn into_task(self) -> Task {
        Task {
            id: self.id,
            instance: self.instance,
            process: self.process,
            parameters: self.parameters,
            predecessors: self.predecessors,
            stage: self.stage,
            timeout_sec: self.timeout,
            cancel_at_timeout: self.cancel_at_timeout,
            require_predecessor_success: self.require_predecessor_success,
            safe_retry: self.safe_retry,
            succeed_on_minor_errors: self.succeed_on_minor_errors,
        }
    }
}

/// Accept both `"id": "3"` and `"id": 3`.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "task id must be a string or number, got {other}"
        ))),
    }
}

impl Taskfile {
    /// Workflow identity: explicit metadata, else the name, else empty (the
    /// loader falls back to the file stem).
    pub fn workflow_name(&self) -> &str {
        if !self.metadata.workflow.is_empty() {
            &self.metadata.workflow
        } else {
            &self.metadata.name
        }
    }

    pub fn to_json_pretty(&self) -> String {
        // Serialization of this shape cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Warnings for unknown keys anywhere in the file.
    pub fn unknown_key_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for key in self.unknown.keys() {
            warnings.push(format!("unknown top-level key '{key}'"));
        }
        for key in self.metadata.unknown.keys() {
            warnings.push(format!("unknown metadata key '{key}'"));
        }
        for key in self.settings.unknown.keys() {
            warnings.push(format!("unknown settings key '{key}'"));
        }
        for task in &self.tasks {
            for key in task.unknown.keys() {
                warnings.push(format!("task '{}': unknown key '{key}'", task.id));
            }
        }
        warnings
    }
}
