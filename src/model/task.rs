// src/model/task.rs

//! The task domain model: one task is one invocation of one remote process
//! with one parameter set on one configured instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Task identifier, unique within a workflow.
pub type TaskId = String;

/// Ordered parameter mapping (name -> string value).
///
/// Declaration order is preserved: it matters for expansion child ids and
/// for emitting a workflow back to disk. Serialized as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters(pub Vec<(String, String)>);

impl Parameters {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }
}

impl FromIterator<(String, String)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Parameters(iter.into_iter().collect())
    }
}

impl Serialize for Parameters {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Parameters {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = Parameters;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a map of parameter names to string values")
            }

            fn visit_map<A: serde::de::MapAccess<'de>>(
                self,
                mut access: A,
            ) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((k, v)) = access.next_entry::<String, ParamValue>()? {
                    entries.push((k, v.0));
                }
                Ok(Parameters(entries))
            }
        }

        deserializer.deserialize_map(Visitor)
    }
}

/// Accepts string, integer, float and boolean JSON values, normalising all
/// of them to strings (the remote protocol is string-typed).
struct ParamValue(String);

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let s = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "parameter value must be a scalar, got {other}"
                )))
            }
        };
        Ok(ParamValue(s))
    }
}

/// One concrete unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub instance: String,
    pub process: String,
    pub parameters: Parameters,
    pub predecessors: Vec<TaskId>,
    pub stage: Option<String>,
    pub timeout_sec: Option<u64>,
    pub cancel_at_timeout: bool,
    pub require_predecessor_success: bool,
    pub safe_retry: bool,
    pub succeed_on_minor_errors: bool,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        instance: impl Into<String>,
        process: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            instance: instance.into(),
            process: process.into(),
            parameters: Parameters::default(),
            predecessors: Vec::new(),
            stage: None,
            timeout_sec: None,
            cancel_at_timeout: false,
            require_predecessor_success: false,
            safe_retry: false,
            succeed_on_minor_errors: false,
        }
    }

    /// Canonical identity used to correlate executions across runs.
    pub fn signature(&self) -> String {
        task_signature(&self.instance, &self.process, &self.parameters)
    }
}

/// Deterministic signature for `(instance, process, parameters)`.
///
/// Parameter keys are sorted and values ASCII-lowercased so that key order
/// and casing differences do not split a task's history.
pub fn task_signature(instance: &str, process: &str, parameters: &Parameters) -> String {
    let mut sorted: Vec<(&str, String)> = parameters
        .iter()
        .map(|(k, v)| (k, v.to_ascii_lowercase()))
        .collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(instance.as_bytes());
    hasher.update(b"|");
    hasher.update(process.as_bytes());
    for (k, v) in &sorted {
        hasher.update(b"|");
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }

    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// State of a task during a run. Any non-`Pending`/`Ready`/`Running` status
/// is terminal within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    /// A terminal status that does not count as a success for
    /// `require_predecessor_success` purposes.
    pub fn is_unsuccessful_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a task-local failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RemoteFailure,
    Timeout,
    MinorErrors,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            ErrorKind::RemoteFailure => "remote_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MinorErrors => "minor_errors",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of executing one task, as reported back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl TaskOutcome {
    pub fn duration_seconds(&self) -> f64 {
        (self.finish - self.start).num_milliseconds() as f64 / 1000.0
    }
}
