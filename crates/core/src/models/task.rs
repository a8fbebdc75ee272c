use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::FailureKind;

/// Task lifecycle state.
///
/// ```text
/// CREATED → SCHEDULED → RUNNING → COMPLETED
///                ↑          ↓  ↘
///              RETRY ←── FAILED  CANCELLED
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Scheduled,
    Running,
    Completed,
    Failed,
    Retry,
    Cancelled,
}

impl TaskState {
    /// Terminal from the job's point of view. `Failed` is only terminal once
    /// the coordinator decides not to retry, which it records by leaving the
    /// task in `Failed` instead of moving it to `Retry`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Scheduled | TaskState::Running)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, Scheduled)
                | (Created, Cancelled)
                | (Scheduled, Running)
                | (Scheduled, Completed)
                | (Scheduled, Failed)
                | (Scheduled, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Retry)
                | (Retry, Scheduled)
                | (Retry, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Scheduled => "SCHEDULED",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Retry => "RETRY",
            TaskState::Cancelled => "CANCELLED",
        }
    }
}

/// Optional CPU / memory ceiling, e.g. `cpus = "0.5"`, `memory = "256m"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Limits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl Limits {
    pub fn is_empty(&self) -> bool {
        self.cpus.as_deref().map_or(true, str::is_empty)
            && self.memory.as_deref().map_or(true, str::is_empty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    Volume,
    Bind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mount {
    #[serde(rename = "type")]
    pub mount_type: MountType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registry {
    pub username: String,
    pub password: String,
}

/// Client-facing task definition inside a job submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    /// Shell command string, written to a script and run through a shell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    /// argv-style command vector, executed directly.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<Registry>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub files: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,
    /// Target queue; the coordinator's queue policy decides when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// `None` depends on the previous task in declaration order,
    /// `Some(vec![])` marks a root task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run: impl Into<String>) -> Self {
        self.run = Some(run.into());
        self
    }

    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(name.into(), contents.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

/// One schedulable unit of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub job_id: String,
    /// Position of the task in the job's declaration order.
    pub position: usize,
    #[serde(flatten)]
    pub spec: TaskSpec,
    /// Resolved predecessor names.
    #[serde(default)]
    pub predecessors: Vec<String>,
    pub state: TaskState,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(job_id: impl Into<String>, position: usize, spec: TaskSpec) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            job_id: job_id.into(),
            position,
            spec,
            predecessors: Vec::new(),
            state: TaskState::Created,
            retry_count: 0,
            node_id: None,
            result: None,
            error: None,
            failure_kind: None,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(TaskState::Created.can_transition_to(TaskState::Scheduled));
        assert!(TaskState::Scheduled.can_transition_to(TaskState::Running));
        assert!(TaskState::Running.can_transition_to(TaskState::Completed));
        assert!(TaskState::Failed.can_transition_to(TaskState::Retry));
        assert!(TaskState::Retry.can_transition_to(TaskState::Scheduled));
    }

    #[test]
    fn test_no_regression_from_terminal_states() {
        assert!(!TaskState::Completed.can_transition_to(TaskState::Running));
        assert!(!TaskState::Cancelled.can_transition_to(TaskState::Scheduled));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Scheduled));
        assert!(!TaskState::Running.can_transition_to(TaskState::Scheduled));
    }

    #[test]
    fn test_limits_is_empty() {
        assert!(Limits::default().is_empty());
        assert!(Limits {
            cpus: Some(String::new()),
            memory: None
        }
        .is_empty());
        assert!(!Limits {
            cpus: None,
            memory: Some("256m".into())
        }
        .is_empty());
    }

    #[test]
    fn test_task_serializes_spec_flat() {
        let task = Task::new("job-1", 0, TaskSpec::new("hello").with_run("echo hi"));
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["name"], "hello");
        assert_eq!(value["run"], "echo hi");
        assert_eq!(value["state"], "CREATED");

        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }
}
