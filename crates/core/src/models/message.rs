use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Node, Task, TaskState};
use crate::errors::FailureKind;

/// Default queue for task assignment.
pub const DEFAULT_QUEUE: &str = "default";
/// Task status reports, consumed by the coordinator.
pub const STATUS_QUEUE: &str = "x-status";
/// Node heartbeats, consumed by the coordinator.
pub const HEARTBEAT_QUEUE: &str = "x-heartbeat";
/// Prefix of every coordinator-internal queue.
pub const RESERVED_QUEUE_PREFIX: &str = "x-";

/// Per-node control queue carrying cancellation requests.
pub fn node_queue(node_id: &str) -> String {
    format!("x-node.{node_id}")
}

pub fn is_reserved_queue(queue: &str) -> bool {
    queue.starts_with(RESERVED_QUEUE_PREFIX)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    /// Number of times the broker redelivered this message.
    pub retry_count: u32,
    /// Job id the message belongs to, when there is one.
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageType {
    TaskExecution(Task),
    TaskStatus(TaskStatusMessage),
    TaskControl(TaskControlMessage),
    NodeHeartbeat(Node),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusMessage {
    pub task_id: String,
    pub job_id: String,
    pub state: TaskState,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub timestamp: DateTime<Utc>,
}

impl TaskStatusMessage {
    pub fn new(task: &Task, state: TaskState, node_id: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            job_id: task.job_id.clone(),
            state,
            node_id: node_id.into(),
            result: None,
            error: None,
            failure_kind: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_result(mut self, result: Option<String>) -> Self {
        self.result = result;
        self
    }

    pub fn with_failure(mut self, error: impl Into<String>, kind: FailureKind) -> Self {
        self.error = Some(error.into());
        self.failure_kind = Some(kind);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskControlAction {
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskControlMessage {
    pub task_id: String,
    pub job_id: String,
    pub action: TaskControlAction,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(message_type: MessageType, correlation_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            timestamp: Utc::now(),
            retry_count: 0,
            correlation_id,
        }
    }

    pub fn task_execution(task: Task) -> Self {
        let job_id = task.job_id.clone();
        Self::new(MessageType::TaskExecution(task), Some(job_id))
    }

    pub fn task_status(status: TaskStatusMessage) -> Self {
        let job_id = status.job_id.clone();
        Self::new(MessageType::TaskStatus(status), Some(job_id))
    }

    pub fn cancel_task(task: &Task) -> Self {
        Self::new(
            MessageType::TaskControl(TaskControlMessage {
                task_id: task.id.clone(),
                job_id: task.job_id.clone(),
                action: TaskControlAction::Cancel,
                timestamp: Utc::now(),
            }),
            Some(task.job_id.clone()),
        )
    }

    pub fn node_heartbeat(node: Node) -> Self {
        Self::new(MessageType::NodeHeartbeat(node), None)
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    pub fn is_retry_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    pub fn serialize_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn deserialize_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn message_type_str(&self) -> &'static str {
        match &self.message_type {
            MessageType::TaskExecution(_) => "task_execution",
            MessageType::TaskStatus(_) => "task_status",
            MessageType::TaskControl(_) => "task_control",
            MessageType::NodeHeartbeat(_) => "node_heartbeat",
        }
    }
}
