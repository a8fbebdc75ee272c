//! Test data builders with sensible defaults.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use orchestrator_core::{
    errors::FailureKind,
    models::{JobSpec, Node, NodeStatus, Task, TaskSpec, TaskState, TaskStatusMessage},
};

/// Builder for [`Task`] records in a given state.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: Task::new(
                "test-job",
                0,
                TaskSpec::new("test_task").with_run("echo hello"),
            ),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn with_job_id(mut self, job_id: &str) -> Self {
        self.task.job_id = job_id.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.task.spec.name = name.to_string();
        self
    }

    pub fn with_position(mut self, position: usize) -> Self {
        self.task.position = position;
        self
    }

    pub fn with_spec(mut self, spec: TaskSpec) -> Self {
        self.task.spec = spec;
        self
    }

    pub fn with_run(mut self, run: &str) -> Self {
        self.task.spec.run = Some(run.to_string());
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.task.state = state;
        self
    }

    pub fn with_node(mut self, node_id: &str) -> Self {
        self.task.node_id = Some(node_id.to_string());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.task.retry_count = retry_count;
        self
    }

    pub fn with_predecessors(mut self, names: &[&str]) -> Self {
        self.task.predecessors = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`Node`] heartbeats.
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            node: Node::new(id, "test-host", HashMap::from([("default".to_string(), 1)])),
        }
    }

    pub fn with_queue(mut self, queue: &str, concurrency: usize) -> Self {
        self.node.queues.insert(queue.to_string(), concurrency);
        self.node.capacity = self.node.queues.values().sum();
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.node.status = status;
        self
    }

    pub fn with_running_tasks(mut self, running_tasks: usize) -> Self {
        self.node.running_tasks = running_tasks;
        self
    }

    pub fn with_last_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.node.last_heartbeat_at = at;
        self
    }

    pub fn build(self) -> Node {
        self.node
    }
}

/// Shorthands for common job shapes.
pub struct JobSpecs;

impl JobSpecs {
    /// One task writing `output` to the capture file.
    pub fn echo(output: &str) -> JobSpec {
        JobSpec::new("echo").with_task(
            TaskSpec::new("echo").with_run(format!("printf '{output}' > $ORCHESTRATOR_OUTPUT")),
        )
    }

    /// Tasks run one after another in declaration order.
    pub fn sequence(names: &[&str]) -> JobSpec {
        names.iter().fold(JobSpec::new("sequence"), |job, name| {
            job.with_task(TaskSpec::new(*name).with_run(format!("echo {name}")))
        })
    }
}

/// Status reports as a worker would publish them.
pub struct StatusMessages;

impl StatusMessages {
    pub fn running(task: &Task, node_id: &str) -> TaskStatusMessage {
        TaskStatusMessage::new(task, TaskState::Running, node_id)
    }

    pub fn completed(task: &Task, node_id: &str, result: &str) -> TaskStatusMessage {
        TaskStatusMessage::new(task, TaskState::Completed, node_id)
            .with_result(Some(result.to_string()))
    }

    pub fn failed(task: &Task, node_id: &str, error: &str, kind: FailureKind) -> TaskStatusMessage {
        TaskStatusMessage::new(task, TaskState::Failed, node_id).with_failure(error, kind)
    }

    pub fn cancelled(task: &Task, node_id: &str) -> TaskStatusMessage {
        TaskStatusMessage::new(task, TaskState::Cancelled, node_id)
    }
}
