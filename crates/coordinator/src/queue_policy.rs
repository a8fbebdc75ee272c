use std::sync::Arc;

use orchestrator_core::{
    config::QueuePolicyKind,
    models::{Node, Task},
};
use tracing::debug;

/// Chooses the queue a task is published to.
pub trait QueuePolicy: Send + Sync {
    /// `nodes` holds the workers currently considered alive.
    fn select_queue(&self, task: &Task, nodes: &[Node]) -> String;

    fn name(&self) -> &str;
}

/// The task's own `queue`, or the default queue.
pub struct NamedQueuePolicy {
    default_queue: String,
}

impl NamedQueuePolicy {
    pub fn new(default_queue: impl Into<String>) -> Self {
        Self {
            default_queue: default_queue.into(),
        }
    }
}

impl QueuePolicy for NamedQueuePolicy {
    fn select_queue(&self, task: &Task, _nodes: &[Node]) -> String {
        task.spec
            .queue
            .clone()
            .unwrap_or_else(|| self.default_queue.clone())
    }

    fn name(&self) -> &str {
        "Named"
    }
}

/// An explicit `queue` wins; otherwise the first task tag naming a queue
/// that some live node consumes, preferring the node with the most spare
/// capacity; otherwise the default queue.
pub struct CapabilityQueuePolicy {
    default_queue: String,
}

impl CapabilityQueuePolicy {
    pub fn new(default_queue: impl Into<String>) -> Self {
        Self {
            default_queue: default_queue.into(),
        }
    }
}

impl QueuePolicy for CapabilityQueuePolicy {
    fn select_queue(&self, task: &Task, nodes: &[Node]) -> String {
        if let Some(queue) = &task.spec.queue {
            return queue.clone();
        }

        let selected = task
            .spec
            .tags
            .iter()
            .filter_map(|tag| {
                nodes
                    .iter()
                    .filter(|node| node.queues.contains_key(tag))
                    .map(|node| node.capacity.saturating_sub(node.running_tasks))
                    .max()
                    .map(|spare| (tag, spare))
            })
            .max_by_key(|(_, spare)| *spare);

        match selected {
            Some((tag, spare)) => {
                debug!(task_id = %task.id, queue = %tag, spare, "matched task tag to queue");
                tag.clone()
            }
            None => self.default_queue.clone(),
        }
    }

    fn name(&self) -> &str {
        "Capability"
    }
}

pub fn create_queue_policy(kind: QueuePolicyKind, default_queue: &str) -> Arc<dyn QueuePolicy> {
    match kind {
        QueuePolicyKind::Named => Arc::new(NamedQueuePolicy::new(default_queue)),
        QueuePolicyKind::Capability => Arc::new(CapabilityQueuePolicy::new(default_queue)),
    }
}
