use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Up,
    Down,
}

/// A live worker registration, refreshed by heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    /// Queue name → consumer concurrency.
    pub queues: HashMap<String, usize>,
    pub capacity: usize,
    pub running_tasks: usize,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Node {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, queues: HashMap<String, usize>) -> Self {
        let now = Utc::now();
        let capacity = queues.values().sum();
        Self {
            id: id.into(),
            hostname: hostname.into(),
            queues,
            capacity,
            running_tasks: 0,
            status: NodeStatus::Up,
            started_at: now,
            last_heartbeat_at: now,
        }
    }

    /// Whether the last heartbeat is recent enough to consider the node live.
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == NodeStatus::Up && now - self.last_heartbeat_at <= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_sums_queue_concurrency() {
        let queues = HashMap::from([("default".to_string(), 2), ("gpu".to_string(), 1)]);
        let node = Node::new("node-1", "localhost", queues);
        assert_eq!(node.capacity, 3);
    }

    #[test]
    fn test_liveness() {
        let mut node = Node::new("node-1", "localhost", HashMap::new());
        let now = Utc::now();
        assert!(node.is_alive(now, Duration::seconds(30)));

        node.last_heartbeat_at = now - Duration::seconds(60);
        assert!(!node.is_alive(now, Duration::seconds(30)));

        node.last_heartbeat_at = now;
        node.status = NodeStatus::Down;
        assert!(!node.is_alive(now, Duration::seconds(30)));
    }
}
