use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orchestrator_core::{
    models::{Message, Node, NodeStatus, HEARTBEAT_QUEUE},
    traits::Broker,
    OrchestratorResult,
};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::TaskExecutionManager;

/// Publishes the node's registration to the heartbeat queue on a fixed
/// interval, starting immediately.
pub struct HeartbeatManager {
    node: Node,
    broker: Arc<dyn Broker>,
    executions: Arc<TaskExecutionManager>,
    heartbeat_interval: Duration,
}

impl HeartbeatManager {
    pub fn new(
        node_id: impl Into<String>,
        hostname: impl Into<String>,
        queues: HashMap<String, usize>,
        broker: Arc<dyn Broker>,
        executions: Arc<TaskExecutionManager>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            node: Node::new(node_id, hostname, queues),
            broker,
            executions,
            heartbeat_interval,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    /// Current view of this node.
    pub fn snapshot(&self, status: NodeStatus) -> Node {
        let mut node = self.node.clone();
        node.status = status;
        node.running_tasks = self.executions.running_count();
        node.last_heartbeat_at = Utc::now();
        node
    }

    pub async fn send_heartbeat(&self, status: NodeStatus) -> OrchestratorResult<()> {
        let node = self.snapshot(status);
        debug!(
            node_id = %node.id,
            running_tasks = node.running_tasks,
            "sending heartbeat"
        );
        self.broker
            .publish(HEARTBEAT_QUEUE, &Message::node_heartbeat(node))
            .await
    }

    /// Spawns the heartbeat loop; it exits when `shutdown` is cancelled.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(manager.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Heartbeat task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.send_heartbeat(NodeStatus::Up).await {
                            error!("Failed to send heartbeat: {}", e);
                        }
                    }
                }
            }
        })
    }
}
