use std::sync::Arc;

use async_trait::async_trait;
use orchestrator_core::{
    models::{Message, MessageType},
    traits::MessageHandler,
    OrchestratorResult,
};
use tracing::warn;

use crate::controller::JobController;

/// Consumes worker status reports and heartbeats.
pub struct StateListener {
    controller: Arc<JobController>,
}

impl StateListener {
    pub fn new(controller: Arc<JobController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl MessageHandler for StateListener {
    async fn handle(&self, message: Message) -> OrchestratorResult<()> {
        let kind = message.message_type_str();
        match message.message_type {
            MessageType::TaskStatus(status) => self.controller.on_task_status(status).await,
            MessageType::NodeHeartbeat(node) => self.controller.on_heartbeat(node).await,
            _ => {
                warn!(message_id = %message.id, kind, "ignoring unexpected message");
                Ok(())
            }
        }
    }
}
