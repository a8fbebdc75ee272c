use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{models::Message, OrchestratorResult};

/// What a broker does with a message whose handler returned an error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorPolicy {
    /// Redeliver until the message's redelivery count reaches the cap.
    #[default]
    Requeue,
    Drop,
}

/// Consumer callback invoked once per delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> OrchestratorResult<()>;
}

/// Handle to an active subscription. Cancelling stops the consumer loops;
/// messages already being handled run to completion.
#[derive(Debug, Clone)]
pub struct Subscription {
    queue: String,
    token: CancellationToken,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            queue: queue.into(),
            token,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Message queue abstraction shared by the coordinator and worker tiers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes a message to the named queue, creating it when needed.
    async fn publish(&self, queue: &str, message: &Message) -> OrchestratorResult<()>;

    /// Starts `concurrency` competing consumers on the queue.
    async fn subscribe(
        &self,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn MessageHandler>,
    ) -> OrchestratorResult<Subscription>;

    async fn health_check(&self) -> OrchestratorResult<()>;

    /// Cancels every subscription and releases connections.
    async fn shutdown(&self) -> OrchestratorResult<()>;
}
