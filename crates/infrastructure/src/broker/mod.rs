//! Broker providers.
//!
//! Both providers share [`deliver`], which runs the handler and decides what
//! happens to a message whose handler failed.

pub mod in_memory;
pub mod rabbitmq;

pub use in_memory::InMemoryBroker;
pub use rabbitmq::RabbitMqBroker;

use std::sync::Arc;

use orchestrator_core::{models::Message, traits::HandlerErrorPolicy, MessageHandler};
use tracing::{error, warn};

/// Outcome of delivering one message to a handler.
#[derive(Debug)]
pub(crate) enum Disposition {
    Handled,
    /// Publish this copy, with its redelivery count bumped, back to the queue.
    Requeue(Message),
    Dropped,
}

pub(crate) async fn deliver(
    queue: &str,
    message: Message,
    handler: &Arc<dyn MessageHandler>,
    policy: HandlerErrorPolicy,
    max_redeliveries: u32,
) -> Disposition {
    let retained = message.clone();
    let Err(e) = handler.handle(message).await else {
        metrics::counter!("orchestrator_messages_handled_total", "queue" => queue.to_string())
            .increment(1);
        return Disposition::Handled;
    };

    metrics::counter!("orchestrator_message_handler_errors_total", "queue" => queue.to_string())
        .increment(1);

    match policy {
        HandlerErrorPolicy::Requeue if !retained.is_retry_exhausted(max_redeliveries) => {
            warn!(
                queue,
                message_id = %retained.id,
                retry_count = retained.retry_count,
                error = %e,
                "message handler failed, requeueing"
            );
            let mut requeued = retained;
            requeued.increment_retry();
            Disposition::Requeue(requeued)
        }
        _ => {
            error!(
                queue,
                message_id = %retained.id,
                retry_count = retained.retry_count,
                error = %e,
                "message handler failed, dropping message"
            );
            Disposition::Dropped
        }
    }
}
