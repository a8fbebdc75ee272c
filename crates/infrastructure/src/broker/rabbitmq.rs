use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery, options::*, types::FieldTable, BasicProperties, Channel, Connection,
    ConnectionProperties, Queue,
};
use orchestrator_core::{
    config::RabbitMqConfig,
    models::Message,
    traits::{Broker, HandlerErrorPolicy, MessageHandler, Subscription},
    OrchestratorError, OrchestratorResult,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{deliver, Disposition};

/// RabbitMQ broker
///
/// Queues are durable and messages persistent. Every consumer gets its own
/// channel with `basic_qos` set to the configured prefetch count and acks
/// manually after its handler returns. A failed message is acked and a copy
/// with a bumped redelivery count is republished, so the count survives
/// redelivery.
pub struct RabbitMqBroker {
    connection: Connection,
    channel: Arc<Mutex<Channel>>,
    config: RabbitMqConfig,
    policy: HandlerErrorPolicy,
    max_redeliveries: u32,
    declared: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl RabbitMqBroker {
    pub async fn new(
        config: RabbitMqConfig,
        policy: HandlerErrorPolicy,
        max_redeliveries: u32,
    ) -> OrchestratorResult<Self> {
        let connect = Connection::connect(&config.url, ConnectionProperties::default());
        let connection =
            tokio::time::timeout(Duration::from_secs(config.connection_timeout_seconds), connect)
                .await
                .map_err(|_| {
                    OrchestratorError::MessageQueue("timed out connecting to RabbitMQ".to_string())
                })?
                .map_err(|e| {
                    OrchestratorError::MessageQueue(format!("failed to connect to RabbitMQ: {e}"))
                })?;

        let channel = connection.create_channel().await.map_err(|e| {
            OrchestratorError::MessageQueue(format!("failed to create channel: {e}"))
        })?;

        info!("connected to RabbitMQ");

        Ok(Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
            config,
            policy,
            max_redeliveries,
            declared: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        })
    }

    async fn declare_queue(channel: &Channel, queue_name: &str) -> OrchestratorResult<Queue> {
        let queue = channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                OrchestratorError::MessageQueue(format!("failed to declare queue {queue_name}: {e}"))
            })?;

        debug!(queue = queue_name, "queue declared");
        Ok(queue)
    }

    async fn ensure_queue(&self, channel: &Channel, queue: &str) -> OrchestratorResult<()> {
        let mut declared = self.declared.lock().await;
        if !declared.contains(queue) {
            Self::declare_queue(channel, queue).await?;
            declared.insert(queue.to_string());
        }
        Ok(())
    }

    async fn publish_on(channel: &Channel, queue: &str, message: &Message) -> OrchestratorResult<()> {
        let payload = message.serialize_bytes()?;

        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2), // 2 = persistent
            )
            .await
            .map_err(|e| {
                OrchestratorError::MessageQueue(format!("failed to publish to queue {queue}: {e}"))
            })?;

        confirm.await.map_err(|e| {
            OrchestratorError::MessageQueue(format!("publish confirmation failed: {e}"))
        })?;

        debug!(queue, message_id = %message.id, "message published");
        Ok(())
    }

    async fn settle(
        channel: &Channel,
        queue: &str,
        delivery: Delivery,
        handler: &Arc<dyn MessageHandler>,
        policy: HandlerErrorPolicy,
        max_redeliveries: u32,
    ) -> OrchestratorResult<()> {
        let message = match Message::deserialize_bytes(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                error!(queue, error = %e, "discarding undecodable message");
                channel
                    .basic_reject(delivery.delivery_tag, BasicRejectOptions { requeue: false })
                    .await
                    .map_err(|e| OrchestratorError::MessageQueue(format!("failed to reject: {e}")))?;
                return Ok(());
            }
        };

        if let Disposition::Requeue(message) =
            deliver(queue, message, handler, policy, max_redeliveries).await
        {
            Self::publish_on(channel, queue, &message).await?;
        }

        channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| OrchestratorError::MessageQueue(format!("failed to ack message: {e}")))
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn publish(&self, queue: &str, message: &Message) -> OrchestratorResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::MessageQueue(
                "broker has been shut down".to_string(),
            ));
        }
        let channel = self.channel.lock().await;
        self.ensure_queue(&channel, queue).await?;
        Self::publish_on(&channel, queue, message).await
    }

    async fn subscribe(
        &self,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn MessageHandler>,
    ) -> OrchestratorResult<Subscription> {
        let token = self.shutdown.child_token();

        for index in 0..concurrency.max(1) {
            let channel = self.connection.create_channel().await.map_err(|e| {
                OrchestratorError::MessageQueue(format!("failed to create channel: {e}"))
            })?;
            channel
                .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| OrchestratorError::MessageQueue(format!("failed to set qos: {e}")))?;
            Self::declare_queue(&channel, queue).await?;

            let consumer_tag = format!("{queue}-{}-{index}", uuid::Uuid::new_v4().simple());
            let mut consumer = channel
                .basic_consume(
                    queue,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    OrchestratorError::MessageQueue(format!("failed to create consumer: {e}"))
                })?;

            let handler = handler.clone();
            let token = token.clone();
            let queue = queue.to_string();
            let policy = self.policy;
            let max_redeliveries = self.max_redeliveries;

            tokio::spawn(async move {
                debug!(queue = %queue, consumer_tag = %consumer_tag, "consumer started");
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        next = consumer.next() => next,
                    };
                    match next {
                        Some(Ok(delivery)) => {
                            if let Err(e) = Self::settle(
                                &channel,
                                &queue,
                                delivery,
                                &handler,
                                policy,
                                max_redeliveries,
                            )
                            .await
                            {
                                error!(queue = %queue, error = %e, "failed to settle delivery");
                            }
                        }
                        Some(Err(e)) => {
                            error!(queue = %queue, error = %e, "consumer stream failed");
                            break;
                        }
                        None => break,
                    }
                }
                if let Err(e) = channel.close(200, "subscription closed").await {
                    warn!(queue = %queue, error = %e, "failed to close consumer channel");
                }
                debug!(queue = %queue, consumer_tag = %consumer_tag, "consumer stopped");
            });
        }

        info!(queue, concurrency, "subscribed to RabbitMQ queue");
        Ok(Subscription::new(queue, token))
    }

    async fn health_check(&self) -> OrchestratorResult<()> {
        if self.connection.status().connected() {
            Ok(())
        } else {
            Err(OrchestratorError::MessageQueue(
                "RabbitMQ connection is not open".to_string(),
            ))
        }
    }

    async fn shutdown(&self) -> OrchestratorResult<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| OrchestratorError::MessageQueue(format!("failed to close connection: {e}")))?;

        info!("RabbitMQ connection closed");
        Ok(())
    }
}
