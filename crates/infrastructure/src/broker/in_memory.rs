use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use orchestrator_core::{
    models::Message,
    traits::{Broker, HandlerErrorPolicy, MessageHandler, Subscription},
    OrchestratorError, OrchestratorResult,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{deliver, Disposition};

#[derive(Debug, Clone)]
struct QueueChannels {
    sender: mpsc::UnboundedSender<Message>,
    /// Shared by every consumer of the queue; whoever holds the lock receives
    /// the next message.
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
}

/// In-process broker built on tokio channels.
///
/// Each queue is an unbounded channel whose receiver is shared by all of the
/// queue's consumers, so every message reaches exactly one of them. Messages
/// published before the first subscription are buffered.
#[derive(Debug)]
pub struct InMemoryBroker {
    queues: Arc<RwLock<HashMap<String, QueueChannels>>>,
    policy: HandlerErrorPolicy,
    max_redeliveries: u32,
    shutdown: CancellationToken,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_policy(HandlerErrorPolicy::Requeue, 3)
    }

    pub fn with_policy(policy: HandlerErrorPolicy, max_redeliveries: u32) -> Self {
        info!(?policy, max_redeliveries, "creating in-memory broker");
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            policy,
            max_redeliveries,
            shutdown: CancellationToken::new(),
        }
    }

    async fn get_or_create_queue(&self, queue: &str) -> QueueChannels {
        if let Some(channels) = self.queues.read().await.get(queue) {
            return channels.clone();
        }

        let mut queues = self.queues.write().await;
        queues
            .entry(queue.to_string())
            .or_insert_with(|| {
                debug!(queue, "creating in-memory queue");
                let (sender, receiver) = mpsc::unbounded_channel();
                QueueChannels {
                    sender,
                    receiver: Arc::new(Mutex::new(receiver)),
                }
            })
            .clone()
    }

    fn ensure_running(&self) -> OrchestratorResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::MessageQueue(
                "broker has been shut down".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, queue: &str, message: &Message) -> OrchestratorResult<()> {
        self.ensure_running()?;
        let channels = self.get_or_create_queue(queue).await;
        channels.sender.send(message.clone()).map_err(|e| {
            OrchestratorError::MessageQueue(format!("failed to publish to queue {queue}: {e}"))
        })?;
        debug!(queue, message_id = %message.id, "message published");
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn MessageHandler>,
    ) -> OrchestratorResult<Subscription> {
        self.ensure_running()?;
        let channels = self.get_or_create_queue(queue).await;
        let token = self.shutdown.child_token();

        for consumer in 0..concurrency.max(1) {
            let channels = channels.clone();
            let handler = handler.clone();
            let token = token.clone();
            let queue = queue.to_string();
            let policy = self.policy;
            let max_redeliveries = self.max_redeliveries;

            tokio::spawn(async move {
                debug!(queue = %queue, consumer, "consumer started");
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        message = async { channels.receiver.lock().await.recv().await } => message,
                    };
                    let Some(message) = next else {
                        break;
                    };

                    match deliver(&queue, message, &handler, policy, max_redeliveries).await {
                        Disposition::Requeue(message) => {
                            if channels.sender.send(message).is_err() {
                                break;
                            }
                        }
                        Disposition::Handled | Disposition::Dropped => {}
                    }
                }
                debug!(queue = %queue, consumer, "consumer stopped");
            });
        }

        info!(queue, concurrency, "subscribed to in-memory queue");
        Ok(Subscription::new(queue, token))
    }

    async fn health_check(&self) -> OrchestratorResult<()> {
        self.ensure_running()
    }

    async fn shutdown(&self) -> OrchestratorResult<()> {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            info!("in-memory broker shut down");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::models::{MessageType, Node, Task, TaskSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Forward(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, message: Message) -> OrchestratorResult<()> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    struct AlwaysFail(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler for AlwaysFail {
        async fn handle(&self, _message: Message) -> OrchestratorResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(OrchestratorError::Internal("boom".into()))
        }
    }

    fn heartbeat() -> Message {
        Message::node_heartbeat(Node::new("node-1", "localhost", HashMap::new()))
    }

    #[tokio::test]
    async fn test_messages_published_before_subscribe_are_buffered() {
        let broker = InMemoryBroker::new();
        let task = Task::new("job-1", 0, TaskSpec::new("a"));
        broker
            .publish("default", &Message::task_execution(task.clone()))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .subscribe("default", 1, Arc::new(Forward(tx)))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match received.message_type {
            MessageType::TaskExecution(received) => assert_eq!(received.id, task.id),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_competing_consumers_receive_each_message_once() {
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .subscribe("work", 4, Arc::new(Forward(tx)))
            .await
            .unwrap();

        for _ in 0..20 {
            broker.publish("work", &heartbeat()).await.unwrap();
        }

        let mut ids = std::collections::HashSet::new();
        for _ in 0..20 {
            let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(ids.insert(message.id));
        }
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_failed_messages_are_requeued_up_to_the_cap() {
        let broker = InMemoryBroker::with_policy(HandlerErrorPolicy::Requeue, 2);
        let attempts = Arc::new(AtomicUsize::new(0));
        broker
            .subscribe("q", 1, Arc::new(AlwaysFail(attempts.clone())))
            .await
            .unwrap();
        broker.publish("q", &heartbeat()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_drop_policy_delivers_once() {
        let broker = InMemoryBroker::with_policy(HandlerErrorPolicy::Drop, 5);
        let attempts = Arc::new(AtomicUsize::new(0));
        broker
            .subscribe("q", 1, Arc::new(AlwaysFail(attempts.clone())))
            .await
            .unwrap();
        broker.publish("q", &heartbeat()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops_consuming() {
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = broker
            .subscribe("q", 1, Arc::new(Forward(tx)))
            .await
            .unwrap();
        subscription.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        broker.publish("q", &heartbeat()).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .map(|m| m.is_none())
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_publish() {
        let broker = InMemoryBroker::new();
        broker.health_check().await.unwrap();
        broker.shutdown().await.unwrap();
        broker.shutdown().await.unwrap();
        assert!(broker.health_check().await.is_err());
        assert!(broker.publish("q", &heartbeat()).await.is_err());
    }
}
