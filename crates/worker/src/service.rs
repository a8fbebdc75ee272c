use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_core::{
    config::WorkerConfig,
    models::{
        node_queue, Limits, Message, MessageType, NodeStatus, TaskControlAction, DEFAULT_QUEUE,
    },
    traits::{Broker, MessageHandler, Runtime, Subscription},
    OrchestratorResult,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::components::{HeartbeatManager, TaskExecutionManager};
use crate::runtime::create_runtime;

/// Worker service builder
pub struct WorkerServiceBuilder {
    node_id: String,
    hostname: String,
    broker: Arc<dyn Broker>,
    runtime: Arc<dyn Runtime>,
    queues: HashMap<String, usize>,
    default_limits: Limits,
    heartbeat_interval: Duration,
    shutdown_grace: Duration,
}

impl WorkerServiceBuilder {
    pub fn new(broker: Arc<dyn Broker>, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            node_id: Uuid::new_v4().simple().to_string(),
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            broker,
            runtime,
            queues: HashMap::new(),
            default_limits: Limits::default(),
            heartbeat_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }

    /// Builder preloaded from the `worker` configuration section, with the
    /// runtime it selects.
    pub fn from_config(config: &WorkerConfig, broker: Arc<dyn Broker>) -> Self {
        let mut builder = Self::new(broker, create_runtime(config))
            .default_limits(config.limits.clone())
            .heartbeat_interval(Duration::from_secs(config.heartbeat_interval_seconds))
            .shutdown_grace(Duration::from_secs(config.shutdown_grace_seconds));
        if let Some(name) = &config.name {
            builder = builder.node_id(name.clone());
        }
        for (queue, concurrency) in &config.queues {
            builder = builder.queue(queue.clone(), *concurrency);
        }
        builder
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Subscribes `concurrency` consumers to `queue`.
    pub fn queue(mut self, queue: impl Into<String>, concurrency: usize) -> Self {
        self.queues.insert(queue.into(), concurrency);
        self
    }

    pub fn default_limits(mut self, limits: Limits) -> Self {
        self.default_limits = limits;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> WorkerService {
        let mut queues = self.queues;
        if queues.is_empty() {
            queues.insert(DEFAULT_QUEUE.to_string(), 1);
        }

        let executions = Arc::new(TaskExecutionManager::new(
            self.node_id.clone(),
            self.runtime.clone(),
            self.broker.clone(),
            self.default_limits,
        ));
        let heartbeat = Arc::new(HeartbeatManager::new(
            self.node_id.clone(),
            self.hostname,
            queues.clone(),
            self.broker.clone(),
            executions.clone(),
            self.heartbeat_interval,
        ));

        WorkerService {
            node_id: self.node_id,
            broker: self.broker,
            runtime: self.runtime,
            queues,
            shutdown_grace: self.shutdown_grace,
            executions,
            heartbeat,
            subscriptions: Mutex::new(Vec::new()),
            heartbeat_task: Mutex::new(None),
            heartbeat_token: CancellationToken::new(),
            is_running: AtomicBool::new(false),
        }
    }
}

/// Consumes task assignments from the configured queues and control
/// messages from the node's own queue.
pub struct WorkerService {
    node_id: String,
    broker: Arc<dyn Broker>,
    runtime: Arc<dyn Runtime>,
    queues: HashMap<String, usize>,
    shutdown_grace: Duration,
    executions: Arc<TaskExecutionManager>,
    heartbeat: Arc<HeartbeatManager>,
    subscriptions: Mutex<Vec<Subscription>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_token: CancellationToken,
    is_running: AtomicBool,
}

impl WorkerService {
    pub fn builder(broker: Arc<dyn Broker>, runtime: Arc<dyn Runtime>) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(broker, runtime)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn queues(&self) -> &HashMap<String, usize> {
        &self.queues
    }

    pub fn running_count(&self) -> usize {
        self.executions.running_count()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> OrchestratorResult<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(node_id = %self.node_id, "worker already started");
            return Ok(());
        }

        info!(
            "Starting worker: node_id={}, runtime={}, queues={:?}",
            self.node_id,
            self.runtime.name(),
            self.queues
        );

        if let Err(e) = self.subscribe_all().await {
            self.cancel_subscriptions().await;
            self.is_running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let handle = self.heartbeat.start(self.heartbeat_token.child_token());
        *self.heartbeat_task.lock().await = Some(handle);

        info!(node_id = %self.node_id, "worker started");
        Ok(())
    }

    async fn subscribe_all(&self) -> OrchestratorResult<()> {
        let task_handler: Arc<dyn MessageHandler> = Arc::new(TaskHandler {
            executions: self.executions.clone(),
        });
        let mut queues: Vec<_> = self.queues.iter().collect();
        queues.sort();
        for (queue, concurrency) in queues {
            let subscription = self
                .broker
                .subscribe(queue, *concurrency, task_handler.clone())
                .await?;
            self.subscriptions.lock().await.push(subscription);
        }

        let control_handler: Arc<dyn MessageHandler> = Arc::new(ControlHandler {
            executions: self.executions.clone(),
        });
        let subscription = self
            .broker
            .subscribe(&node_queue(&self.node_id), 1, control_handler)
            .await?;
        self.subscriptions.lock().await.push(subscription);
        Ok(())
    }

    async fn cancel_subscriptions(&self) {
        for subscription in self.subscriptions.lock().await.drain(..) {
            debug!(queue = subscription.queue(), "cancelling subscription");
            subscription.cancel();
        }
    }

    /// Stops consuming, gives in-flight tasks the grace period to finish and
    /// then cancels the rest. Calling it again is a no-op.
    pub async fn stop(&self) -> OrchestratorResult<()> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            debug!(node_id = %self.node_id, "worker not running");
            return Ok(());
        }
        info!(node_id = %self.node_id, "stopping worker");

        self.cancel_subscriptions().await;

        if !self.executions.wait_idle(self.shutdown_grace).await {
            warn!(
                "Grace period elapsed with {} tasks in flight, cancelling them",
                self.executions.running_count()
            );
            self.executions.cancel_all();
            if !self.executions.wait_idle(self.shutdown_grace).await {
                warn!(
                    running = self.executions.running_count(),
                    "tasks still unwinding after cancellation"
                );
            }
        }

        self.heartbeat_token.cancel();
        if let Some(handle) = self.heartbeat_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "heartbeat task ended abnormally");
            }
        }
        if let Err(e) = self.heartbeat.send_heartbeat(NodeStatus::Down).await {
            debug!(error = %e, "final heartbeat not delivered");
        }

        info!(node_id = %self.node_id, "worker stopped");
        Ok(())
    }

    pub async fn health_check(&self) -> OrchestratorResult<()> {
        self.runtime.health_check().await?;
        self.broker.health_check().await
    }

    /// Cancels one of this worker's executions.
    pub async fn cancel_task(&self, task_id: &str) -> OrchestratorResult<()> {
        self.executions.cancel(task_id).await
    }
}

struct TaskHandler {
    executions: Arc<TaskExecutionManager>,
}

#[async_trait]
impl MessageHandler for TaskHandler {
    async fn handle(&self, message: Message) -> OrchestratorResult<()> {
        let kind = message.message_type_str();
        match message.message_type {
            MessageType::TaskExecution(task) => self.executions.execute(task).await,
            _ => {
                warn!(message_id = %message.id, kind, "ignoring unexpected message on task queue");
                Ok(())
            }
        }
    }
}

struct ControlHandler {
    executions: Arc<TaskExecutionManager>,
}

#[async_trait]
impl MessageHandler for ControlHandler {
    async fn handle(&self, message: Message) -> OrchestratorResult<()> {
        match message.message_type {
            MessageType::TaskControl(control) => match control.action {
                TaskControlAction::Cancel => self.executions.cancel(&control.task_id).await,
            },
            _ => {
                warn!(
                    message_id = %message.id,
                    kind = message.message_type_str(),
                    "ignoring unexpected message on control queue"
                );
                Ok(())
            }
        }
    }
}
