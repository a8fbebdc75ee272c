//! Recording test doubles for the broker and runtime contracts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_core::{
    models::{Message, Task},
    traits::{Broker, MessageHandler, RunContext, Runtime, Subscription},
    OrchestratorError, OrchestratorResult,
};
use tokio_util::sync::CancellationToken;

/// Broker that records every publish and lets tests deliver messages to
/// subscribed handlers by hand.
#[derive(Clone)]
pub struct MockBroker {
    published: Arc<Mutex<Vec<(String, Message)>>>,
    handlers: Arc<Mutex<HashMap<String, Vec<(Arc<dyn MessageHandler>, CancellationToken)>>>>,
    fail_publish: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
    shutdown_calls: Arc<AtomicUsize>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            fail_publish: Arc::new(AtomicBool::new(false)),
            healthy: Arc::new(AtomicBool::new(true)),
            shutdown_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn published(&self) -> Vec<(String, Message)> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, queue: &str) -> Vec<Message> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Queues with at least one live subscription.
    pub fn subscribed_queues(&self) -> Vec<String> {
        let handlers = self.handlers.lock().unwrap();
        let mut queues: Vec<String> = handlers
            .iter()
            .filter(|(_, subs)| subs.iter().any(|(_, token)| !token.is_cancelled()))
            .map(|(queue, _)| queue.clone())
            .collect();
        queues.sort();
        queues
    }

    /// Hands `message` to the first live handler of `queue`.
    pub async fn deliver(&self, queue: &str, message: Message) -> OrchestratorResult<()> {
        let handler = {
            let handlers = self.handlers.lock().unwrap();
            handlers.get(queue).and_then(|subs| {
                subs.iter()
                    .find(|(_, token)| !token.is_cancelled())
                    .map(|(handler, _)| handler.clone())
            })
        };
        match handler {
            Some(handler) => handler.handle(message).await,
            None => Err(OrchestratorError::MessageQueue(format!(
                "no subscriber on {queue}"
            ))),
        }
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn publish(&self, queue: &str, message: &Message) -> OrchestratorResult<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(OrchestratorError::MessageQueue("publish failed".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((queue.to_string(), message.clone()));
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _concurrency: usize,
        handler: Arc<dyn MessageHandler>,
    ) -> OrchestratorResult<Subscription> {
        let token = CancellationToken::new();
        self.handlers
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push((handler, token.clone()));
        Ok(Subscription::new(queue, token))
    }

    async fn health_check(&self) -> OrchestratorResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrchestratorError::MessageQueue("broker unhealthy".to_string()))
        }
    }

    async fn shutdown(&self) -> OrchestratorResult<()> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted result of one [`MockRuntime`] execution.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed(String),
    Fail(String),
    Unsupported(&'static str),
    /// Runs until cancelled or the deadline passes.
    Block,
}

/// Runtime whose outcomes are scripted per task name. Unscripted runs
/// succeed with an empty result.
#[derive(Clone, Default)]
pub struct MockRuntime {
    outcomes: Arc<Mutex<HashMap<String, VecDeque<MockOutcome>>>>,
    runs: Arc<Mutex<Vec<Task>>>,
    stops: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every run takes at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Appends an outcome for the next run of the named task.
    pub fn script(&self, task_name: &str, outcome: MockOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(task_name.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn runs(&self) -> Vec<Task> {
        self.runs.lock().unwrap().clone()
    }

    pub fn run_count(&self, task_name: &str) -> usize {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.name() == task_name)
            .count()
    }

    pub fn stops(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }

    async fn interruptible(ctx: &RunContext, wait: Option<Duration>) -> OrchestratorResult<()> {
        let deadline = ctx.deadline();
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        let finished = async move {
            match wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = finished => Ok(()),
            _ = ctx.token().cancelled() => Err(OrchestratorError::Cancelled),
            _ = expired => Err(OrchestratorError::Timeout),
        }
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn run(&self, ctx: &RunContext, task: &mut Task) -> OrchestratorResult<()> {
        self.runs.lock().unwrap().push(task.clone());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(task.name())
            .and_then(VecDeque::pop_front)
            .unwrap_or(MockOutcome::Succeed(String::new()));

        if let MockOutcome::Block = outcome {
            return Self::interruptible(ctx, None).await;
        }
        if let Some(delay) = self.delay {
            Self::interruptible(ctx, Some(delay)).await?;
        }

        match outcome {
            MockOutcome::Succeed(result) => {
                task.result = Some(result);
                Ok(())
            }
            MockOutcome::Fail(reason) => Err(OrchestratorError::ExecutionFailed(reason)),
            MockOutcome::Unsupported(feature) => Err(OrchestratorError::UnsupportedFeature {
                runtime: "mock",
                feature,
            }),
            MockOutcome::Block => Err(OrchestratorError::Cancelled),
        }
    }

    async fn stop(&self, task: &Task) -> OrchestratorResult<()> {
        self.stops.lock().unwrap().push(task.id.clone());
        Ok(())
    }

    async fn health_check(&self) -> OrchestratorResult<()> {
        Ok(())
    }
}
