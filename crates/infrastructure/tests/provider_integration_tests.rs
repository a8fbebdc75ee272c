//! Provider tests against real PostgreSQL and RabbitMQ containers.
//!
//! Run with `cargo test -p orchestrator-infrastructure -- --ignored`; Docker
//! is required.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use orchestrator_core::{
    models::{Job, JobSpec, JobState, Message, MessageType, Node, Task, TaskSpec},
    traits::{Broker, Datastore, HandlerErrorPolicy, MessageHandler},
    OrchestratorError, OrchestratorResult,
};
use orchestrator_infrastructure::{PostgresDatastore, RabbitMqBroker};
use orchestrator_testing_utils::{PostgresTestContainer, RabbitMqTestContainer};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

struct Forward(mpsc::UnboundedSender<Message>);

#[async_trait]
impl MessageHandler for Forward {
    async fn handle(&self, message: Message) -> OrchestratorResult<()> {
        let _ = self.0.send(message);
        Ok(())
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_datastore_roundtrip() -> Result<()> {
    let container = PostgresTestContainer::start().await?;
    let config = container.config.clone();

    let mut attempts = 0;
    let store = loop {
        match PostgresDatastore::connect(&config).await {
            Ok(store) => break store,
            Err(_) if attempts < 30 => {
                attempts += 1;
                sleep(Duration::from_millis(500)).await;
            }
            Err(e) => return Err(e.into()),
        }
    };
    store.health_check().await?;

    let mut job = Job::new(JobSpec::new("pg").with_task(TaskSpec::new("a").with_run("echo a")));
    store.save_job(&job).await?;
    job.state = JobState::Running;
    store.save_job(&job).await?;
    let loaded = store.get_job(&job.id).await?.expect("job");
    assert_eq!(loaded.state, JobState::Running);
    assert_eq!(loaded.tasks.len(), 1);

    let second = Task::new(&job.id, 1, TaskSpec::new("b"));
    let first = Task::new(&job.id, 0, TaskSpec::new("a"));
    store.save_task(&second).await?;
    store.save_task(&first).await?;
    let tasks = store.list_tasks(&job.id).await?;
    assert_eq!(tasks, vec![first.clone(), second]);
    assert_eq!(store.get_task(&first.id).await?, Some(first));

    store
        .save_node(&Node::new("node-1", "host", Default::default()))
        .await?;
    assert_eq!(store.list_nodes().await?.len(), 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_rabbitmq_broker_publish_subscribe() -> Result<()> {
    let container = RabbitMqTestContainer::start().await?;
    sleep(Duration::from_secs(5)).await;
    let config = container.config.clone();
    let broker = RabbitMqBroker::new(config, HandlerErrorPolicy::Requeue, 3).await?;
    broker.health_check().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = broker
        .subscribe("default", 2, Arc::new(Forward(tx)))
        .await?;

    let task = Task::new("job-1", 0, TaskSpec::new("a").with_run("echo a"));
    broker
        .publish("default", &Message::task_execution(task.clone()))
        .await?;

    let received = timeout(Duration::from_secs(10), rx.recv())
        .await?
        .expect("message");
    match received.message_type {
        MessageType::TaskExecution(received) => assert_eq!(received, task),
        other => panic!("unexpected message: {other:?}"),
    }

    subscription.cancel();
    broker.shutdown().await?;
    Ok(())
}

/// Fails the first delivery of every message.
struct FailFirst(mpsc::UnboundedSender<Message>);

#[async_trait]
impl MessageHandler for FailFirst {
    async fn handle(&self, message: Message) -> OrchestratorResult<()> {
        let retry_count = message.retry_count;
        let _ = self.0.send(message);
        if retry_count == 0 {
            return Err(OrchestratorError::Internal("first attempt".into()));
        }
        Ok(())
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_rabbitmq_requeues_failed_message() -> Result<()> {
    let container = RabbitMqTestContainer::start().await?;
    sleep(Duration::from_secs(5)).await;
    let broker =
        RabbitMqBroker::new(container.config.clone(), HandlerErrorPolicy::Requeue, 3).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = broker
        .subscribe("retries", 1, Arc::new(FailFirst(tx)))
        .await?;

    let task = Task::new("job-1", 0, TaskSpec::new("a").with_run("echo a"));
    let message = Message::task_execution(task);
    broker.publish("retries", &message).await?;

    let first = timeout(Duration::from_secs(10), rx.recv()).await?.expect("first");
    let second = timeout(Duration::from_secs(10), rx.recv()).await?.expect("second");
    assert_eq!(first.retry_count, 0);
    assert_eq!(second.retry_count, 1);
    assert_eq!(second.id, message.id);

    // Both deliveries were acked, nothing is left to redeliver.
    assert!(timeout(Duration::from_secs(2), rx.recv()).await.is_err());

    subscription.cancel();
    broker.shutdown().await?;
    Ok(())
}
