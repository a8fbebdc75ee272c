use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use orchestrator_core::{
    config::CoordinatorConfig,
    middleware::{
        Handler, JobEvent, JobEventType, MiddlewareChain, NodeEvent, TaskEvent,
    },
    models::{
        node_queue, Job, JobSpec, JobState, Message, Node, Task, TaskState, TaskStatusMessage,
    },
    traits::{Broker, Datastore},
    OrchestratorError, OrchestratorResult,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dependency_checker::DependencyChecker;
use crate::job_locks::JobLocks;
use crate::queue_policy::{create_queue_policy, QueuePolicy};
use crate::retry_service::RetryService;

/// Middleware chains wrapped around job, task and node persistence.
#[derive(Debug, Clone, Default)]
pub struct Middlewares {
    pub job: MiddlewareChain<JobEvent>,
    pub task: MiddlewareChain<TaskEvent>,
    pub node: MiddlewareChain<NodeEvent>,
}

struct PersistJob {
    datastore: Arc<dyn Datastore>,
}

#[async_trait]
impl Handler<JobEvent> for PersistJob {
    async fn handle(&self, event: &mut JobEvent) -> OrchestratorResult<()> {
        match event.event_type {
            JobEventType::StateChange => self.datastore.save_job(&event.job).await,
            JobEventType::Read => Ok(()),
        }
    }
}

struct PersistTask {
    datastore: Arc<dyn Datastore>,
}

#[async_trait]
impl Handler<TaskEvent> for PersistTask {
    async fn handle(&self, event: &mut TaskEvent) -> OrchestratorResult<()> {
        self.datastore.save_task(&event.task).await
    }
}

struct PersistNode {
    datastore: Arc<dyn Datastore>,
}

#[async_trait]
impl Handler<NodeEvent> for PersistNode {
    async fn handle(&self, event: &mut NodeEvent) -> OrchestratorResult<()> {
        self.datastore.save_node(&event.node).await
    }
}

/// Job and task state machine.
///
/// Every event of one job runs under that job's lock, so status updates for
/// sibling tasks never interleave. All writes pass through the middleware
/// chains before they reach the datastore.
pub struct JobController {
    datastore: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
    queue_policy: Arc<dyn QueuePolicy>,
    retry: RetryService,
    node_timeout: chrono::Duration,
    locks: JobLocks,
    jobs: Arc<dyn Handler<JobEvent>>,
    tasks: Arc<dyn Handler<TaskEvent>>,
    nodes: Arc<dyn Handler<NodeEvent>>,
    shutdown: CancellationToken,
}

impl JobController {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        broker: Arc<dyn Broker>,
        config: &CoordinatorConfig,
        middlewares: &Middlewares,
    ) -> Self {
        let jobs = middlewares.job.build(Arc::new(PersistJob {
            datastore: datastore.clone(),
        }));
        let tasks = middlewares.task.build(Arc::new(PersistTask {
            datastore: datastore.clone(),
        }));
        let nodes = middlewares.node.build(Arc::new(PersistNode {
            datastore: datastore.clone(),
        }));

        Self {
            datastore,
            broker,
            queue_policy: create_queue_policy(config.queue_policy, &config.default_queue),
            retry: RetryService::new(config.retry.clone()),
            node_timeout: chrono::Duration::seconds(config.node_timeout_seconds as i64),
            locks: JobLocks::new(),
            jobs,
            tasks,
            nodes,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_queue_policy(mut self, policy: Arc<dyn QueuePolicy>) -> Self {
        self.queue_policy = policy;
        self
    }

    /// Drops retries still waiting out their backoff.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Validates and persists a job, then schedules its root tasks.
    pub async fn submit(&self, spec: JobSpec) -> OrchestratorResult<Job> {
        let predecessors = DependencyChecker::validate(&spec)?;
        let job = Job::new(spec);
        let _guard = self.locks.lock(&job.id).await;

        let mut job = self.save_job(job).await?;
        let mut tasks = Vec::with_capacity(job.tasks.len());
        for (position, (spec, predecessors)) in
            job.tasks.iter().cloned().zip(predecessors).enumerate()
        {
            let mut task = Task::new(&job.id, position, spec);
            task.predecessors = predecessors;
            tasks.push(self.save_task(task).await?);
        }

        job.state = JobState::Running;
        job.started_at = Some(Utc::now());
        let job = self.save_job(job).await?;

        metrics::counter!("orchestrator_jobs_submitted_total").increment(1);
        info!(
            "Job {} ({}) submitted with {} tasks",
            job.id,
            job.name,
            tasks.len()
        );

        self.schedule_ready(&tasks).await?;
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> OrchestratorResult<Job> {
        let job = self
            .datastore
            .get_job(id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound { id: id.to_string() })?;
        let mut event = JobEvent::read(job);
        self.jobs.handle(&mut event).await?;
        Ok(event.job)
    }

    pub async fn list_jobs(&self) -> OrchestratorResult<Vec<Job>> {
        self.datastore.list_jobs().await
    }

    pub async fn list_tasks(&self, job_id: &str) -> OrchestratorResult<Vec<Task>> {
        self.datastore.list_tasks(job_id).await
    }

    pub async fn list_nodes(&self) -> OrchestratorResult<Vec<Node>> {
        self.datastore.list_nodes().await
    }

    /// Cancels a job that has not finished yet, along with its open tasks.
    pub async fn cancel_job(&self, id: &str) -> OrchestratorResult<Job> {
        let _guard = self.locks.lock(id).await;
        let job = self
            .datastore
            .get_job(id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound { id: id.to_string() })?;
        if !job.state.can_transition_to(JobState::Cancelled) {
            return Err(OrchestratorError::InvalidJobTransition {
                id: job.id,
                from: job.state,
                to: JobState::Cancelled,
            });
        }
        info!(job_id = %job.id, "cancelling job");
        self.finish_job(job, JobState::Cancelled, None, None).await
    }

    pub async fn on_heartbeat(&self, node: Node) -> OrchestratorResult<()> {
        debug!(
            node_id = %node.id,
            status = ?node.status,
            running = node.running_tasks,
            "heartbeat received"
        );
        let mut event = NodeEvent::heartbeat(node);
        self.nodes.handle(&mut event).await
    }

    /// Applies a status report from a worker.
    ///
    /// Reports for unknown tasks, for finished jobs and reports that would
    /// move a task backwards are dropped; redeliveries therefore have no
    /// effect.
    #[instrument(skip(self, status), fields(task_id = %status.task_id, job_id = %status.job_id, state = status.state.as_str()))]
    pub async fn on_task_status(&self, status: TaskStatusMessage) -> OrchestratorResult<()> {
        let _guard = self.locks.lock(&status.job_id).await;

        let Some(mut task) = self.datastore.get_task(&status.task_id).await? else {
            warn!(task_id = %status.task_id, "status update for unknown task");
            return Ok(());
        };
        if task.job_id != status.job_id {
            warn!(
                task_id = %task.id,
                job_id = %status.job_id,
                "status update names the wrong job"
            );
            return Ok(());
        }
        let Some(job) = self.datastore.get_job(&task.job_id).await? else {
            warn!(job_id = %task.job_id, "status update for unknown job");
            return Ok(());
        };
        if job.is_terminal() {
            debug!(
                job_id = %job.id,
                task_id = %task.id,
                state = status.state.as_str(),
                "job already finished, ignoring status update"
            );
            return Ok(());
        }
        if !task.state.can_transition_to(status.state) {
            warn!(
                "Ignoring status update for task {}: {} -> {}",
                task.id,
                task.state.as_str(),
                status.state.as_str()
            );
            return Ok(());
        }

        task.node_id = Some(status.node_id.clone());
        match status.state {
            TaskState::Running => {
                task.state = TaskState::Running;
                task.started_at = Some(status.timestamp);
                self.save_task(task).await?;
                Ok(())
            }
            TaskState::Completed => self.complete_task(job, task, status).await,
            TaskState::Failed => self.fail_task(job, task, status).await,
            TaskState::Cancelled => {
                task.state = TaskState::Cancelled;
                task.completed_at = Some(status.timestamp);
                self.save_task(task).await?;
                self.finish_job(job, JobState::Cancelled, None, None).await?;
                Ok(())
            }
            other => {
                warn!(
                    task_id = %task.id,
                    state = other.as_str(),
                    "workers do not report this state"
                );
                Ok(())
            }
        }
    }

    async fn complete_task(
        &self,
        job: Job,
        mut task: Task,
        status: TaskStatusMessage,
    ) -> OrchestratorResult<()> {
        task.state = TaskState::Completed;
        task.result = status.result;
        task.error = None;
        task.failure_kind = None;
        task.completed_at = Some(status.timestamp);
        let task = self.save_task(task).await?;
        metrics::counter!("orchestrator_tasks_finished_total", "state" => "COMPLETED").increment(1);
        debug!(job_id = %job.id, task_id = %task.id, "task completed");

        let tasks = self.datastore.list_tasks(&job.id).await?;
        if DependencyChecker::all_completed(&tasks) {
            let result = tasks
                .iter()
                .max_by_key(|t| t.position)
                .and_then(|t| t.result.clone());
            self.finish_job(job, JobState::Completed, result, None)
                .await?;
            return Ok(());
        }
        self.schedule_ready(&tasks).await
    }

    async fn fail_task(
        &self,
        job: Job,
        mut task: Task,
        status: TaskStatusMessage,
    ) -> OrchestratorResult<()> {
        let kind = status.failure_kind;
        let error = status
            .error
            .unwrap_or_else(|| "task failed without a reason".to_string());

        task.state = TaskState::Failed;
        task.error = Some(error.clone());
        task.failure_kind = kind;
        task.completed_at = Some(status.timestamp);
        let mut task = self.save_task(task).await?;
        metrics::counter!("orchestrator_tasks_finished_total", "state" => "FAILED").increment(1);

        if !self.retry.should_retry(&task, kind) {
            info!(
                "Task {} of job {} failed, failing the job: {}",
                task.id, job.id, error
            );
            self.finish_job(job, JobState::Failed, None, Some(error))
                .await?;
            return Ok(());
        }

        let delay = self.retry.backoff(task.retry_count);
        task.state = TaskState::Retry;
        task.retry_count += 1;
        task.started_at = None;
        task.completed_at = None;
        let task = self.save_task(task).await?;
        metrics::counter!("orchestrator_task_retries_total").increment(1);
        info!(
            "Task {} failed, retry {}/{} in {:?}: {}",
            task.id,
            task.retry_count,
            self.retry.limit(&task),
            delay,
            error
        );

        let nodes = self.live_nodes().await?;
        self.schedule(task, &nodes, delay).await?;
        Ok(())
    }

    /// Moves the job to a terminal state. Failed and cancelled jobs take
    /// their open tasks down with them.
    async fn finish_job(
        &self,
        mut job: Job,
        state: JobState,
        result: Option<String>,
        error: Option<String>,
    ) -> OrchestratorResult<Job> {
        if !job.state.can_transition_to(state) {
            warn!(
                job_id = %job.id,
                from = job.state.as_str(),
                to = state.as_str(),
                "ignoring job transition"
            );
            return Ok(job);
        }

        job.state = state;
        job.result = result;
        job.error = error;
        job.completed_at = Some(Utc::now());
        let job = self.save_job(job).await?;
        metrics::counter!("orchestrator_jobs_finished_total", "state" => state.as_str())
            .increment(1);
        info!(job_id = %job.id, state = state.as_str(), "job finished");

        if state != JobState::Completed {
            self.cancel_open_tasks(&job.id).await?;
        }
        Ok(job)
    }

    async fn cancel_open_tasks(&self, job_id: &str) -> OrchestratorResult<()> {
        for mut task in self.datastore.list_tasks(job_id).await? {
            if task.is_terminal() {
                continue;
            }
            if task.state == TaskState::Running {
                if let Some(node_id) = &task.node_id {
                    let queue = node_queue(node_id);
                    if let Err(e) = self.broker.publish(&queue, &Message::cancel_task(&task)).await
                    {
                        warn!(task_id = %task.id, error = %e, "failed to send cancel request");
                    }
                }
            }
            task.state = TaskState::Cancelled;
            task.completed_at = Some(Utc::now());
            self.save_task(task).await?;
        }
        Ok(())
    }

    async fn schedule_ready(&self, tasks: &[Task]) -> OrchestratorResult<()> {
        let ready = DependencyChecker::ready_tasks(tasks);
        if ready.is_empty() {
            return Ok(());
        }
        let nodes = self.live_nodes().await?;
        for id in ready {
            if let Some(task) = tasks.iter().find(|t| t.id == id) {
                self.schedule(task.clone(), &nodes, Duration::ZERO).await?;
            }
        }
        Ok(())
    }

    async fn schedule(
        &self,
        mut task: Task,
        nodes: &[Node],
        delay: Duration,
    ) -> OrchestratorResult<Task> {
        let queue = self.queue_policy.select_queue(&task, nodes);
        task.state = TaskState::Scheduled;
        task.scheduled_at = Some(Utc::now());
        let task = self.save_task(task).await?;

        let message = Message::task_execution(task.clone());
        if delay.is_zero() {
            self.broker.publish(&queue, &message).await?;
        } else {
            self.publish_later(queue.clone(), message, delay);
        }
        debug!(task_id = %task.id, queue = %queue, ?delay, "task scheduled");
        Ok(task)
    }

    fn publish_later(&self, queue: String, message: Message, delay: Duration) {
        let broker = self.broker.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(message_id = %message.id, "coordinator stopping, delayed publish dropped");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = broker.publish(&queue, &message).await {
                        error!(queue = %queue, error = %e, "failed to publish retried task");
                    }
                }
            }
        });
    }

    async fn live_nodes(&self) -> OrchestratorResult<Vec<Node>> {
        let now = Utc::now();
        Ok(self
            .datastore
            .list_nodes()
            .await?
            .into_iter()
            .filter(|node| node.is_alive(now, self.node_timeout))
            .collect())
    }

    async fn save_job(&self, job: Job) -> OrchestratorResult<Job> {
        let mut event = JobEvent::state_change(job);
        self.jobs.handle(&mut event).await?;
        Ok(event.job)
    }

    async fn save_task(&self, task: Task) -> OrchestratorResult<Task> {
        let mut event = TaskEvent::state_change(task);
        self.tasks.handle(&mut event).await?;
        Ok(event.task)
    }
}
