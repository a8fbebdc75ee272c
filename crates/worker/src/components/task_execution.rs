use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{mapref::entry::Entry, DashMap};
use orchestrator_core::{
    models::{Limits, Message, Task, TaskState, TaskStatusMessage, STATUS_QUEUE},
    traits::{Broker, RunContext, Runtime},
    OrchestratorError, OrchestratorResult,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Executes assigned tasks and reports their progress to the status queue.
///
/// Every execution runs under a [`RunContext`] derived from the manager's
/// shutdown token, so [`TaskExecutionManager::cancel_all`] reaches all of
/// them at once.
pub struct TaskExecutionManager {
    node_id: String,
    runtime: Arc<dyn Runtime>,
    broker: Arc<dyn Broker>,
    default_limits: Limits,
    shutdown: CancellationToken,
    running_tasks: DashMap<String, (Task, RunContext)>,
}

impl TaskExecutionManager {
    pub fn new(
        node_id: impl Into<String>,
        runtime: Arc<dyn Runtime>,
        broker: Arc<dyn Broker>,
        default_limits: Limits,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            runtime,
            broker,
            default_limits,
            shutdown: CancellationToken::new(),
            running_tasks: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn running_count(&self) -> usize {
        self.running_tasks.len()
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running_tasks.contains_key(task_id)
    }

    /// Runs one assignment to completion.
    ///
    /// Task failures are reported as `FAILED` status messages and are not
    /// errors of this call. An `Err` means the assignment was not handled,
    /// either because reporting failed or because the worker is shutting
    /// down, and the broker should redeliver it.
    #[instrument(skip(self, task), fields(task_id = %task.id, job_id = %task.job_id, node_id = %self.node_id))]
    pub async fn execute(&self, mut task: Task) -> OrchestratorResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        if !self.default_limits.is_empty()
            && task.spec.limits.as_ref().map_or(true, Limits::is_empty)
        {
            task.spec.limits = Some(self.default_limits.clone());
        }

        let timeout = task.spec.timeout_seconds.map(Duration::from_secs);
        let ctx = RunContext::with_token(self.shutdown.clone()).child(timeout);
        match self.running_tasks.entry(task.id.clone()) {
            Entry::Occupied(_) => {
                // Redelivery of an execution this worker still owns.
                warn!(task_id = %task.id, "task already executing, ignoring duplicate assignment");
                return Ok(());
            }
            Entry::Vacant(entry) => {
                entry.insert((task.clone(), ctx.clone()));
            }
        }
        let _tracked = Tracked {
            table: &self.running_tasks,
            task_id: task.id.clone(),
        };

        info!(
            "Executing task: task_id={}, job_id={}, name={}",
            task.id,
            task.job_id,
            task.name()
        );
        self.report(TaskStatusMessage::new(&task, TaskState::Running, &self.node_id))
            .await?;

        metrics::counter!("orchestrator_tasks_started_total").increment(1);
        let started = Instant::now();
        let outcome = self.runtime.run(&ctx, &mut task).await;
        metrics::histogram!("orchestrator_task_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let status = match outcome {
            Ok(()) => {
                metrics::counter!("orchestrator_tasks_completed_total").increment(1);
                info!(task_id = %task.id, "task completed");
                TaskStatusMessage::new(&task, TaskState::Completed, &self.node_id)
                    .with_result(task.result.clone())
            }
            Err(OrchestratorError::Cancelled) if self.shutdown.is_cancelled() => {
                warn!(task_id = %task.id, "task interrupted by worker shutdown");
                return Err(OrchestratorError::Cancelled);
            }
            Err(OrchestratorError::Cancelled) => {
                metrics::counter!("orchestrator_tasks_cancelled_total").increment(1);
                info!(task_id = %task.id, "task cancelled");
                TaskStatusMessage::new(&task, TaskState::Cancelled, &self.node_id)
            }
            Err(e) => {
                metrics::counter!("orchestrator_tasks_failed_total").increment(1);
                error!(task_id = %task.id, error = %e, "task failed");
                TaskStatusMessage::new(&task, TaskState::Failed, &self.node_id)
                    .with_failure(e.to_string(), e.failure_kind())
            }
        };
        self.report(status).await
    }

    /// Cancels one execution. Unknown ids are ignored.
    pub async fn cancel(&self, task_id: &str) -> OrchestratorResult<()> {
        let entry = self
            .running_tasks
            .get(task_id)
            .map(|entry| entry.value().clone());
        let Some((task, ctx)) = entry else {
            debug!(task_id, "cancel requested for a task that is not running");
            return Ok(());
        };

        info!(task_id, "cancelling task");
        ctx.cancel();
        self.runtime.stop(&task).await
    }

    /// Cancels every execution, including ones not yet started.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Waits until no execution is tracked. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.running_tasks.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    async fn report(&self, status: TaskStatusMessage) -> OrchestratorResult<()> {
        debug!(task_id = %status.task_id, state = status.state.as_str(), "reporting task status");
        self.broker
            .publish(STATUS_QUEUE, &Message::task_status(status))
            .await
    }
}

struct Tracked<'a> {
    table: &'a DashMap<String, (Task, RunContext)>,
    task_id: String,
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.task_id);
    }
}
