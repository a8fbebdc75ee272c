use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use orchestrator::{Engine, Mode};
use orchestrator_core::{
    config::{AppConfig, BackoffConfig},
    middleware::{Handler, JobEvent, JobEventType, Middleware},
    models::{Job, JobSpec, JobState, TaskSpec, TaskState},
    OrchestratorError, OrchestratorResult,
};
use orchestrator_coordinator::Coordinator;
use orchestrator_testing_utils::{JobSpecs, TestEnv};
use tempfile::TempDir;
use tokio::time::timeout;

fn standalone_config(scratch: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.worker.temp_dir = Some(scratch.path().to_path_buf());
    config.worker.queues.insert("default".to_string(), 2);
    config.worker.heartbeat_interval_seconds = 1;
    config.worker.shutdown_grace_seconds = 1;
    config.coordinator.retry.backoff = BackoffConfig::immediate();
    config
}

/// Records every persisted job state.
#[derive(Clone, Default)]
struct StateRecorder(Arc<Mutex<Vec<JobState>>>);

#[async_trait]
impl Middleware<JobEvent> for StateRecorder {
    async fn handle(&self, event: &mut JobEvent, next: &dyn Handler<JobEvent>) -> OrchestratorResult<()> {
        if event.event_type == JobEventType::StateChange {
            self.0.lock().unwrap().push(event.job.state);
        }
        next.handle(event).await
    }
}

async fn wait_until_finished(coordinator: &Arc<Coordinator>, job_id: &str) -> Job {
    let finished = TestEnv::wait_for(
        || {
            let coordinator = coordinator.clone();
            let job_id = job_id.to_string();
            async move {
                coordinator
                    .get_job(&job_id)
                    .await
                    .map(|job| job.is_terminal())
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(20),
    )
    .await;
    assert!(finished, "job {job_id} did not finish");
    coordinator.get_job(job_id).await.unwrap()
}

#[tokio::test]
async fn test_single_echo_task_completes() {
    let scratch = tempfile::tempdir().unwrap();
    let recorder = StateRecorder::default();
    let engine = Engine::new(standalone_config(&scratch), Mode::Standalone).configure_coordinator({
        let recorder = recorder.clone();
        move |builder| builder.job_middleware(Arc::new(recorder.clone()))
    });
    engine.start().await.unwrap();
    let coordinator = engine.coordinator().await.unwrap();

    let job = coordinator
        .submit_job(JobSpecs::echo("hello world"))
        .await
        .unwrap();
    let job = wait_until_finished(&coordinator, &job.id).await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result.as_deref(), Some("hello world"));
    assert_eq!(
        *recorder.0.lock().unwrap(),
        vec![JobState::Pending, JobState::Running, JobState::Completed]
    );
    let tasks = coordinator.list_tasks(&job.id).await.unwrap();
    assert_eq!(tasks[0].state, TaskState::Completed);
    assert!(tasks[0].node_id.is_some());

    engine.stop().await;
}

#[tokio::test]
async fn test_retry_budget_is_exhausted() {
    let scratch = tempfile::tempdir().unwrap();
    let engine = Engine::new(standalone_config(&scratch), Mode::Standalone);
    engine.start().await.unwrap();
    let coordinator = engine.coordinator().await.unwrap();

    let spec = JobSpec::new("flaky").with_task(
        TaskSpec::new("flaky")
            .with_run("echo attempt >> ../attempts; exit 3")
            .with_retry_limit(2),
    );
    let job = coordinator.submit_job(spec).await.unwrap();
    let job = wait_until_finished(&coordinator, &job.id).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(
        job.error.as_deref(),
        Some("process exited with exit status: 3")
    );
    let tasks = coordinator.list_tasks(&job.id).await.unwrap();
    assert_eq!(tasks[0].retry_count, 2);

    let attempts = std::fs::read_to_string(scratch.path().join("attempts")).unwrap();
    assert_eq!(attempts.lines().count(), 3);

    engine.stop().await;
}

#[tokio::test]
async fn test_dependent_task_runs_after_predecessor() {
    let scratch = tempfile::tempdir().unwrap();
    let engine = Engine::new(standalone_config(&scratch), Mode::Standalone);
    engine.start().await.unwrap();
    let coordinator = engine.coordinator().await.unwrap();

    let spec = JobSpec::new("pipeline")
        .with_task(TaskSpec::new("produce").with_run("sleep 0.2; echo data > ../handoff"))
        .with_task(
            TaskSpec::new("consume").with_run("cat ../handoff > $ORCHESTRATOR_OUTPUT"),
        );
    let job = coordinator.submit_job(spec).await.unwrap();
    let job = wait_until_finished(&coordinator, &job.id).await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result.as_deref(), Some("data\n"));

    let tasks = coordinator.list_tasks(&job.id).await.unwrap();
    let produced = tasks[0].completed_at.unwrap();
    let scheduled = tasks[1].scheduled_at.unwrap();
    assert!(scheduled >= produced);

    engine.stop().await;
}

#[tokio::test]
async fn test_failed_startup_hook_stops_started_tiers() {
    let scratch = tempfile::tempdir().unwrap();
    let engine = Engine::new(standalone_config(&scratch), Mode::Standalone).on_started(|context| {
        Box::pin(async move {
            assert!(context.coordinator.is_some());
            assert!(context.worker.as_ref().unwrap().is_running());
            Err(OrchestratorError::Internal("hook failed".into()))
        })
    });

    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Internal(_)));
    assert!(engine.context().await.is_none());
}

#[tokio::test]
async fn test_terminate_ends_run() {
    let scratch = tempfile::tempdir().unwrap();
    let engine = Arc::new(Engine::new(standalone_config(&scratch), Mode::Standalone));

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };
    let engine_ref = engine.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let engine = engine_ref.clone();
                async move { engine.context().await.is_some() }
            },
            Duration::from_secs(5)
        )
        .await
    );

    let context = engine.context().await.unwrap();
    engine.terminate();
    timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(!context.coordinator.unwrap().is_running());
    assert!(!context.worker.unwrap().is_running());
    assert!(engine.context().await.is_none());
}
