use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use orchestrator_core::{
    models::Task,
    traits::{RunContext, Runtime, ENTRYPOINT_FILE_NAME, OUTPUT_ENV_VAR, OUTPUT_FILE_NAME},
    OrchestratorError, OrchestratorResult,
};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::process::{self, ProcessTable};

const RUNTIME_NAME: &str = "shell";

/// Runs tasks as local child processes.
///
/// Every execution gets a private temporary workspace that doubles as the
/// working directory. Container-only task features are rejected up front.
#[derive(Debug, Default)]
pub struct ShellRuntime {
    temp_dir: Option<PathBuf>,
    processes: ProcessTable,
}

impl ShellRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workspaces are created under `temp_dir` instead of the system default.
    pub fn with_temp_dir(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: Some(temp_dir.into()),
            processes: ProcessTable::new(),
        }
    }

    /// Number of executions currently registered.
    pub fn running(&self) -> usize {
        self.processes.len()
    }

    fn validate(task: &Task) -> OrchestratorResult<()> {
        let spec = &task.spec;
        let unsupported = |feature| OrchestratorError::UnsupportedFeature {
            runtime: RUNTIME_NAME,
            feature,
        };

        if !spec.mounts.is_empty() {
            return Err(unsupported("mounts"));
        }
        if !spec.entrypoint.is_empty() {
            return Err(unsupported("entrypoint"));
        }
        if spec.image.as_deref().is_some_and(|image| !image.is_empty()) {
            return Err(unsupported("image"));
        }
        if spec.limits.as_ref().is_some_and(|limits| !limits.is_empty()) {
            return Err(unsupported("limits"));
        }
        if !spec.networks.is_empty() {
            return Err(unsupported("networks"));
        }
        if spec.registry.is_some() {
            return Err(unsupported("registry"));
        }

        if task.id.is_empty() {
            return Err(OrchestratorError::InvalidTask(
                "task id must not be empty".to_string(),
            ));
        }
        process::validate_command(spec)?;
        process::validate_file_names(spec)
    }

    fn environment(task: &Task, output: &str) -> HashMap<String, String> {
        let mut env = task.spec.env.clone();
        if !env.contains_key("PATH") {
            if let Ok(path) = std::env::var("PATH") {
                env.insert("PATH".to_string(), path);
            }
        }
        env.insert(OUTPUT_ENV_VAR.to_string(), output.to_string());
        env
    }
}

#[async_trait]
impl Runtime for ShellRuntime {
    fn name(&self) -> &'static str {
        RUNTIME_NAME
    }

    #[instrument(skip_all, fields(task_id = %task.id, job_id = %task.job_id))]
    async fn run(&self, ctx: &RunContext, task: &mut Task) -> OrchestratorResult<()> {
        Self::validate(task)?;

        let token = ctx.token().child_token();
        let _registration = self.processes.register(&task.id, token.clone())?;
        if token.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let workspace = process::stage_workspace(self.temp_dir.as_deref(), task).await?;
        let output = workspace.path().join(OUTPUT_FILE_NAME);
        let env = Self::environment(task, &output.to_string_lossy());

        let mut command: Command = match task.spec.cmd.split_first() {
            Some((program, args)) => {
                let mut command = process::base_command(program, &env);
                command.args(args);
                command
            }
            None => {
                let mut command = process::base_command("bash", &env);
                command.arg(workspace.path().join(ENTRYPOINT_FILE_NAME));
                command
            }
        };
        command.current_dir(workspace.path());

        let mut child = process::spawn(&mut command, &task.id)?;
        debug!(pid = child.id(), "process started");

        let status = process::supervise(&mut child, ctx, &token).await?;
        process::check_exit(status)?;

        task.result = Some(process::read_output(workspace.path()).await?);
        process::remove_workspace(workspace, &task.id);
        info!("shell task finished");
        Ok(())
    }

    async fn stop(&self, task: &Task) -> OrchestratorResult<()> {
        if self.processes.cancel(&task.id) {
            debug!(task_id = %task.id, "stop requested");
        }
        Ok(())
    }

    async fn health_check(&self) -> OrchestratorResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use orchestrator_core::models::{Limits, Mount, MountType, Registry, TaskSpec};

    use super::*;

    fn task(spec: TaskSpec) -> Task {
        Task::new("job-1", 0, spec)
    }

    fn scratch() -> (tempfile::TempDir, ShellRuntime) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ShellRuntime::with_temp_dir(dir.path());
        (dir, runtime)
    }

    fn is_empty_dir(dir: &tempfile::TempDir) -> bool {
        std::fs::read_dir(dir.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_run_captures_output_byte_exact() {
        let (dir, runtime) = scratch();
        let mut task = task(TaskSpec::new("t").with_run("printf 'hello world' > $ORCHESTRATOR_OUTPUT"));

        runtime.run(&RunContext::new(), &mut task).await.unwrap();

        assert_eq!(task.result.as_deref(), Some("hello world"));
        assert!(is_empty_dir(&dir), "workspace left behind");
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn test_run_without_output_yields_empty_result() {
        let (_dir, runtime) = scratch();
        let mut task = task(TaskSpec::new("t").with_run("echo ignored"));

        runtime.run(&RunContext::new(), &mut task).await.unwrap();

        assert_eq!(task.result.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_cmd_runs_directly() {
        let (_dir, runtime) = scratch();
        let mut task = task(
            TaskSpec::new("t")
                .with_cmd(["bash", "-c", "echo -n \"$GREETING\" > $ORCHESTRATOR_OUTPUT"])
                .with_env("GREETING", "hi there"),
        );

        runtime.run(&RunContext::new(), &mut task).await.unwrap();

        assert_eq!(task.result.as_deref(), Some("hi there"));
    }

    #[tokio::test]
    async fn test_files_are_staged_in_working_directory() {
        let (_dir, runtime) = scratch();
        let mut task = task(
            TaskSpec::new("t")
                .with_run("cat hello.txt > $ORCHESTRATOR_OUTPUT")
                .with_file("hello.txt", "hello world"),
        );

        runtime.run(&RunContext::new(), &mut task).await.unwrap();

        assert_eq!(task.result.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn test_unsupported_features_fail_before_workspace() {
        let (dir, runtime) = scratch();
        let base = || TaskSpec::new("t").with_run("echo hi");

        let mut mounts = base();
        mounts.mounts.push(Mount {
            mount_type: MountType::Bind,
            source: Some("/tmp".into()),
            target: "/data".into(),
        });
        let mut entrypoint = base();
        entrypoint.entrypoint = vec!["sh".into()];
        let mut image = base();
        image.image = Some("alpine:3".into());
        let mut limits = base();
        limits.limits = Some(Limits {
            cpus: Some("1".into()),
            memory: None,
        });
        let mut networks = base();
        networks.networks = vec!["bridge".into()];
        let mut registry = base();
        registry.registry = Some(Registry {
            username: "u".into(),
            password: "p".into(),
        });

        for (spec, expected) in [
            (mounts, "mounts"),
            (entrypoint, "entrypoint"),
            (image, "image"),
            (limits, "limits"),
            (networks, "networks"),
            (registry, "registry"),
        ] {
            let err = runtime
                .run(&RunContext::new(), &mut task(spec))
                .await
                .unwrap_err();
            match err {
                OrchestratorError::UnsupportedFeature { runtime, feature } => {
                    assert_eq!(runtime, "shell");
                    assert_eq!(feature, expected);
                }
                other => panic!("unexpected error: {other}"),
            }
        }
        assert!(is_empty_dir(&dir));
    }

    #[tokio::test]
    async fn test_empty_limits_are_accepted() {
        let (_dir, runtime) = scratch();
        let mut spec = TaskSpec::new("t").with_run("true");
        spec.limits = Some(Limits::default());

        runtime.run(&RunContext::new(), &mut task(spec)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_command_reports_execution_failure() {
        let (dir, runtime) = scratch();
        let mut task = task(TaskSpec::new("t").with_run("no_such_command"));

        let err = runtime.run(&RunContext::new(), &mut task).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::ExecutionFailed(_)));
        assert!(task.result.is_none());
        assert!(is_empty_dir(&dir));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let (_dir, runtime) = scratch();
        let mut task = task(TaskSpec::new("t").with_cmd(["no_such_program_xyz"]));

        let err = runtime.run(&RunContext::new(), &mut task).await.unwrap_err();

        assert!(err.to_string().starts_with("failed to start process"));
    }

    #[tokio::test]
    async fn test_deadline_kills_process() {
        let (dir, runtime) = scratch();
        let mut task = task(TaskSpec::new("t").with_cmd(["sleep", "30"]));
        let ctx = RunContext::with_timeout(Duration::from_millis(200));

        let started = tokio::time::Instant::now();
        let err = runtime.run(&ctx, &mut task).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(is_empty_dir(&dir));
        assert_eq!(runtime.running(), 0);
    }

    #[cfg(target_os = "linux")]
    fn process_gone(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // zombies are dead, only waiting to be reaped
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_deadline_kills_script_children() {
        let (dir, runtime) = scratch();
        let mut task = task(
            TaskSpec::new("t").with_run("sleep 30 &\necho -n $! > ../child.pid\nwait"),
        );
        let ctx = RunContext::with_timeout(Duration::from_millis(500));

        let err = runtime.run(&ctx, &mut task).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout));

        let pid = std::fs::read_to_string(dir.path().join("child.pid")).unwrap();
        let mut gone = process_gone(&pid);
        for _ in 0..50 {
            if gone {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            gone = process_gone(&pid);
        }
        assert!(gone, "background process {pid} survived the deadline");
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_running_task() {
        let (_dir, runtime) = scratch();
        let runtime = Arc::new(runtime);
        let task = task(TaskSpec::new("t").with_cmd(["sleep", "5"]));

        let handle = {
            let runtime = runtime.clone();
            let mut task = task.clone();
            tokio::spawn(async move { runtime.run(&RunContext::new(), &mut task).await })
        };

        while runtime.running() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        runtime.stop(&task).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_registration_is_noop() {
        let runtime = ShellRuntime::new();
        let task = task(TaskSpec::new("t").with_run("true"));

        runtime.stop(&task).await.unwrap();
        runtime.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_context_never_starts() {
        let (dir, runtime) = scratch();
        let ctx = RunContext::new();
        ctx.cancel();

        let err = runtime
            .run(&ctx, &mut task(TaskSpec::new("t").with_run("true")))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Cancelled));
        assert!(is_empty_dir(&dir));
    }

    #[tokio::test]
    async fn test_concurrent_runs_leave_table_empty() {
        let (dir, runtime) = scratch();
        let runtime = Arc::new(runtime);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let runtime = runtime.clone();
                tokio::spawn(async move {
                    let mut task = Task::new(
                        "job-1",
                        i,
                        TaskSpec::new(format!("t{i}"))
                            .with_run(format!("printf {i} > $ORCHESTRATOR_OUTPUT")),
                    );
                    runtime.run(&RunContext::new(), &mut task).await.map(|_| task.result)
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), Some(i.to_string()));
        }
        assert_eq!(runtime.running(), 0);
        assert!(is_empty_dir(&dir));
    }

    #[tokio::test]
    async fn test_path_is_passed_through_unless_overridden() {
        let task = task(TaskSpec::new("t").with_run("true"));
        let env = ShellRuntime::environment(&task, "/ws/stdout");
        assert_eq!(env.get(OUTPUT_ENV_VAR).map(String::as_str), Some("/ws/stdout"));
        assert_eq!(env.get("PATH").cloned(), std::env::var("PATH").ok());

        let custom = Task::new("job-1", 0, TaskSpec::new("t").with_env("PATH", "/opt/bin"));
        let env = ShellRuntime::environment(&custom, "/ws/stdout");
        assert_eq!(env.get("PATH").map(String::as_str), Some("/opt/bin"));
    }
}
