use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use orchestrator_core::{
    errors::RuntimeStep,
    models::{MountType, Task},
    traits::{RunContext, Runtime, ENTRYPOINT_FILE_NAME, OUTPUT_ENV_VAR, OUTPUT_FILE_NAME},
    OrchestratorError, OrchestratorResult,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::process::{self, ProcessTable};

const RUNTIME_NAME: &str = "docker";
/// Where the workspace is mounted inside the container.
pub const CONTAINER_WORKDIR: &str = "/orchestrator";

/// Runs tasks in containers by driving the `docker` CLI.
#[derive(Debug)]
pub struct DockerRuntime {
    binary: String,
    temp_dir: Option<PathBuf>,
    processes: ProcessTable,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            temp_dir: None,
            processes: ProcessTable::new(),
        }
    }
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }

    /// Overrides the client binary, e.g. `podman`.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn container_name(task: &Task) -> String {
        format!("orchestrator-{}", task.id)
    }

    fn validate(task: &Task) -> OrchestratorResult<()> {
        if task.id.is_empty() {
            return Err(OrchestratorError::InvalidTask(
                "task id must not be empty".to_string(),
            ));
        }
        if task.spec.image.as_deref().map_or(true, str::is_empty) {
            return Err(OrchestratorError::InvalidTask(
                "docker tasks require an image".to_string(),
            ));
        }
        for mount in &task.spec.mounts {
            if mount.mount_type == MountType::Bind && mount.source.is_none() {
                return Err(OrchestratorError::InvalidTask(format!(
                    "bind mount {} requires a source",
                    mount.target
                )));
            }
        }
        process::validate_command(&task.spec)?;
        process::validate_file_names(&task.spec)
    }

    /// Arguments of the `docker run` invocation for `task`.
    pub fn run_args(task: &Task, workspace: &Path) -> Vec<String> {
        let spec = &task.spec;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            Self::container_name(task),
            "--volume".to_string(),
            format!("{}:{CONTAINER_WORKDIR}", workspace.display()),
            "--workdir".to_string(),
            CONTAINER_WORKDIR.to_string(),
        ];

        let mut env: Vec<_> = spec.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push("--env".to_string());
        args.push(format!("{OUTPUT_ENV_VAR}={CONTAINER_WORKDIR}/{OUTPUT_FILE_NAME}"));

        if let Some(limits) = &spec.limits {
            if let Some(cpus) = limits.cpus.as_deref().filter(|c| !c.is_empty()) {
                args.push(format!("--cpus={cpus}"));
            }
            if let Some(memory) = limits.memory.as_deref().filter(|m| !m.is_empty()) {
                args.push(format!("--memory={memory}"));
            }
        }

        for mount in &spec.mounts {
            let source = mount.source.as_deref().unwrap_or_default();
            let kind = match mount.mount_type {
                MountType::Volume => "volume",
                MountType::Bind => "bind",
            };
            let mut value = format!("type={kind},target={}", mount.target);
            if !source.is_empty() {
                value.push_str(&format!(",source={source}"));
            }
            args.push("--mount".to_string());
            args.push(value);
        }

        for network in &spec.networks {
            args.push(format!("--network={network}"));
        }

        let mut command: Vec<String> = spec.cmd.clone();
        let mut entrypoint = spec.entrypoint.iter();
        if command.is_empty() {
            let script = format!("{CONTAINER_WORKDIR}/{ENTRYPOINT_FILE_NAME}");
            match entrypoint.next() {
                Some(first) => args.push(format!("--entrypoint={first}")),
                None => args.push("--entrypoint=sh".to_string()),
            }
            command = entrypoint.cloned().chain(std::iter::once(script)).collect();
        } else if let Some(first) = entrypoint.next() {
            args.push(format!("--entrypoint={first}"));
            command = entrypoint.cloned().chain(command).collect();
        }

        args.push(spec.image.clone().unwrap_or_default());
        args.extend(command);
        args
    }

    fn client(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Runs a short-lived client command under the execution's scope.
    async fn client_step(
        &self,
        mut command: Command,
        ctx: &RunContext,
        token: &CancellationToken,
        task_id: &str,
    ) -> OrchestratorResult<()> {
        let mut child = process::spawn(&mut command, task_id)?;
        let status = process::supervise(&mut child, ctx, token).await?;
        process::check_exit(status)
    }

    async fn login(
        &self,
        task: &Task,
        ctx: &RunContext,
        token: &CancellationToken,
    ) -> OrchestratorResult<()> {
        let (Some(registry), Some(image)) = (&task.spec.registry, &task.spec.image) else {
            return Ok(());
        };

        let mut command = self.client();
        command
            .arg("login")
            .arg("--username")
            .arg(&registry.username)
            .arg("--password-stdin")
            .stdin(Stdio::piped());
        if let Some(host) = registry_host(image) {
            command.arg(host);
        }

        let mut child = process::spawn(&mut command, &task.id)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(registry.password.as_bytes())
                .await
                .map_err(|e| OrchestratorError::runtime_io(RuntimeStep::StartProcess, e))?;
        }
        let status = process::supervise(&mut child, ctx, token).await?;
        process::check_exit(status)
    }

    async fn remove_container(&self, name: &str) {
        let mut command = self.client();
        command.args(["rm", "--force", name]);
        match command.output().await {
            Ok(output) if output.status.success() => debug!(container = name, "container removed"),
            Ok(output) => debug!(container = name, status = %output.status, "container not removed"),
            Err(e) => warn!(container = name, error = %e, "failed to remove container"),
        }
    }
}

/// Registry host of an image reference, `None` for Docker Hub.
fn registry_host(image: &str) -> Option<&str> {
    let (first, rest) = image.split_once('/')?;
    if rest.is_empty() {
        return None;
    }
    (first.contains('.') || first.contains(':') || first == "localhost").then_some(first)
}

#[async_trait]
impl Runtime for DockerRuntime {
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

        self.login(task, ctx, &token).await?;

        let image = task.spec.image.clone().unwrap_or_default();
        let mut pull = self.client();
        pull.arg("pull").arg(&image);
        self.client_step(pull, ctx, &token, &task.id).await?;
        debug!(image = %image, "image pulled");

        let mut run = self.client();
        run.args(Self::run_args(task, workspace.path()));
        let outcome = self.client_step(run, ctx, &token, &task.id).await;
        if matches!(
            outcome,
            Err(OrchestratorError::Cancelled | OrchestratorError::Timeout)
        ) {
            self.remove_container(&Self::container_name(task)).await;
        }
        outcome?;

        task.result = Some(process::read_output(workspace.path()).await?);
        process::remove_workspace(workspace, &task.id);
        info!(image = %image, "container task finished");
        Ok(())
    }

    async fn stop(&self, task: &Task) -> OrchestratorResult<()> {
        if self.processes.cancel(&task.id) {
            self.remove_container(&Self::container_name(task)).await;
        }
        Ok(())
    }

    async fn health_check(&self) -> OrchestratorResult<()> {
        let output = self
            .client()
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(|e| OrchestratorError::runtime_io(RuntimeStep::StartProcess, e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(OrchestratorError::ExecutionFailed(format!(
                "docker daemon unavailable: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}
