//! Process supervision shared by the runtime backends.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use dashmap::{mapref::entry::Entry, DashMap};
use orchestrator_core::{
    errors::RuntimeStep,
    models::{Task, TaskSpec},
    traits::{RunContext, ENTRYPOINT_FILE_NAME, OUTPUT_FILE_NAME},
    OrchestratorError, OrchestratorResult,
};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Executions currently owned by a runtime, keyed by task id.
#[derive(Debug, Default)]
pub struct ProcessTable {
    entries: DashMap<String, CancellationToken>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task_id` and returns a guard that unregisters it on drop.
    /// A live registration under the same id is rejected.
    pub fn register(
        &self,
        task_id: &str,
        token: CancellationToken,
    ) -> OrchestratorResult<Registration<'_>> {
        match self.entries.entry(task_id.to_string()) {
            Entry::Occupied(_) => Err(OrchestratorError::AlreadyRunning {
                id: task_id.to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(token);
                Ok(Registration {
                    table: self,
                    task_id: task_id.to_string(),
                })
            }
        }
    }

    /// Cancels the registration, returning whether one existed.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.entries.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Registration<'a> {
    table: &'a ProcessTable,
    task_id: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.table.entries.remove(&self.task_id);
    }
}

/// File names must be plain names inside the workspace.
pub fn validate_file_names(spec: &TaskSpec) -> OrchestratorResult<()> {
    for name in spec.files.keys() {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains('/')
            && !name.contains('\\');
        if !plain {
            return Err(OrchestratorError::InvalidTask(format!(
                "file name must not contain path separators: {name}"
            )));
        }
        if name == OUTPUT_FILE_NAME || name == ENTRYPOINT_FILE_NAME {
            return Err(OrchestratorError::InvalidTask(format!(
                "file name is reserved: {name}"
            )));
        }
    }
    Ok(())
}

pub fn validate_command(spec: &TaskSpec) -> OrchestratorResult<()> {
    if spec.cmd.is_empty() && spec.run.as_deref().map_or(true, str::is_empty) {
        return Err(OrchestratorError::InvalidTask(
            "task declares neither run nor cmd".to_string(),
        ));
    }
    Ok(())
}

/// Creates the private workspace, the empty output file and the task's files.
pub async fn stage_workspace(parent: Option<&Path>, task: &Task) -> OrchestratorResult<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("orchestrator-");
    let workspace = match parent {
        Some(parent) => builder.tempdir_in(parent),
        None => builder.tempdir(),
    }
    .map_err(|e| OrchestratorError::runtime_io(RuntimeStep::CreateWorkspace, e))?;

    tokio::fs::write(workspace.path().join(OUTPUT_FILE_NAME), b"")
        .await
        .map_err(|e| OrchestratorError::runtime_io(RuntimeStep::StageFiles, e))?;

    for (name, contents) in &task.spec.files {
        tokio::fs::write(workspace.path().join(name), contents)
            .await
            .map_err(|e| OrchestratorError::runtime_io(RuntimeStep::StageFiles, e))?;
    }

    if task.spec.cmd.is_empty() {
        if let Some(run) = &task.spec.run {
            let script = workspace.path().join(ENTRYPOINT_FILE_NAME);
            tokio::fs::write(&script, run)
                .await
                .map_err(|e| OrchestratorError::runtime_io(RuntimeStep::StageFiles, e))?;
            make_executable(&script).await?;
        }
    }

    debug!(task_id = %task.id, workspace = %workspace.path().display(), "workspace staged");
    Ok(workspace)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> OrchestratorResult<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| OrchestratorError::runtime_io(RuntimeStep::StageFiles, e))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> OrchestratorResult<()> {
    Ok(())
}

/// Reads the output file byte-exact.
pub async fn read_output(workspace: &Path) -> OrchestratorResult<String> {
    let bytes = tokio::fs::read(workspace.join(OUTPUT_FILE_NAME))
        .await
        .map_err(|e| OrchestratorError::runtime_io(RuntimeStep::ReadOutput, e))?;
    Ok(String::from_utf8(bytes)
        .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
}

/// Removes the workspace, logging instead of failing the task.
pub fn remove_workspace(workspace: TempDir, task_id: &str) {
    let path = workspace.path().to_path_buf();
    if let Err(e) = workspace.close() {
        let err = OrchestratorError::runtime_io(RuntimeStep::CleanupWorkspace, e);
        warn!(task_id, workspace = %path.display(), error = %err, "workspace not removed");
    }
}

pub fn base_command(program: &str, env: &HashMap<String, String>) -> Command {
    let mut command = Command::new(program);
    command
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // The child leads its own group so that everything it forks can be
    // signalled together.
    #[cfg(unix)]
    command.process_group(0);
    command
}

pub fn spawn(command: &mut Command, task_id: &str) -> OrchestratorResult<Child> {
    let mut child = command
        .spawn()
        .map_err(|e| OrchestratorError::runtime_io(RuntimeStep::StartProcess, e))?;

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, task_id.to_string(), "stdout");
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, task_id.to_string(), "stderr");
    }
    Ok(child)
}

fn forward_lines<R>(reader: R, task_id: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(task_id = %task_id, stream, "{line}");
        }
    });
}

/// Waits for the child to exit, to be cancelled or to hit the deadline.
/// Cancelled and timed-out children are killed and reaped before returning.
pub async fn supervise(
    child: &mut Child,
    ctx: &RunContext,
    token: &CancellationToken,
) -> OrchestratorResult<ExitStatus> {
    let deadline = ctx.deadline();
    let expired = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    let interrupted = tokio::select! {
        status = child.wait() => {
            return status.map_err(|e| OrchestratorError::runtime_io(RuntimeStep::WaitProcess, e));
        }
        _ = token.cancelled() => OrchestratorError::Cancelled,
        _ = expired => OrchestratorError::Timeout,
    };

    kill_process_group(child);
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill process");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap killed process");
    }
    Err(interrupted)
}

/// Sends SIGKILL to the group led by `child`, reaching the processes a
/// script started as well as the script itself.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    match i32::try_from(pid) {
        Ok(pid) => {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!(pid, error = %e, "failed to kill process group");
            }
        }
        Err(_) => warn!(pid, "process id out of range"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

pub fn check_exit(status: ExitStatus) -> OrchestratorResult<()> {
    if status.success() {
        Ok(())
    } else {
        Err(OrchestratorError::ExecutionFailed(format!(
            "process exited with {status}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let table = ProcessTable::new();
        let guard = table.register("t1", CancellationToken::new()).unwrap();
        assert!(matches!(
            table.register("t1", CancellationToken::new()),
            Err(OrchestratorError::AlreadyRunning { .. })
        ));
        drop(guard);
        assert!(table.is_empty());
        assert!(table.register("t1", CancellationToken::new()).is_ok());
    }

    #[test]
    fn test_cancel_reaches_registered_token() {
        let table = ProcessTable::new();
        let token = CancellationToken::new();
        let _guard = table.register("t1", token.clone()).unwrap();
        assert!(table.cancel("t1"));
        assert!(token.is_cancelled());
        assert!(!table.cancel("unknown"));
    }

    #[test]
    fn test_file_names_must_be_plain() {
        for name in ["../escape", "a/b", "a\\b", "", "..", "stdout", "entrypoint"] {
            let spec = TaskSpec::new("t").with_run("true").with_file(name, "x");
            assert!(validate_file_names(&spec).is_err(), "{name} accepted");
        }
        let spec = TaskSpec::new("t").with_run("true").with_file("data.txt", "x");
        assert!(validate_file_names(&spec).is_ok());
    }
}
