use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{JobState, TaskState};

/// The step of a runtime execution that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStep {
    CreateWorkspace,
    StageFiles,
    StartProcess,
    WaitProcess,
    ReadOutput,
    CleanupWorkspace,
}

impl fmt::Display for RuntimeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            RuntimeStep::CreateWorkspace => "create workspace",
            RuntimeStep::StageFiles => "stage files",
            RuntimeStep::StartProcess => "start process",
            RuntimeStep::WaitProcess => "wait for process",
            RuntimeStep::ReadOutput => "read output",
            RuntimeStep::CleanupWorkspace => "clean up workspace",
        };
        f.write_str(step)
    }
}

/// Classification of a task failure, carried back to the coordinator so the
/// retry policy can tell failure classes apart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The task declared a capability the runtime backend cannot honor.
    Unsupported,
    /// Workspace, broker or datastore failure.
    Infrastructure,
    /// The process ran and exited unsuccessfully.
    Execution,
    /// The task deadline elapsed.
    Timeout,
    /// The execution was cancelled.
    Cancelled,
}

/// Orchestrator error type
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{feature} is not supported on {runtime} runtime")]
    UnsupportedFeature {
        runtime: &'static str,
        feature: &'static str,
    },

    #[error("failed to {step}: {source}")]
    RuntimeIo {
        step: RuntimeStep,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    ExecutionFailed(String),

    #[error("task execution timed out")]
    Timeout,

    #[error("task execution cancelled")]
    Cancelled,

    #[error("task {id} is already running")]
    AlreadyRunning { id: String },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job not found: {id}")]
    JobNotFound { id: String },

    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    #[error("invalid task state transition for {id}: {from:?} -> {to:?}")]
    InvalidTaskTransition {
        id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("invalid job state transition for {id}: {from:?} -> {to:?}")]
    InvalidJobTransition {
        id: String,
        from: JobState,
        to: JobState,
    },

    #[error("message queue error: {0}")]
    MessageQueue(String),

    #[error("datastore error: {0}")]
    Datastore(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("rejected by middleware: {0}")]
    Rejected(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn runtime_io(step: RuntimeStep, source: std::io::Error) -> Self {
        OrchestratorError::RuntimeIo { step, source }
    }

    /// Maps the error onto the failure class reported to the coordinator.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            OrchestratorError::UnsupportedFeature { .. } | OrchestratorError::InvalidTask(_) => {
                FailureKind::Unsupported
            }
            OrchestratorError::ExecutionFailed(_) => FailureKind::Execution,
            OrchestratorError::Timeout => FailureKind::Timeout,
            OrchestratorError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Infrastructure,
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(err: config::ConfigError) -> Self {
        OrchestratorError::Configuration(err.to_string())
    }
}
