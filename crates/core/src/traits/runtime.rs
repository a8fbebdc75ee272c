//! Task runtime contract.
//!
//! A [`Runtime`] executes one [`Task`] in an isolated workspace and reports
//! the captured output through `task.result`. Backends differ in how they
//! isolate the process (local child process, container) but share the same
//! lifecycle:
//!
//! 1. reject any task feature the backend cannot honor, before touching disk
//! 2. materialize a private workspace and stage the task's files into it
//! 3. start the process with the task environment plus `ORCHESTRATOR_OUTPUT`
//! 4. wait for exit, cancellation or the deadline carried by [`RunContext`]
//! 5. read the output file into `task.result`, then remove the workspace
//!
//! ## Example
//!
//! ```rust,ignore
//! use orchestrator_core::traits::{RunContext, Runtime};
//!
//! async fn execute(runtime: &dyn Runtime, task: &mut Task) -> OrchestratorResult<()> {
//!     let ctx = RunContext::with_timeout(std::time::Duration::from_secs(30));
//!     runtime.run(&ctx, task).await?;
//!     println!("output: {:?}", task.result);
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{models::Task, OrchestratorResult};

/// Environment variable naming the output-capture file inside the workspace.
pub const OUTPUT_ENV_VAR: &str = "ORCHESTRATOR_OUTPUT";
/// Name of the output-capture file inside the workspace.
pub const OUTPUT_FILE_NAME: &str = "stdout";
/// Name of the generated script for tasks declared with `run`.
pub const ENTRYPOINT_FILE_NAME: &str = "entrypoint";

/// Cancellation and deadline scope of a single execution.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Child scope cancelled together with `self`, with an optional tighter
    /// deadline. The earlier of both deadlines wins.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let requested = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, requested) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Backend name used in logs and unsupported-feature errors.
    fn name(&self) -> &'static str;

    /// Executes the task to completion. On success `task.result` holds the
    /// byte-exact contents of the output file.
    async fn run(&self, ctx: &RunContext, task: &mut Task) -> OrchestratorResult<()>;

    /// Requests termination of a running task. Unknown ids are a no-op.
    async fn stop(&self, task: &Task) -> OrchestratorResult<()>;

    async fn health_check(&self) -> OrchestratorResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_context_follows_parent_cancellation() {
        let parent = RunContext::new();
        let child = parent.child(None);
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cancellation_does_not_reach_parent() {
        let parent = RunContext::new();
        let child = parent.child(Some(Duration::from_secs(1)));
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_keeps_earliest_deadline() {
        let parent = RunContext::with_timeout(Duration::from_secs(5));
        let child = parent.child(Some(Duration::from_secs(60)));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.child(Some(Duration::from_millis(10)));
        assert!(tighter.deadline() < parent.deadline());

        assert!(RunContext::new().child(None).deadline().is_none());
    }
}
