use async_trait::async_trait;

use crate::{
    models::{Job, Node, Task},
    OrchestratorResult,
};

/// Record store for jobs, tasks and nodes.
///
/// Saves are upserts keyed by id. A single coordinator always reads its own
/// writes.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn save_job(&self, job: &Job) -> OrchestratorResult<()>;
    async fn get_job(&self, id: &str) -> OrchestratorResult<Option<Job>>;
    /// Jobs ordered by creation time, newest first.
    async fn list_jobs(&self) -> OrchestratorResult<Vec<Job>>;

    async fn save_task(&self, task: &Task) -> OrchestratorResult<()>;
    async fn get_task(&self, id: &str) -> OrchestratorResult<Option<Task>>;
    /// Tasks of a job in declaration order.
    async fn list_tasks(&self, job_id: &str) -> OrchestratorResult<Vec<Task>>;

    async fn save_node(&self, node: &Node) -> OrchestratorResult<()>;
    async fn list_nodes(&self) -> OrchestratorResult<Vec<Node>>;

    async fn health_check(&self) -> OrchestratorResult<()>;
}
