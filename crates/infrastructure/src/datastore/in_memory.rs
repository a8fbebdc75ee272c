use std::collections::HashMap;

use async_trait::async_trait;
use orchestrator_core::{
    models::{Job, Node, Task},
    traits::Datastore,
    OrchestratorResult,
};
use tokio::sync::RwLock;

/// Datastore kept in process memory. Records are cloned in and out.
#[derive(Debug, Default)]
pub struct InMemoryDatastore {
    jobs: RwLock<HashMap<String, Job>>,
    tasks: RwLock<HashMap<String, Task>>,
    nodes: RwLock<HashMap<String, Node>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn save_job(&self, job: &Job) -> OrchestratorResult<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> OrchestratorResult<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list_jobs(&self) -> OrchestratorResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn save_task(&self, task: &Task) -> OrchestratorResult<()> {
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> OrchestratorResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn list_tasks(&self, job_id: &str) -> OrchestratorResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.position);
        Ok(tasks)
    }

    async fn save_node(&self, node: &Node) -> OrchestratorResult<()> {
        self.nodes.write().await.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn list_nodes(&self) -> OrchestratorResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn health_check(&self) -> OrchestratorResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::models::{JobSpec, JobState, TaskSpec, TaskState};

    #[tokio::test]
    async fn test_job_upsert_and_read_back() {
        let store = InMemoryDatastore::new();
        let mut job = Job::new(JobSpec::new("example"));
        store.save_job(&job).await.unwrap();

        job.state = JobState::Running;
        store.save_job(&job).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Running);
        assert_eq!(store.list_jobs().await.unwrap().len(), 1);
        assert!(store.get_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tasks_are_listed_per_job_in_declaration_order() {
        let store = InMemoryDatastore::new();
        for position in [2, 0, 1] {
            let task = Task::new("job-1", position, TaskSpec::new(format!("t{position}")));
            store.save_task(&task).await.unwrap();
        }
        store
            .save_task(&Task::new("job-2", 0, TaskSpec::new("other")))
            .await
            .unwrap();

        let tasks = store.list_tasks("job-1").await.unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["t0", "t1", "t2"]);
        assert!(tasks.iter().all(|t| t.state == TaskState::Created));
    }

    #[tokio::test]
    async fn test_nodes_are_upserted_by_id() {
        let store = InMemoryDatastore::new();
        let mut node = Node::new("node-1", "host", HashMap::new());
        store.save_node(&node).await.unwrap();
        node.running_tasks = 3;
        store.save_node(&node).await.unwrap();

        let nodes = store.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].running_tasks, 3);
    }
}
