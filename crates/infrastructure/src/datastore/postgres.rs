use std::time::Duration;

use async_trait::async_trait;
use orchestrator_core::{
    config::PostgresConfig,
    models::{Job, Node, Task},
    traits::Datastore,
    OrchestratorResult,
};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use tracing::{debug, info, instrument};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS orchestrator_jobs (
        id TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        doc JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orchestrator_tasks (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        state TEXT NOT NULL,
        doc JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_orchestrator_tasks_job_id ON orchestrator_tasks (job_id)",
    r#"
    CREATE TABLE IF NOT EXISTS orchestrator_nodes (
        id TEXT PRIMARY KEY,
        last_heartbeat_at TIMESTAMPTZ NOT NULL,
        doc JSONB NOT NULL
    )
    "#,
];

/// PostgreSQL datastore
///
/// Each record is stored as a JSONB document next to the columns used for
/// lookups and ordering. Tables are created on connect.
#[derive(Debug, Clone)]
pub struct PostgresDatastore {
    pool: PgPool,
}

impl PostgresDatastore {
    pub async fn connect(config: &PostgresConfig) -> OrchestratorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect(&config.dsn)
            .await?;

        let datastore = Self::new(pool);
        datastore.migrate().await?;
        info!("connected to PostgreSQL datastore");
        Ok(datastore)
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn migrate(&self) -> OrchestratorResult<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        debug!("datastore schema ready");
        Ok(())
    }
}

#[async_trait]
impl Datastore for PostgresDatastore {
    #[instrument(skip(self, job), fields(job_id = %job.id, state = job.state.as_str()))]
    async fn save_job(&self, job: &Job) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orchestrator_jobs (id, state, created_at, doc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                doc = EXCLUDED.doc
            "#,
        )
        .bind(&job.id)
        .bind(job.state.as_str())
        .bind(job.created_at)
        .bind(Json(job))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> OrchestratorResult<Option<Job>> {
        let job = sqlx::query_scalar::<_, Json<Job>>("SELECT doc FROM orchestrator_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job.map(|Json(job)| job))
    }

    async fn list_jobs(&self) -> OrchestratorResult<Vec<Job>> {
        let jobs = sqlx::query_scalar::<_, Json<Job>>(
            "SELECT doc FROM orchestrator_jobs ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs.into_iter().map(|Json(job)| job).collect())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, state = task.state.as_str()))]
    async fn save_task(&self, task: &Task) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orchestrator_tasks (id, job_id, position, state, doc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                doc = EXCLUDED.doc
            "#,
        )
        .bind(&task.id)
        .bind(&task.job_id)
        .bind(task.position as i32)
        .bind(task.state.as_str())
        .bind(Json(task))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> OrchestratorResult<Option<Task>> {
        let task =
            sqlx::query_scalar::<_, Json<Task>>("SELECT doc FROM orchestrator_tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(task.map(|Json(task)| task))
    }

    #[instrument(skip(self))]
    async fn list_tasks(&self, job_id: &str) -> OrchestratorResult<Vec<Task>> {
        let tasks = sqlx::query_scalar::<_, Json<Task>>(
            "SELECT doc FROM orchestrator_tasks WHERE job_id = $1 ORDER BY position",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks.into_iter().map(|Json(task)| task).collect())
    }

    async fn save_node(&self, node: &Node) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orchestrator_nodes (id, last_heartbeat_at, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                doc = EXCLUDED.doc
            "#,
        )
        .bind(&node.id)
        .bind(node.last_heartbeat_at)
        .bind(Json(node))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_nodes(&self) -> OrchestratorResult<Vec<Node>> {
        let nodes =
            sqlx::query_scalar::<_, Json<Node>>("SELECT doc FROM orchestrator_nodes ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(nodes.into_iter().map(|Json(node)| node).collect())
    }

    async fn health_check(&self) -> OrchestratorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
