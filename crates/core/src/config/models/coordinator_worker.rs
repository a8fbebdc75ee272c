use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::{Limits, DEFAULT_QUEUE, HEARTBEAT_QUEUE, STATUS_QUEUE};

/// How the coordinator picks a queue for tasks that do not name one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicyKind {
    /// Always the configured default queue.
    #[default]
    Named,
    /// The first task tag naming a queue some live node consumes, falling
    /// back to the default queue.
    Capability,
}

/// Exponential backoff between task retries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    /// Fraction of the computed delay randomized in both directions.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// No delay at all; used by tests.
    pub fn immediate() -> Self {
        Self {
            initial_interval_ms: 0,
            max_interval_ms: 0,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_interval_ms > self.max_interval_ms {
            return Err(anyhow::anyhow!(
                "initial retry interval must not exceed the max retry interval"
            ));
        }
        if self.multiplier < 1.0 {
            return Err(anyhow::anyhow!("retry multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("retry jitter factor must be within [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry budget for tasks without their own `retry_limit`.
    pub default_limit: u32,
    pub retry_on_timeout: bool,
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_limit: 0,
            retry_on_timeout: true,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Consumer concurrency for the coordinator's own queues.
    pub queues: HashMap<String, usize>,
    pub default_queue: String,
    pub queue_policy: QueuePolicyKind,
    pub retry: RetryConfig,
    /// Heartbeat age after which a node no longer counts as live.
    pub node_timeout_seconds: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queues: HashMap::from([
                (STATUS_QUEUE.to_string(), 1),
                (HEARTBEAT_QUEUE.to_string(), 1),
            ]),
            default_queue: DEFAULT_QUEUE.to_string(),
            queue_policy: QueuePolicyKind::Named,
            retry: RetryConfig::default(),
            node_timeout_seconds: 90,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_queue.is_empty() {
            return Err(anyhow::anyhow!("coordinator default queue must not be empty"));
        }
        if crate::models::is_reserved_queue(&self.default_queue) {
            return Err(anyhow::anyhow!(
                "coordinator default queue must not be a reserved queue: {}",
                self.default_queue
            ));
        }
        for (queue, concurrency) in &self.queues {
            if *concurrency == 0 {
                return Err(anyhow::anyhow!(
                    "concurrency of coordinator queue {queue} must be greater than 0"
                ));
            }
        }
        if self.node_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("node timeout must be greater than 0"));
        }
        self.retry.backoff.validate()
    }

    pub fn concurrency(&self, queue: &str) -> usize {
        self.queues.get(queue).copied().unwrap_or(1)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[default]
    Shell,
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Node id; a random id is generated when unset.
    pub name: Option<String>,
    /// Task queues consumed by this worker, with their concurrency.
    pub queues: HashMap<String, usize>,
    pub runtime: RuntimeType,
    /// Applied to tasks that leave their limits unset.
    pub limits: Limits,
    /// Parent directory for task workspaces; the OS temp dir when unset.
    pub temp_dir: Option<PathBuf>,
    pub heartbeat_interval_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            queues: HashMap::from([(DEFAULT_QUEUE.to_string(), 1)]),
            runtime: RuntimeType::Shell,
            limits: Limits::default(),
            temp_dir: None,
            heartbeat_interval_seconds: 30,
            shutdown_grace_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queues.is_empty() {
            return Err(anyhow::anyhow!("worker must consume at least one queue"));
        }
        for (queue, concurrency) in &self.queues {
            if crate::models::is_reserved_queue(queue) {
                return Err(anyhow::anyhow!(
                    "worker must not consume reserved queue {queue}"
                ));
            }
            if *concurrency == 0 {
                return Err(anyhow::anyhow!(
                    "concurrency of worker queue {queue} must be greater than 0"
                ));
            }
        }
        if self.runtime == RuntimeType::Shell && !self.limits.is_empty() {
            return Err(anyhow::anyhow!(
                "default limits are not supported by the shell runtime"
            ));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("heartbeat interval must be greater than 0"));
        }
        Ok(())
    }
}
