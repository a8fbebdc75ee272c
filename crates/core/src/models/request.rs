use serde::{Deserialize, Serialize};

use super::{Job, JobSpec, Node};

/// In-process client request handled by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    SubmitJob(JobSpec),
    GetJob { id: String },
    CancelJob { id: String },
    ListJobs,
    ListNodes,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::SubmitJob(_) => "submit_job",
            Request::GetJob { .. } => "get_job",
            Request::CancelJob { .. } => "cancel_job",
            Request::ListJobs => "list_jobs",
            Request::ListNodes => "list_nodes",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Response {
    Job(Job),
    Jobs(Vec<Job>),
    Nodes(Vec<Node>),
}
