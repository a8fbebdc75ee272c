pub mod config;
pub mod errors;
pub mod logging;
pub mod middleware;
pub mod models;
pub mod traits;

pub use errors::*;
pub use logging::init_logging;
pub use models::{Job, JobSpec, JobState, Message, Node, Request, Response, Task, TaskSpec, TaskState};
pub use traits::{Broker, Datastore, MessageHandler, RunContext, Runtime, Subscription};

/// Unified result type
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;
