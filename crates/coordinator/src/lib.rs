//! Coordinator tier: validates submitted jobs, schedules their tasks onto
//! broker queues and advances job state from worker reports.

pub mod controller;
pub mod coordinator;
pub mod dependency_checker;
pub mod job_locks;
pub mod queue_policy;
pub mod retry_service;
pub mod state_listener;

pub use controller::{JobController, Middlewares};
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use dependency_checker::DependencyChecker;
pub use queue_policy::{create_queue_policy, CapabilityQueuePolicy, NamedQueuePolicy, QueuePolicy};
pub use retry_service::RetryService;
pub use state_listener::StateListener;
