pub mod components;
pub mod runtime;
pub mod service;

pub use components::{HeartbeatManager, TaskExecutionManager};
pub use runtime::{create_runtime, DockerRuntime, ShellRuntime};
pub use service::{WorkerService, WorkerServiceBuilder};
