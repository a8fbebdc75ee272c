//! Data model shared by every tier: jobs, tasks, worker nodes and the
//! message envelope exchanged through the broker.

pub mod job;
pub mod message;
pub mod node;
pub mod request;
pub mod task;

pub use job::{Job, JobSpec, JobState};
pub use message::{
    is_reserved_queue, node_queue, Message, MessageType, TaskControlAction, TaskControlMessage,
    TaskStatusMessage, DEFAULT_QUEUE, HEARTBEAT_QUEUE, RESERVED_QUEUE_PREFIX, STATUS_QUEUE,
};
pub use node::{Node, NodeStatus};
pub use request::{Request, Response};
pub use task::{Limits, Mount, MountType, Registry, Task, TaskSpec, TaskState};
