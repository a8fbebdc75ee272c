//! Interceptor chains around job, task, node and request events.
//!
//! A [`MiddlewareChain`] collects [`Middleware`]s in declaration order and is
//! folded once, at construction, around a terminal [`Handler`]. The first
//! middleware added is the outermost layer: it sees the event first and the
//! outcome last.
//!
//! ```text
//!   m1 ─▶ m2 ─▶ terminal
//!   m1 ◀─ m2 ◀──┘
//! ```
//!
//! A middleware vetoes an event by returning an error or by returning
//! without calling `next`. Middlewares run before the terminal handler and
//! may mutate the event in place.
//!
//! ```rust,ignore
//! struct Audit;
//!
//! #[async_trait]
//! impl Middleware<JobEvent> for Audit {
//!     async fn handle(&self, event: &mut JobEvent, next: &dyn Handler<JobEvent>) -> OrchestratorResult<()> {
//!         tracing::info!(job_id = %event.job.id, state = event.job.state.as_str(), "job event");
//!         next.handle(event).await
//!     }
//! }
//!
//! let handler = MiddlewareChain::new().with(Arc::new(Audit)).build(Arc::new(NoOpHandler));
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    models::{Job, Node, Request, Response, Task},
    OrchestratorResult,
};

/// Terminal event handler.
#[async_trait]
pub trait Handler<E: Send + 'static>: Send + Sync {
    async fn handle(&self, event: &mut E) -> OrchestratorResult<()>;
}

/// Interceptor wrapping the rest of a chain.
#[async_trait]
pub trait Middleware<E: Send + 'static>: Send + Sync {
    async fn handle(&self, event: &mut E, next: &dyn Handler<E>) -> OrchestratorResult<()>;
}

/// Accepts every event and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpHandler;

#[async_trait]
impl<E: Send + 'static> Handler<E> for NoOpHandler {
    async fn handle(&self, _event: &mut E) -> OrchestratorResult<()> {
        Ok(())
    }
}

struct Layer<E: Send + 'static> {
    middleware: Arc<dyn Middleware<E>>,
    next: Arc<dyn Handler<E>>,
}

#[async_trait]
impl<E: Send + 'static> Handler<E> for Layer<E> {
    async fn handle(&self, event: &mut E) -> OrchestratorResult<()> {
        self.middleware.handle(event, self.next.as_ref()).await
    }
}

pub struct MiddlewareChain<E: Send + 'static> {
    middlewares: Vec<Arc<dyn Middleware<E>>>,
}

impl<E: Send + 'static> MiddlewareChain<E> {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware<E>>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware<E>>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Folds the chain right-to-left around `terminal`. An empty chain
    /// returns `terminal` itself.
    pub fn build(&self, terminal: Arc<dyn Handler<E>>) -> Arc<dyn Handler<E>> {
        self.middlewares
            .iter()
            .rev()
            .fold(terminal, |next, middleware| {
                let layer: Arc<dyn Handler<E>> = Arc::new(Layer {
                    middleware: Arc::clone(middleware),
                    next,
                });
                layer
            })
    }
}

impl<E: Send + 'static> Default for MiddlewareChain<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + 'static> Clone for MiddlewareChain<E> {
    fn clone(&self) -> Self {
        Self {
            middlewares: self.middlewares.clone(),
        }
    }
}

impl<E: Send + 'static> fmt::Debug for MiddlewareChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("len", &self.middlewares.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventType {
    /// The job's state changed; inspect `job.state`.
    StateChange,
    /// The job was read by a client.
    Read,
}

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub event_type: JobEventType,
    pub job: Job,
}

impl JobEvent {
    pub fn state_change(job: Job) -> Self {
        Self {
            event_type: JobEventType::StateChange,
            job,
        }
    }

    pub fn read(job: Job) -> Self {
        Self {
            event_type: JobEventType::Read,
            job,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEventType {
    StateChange,
}

#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub event_type: TaskEventType,
    pub task: Task,
}

impl TaskEvent {
    pub fn state_change(task: Task) -> Self {
        Self {
            event_type: TaskEventType::StateChange,
            task,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventType {
    Heartbeat,
}

#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub event_type: NodeEventType,
    pub node: Node,
}

impl NodeEvent {
    pub fn heartbeat(node: Node) -> Self {
        Self {
            event_type: NodeEventType::Heartbeat,
            node,
        }
    }
}

/// A client request; the terminal handler fills in `response`.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub request: Request,
    pub response: Option<Response>,
}

impl RequestEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: None,
        }
    }
}
