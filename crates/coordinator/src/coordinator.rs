use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use orchestrator_core::{
    config::CoordinatorConfig,
    middleware::{Handler, JobEvent, Middleware, MiddlewareChain, NodeEvent, RequestEvent, TaskEvent},
    models::{Job, JobSpec, Node, Request, Response, Task, HEARTBEAT_QUEUE, STATUS_QUEUE},
    traits::{Broker, Datastore, MessageHandler, Subscription},
    OrchestratorError, OrchestratorResult,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::controller::{JobController, Middlewares};
use crate::queue_policy::QueuePolicy;
use crate::state_listener::StateListener;

/// Coordinator builder
pub struct CoordinatorBuilder {
    broker: Arc<dyn Broker>,
    datastore: Arc<dyn Datastore>,
    config: CoordinatorConfig,
    middlewares: Middlewares,
    requests: MiddlewareChain<RequestEvent>,
    queue_policy: Option<Arc<dyn QueuePolicy>>,
}

impl CoordinatorBuilder {
    pub fn new(broker: Arc<dyn Broker>, datastore: Arc<dyn Datastore>) -> Self {
        Self {
            broker,
            datastore,
            config: CoordinatorConfig::default(),
            middlewares: Middlewares::default(),
            requests: MiddlewareChain::new(),
            queue_policy: None,
        }
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Middlewares run in registration order, the first one outermost.
    pub fn job_middleware(mut self, middleware: Arc<dyn Middleware<JobEvent>>) -> Self {
        self.middlewares.job.push(middleware);
        self
    }

    pub fn task_middleware(mut self, middleware: Arc<dyn Middleware<TaskEvent>>) -> Self {
        self.middlewares.task.push(middleware);
        self
    }

    pub fn node_middleware(mut self, middleware: Arc<dyn Middleware<NodeEvent>>) -> Self {
        self.middlewares.node.push(middleware);
        self
    }

    pub fn request_middleware(mut self, middleware: Arc<dyn Middleware<RequestEvent>>) -> Self {
        self.requests.push(middleware);
        self
    }

    /// Replaces the policy selected by `config.queue_policy`.
    pub fn queue_policy(mut self, policy: Arc<dyn QueuePolicy>) -> Self {
        self.queue_policy = Some(policy);
        self
    }

    pub fn build(self) -> Coordinator {
        let mut controller = JobController::new(
            self.datastore.clone(),
            self.broker.clone(),
            &self.config,
            &self.middlewares,
        );
        if let Some(policy) = self.queue_policy {
            controller = controller.with_queue_policy(policy);
        }
        let controller = Arc::new(controller);
        let requests = self.requests.build(Arc::new(Dispatch {
            controller: controller.clone(),
        }));

        Coordinator {
            controller,
            broker: self.broker,
            datastore: self.datastore,
            config: self.config,
            requests,
            subscriptions: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
        }
    }
}

/// Consumes the status and heartbeat queues and serves client requests.
pub struct Coordinator {
    controller: Arc<JobController>,
    broker: Arc<dyn Broker>,
    datastore: Arc<dyn Datastore>,
    config: CoordinatorConfig,
    requests: Arc<dyn Handler<RequestEvent>>,
    subscriptions: Mutex<Vec<Subscription>>,
    is_running: AtomicBool,
}

impl Coordinator {
    pub fn builder(broker: Arc<dyn Broker>, datastore: Arc<dyn Datastore>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(broker, datastore)
    }

    pub fn controller(&self) -> &Arc<JobController> {
        &self.controller
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> OrchestratorResult<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("coordinator already started");
            return Ok(());
        }

        info!(
            "Starting coordinator: default_queue={}, queue_policy={:?}",
            self.config.default_queue, self.config.queue_policy
        );

        let listener: Arc<dyn MessageHandler> =
            Arc::new(StateListener::new(self.controller.clone()));
        for queue in [STATUS_QUEUE, HEARTBEAT_QUEUE] {
            let concurrency = self.config.concurrency(queue);
            match self.broker.subscribe(queue, concurrency, listener.clone()).await {
                Ok(subscription) => self.subscriptions.lock().await.push(subscription),
                Err(e) => {
                    self.cancel_subscriptions().await;
                    self.is_running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        info!("coordinator started");
        Ok(())
    }

    async fn cancel_subscriptions(&self) {
        for subscription in self.subscriptions.lock().await.drain(..) {
            debug!(queue = subscription.queue(), "cancelling subscription");
            subscription.cancel();
        }
    }

    /// Stops consuming and drops pending retries. Calling it again is a
    /// no-op.
    pub async fn stop(&self) -> OrchestratorResult<()> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            debug!("coordinator not running");
            return Ok(());
        }
        self.cancel_subscriptions().await;
        self.controller.shutdown();
        info!("coordinator stopped");
        Ok(())
    }

    pub async fn health_check(&self) -> OrchestratorResult<()> {
        self.datastore.health_check().await?;
        self.broker.health_check().await
    }

    /// Runs a request through the request middleware chain.
    pub async fn handle_request(&self, request: Request) -> OrchestratorResult<Response> {
        let kind = request.kind();
        let mut event = RequestEvent::new(request);
        self.requests.handle(&mut event).await?;
        event.response.ok_or_else(|| {
            OrchestratorError::Rejected(format!("{kind} request was not dispatched"))
        })
    }

    pub async fn submit_job(&self, spec: JobSpec) -> OrchestratorResult<Job> {
        match self.handle_request(Request::SubmitJob(spec)).await? {
            Response::Job(job) => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_job(&self, id: &str) -> OrchestratorResult<Job> {
        match self
            .handle_request(Request::GetJob { id: id.to_string() })
            .await?
        {
            Response::Job(job) => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel_job(&self, id: &str) -> OrchestratorResult<Job> {
        match self
            .handle_request(Request::CancelJob { id: id.to_string() })
            .await?
        {
            Response::Job(job) => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_jobs(&self) -> OrchestratorResult<Vec<Job>> {
        match self.handle_request(Request::ListJobs).await? {
            Response::Jobs(jobs) => Ok(jobs),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_nodes(&self) -> OrchestratorResult<Vec<Node>> {
        match self.handle_request(Request::ListNodes).await? {
            Response::Nodes(nodes) => Ok(nodes),
            other => Err(unexpected(other)),
        }
    }

    /// Tasks of a job in declaration order.
    pub async fn list_tasks(&self, job_id: &str) -> OrchestratorResult<Vec<Task>> {
        let mut tasks = self.controller.list_tasks(job_id).await?;
        tasks.sort_by_key(|t| t.position);
        Ok(tasks)
    }
}

fn unexpected(response: Response) -> OrchestratorError {
    OrchestratorError::Internal(format!("unexpected response: {response:?}"))
}

/// Terminal request handler.
struct Dispatch {
    controller: Arc<JobController>,
}

#[async_trait]
impl Handler<RequestEvent> for Dispatch {
    async fn handle(&self, event: &mut RequestEvent) -> OrchestratorResult<()> {
        let response = match &event.request {
            Request::SubmitJob(spec) => Response::Job(self.controller.submit(spec.clone()).await?),
            Request::GetJob { id } => Response::Job(self.controller.get_job(id).await?),
            Request::CancelJob { id } => Response::Job(self.controller.cancel_job(id).await?),
            Request::ListJobs => Response::Jobs(self.controller.list_jobs().await?),
            Request::ListNodes => Response::Nodes(self.controller.list_nodes().await?),
        };
        event.response = Some(response);
        Ok(())
    }
}
