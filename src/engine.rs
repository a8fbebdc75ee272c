//! Process bootstrap.
//!
//! An [`Engine`] assembles the tiers of one [`Mode`], starts them in order,
//! blocks until a signal or [`Engine::terminate`] and stops them in reverse.
//!
//! ```text
//!   start:  broker ─▶ datastore ─▶ coordinator ─▶ worker ─▶ on_started
//!   stop:   worker ─▶ coordinator ─▶ broker shutdown
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use orchestrator_coordinator::{Coordinator, CoordinatorBuilder};
use orchestrator_core::{
    config::AppConfig,
    traits::Broker,
    OrchestratorError, OrchestratorResult,
};
use orchestrator_infrastructure::ProviderRegistry;
use orchestrator_worker::{WorkerService, WorkerServiceBuilder};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::shutdown::ShutdownManager;

/// Deployment topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Coordinator,
    Worker,
    /// Coordinator and worker in one process.
    #[default]
    Standalone,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Coordinator => "coordinator",
            Mode::Worker => "worker",
            Mode::Standalone => "standalone",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(Mode::Coordinator),
            "worker" => Ok(Mode::Worker),
            "standalone" => Ok(Mode::Standalone),
            other => Err(OrchestratorError::Configuration(format!(
                "unknown mode: {other}"
            ))),
        }
    }
}

/// A component the engine starts and stops.
#[async_trait]
pub trait Tier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> OrchestratorResult<()>;

    async fn stop(&self) -> OrchestratorResult<()>;
}

#[async_trait]
impl Tier for Coordinator {
    fn name(&self) -> &'static str {
        "coordinator"
    }

    async fn start(&self) -> OrchestratorResult<()> {
        Coordinator::start(self).await
    }

    async fn stop(&self) -> OrchestratorResult<()> {
        Coordinator::stop(self).await
    }
}

#[async_trait]
impl Tier for WorkerService {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn start(&self) -> OrchestratorResult<()> {
        WorkerService::start(self).await
    }

    async fn stop(&self) -> OrchestratorResult<()> {
        WorkerService::stop(self).await
    }
}

/// What the `on_started` hook can reach.
#[derive(Clone)]
pub struct EngineContext {
    pub broker: Arc<dyn Broker>,
    pub coordinator: Option<Arc<Coordinator>>,
    pub worker: Option<Arc<WorkerService>>,
}

pub type StartedHook =
    Box<dyn FnOnce(EngineContext) -> BoxFuture<'static, OrchestratorResult<()>> + Send>;

type CoordinatorCustomizer = Box<dyn Fn(CoordinatorBuilder) -> CoordinatorBuilder + Send + Sync>;

/// Tiers of one mode, in start order.
struct Assembly {
    tiers: Vec<Arc<dyn Tier>>,
    coordinator: Option<Arc<Coordinator>>,
    worker: Option<Arc<WorkerService>>,
}

struct Running {
    broker: Arc<dyn Broker>,
    tiers: Vec<Arc<dyn Tier>>,
    context: EngineContext,
}

pub struct Engine {
    config: AppConfig,
    mode: Mode,
    registry: ProviderRegistry,
    customize_coordinator: Option<CoordinatorCustomizer>,
    on_started: std::sync::Mutex<Option<StartedHook>>,
    shutdown: ShutdownManager,
    running: Mutex<Option<Running>>,
}

impl Engine {
    pub fn new(config: AppConfig, mode: Mode) -> Self {
        Self {
            config,
            mode,
            registry: ProviderRegistry::with_defaults(),
            customize_coordinator: None,
            on_started: std::sync::Mutex::new(None),
            shutdown: ShutdownManager::new(),
            running: Mutex::new(None),
        }
    }

    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Runs once every tier has started; an error aborts startup.
    pub fn on_started<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(EngineContext) -> BoxFuture<'static, OrchestratorResult<()>> + Send + 'static,
    {
        self.on_started = std::sync::Mutex::new(Some(Box::new(hook)));
        self
    }

    /// Adjusts the coordinator before it is built, e.g. to register
    /// middleware.
    pub fn configure_coordinator<F>(mut self, customize: F) -> Self
    where
        F: Fn(CoordinatorBuilder) -> CoordinatorBuilder + Send + Sync + 'static,
    {
        self.customize_coordinator = Some(Box::new(customize));
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn shutdown_manager(&self) -> ShutdownManager {
        self.shutdown.clone()
    }

    /// Requests the same shutdown an OS signal would.
    pub fn terminate(&self) {
        self.shutdown.shutdown();
    }

    pub async fn context(&self) -> Option<EngineContext> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.context.clone())
    }

    pub async fn coordinator(&self) -> Option<Arc<Coordinator>> {
        self.context().await.and_then(|context| context.coordinator)
    }

    /// Builds the providers and starts every tier. On failure the tiers
    /// already started are stopped again before the error is returned.
    pub async fn start(&self) -> OrchestratorResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("engine already started");
            return Ok(());
        }

        info!("Starting engine: mode={}", self.mode);
        let broker = self.registry.create_broker(&self.config.broker).await?;
        let assembly = match self.assemble(broker.clone()).await {
            Ok(assembly) => assembly,
            Err(e) => {
                shutdown_broker(&broker).await;
                return Err(e);
            }
        };

        let mut started: Vec<Arc<dyn Tier>> = Vec::with_capacity(assembly.tiers.len());
        for tier in &assembly.tiers {
            info!(tier = tier.name(), "starting tier");
            if let Err(e) = tier.start().await {
                error!(tier = tier.name(), error = %e, "tier failed to start");
                stop_tiers(&started).await;
                shutdown_broker(&broker).await;
                return Err(e);
            }
            started.push(tier.clone());
        }

        let context = EngineContext {
            broker: broker.clone(),
            coordinator: assembly.coordinator,
            worker: assembly.worker,
        };

        let hook = self.on_started.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            if let Err(e) = hook(context.clone()).await {
                error!(error = %e, "startup hook failed");
                stop_tiers(&started).await;
                shutdown_broker(&broker).await;
                return Err(e);
            }
        }

        *running = Some(Running {
            broker,
            tiers: started,
            context,
        });
        info!(mode = %self.mode, "engine started");
        Ok(())
    }

    async fn assemble(&self, broker: Arc<dyn Broker>) -> OrchestratorResult<Assembly> {
        match self.mode {
            Mode::Coordinator => self.assemble_coordinator(broker).await,
            Mode::Worker => Ok(self.assemble_worker(broker)),
            Mode::Standalone => self.assemble_standalone(broker).await,
        }
    }

    async fn assemble_coordinator(&self, broker: Arc<dyn Broker>) -> OrchestratorResult<Assembly> {
        let datastore = self
            .registry
            .create_datastore(&self.config.datastore)
            .await?;
        let mut builder =
            Coordinator::builder(broker, datastore).config(self.config.coordinator.clone());
        if let Some(customize) = &self.customize_coordinator {
            builder = customize(builder);
        }
        let coordinator = Arc::new(builder.build());
        Ok(Assembly {
            tiers: vec![coordinator.clone()],
            coordinator: Some(coordinator),
            worker: None,
        })
    }

    fn assemble_worker(&self, broker: Arc<dyn Broker>) -> Assembly {
        let worker = Arc::new(WorkerServiceBuilder::from_config(&self.config.worker, broker).build());
        Assembly {
            tiers: vec![worker.clone()],
            coordinator: None,
            worker: Some(worker),
        }
    }

    /// Coordinator first, so status reports of the first tasks find a
    /// consumer.
    async fn assemble_standalone(&self, broker: Arc<dyn Broker>) -> OrchestratorResult<Assembly> {
        let coordinator = self.assemble_coordinator(broker.clone()).await?;
        let worker = self.assemble_worker(broker);
        Ok(Assembly {
            tiers: coordinator.tiers.into_iter().chain(worker.tiers).collect(),
            coordinator: coordinator.coordinator,
            worker: worker.worker,
        })
    }

    /// Blocks until Ctrl-C, SIGTERM or [`Engine::terminate`].
    pub async fn wait(&self) {
        self.shutdown.wait_for_signal().await;
    }

    /// Stops the tiers in reverse start order, then the broker. Failures are
    /// logged and do not keep the remaining tiers running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        info!(mode = %self.mode, "stopping engine");
        stop_tiers(&running.tiers).await;
        shutdown_broker(&running.broker).await;
        info!("engine stopped");
    }

    /// `start`, `wait`, `stop`. Only a startup failure is returned.
    pub async fn run(&self) -> OrchestratorResult<()> {
        self.start().await?;
        self.wait().await;
        self.stop().await;
        Ok(())
    }
}

async fn stop_tiers(tiers: &[Arc<dyn Tier>]) {
    for tier in tiers.iter().rev() {
        info!(tier = tier.name(), "stopping tier");
        if let Err(e) = tier.stop().await {
            error!(tier = tier.name(), error = %e, "failed to stop tier");
        }
    }
}

async fn shutdown_broker(broker: &Arc<dyn Broker>) {
    if let Err(e) = broker.shutdown().await {
        error!(error = %e, "failed to shut down broker");
    }
}
