use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use orchestrator_core::{
    config::{
        BrokerConfig, DatastoreConfig, INMEMORY_PROVIDER, POSTGRES_PROVIDER, RABBITMQ_PROVIDER,
    },
    traits::{Broker, Datastore},
    OrchestratorError, OrchestratorResult,
};
use tracing::{debug, info};

use crate::{InMemoryBroker, InMemoryDatastore, PostgresDatastore, RabbitMqBroker};

pub type BrokerFactory = Arc<
    dyn Fn(BrokerConfig) -> BoxFuture<'static, OrchestratorResult<Arc<dyn Broker>>> + Send + Sync,
>;
pub type DatastoreFactory = Arc<
    dyn Fn(DatastoreConfig) -> BoxFuture<'static, OrchestratorResult<Arc<dyn Datastore>>>
        + Send
        + Sync,
>;

/// Named broker and datastore constructors.
///
/// Built once at startup and then shared read-only; the `type` field of the
/// broker and datastore configuration sections selects the provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    brokers: HashMap<String, BrokerFactory>,
    datastores: HashMap<String, DatastoreFactory>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers: `inmemory` and `rabbitmq`
    /// brokers, `inmemory` and `postgres` datastores.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_broker(INMEMORY_PROVIDER, |config: BrokerConfig| {
                Box::pin(async move {
                    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::with_policy(
                        config.error_policy,
                        config.max_redeliveries,
                    ));
                    Ok::<_, OrchestratorError>(broker)
                })
            })
            .with_broker(RABBITMQ_PROVIDER, |config: BrokerConfig| {
                Box::pin(async move {
                    let broker: Arc<dyn Broker> = Arc::new(
                        RabbitMqBroker::new(
                            config.rabbitmq,
                            config.error_policy,
                            config.max_redeliveries,
                        )
                        .await?,
                    );
                    Ok::<_, OrchestratorError>(broker)
                })
            })
            .with_datastore(INMEMORY_PROVIDER, |_config: DatastoreConfig| {
                Box::pin(async move {
                    let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
                    Ok::<_, OrchestratorError>(datastore)
                })
            })
            .with_datastore(POSTGRES_PROVIDER, |config: DatastoreConfig| {
                Box::pin(async move {
                    let datastore: Arc<dyn Datastore> =
                        Arc::new(PostgresDatastore::connect(&config.postgres).await?);
                    Ok::<_, OrchestratorError>(datastore)
                })
            })
    }

    pub fn with_broker<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(BrokerConfig) -> BoxFuture<'static, OrchestratorResult<Arc<dyn Broker>>>
            + Send
            + Sync
            + 'static,
    {
        self.brokers.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn with_datastore<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(DatastoreConfig) -> BoxFuture<'static, OrchestratorResult<Arc<dyn Datastore>>>
            + Send
            + Sync
            + 'static,
    {
        self.datastores.insert(name.into(), Arc::new(factory));
        self
    }

    pub async fn create_broker(&self, config: &BrokerConfig) -> OrchestratorResult<Arc<dyn Broker>> {
        debug!(provider = %config.r#type, "creating broker");
        let factory = self.brokers.get(&config.r#type).ok_or_else(|| {
            OrchestratorError::Configuration(format!("unknown broker type: {}", config.r#type))
        })?;
        let broker = factory(config.clone()).await?;
        info!(provider = %config.r#type, "broker ready");
        Ok(broker)
    }

    pub async fn create_datastore(
        &self,
        config: &DatastoreConfig,
    ) -> OrchestratorResult<Arc<dyn Datastore>> {
        debug!(provider = %config.r#type, "creating datastore");
        let factory = self.datastores.get(&config.r#type).ok_or_else(|| {
            OrchestratorError::Configuration(format!("unknown datastore type: {}", config.r#type))
        })?;
        let datastore = factory(config.clone()).await?;
        info!(provider = %config.r#type, "datastore ready");
        Ok(datastore)
    }

    pub fn broker_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.brokers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn datastore_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.datastores.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("brokers", &self.broker_types())
            .field("datastores", &self.datastore_types())
            .finish()
    }
}
