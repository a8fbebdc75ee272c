pub mod app_config;
pub mod broker_datastore;
pub mod coordinator_worker;
pub mod observability;

// Re-export main types for easier imports
pub use app_config::{AppConfig, ENV_PREFIX, ENV_SEPARATOR};
pub use broker_datastore::{
    BrokerConfig, DatastoreConfig, PostgresConfig, RabbitMqConfig, INMEMORY_PROVIDER,
    POSTGRES_PROVIDER, RABBITMQ_PROVIDER,
};
pub use coordinator_worker::{
    BackoffConfig, CoordinatorConfig, QueuePolicyKind, RetryConfig, RuntimeType, WorkerConfig,
};
pub use observability::{LoggingConfig, ObservabilityConfig};
