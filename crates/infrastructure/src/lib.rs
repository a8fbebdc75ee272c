pub mod broker;
pub mod datastore;
pub mod registry;

pub use broker::{InMemoryBroker, RabbitMqBroker};
pub use datastore::{InMemoryDatastore, PostgresDatastore};
pub use registry::ProviderRegistry;
