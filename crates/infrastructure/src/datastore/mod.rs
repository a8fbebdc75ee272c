pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryDatastore;
pub use postgres::PostgresDatastore;
