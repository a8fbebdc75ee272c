pub mod broker;
pub mod datastore;
pub mod runtime;

pub use broker::*;
pub use datastore::*;
pub use runtime::*;
