//! # Orchestrator Testing Utils
//!
//! Shared test doubles, builders and containers for the workspace crates.
//!
//! ```toml
//! [dev-dependencies]
//! orchestrator-testing-utils = { path = "../testing-utils" }
//! ```
//!
//! ```rust,ignore
//! use orchestrator_testing_utils::{MockBroker, MockOutcome, MockRuntime, TaskBuilder};
//! ```

pub mod builders;
pub mod containers;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use containers::*;
pub use helpers::*;
pub use mocks::*;
