//! Distributed job orchestration engine.
//!
//! The workspace crates hold the tiers; this crate assembles them into a
//! process per [`Mode`].

pub mod engine;
pub mod shutdown;

pub use engine::{Engine, EngineContext, Mode, StartedHook, Tier};
pub use shutdown::{ShutdownManager, ShutdownReason};
