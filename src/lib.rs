//! Budget reconciliation and change-impact engine.
//!
//! Keeps customer quotes for scraped travel packages consistent while the
//! underlying packages change upstream:
//!
//! - `detect`: typed diff between two package snapshots
//! - `impact`: severity scoring and strategy selection
//! - `strategy`: repricing, substitution and invalidation
//! - `versioning`: append-only checkpoint chains and replay
//! - `scheduler`: per-budget serialized reconciliation workers

pub mod alternatives;
pub mod budget;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod events;
pub mod impact;
pub mod package;
pub mod scheduler;
pub mod storage;
pub mod strategy;
pub mod versioning;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use engine::{Engine, EngineSettings};
pub use error::ReconcileError;
