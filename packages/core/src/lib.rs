//! Arbor Core - Tree Encodings for Flat Record Stores
//!
//! This crate keeps hierarchical data queryable inside a store that only knows
//! flat records. Nodes store a parent id; an engine maintains a derived
//! encoding so subtree, ancestor and child reads need no recursive queries.
//!
//! # Architecture
//!
//! - **Three encodings**: nested set intervals, closure table rows, materialized paths
//! - **Parent links as truth**: every derived field can be rebuilt from them
//! - **Storage agnostic**: engines talk to an async `StorageGateway`
//! - **Atomic or locked**: transactional stores wrap each mutation in a
//!   transaction; others serialize writers with a root-level lock
//!
//! # Modules
//!
//! - [`models`] - Node records, positions and orderings
//! - [`db`] - Storage gateway trait, bulk update vocabulary, in-memory store
//! - [`services`] - Tree engines, verification/recovery, lock manager
//! - [`operations`] - Retry wrapper for lock contention
//! - [`config`] - Per-tree configuration
//! - [`logging`] - Tracing subscriber bootstrap

pub mod config;
pub mod db;
pub mod logging;
pub mod models;
pub mod operations;
pub mod services;

// Re-export commonly used types
pub use config::{TreeConfig, TreeStrategy};
pub use models::*;
pub use services::*;
