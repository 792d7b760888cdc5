//! Tree Engines
//!
//! This module contains the hierarchy maintenance logic:
//!
//! - `NestedSetEngine` - left/right intervals, with verification and recovery
//! - `ClosureTableEngine` - explicit ancestor/descendant rows
//! - `MaterializedPathEngine` - separator-joined path strings
//! - `LockManager` - root-level cooperative locking for non-transactional stores
//!
//! All engines implement [`TreeEngine`]; [`engine_for`] picks one from a
//! [`crate::config::TreeConfig`]. Engines keep only parent links as the source
//! of truth and recompute every derived field from them.

pub mod closure_table;
pub mod engine;
pub mod error;
pub mod lock_manager;
pub mod materialized_path;
pub mod nested_set;
mod traversal;
mod unit_of_work;

pub use closure_table::ClosureTableEngine;
pub use engine::{
    engine_for, RecoveryReport, RemovalSummary, TreeEngine, TreeRepair, VerificationReport,
    Violation,
};
pub use error::TreeError;
pub use lock_manager::{LockManager, RootLockGuard};
pub use materialized_path::MaterializedPathEngine;
pub use nested_set::NestedSetEngine;
