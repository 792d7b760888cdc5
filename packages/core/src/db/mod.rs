//! Storage Layer
//!
//! This module defines the seam between the tree engines and whatever holds
//! the records:
//!
//! - `StorageGateway` - async trait every backend implements
//! - `NodePredicate` / `FieldUpdate` / `ClosurePredicate` - bulk operation vocabulary
//! - `MemoryStore` - in-memory reference backend (transactional or not)
//! - `StoreError` - gateway error type
//!
//! # Architecture
//!
//! Engines express every derived-field change as a predicate plus a field
//! update so a backend can execute it as one bulk statement. Backends that
//! cannot group writes atomically report `supports_transactions() == false`
//! and the engines switch to root-level locking.

mod error;
mod gateway;
mod memory_store;
mod predicate;

pub use error::StoreError;
pub use gateway::{StorageGateway, StoreResult};
pub use memory_store::MemoryStore;
pub use predicate::{Bound, ClosurePredicate, FieldUpdate, NodePredicate};
