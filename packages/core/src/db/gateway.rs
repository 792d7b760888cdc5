//! StorageGateway Trait - Backing Store Abstraction
//!
//! This module defines the `StorageGateway` trait the tree engines talk to.
//! The engines never assume a particular database: anything that can read and
//! write single records, run predicate-based bulk updates and (optionally)
//! group writes atomically can host a tree.
//!
//! # Design Decisions
//!
//! 1. **Async-First**: all methods are async so embedded and networked backends
//!    implement the same trait
//! 2. **Ownership Semantics**: writes take records by value; callers clone when
//!    they need to keep a copy
//! 3. **Bulk Vocabulary**: range shifts and prefix rewrites are expressed as
//!    [`NodePredicate`] + [`FieldUpdate`] so a backend can run them as one
//!    statement instead of N record writes
//! 4. **Transactions Optional**: backends report `supports_transactions()`;
//!    engines fall back to root locking when it is false
//!
//! # Examples
//!
//! ```rust,no_run
//! use arbor_core::db::{MemoryStore, StorageGateway};
//! use arbor_core::models::TreeNode;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), arbor_core::db::StoreError> {
//! let store: Arc<dyn StorageGateway> = Arc::new(MemoryStore::new());
//! store.insert_node(TreeNode::with_id("1", "Food")).await?;
//! assert!(store.get_node("1").await?.is_some());
//! # Ok(())
//! # }
//! ```

use crate::db::error::StoreError;
use crate::db::predicate::{ClosurePredicate, FieldUpdate, NodePredicate};
use crate::models::{ChildOrder, ClosureRow, TreeNode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Result alias for gateway calls
pub type StoreResult<T> = Result<T, StoreError>;

/// Abstraction over the flat record store holding tree nodes.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; engines share one gateway through
/// `Arc<dyn StorageGateway>` across tasks.
///
/// # Method Categories
///
/// - **Records**: single-node reads and writes, child listing
/// - **Bulk**: predicate-based update and delete
/// - **Locks**: compare-and-set on a root's `lock_time`
/// - **Transactions**: optional atomic grouping
/// - **Closure rows**: the auxiliary ancestor/descendant relation
#[async_trait]
pub trait StorageGateway: Send + Sync {
    //
    // RECORDS
    //

    /// Get node by id; `Ok(None)` when it does not exist.
    async fn get_node(&self, id: &str) -> StoreResult<Option<TreeNode>>;

    /// Insert a new node.
    ///
    /// # Errors
    ///
    /// `DuplicateRecord` if the id is taken.
    async fn insert_node(&self, node: TreeNode) -> StoreResult<()>;

    /// Replace a stored node with the given record.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` if the id is unknown.
    async fn update_node(&self, node: TreeNode) -> StoreResult<()>;

    /// Delete one node. Returns false when nothing was deleted.
    async fn delete_node(&self, id: &str) -> StoreResult<bool>;

    /// Children of `parent_id`, or every root when `None`.
    ///
    /// Ordering follows `order`; ties are broken by id.
    async fn children_of(&self, parent_id: Option<&str>, order: ChildOrder)
        -> StoreResult<Vec<TreeNode>>;

    /// All nodes matching the predicate, in no particular order.
    async fn nodes_matching(&self, predicate: &NodePredicate) -> StoreResult<Vec<TreeNode>>;

    //
    // BULK
    //

    /// Apply `update` to every node matching `predicate`.
    ///
    /// Returns the number of records changed.
    async fn bulk_update(&self, predicate: &NodePredicate, update: &FieldUpdate)
        -> StoreResult<u64>;

    /// Delete every node matching `predicate`. Returns the count deleted.
    async fn delete_matching(&self, predicate: &NodePredicate) -> StoreResult<u64>;

    //
    // LOCKS
    //

    /// Set `lock_time` on `root_id` to `new` only if it currently equals `expected`.
    ///
    /// Returns false when another writer changed it first.
    async fn compare_and_set_lock(
        &self,
        root_id: &str,
        expected: Option<DateTime<Utc>>,
        new: Option<DateTime<Utc>>,
    ) -> StoreResult<bool>;

    /// Unconditionally write `lock_time` on `root_id`.
    async fn write_lock(&self, root_id: &str, value: Option<DateTime<Utc>>) -> StoreResult<()>;

    //
    // TRANSACTIONS
    //

    /// Whether begin/commit/rollback provide real atomicity.
    fn supports_transactions(&self) -> bool;

    /// Start a transaction. Waits while a conflicting transaction is open
    /// rather than failing, so concurrent units on different trees queue up.
    async fn begin_transaction(&self) -> StoreResult<()>;

    async fn commit_transaction(&self) -> StoreResult<()>;

    async fn rollback_transaction(&self) -> StoreResult<()>;

    //
    // CLOSURE ROWS
    //

    /// Insert closure rows; an existing `(ancestor, descendant)` pair is overwritten.
    async fn insert_closure_rows(&self, rows: Vec<ClosureRow>) -> StoreResult<()>;

    /// Rows matching the predicate, ordered by depth then ids.
    async fn closure_rows(&self, predicate: &ClosurePredicate) -> StoreResult<Vec<ClosureRow>>;

    /// Delete rows matching the predicate. Returns the count deleted.
    async fn delete_closure_rows(&self, predicate: &ClosurePredicate) -> StoreResult<u64>;
}
