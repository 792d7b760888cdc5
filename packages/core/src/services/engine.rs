//! TreeEngine Trait - Strategy Abstraction
//!
//! Every encoding (nested set, closure table, materialized path) implements
//! [`TreeEngine`] so callers can swap strategies through [`TreeConfig`]
//! without touching the code that inserts, moves and removes nodes.
//!
//! Only the nested set encoding can be checked and rebuilt from its own
//! derived fields, so verification lives in the separate [`TreeRepair`] trait.

use crate::config::{TreeConfig, TreeStrategy};
use crate::db::StorageGateway;
use crate::models::{ChildOrder, InsertPosition, TreeNode};
use crate::services::closure_table::ClosureTableEngine;
use crate::services::error::TreeError;
use crate::services::materialized_path::MaterializedPathEngine;
use crate::services::nested_set::NestedSetEngine;
use crate::services::traversal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of a removal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalSummary {
    /// Node records deleted
    pub removed: u64,
    /// Children that were handed to the removed node's parent (or promoted to roots)
    pub reparented: Vec<String>,
}

/// Hierarchy operations shared by all encodings.
///
/// All mutations either complete or leave the store as it was: engines run
/// them inside a transaction when the gateway supports one and under the
/// root lock otherwise.
#[async_trait]
pub trait TreeEngine: Send + Sync {
    fn strategy(&self) -> TreeStrategy;

    fn store(&self) -> &Arc<dyn StorageGateway>;

    /// Place a new node. Returns the record as stored.
    ///
    /// # Errors
    ///
    /// - `InvalidPosition` if the reference node is missing, or a sibling
    ///   position is requested relative to a root
    async fn insert(&self, node: TreeNode, position: InsertPosition)
        -> Result<TreeNode, TreeError>;

    /// Relocate a node together with its subtree.
    ///
    /// # Errors
    ///
    /// - `CyclicMove` if the destination is the node or one of its descendants
    /// - `InvalidPosition` as for `insert`
    async fn move_node(&self, node_id: &str, position: InsertPosition)
        -> Result<TreeNode, TreeError>;

    /// Delete one node; its children take its place under its parent.
    async fn remove_single_node(&self, node_id: &str) -> Result<RemovalSummary, TreeError>;

    /// Delete a node with all of its descendants.
    async fn remove_subtree(&self, node_id: &str) -> Result<RemovalSummary, TreeError>;

    /// Descendants of the node, excluding itself, in encoding order.
    async fn descendants(&self, node_id: &str) -> Result<Vec<TreeNode>, TreeError>;

    /// Direct children ordered by stored position.
    async fn children(&self, node_id: &str) -> Result<Vec<TreeNode>, TreeError> {
        traversal::require_node(self.store(), node_id).await?;
        Ok(self
            .store()
            .children_of(Some(node_id), ChildOrder::by_position())
            .await?)
    }

    /// Ancestors of the node, nearest first.
    async fn ancestors(&self, node_id: &str) -> Result<Vec<TreeNode>, TreeError> {
        traversal::ancestor_chain(self.store(), node_id).await
    }

    /// Fail with `StaleState` if `node` no longer matches the stored record.
    async fn ensure_current(&self, node: &TreeNode) -> Result<(), TreeError> {
        let stored = traversal::require_node(self.store(), &node.id).await?;
        if stored.parent_id != node.parent_id {
            return Err(TreeError::stale_state(&node.id, "parent changed"));
        }
        if stored.position != node.position {
            return Err(TreeError::stale_state(&node.id, "position changed"));
        }
        Ok(())
    }
}

/// One structural problem found by [`TreeRepair::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Violation {
    MissingRoot {
        root_id: String,
    },
    RootHasParent {
        root_id: String,
        parent_id: String,
    },
    /// Root bounds are not `(1, 2n)` for the `n` nodes tagged with the tree
    RootBoundsMismatch {
        root_id: String,
        left: i64,
        right: i64,
        expected_right: i64,
    },
    InvalidBounds {
        node_id: String,
        left: i64,
        right: i64,
    },
    /// `right - left` is even, so the bounds cannot enclose whole children
    EvenWidth {
        node_id: String,
        left: i64,
        right: i64,
    },
    MissingIndex {
        index: i64,
    },
    DuplicateIndex {
        index: i64,
        node_ids: Vec<String>,
    },
    LevelMismatch {
        node_id: String,
        expected: i64,
        actual: i64,
    },
    /// Non-root node whose parent is missing or outside the tree
    OrphanedNode {
        node_id: String,
        parent_id: Option<String>,
    },
    OutsideParent {
        node_id: String,
        parent_id: String,
    },
    SiblingOverlap {
        first_id: String,
        second_id: String,
    },
    /// Node reachable through parent links but tagged with another tree
    RootMismatch {
        node_id: String,
        expected_root: String,
        actual_root: Option<String>,
    },
}

/// Result of verifying one tree. Verification never writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub root_id: String,
    pub node_count: usize,
    pub violations: Vec<Violation>,
}

impl VerificationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Result of rebuilding derived fields from parent links.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub root_id: String,
    /// Roots of every tree that was renumbered, requested tree first
    pub trees: Vec<String>,
    /// Records whose derived fields changed
    pub renumbered: usize,
    /// Nodes whose broken parent link was cleared, making them roots
    pub promoted_roots: Vec<String>,
    /// Trees reached through parent links whose root lock another writer held;
    /// each needs its own `recover` call
    pub deferred_trees: Vec<String>,
}

/// Verification and recovery for encodings that can check themselves.
#[async_trait]
pub trait TreeRepair: Send + Sync {
    async fn verify(&self, root_id: &str) -> Result<VerificationReport, TreeError>;

    /// Rebuild all derived fields of the tree from parent links.
    async fn recover(&self, root_id: &str) -> Result<RecoveryReport, TreeError>;
}

/// Build the engine selected by `config.strategy`.
pub fn engine_for(
    config: TreeConfig,
    store: Arc<dyn StorageGateway>,
) -> Result<Arc<dyn TreeEngine>, TreeError> {
    config.validate().map_err(TreeError::Configuration)?;
    tracing::debug!("Creating {:?} engine", config.strategy);

    let engine: Arc<dyn TreeEngine> = match config.strategy {
        TreeStrategy::NestedSet => Arc::new(NestedSetEngine::new(store, &config)),
        TreeStrategy::ClosureTable => Arc::new(ClosureTableEngine::new(store, &config)),
        TreeStrategy::MaterializedPath => Arc::new(MaterializedPathEngine::new(store, &config)),
    };
    Ok(engine)
}
