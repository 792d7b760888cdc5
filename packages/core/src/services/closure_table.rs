//! Closure Table Engine
//!
//! Stores every `(ancestor, descendant, depth)` pair explicitly, self rows
//! included, so both subtree and ancestor-chain reads are one row lookup.
//! The encoding keeps no sibling order: child and sibling positions only
//! choose the parent.
//!
//! Rows are fully derivable from parent links; [`ClosureTableEngine::rebuild`]
//! regenerates them for a whole tree.

use crate::config::{TreeConfig, TreeStrategy};
use crate::db::{ClosurePredicate, NodePredicate, StorageGateway};
use crate::models::{ClosureRow, InsertPosition, NodePosition, TreeNode};
use crate::services::engine::{RemovalSummary, TreeEngine};
use crate::services::error::TreeError;
use crate::services::lock_manager::LockManager;
use crate::services::traversal;
use crate::services::unit_of_work::UnitOfWork;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ClosureTableEngine {
    store: Arc<dyn StorageGateway>,
    locks: Option<LockManager>,
}

impl ClosureTableEngine {
    pub fn new(store: Arc<dyn StorageGateway>, config: &TreeConfig) -> Self {
        let locks = config
            .locking
            .then(|| LockManager::new(store.clone(), config.lock_timeout()));
        Self { store, locks }
    }

    /// Regenerate every closure row of the tree below `root_id` from parent links.
    ///
    /// Returns the number of rows written.
    pub async fn rebuild(&self, root_id: &str) -> Result<usize, TreeError> {
        let top = traversal::root_of(&self.store, root_id).await?;
        let unit = self.begin(vec![top], "closure rebuild").await?;
        let result = self.rebuild_locked(root_id).await;
        unit.finish(result).await
    }

    async fn begin(
        &self,
        roots: Vec<String>,
        operation: &'static str,
    ) -> Result<UnitOfWork, TreeError> {
        UnitOfWork::begin(&self.store, self.locks.as_ref(), &roots, operation).await
    }

    async fn member(&self, id: &str) -> Result<TreeNode, TreeError> {
        let node = traversal::require_node(&self.store, id).await?;
        if node.position != NodePosition::ClosureTable {
            return Err(TreeError::invalid_position(
                id,
                "node is not part of a closure table tree",
            ));
        }
        Ok(node)
    }

    /// New parent for `node_id`, checked to belong to this encoding.
    async fn resolve_parent(
        &self,
        node_id: &str,
        position: &InsertPosition,
    ) -> Result<Option<TreeNode>, TreeError> {
        let parent = traversal::parent_for_position(&self.store, node_id, position).await?;
        if let Some(parent) = &parent {
            if parent.position != NodePosition::ClosureTable {
                return Err(TreeError::invalid_position(
                    node_id,
                    format!("'{}' is not part of a closure table tree", parent.id),
                ));
            }
        }
        Ok(parent)
    }

    async fn is_ancestor(&self, ancestor_id: &str, descendant_id: &str) -> Result<bool, TreeError> {
        let rows = self
            .store
            .closure_rows(&ClosurePredicate::Between {
                ancestors: vec![ancestor_id.to_string()],
                descendants: vec![descendant_id.to_string()],
            })
            .await?;
        Ok(!rows.is_empty())
    }

    /// Rows `(A, child, d + 1)` for every row `(A, parent, d)`, plus the self row.
    async fn rows_for_new_node(
        &self,
        node_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<ClosureRow>, TreeError> {
        let mut rows = vec![ClosureRow::self_row(node_id)];
        if let Some(parent_id) = parent_id {
            for row in self
                .store
                .closure_rows(&ClosurePredicate::AncestorsOf(parent_id.to_string()))
                .await?
            {
                rows.push(ClosureRow::new(row.ancestor_id, node_id, row.depth + 1));
            }
        }
        Ok(rows)
    }

    async fn insert_locked(
        &self,
        mut node: TreeNode,
        parent_id: Option<String>,
        roots: &[String],
    ) -> Result<TreeNode, TreeError> {
        if let Some(parent_id) = &parent_id {
            traversal::ensure_covered(&self.store, parent_id, roots).await?;
        }
        let rows = self.rows_for_new_node(&node.id, parent_id.as_deref()).await?;
        node.parent_id = parent_id;
        node.position = NodePosition::ClosureTable;
        self.store.insert_node(node.clone()).await?;
        let count = rows.len();
        self.store.insert_closure_rows(rows).await?;
        tracing::debug!("Inserted node '{}' with {} closure rows", node.id, count);
        Ok(node)
    }

    /// Re-check a move under the unit, then reattach.
    async fn move_locked(
        &self,
        node_id: &str,
        position: &InsertPosition,
        roots: &[String],
    ) -> Result<TreeNode, TreeError> {
        self.member(node_id).await?;
        traversal::ensure_covered(&self.store, node_id, roots).await?;
        let parent = self.resolve_parent(node_id, position).await?;
        if let Some(parent) = &parent {
            self.reject_cycle(node_id, &parent.id).await?;
            traversal::ensure_covered(&self.store, &parent.id, roots).await?;
        }
        self.reattach(node_id, parent.as_ref().map(|p| p.id.as_str()))
            .await
    }

    async fn reject_cycle(&self, node_id: &str, parent_id: &str) -> Result<(), TreeError> {
        if parent_id == node_id || self.is_ancestor(node_id, parent_id).await? {
            return Err(TreeError::cyclic_move(node_id, parent_id));
        }
        Ok(())
    }

    /// Detach the subtree of `node_id` from its old ancestors and attach it below
    /// `new_parent_id`.
    async fn reattach(
        &self,
        node_id: &str,
        new_parent_id: Option<&str>,
    ) -> Result<TreeNode, TreeError> {
        let subtree = self
            .store
            .closure_rows(&ClosurePredicate::DescendantsOf(node_id.to_string()))
            .await?;
        let old_ancestors: Vec<String> = self
            .store
            .closure_rows(&ClosurePredicate::AncestorsOf(node_id.to_string()))
            .await?
            .into_iter()
            .filter(|row| !row.is_self_row())
            .map(|row| row.ancestor_id)
            .collect();
        let subtree_ids: Vec<String> = subtree.iter().map(|r| r.descendant_id.clone()).collect();

        let deleted = if old_ancestors.is_empty() {
            0
        } else {
            self.store
                .delete_closure_rows(&ClosurePredicate::Between {
                    ancestors: old_ancestors,
                    descendants: subtree_ids,
                })
                .await?
        };

        let mut rows = Vec::new();
        if let Some(parent_id) = new_parent_id {
            let new_ancestors = self
                .store
                .closure_rows(&ClosurePredicate::AncestorsOf(parent_id.to_string()))
                .await?;
            // Subtree rows arrive ordered by depth, so descendants are linked level by level
            for local in &subtree {
                for ancestor in &new_ancestors {
                    rows.push(ClosureRow::new(
                        &ancestor.ancestor_id,
                        &local.descendant_id,
                        ancestor.depth + 1 + local.depth,
                    ));
                }
            }
        }
        let inserted = rows.len();
        if !rows.is_empty() {
            self.store.insert_closure_rows(rows).await?;
        }

        let mut node = traversal::require_node(&self.store, node_id).await?;
        node.parent_id = new_parent_id.map(str::to_string);
        self.store.update_node(node.clone()).await?;
        tracing::debug!(
            "Reattached '{}' under {:?} ({} rows removed, {} added)",
            node_id,
            new_parent_id,
            deleted,
            inserted
        );
        Ok(node)
    }

    async fn remove_single_locked(
        &self,
        node_id: &str,
        roots: &[String],
    ) -> Result<RemovalSummary, TreeError> {
        let node = self.member(node_id).await?;
        traversal::ensure_covered(&self.store, node_id, roots).await?;
        let children = self
            .store
            .children_of(Some(node_id), Default::default())
            .await?;
        let mut reparented = Vec::with_capacity(children.len());
        for child in children {
            self.reattach(&child.id, node.parent_id.as_deref()).await?;
            reparented.push(child.id);
        }

        self.store
            .delete_closure_rows(&ClosurePredicate::Touching(node_id.to_string()))
            .await?;
        self.store.delete_node(node_id).await?;
        Ok(RemovalSummary {
            removed: 1,
            reparented,
        })
    }

    async fn remove_subtree_locked(
        &self,
        node_id: &str,
        roots: &[String],
    ) -> Result<RemovalSummary, TreeError> {
        self.member(node_id).await?;
        traversal::ensure_covered(&self.store, node_id, roots).await?;
        let subtree: Vec<String> = self
            .store
            .closure_rows(&ClosurePredicate::DescendantsOf(node_id.to_string()))
            .await?
            .into_iter()
            .map(|row| row.descendant_id)
            .collect();

        let rows = self
            .store
            .delete_closure_rows(&ClosurePredicate::DescendantIn(subtree.clone()))
            .await?;
        let removed = self
            .store
            .delete_matching(&NodePredicate::Ids(subtree))
            .await?;
        tracing::debug!(
            "Removed subtree of '{}' ({} nodes, {} closure rows)",
            node_id,
            removed,
            rows
        );
        Ok(RemovalSummary {
            removed,
            reparented: Vec::new(),
        })
    }

    async fn rebuild_locked(&self, root_id: &str) -> Result<usize, TreeError> {
        let start = traversal::require_node(&self.store, root_id).await?;
        let start_parent = start.parent_id.clone();
        let walked = traversal::preorder(
            traversal::walk(&self.store, start, Default::default()).await?,
        );
        let ids: Vec<String> = walked.iter().map(|(n, _)| n.id.clone()).collect();

        // Rows linking the walked subtree to anything above it are rebuilt too
        self.store
            .delete_closure_rows(&ClosurePredicate::DescendantIn(ids))
            .await?;
        let outer = match &start_parent {
            Some(parent_id) => {
                self.store
                    .closure_rows(&ClosurePredicate::AncestorsOf(parent_id.clone()))
                    .await?
            }
            None => Vec::new(),
        };

        let mut rows = Vec::new();
        let mut chain: Vec<String> = Vec::new();
        for (mut node, depth) in walked {
            chain.truncate(depth as usize);
            rows.push(ClosureRow::self_row(&node.id));
            for (index, ancestor_id) in chain.iter().enumerate() {
                rows.push(ClosureRow::new(
                    ancestor_id,
                    &node.id,
                    (chain.len() - index) as u32,
                ));
            }
            for ancestor in &outer {
                rows.push(ClosureRow::new(
                    &ancestor.ancestor_id,
                    &node.id,
                    ancestor.depth + 1 + depth as u32,
                ));
            }
            chain.push(node.id.clone());

            if node.position != NodePosition::ClosureTable {
                node.position = NodePosition::ClosureTable;
                self.store.update_node(node).await?;
            }
        }

        let count = rows.len();
        self.store.insert_closure_rows(rows).await?;
        tracing::info!("Rebuilt {} closure rows below '{}'", count, root_id);
        Ok(count)
    }
}

#[async_trait]
impl TreeEngine for ClosureTableEngine {
    fn strategy(&self) -> TreeStrategy {
        TreeStrategy::ClosureTable
    }

    fn store(&self) -> &Arc<dyn StorageGateway> {
        &self.store
    }

    async fn insert(&self, node: TreeNode, position: InsertPosition) -> Result<TreeNode, TreeError> {
        if self.store.get_node(&node.id).await?.is_some() {
            return Err(TreeError::invalid_position(
                &node.id,
                "node already exists; use move_node to relocate it",
            ));
        }
        let parent = self.resolve_parent(&node.id, &position).await?;

        let roots = match &parent {
            Some(parent) => vec![traversal::root_of(&self.store, &parent.id).await?],
            None => Vec::new(),
        };
        let unit = self.begin(roots.clone(), "closure insert").await?;
        let result = self.insert_locked(node, parent.map(|p| p.id), &roots).await;
        unit.finish(result).await
    }

    async fn move_node(
        &self,
        node_id: &str,
        position: InsertPosition,
    ) -> Result<TreeNode, TreeError> {
        let node = self.member(node_id).await?;
        if let Some(reference_id) = position.reference() {
            if reference_id == node_id {
                return Err(TreeError::cyclic_move(node_id, reference_id));
            }
        }

        let parent = self.resolve_parent(node_id, &position).await?;
        if let Some(parent) = &parent {
            self.reject_cycle(node_id, &parent.id).await?;
        }
        let new_parent_id = parent.map(|p| p.id);
        if new_parent_id == node.parent_id {
            tracing::debug!("Node '{}' already has the requested parent", node_id);
            return Ok(node);
        }

        let mut roots = vec![traversal::root_of(&self.store, node_id).await?];
        if let Some(parent_id) = &new_parent_id {
            roots.push(traversal::root_of(&self.store, parent_id).await?);
        }
        let unit = self.begin(roots.clone(), "closure move").await?;
        let result = self.move_locked(node_id, &position, &roots).await;
        unit.finish(result).await
    }

    async fn remove_single_node(&self, node_id: &str) -> Result<RemovalSummary, TreeError> {
        self.member(node_id).await?;
        let roots = vec![traversal::root_of(&self.store, node_id).await?];
        let unit = self.begin(roots.clone(), "closure single removal").await?;
        let result = self.remove_single_locked(node_id, &roots).await;
        unit.finish(result).await
    }

    async fn remove_subtree(&self, node_id: &str) -> Result<RemovalSummary, TreeError> {
        self.member(node_id).await?;
        let roots = vec![traversal::root_of(&self.store, node_id).await?];
        let unit = self.begin(roots.clone(), "closure subtree removal").await?;
        let result = self.remove_subtree_locked(node_id, &roots).await;
        unit.finish(result).await
    }

    async fn descendants(&self, node_id: &str) -> Result<Vec<TreeNode>, TreeError> {
        self.member(node_id).await?;
        let rows = self
            .store
            .closure_rows(&ClosurePredicate::DescendantsOf(node_id.to_string()))
            .await?;
        let depth: HashMap<String, u32> = rows
            .into_iter()
            .filter(|row| !row.is_self_row())
            .map(|row| (row.descendant_id, row.depth))
            .collect();

        let mut nodes = self
            .store
            .nodes_matching(&NodePredicate::Ids(depth.keys().cloned().collect()))
            .await?;
        nodes.sort_by(|a, b| {
            depth
                .get(&a.id)
                .cmp(&depth.get(&b.id))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(nodes)
    }

    async fn ancestors(&self, node_id: &str) -> Result<Vec<TreeNode>, TreeError> {
        self.member(node_id).await?;
        let rows = self
            .store
            .closure_rows(&ClosurePredicate::AncestorsOf(node_id.to_string()))
            .await?;

        let mut chain = Vec::new();
        for row in rows.into_iter().filter(|row| !row.is_self_row()) {
            if let Some(node) = self.store.get_node(&row.ancestor_id).await? {
                chain.push(node);
            }
        }
        Ok(chain)
    }
}
