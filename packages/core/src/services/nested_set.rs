//! Nested Set Engine
//!
//! Each node stores `left`/`right` bounds such that a node's descendants are
//! exactly the nodes of the same tree whose bounds lie strictly inside its own.
//! Subtree reads become one range query; writes pay for it by shifting the
//! bounds of everything to the right of the change.
//!
//! # Write Pattern
//!
//! Every structural change is built from three bulk updates:
//!
//! - **open gap**: shift bounds `>= boundary` right by the width being inserted
//! - **close gap**: shift bounds `> right` left by the width being removed
//! - **translate**: move a whole subtree by a fixed offset (and re-root it)
//!
//! A move closes the gap at the source first, then computes the destination
//! boundary in the compacted coordinates, opens a gap there (skipping the
//! moving subtree) and finally translates the subtree into it.
//!
//! # Examples
//!
//! ```rust,no_run
//! use arbor_core::config::TreeConfig;
//! use arbor_core::db::MemoryStore;
//! use arbor_core::models::{InsertPosition, TreeNode};
//! use arbor_core::services::{NestedSetEngine, TreeEngine};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), arbor_core::services::TreeError> {
//! let engine = NestedSetEngine::new(Arc::new(MemoryStore::new()), &TreeConfig::default());
//! let food = engine.insert(TreeNode::new("Food"), InsertPosition::Root).await?;
//! engine
//!     .insert(TreeNode::new("Fruits"), InsertPosition::first_child_of(&food.id))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{TreeConfig, TreeStrategy};
use crate::db::{Bound, FieldUpdate, NodePredicate, StorageGateway};
use crate::models::{ChildOrder, InsertPosition, Interval, NodePosition, Steps, TreeNode};
use crate::services::engine::{
    RecoveryReport, RemovalSummary, TreeEngine, TreeRepair, VerificationReport, Violation,
};
use crate::services::error::TreeError;
use crate::services::lock_manager::{LockManager, RootLockGuard};
use crate::services::traversal::{self, WalkEvent};
use crate::services::unit_of_work::{release_all, UnitOfWork};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Where an inserted or moved node lands.
#[derive(Debug)]
struct Target {
    boundary: i64,
    level: i64,
    root: String,
    parent_id: Option<String>,
}

/// Fails with `StaleState` when `interval` lies in a tree the unit did not cover.
fn ensure_covered(node_id: &str, interval: &Interval, roots: &[String]) -> Result<(), TreeError> {
    if roots.iter().any(|root| *root == interval.root) {
        Ok(())
    } else {
        Err(TreeError::stale_state(
            node_id,
            format!("moved to tree '{}' after the unit started", interval.root),
        ))
    }
}

pub struct NestedSetEngine {
    store: Arc<dyn StorageGateway>,
    locks: Option<LockManager>,
}

impl NestedSetEngine {
    pub fn new(store: Arc<dyn StorageGateway>, config: &TreeConfig) -> Self {
        let locks = config
            .locking
            .then(|| LockManager::new(store.clone(), config.lock_timeout()));
        Self { store, locks }
    }

    /// Move a node `steps` slots towards the front of its siblings.
    ///
    /// Returns false when the node is already in place. Counts past the first
    /// slot stop at the first slot.
    pub async fn move_up(&self, node_id: &str, steps: Steps) -> Result<bool, TreeError> {
        self.move_among_siblings(node_id, steps, true).await
    }

    /// Move a node `steps` slots towards the back of its siblings.
    pub async fn move_down(&self, node_id: &str, steps: Steps) -> Result<bool, TreeError> {
        self.move_among_siblings(node_id, steps, false).await
    }

    /// Renumber the subtree of `node_id` so siblings follow `order` at every level.
    ///
    /// The subtree keeps its outer bounds. Returns the number of records changed.
    pub async fn reorder(&self, node_id: &str, order: ChildOrder) -> Result<usize, TreeError> {
        let (_, interval) = self.placed(node_id).await?;
        let roots = vec![interval.root];
        let unit = self.begin(roots.clone(), "nested set reorder").await?;
        let result = self.reorder_locked(node_id, order, &roots).await;
        unit.finish(result).await
    }

    async fn begin(
        &self,
        roots: Vec<String>,
        operation: &'static str,
    ) -> Result<UnitOfWork, TreeError> {
        UnitOfWork::begin(&self.store, self.locks.as_ref(), &roots, operation).await
    }

    /// The node and its bounds; fails when it exists but was never placed.
    async fn placed(&self, id: &str) -> Result<(TreeNode, Interval), TreeError> {
        let node = traversal::require_node(&self.store, id).await?;
        let interval = node
            .interval()
            .cloned()
            .ok_or_else(|| TreeError::invalid_position(id, "node is not placed in a nested set"))?;
        Ok((node, interval))
    }

    async fn reference(
        &self,
        node_id: &str,
        reference_id: &str,
    ) -> Result<(TreeNode, Interval), TreeError> {
        let reference = self.store.get_node(reference_id).await?.ok_or_else(|| {
            TreeError::invalid_position(
                node_id,
                format!("reference node '{}' does not exist", reference_id),
            )
        })?;
        let interval = reference.interval().cloned().ok_or_else(|| {
            TreeError::invalid_position(
                node_id,
                format!("reference node '{}' is not placed in a nested set", reference_id),
            )
        })?;
        Ok((reference, interval))
    }

    /// Reference node of a move, rejecting destinations inside the moved subtree.
    async fn destination(
        &self,
        node_id: &str,
        interval: &Interval,
        reference_id: &str,
    ) -> Result<(TreeNode, Interval), TreeError> {
        if reference_id == node_id {
            return Err(TreeError::cyclic_move(node_id, reference_id));
        }
        let (reference, reference_interval) = self.reference(node_id, reference_id).await?;
        if interval.contains(&reference_interval) {
            return Err(TreeError::cyclic_move(node_id, reference_id));
        }
        Ok((reference, reference_interval))
    }

    fn target(
        node_id: &str,
        position: &InsertPosition,
        reference: &TreeNode,
        interval: &Interval,
    ) -> Result<Target, TreeError> {
        let child_of = |boundary| Target {
            boundary,
            level: interval.level + 1,
            root: interval.root.clone(),
            parent_id: Some(reference.id.clone()),
        };
        let sibling_of = |boundary| -> Result<Target, TreeError> {
            let parent_id = reference.parent_id.clone().ok_or_else(|| {
                TreeError::invalid_position(
                    node_id,
                    format!("'{}' is a root and cannot have siblings", reference.id),
                )
            })?;
            Ok(Target {
                boundary,
                level: interval.level,
                root: interval.root.clone(),
                parent_id: Some(parent_id),
            })
        };

        match position {
            InsertPosition::Root => Err(TreeError::invalid_position(
                node_id,
                "root position has no reference node",
            )),
            InsertPosition::FirstChildOf(_) => Ok(child_of(interval.left + 1)),
            InsertPosition::LastChildOf(_) => Ok(child_of(interval.right)),
            InsertPosition::NextSiblingOf(_) => sibling_of(interval.right + 1),
            InsertPosition::PrevSiblingOf(_) => sibling_of(interval.left),
        }
    }

    /// Shift every bound `>= from` in `root` right by `width`.
    async fn open_gap(
        &self,
        root: &str,
        from: i64,
        width: i64,
        excluding: &[String],
    ) -> Result<(), TreeError> {
        let mut shifted = 0;
        for bound in [Bound::Left, Bound::Right] {
            let predicate = NodePredicate::BoundFrom {
                root: root.to_string(),
                bound,
                min: from,
                excluding: excluding.to_vec(),
            };
            shifted += self
                .store
                .bulk_update(&predicate, &FieldUpdate::shift(bound, width))
                .await?;
        }
        tracing::debug!(
            "Opened gap of {} at {} in tree '{}' ({} bounds shifted)",
            width,
            from,
            root,
            shifted
        );
        Ok(())
    }

    /// Shift every bound `> after` in `root` left by `width`.
    async fn close_gap(&self, root: &str, after: i64, width: i64) -> Result<(), TreeError> {
        let mut shifted = 0;
        for bound in [Bound::Left, Bound::Right] {
            shifted += self
                .store
                .bulk_update(
                    &NodePredicate::bound_from(root, bound, after + 1),
                    &FieldUpdate::shift(bound, -width),
                )
                .await?;
        }
        tracing::debug!(
            "Closed gap of {} after {} in tree '{}' ({} bounds shifted)",
            width,
            after,
            root,
            shifted
        );
        Ok(())
    }

    async fn set_parent(&self, id: &str, parent_id: Option<String>) -> Result<(), TreeError> {
        let mut node = traversal::require_node(&self.store, id).await?;
        node.parent_id = parent_id;
        self.store.update_node(node).await?;
        Ok(())
    }

    async fn insert_locked(
        &self,
        mut node: TreeNode,
        position: &InsertPosition,
        reference_id: &str,
        roots: &[String],
    ) -> Result<TreeNode, TreeError> {
        let (reference, interval) = self.reference(&node.id, reference_id).await?;
        ensure_covered(reference_id, &interval, roots)?;
        let target = Self::target(&node.id, position, &reference, &interval)?;

        self.open_gap(&target.root, target.boundary, 2, &[]).await?;
        node.parent_id = target.parent_id;
        node.position = NodePosition::NestedSet(Interval::new(
            target.boundary,
            target.boundary + 1,
            target.level,
            target.root,
        ));
        self.store.insert_node(node.clone()).await?;
        tracing::debug!("Inserted node '{}' at {:?}", node.id, node.position);
        Ok(node)
    }

    async fn relocate(
        &self,
        node_id: &str,
        position: &InsertPosition,
        roots: &[String],
    ) -> Result<TreeNode, TreeError> {
        let (node, interval) = self.placed(node_id).await?;
        ensure_covered(node_id, &interval, roots)?;
        if let Some(reference_id) = position.reference() {
            let (_, reference_interval) =
                self.destination(node_id, &interval, reference_id).await?;
            ensure_covered(reference_id, &reference_interval, roots)?;
        }

        let width = interval.width();
        let subtree: Vec<String> = self
            .store
            .nodes_matching(&NodePredicate::span(&interval.root, interval.left, interval.right))
            .await?
            .into_iter()
            .map(|n| n.id)
            .collect();

        self.close_gap(&interval.root, interval.right, width).await?;

        let target = match position.reference() {
            None => Target {
                boundary: 1,
                level: 0,
                root: node.id.clone(),
                parent_id: None,
            },
            Some(reference_id) => {
                let (reference, reference_interval) =
                    self.reference(node_id, reference_id).await?;
                let target = Self::target(node_id, position, &reference, &reference_interval)?;
                self.open_gap(&target.root, target.boundary, width, &subtree)
                    .await?;
                target
            }
        };

        let offset = target.boundary - interval.left;
        let level_offset = target.level - interval.level;
        let new_root = (target.root != interval.root).then(|| target.root.clone());
        let translated = self
            .store
            .bulk_update(
                &NodePredicate::Ids(subtree),
                &FieldUpdate::translate(offset, level_offset, new_root),
            )
            .await?;

        let mut moved = traversal::require_node(&self.store, node_id).await?;
        moved.parent_id = target.parent_id;
        self.store.update_node(moved.clone()).await?;
        tracing::debug!(
            "Moved node '{}' with {} records by {} into tree '{}'",
            node_id,
            translated,
            offset,
            target.root
        );
        Ok(moved)
    }

    async fn remove_single_locked(
        &self,
        node_id: &str,
        roots: &[String],
    ) -> Result<RemovalSummary, TreeError> {
        let (node, interval) = self.placed(node_id).await?;
        ensure_covered(node_id, &interval, roots)?;
        let children = self
            .store
            .children_of(Some(node_id), ChildOrder::by_position())
            .await?;
        let reparented: Vec<String> = children.iter().map(|c| c.id.clone()).collect();

        match node.parent_id {
            Some(parent_id) => {
                if interval.right - interval.left > 1 {
                    self.store
                        .bulk_update(
                            &NodePredicate::span(
                                &interval.root,
                                interval.left + 1,
                                interval.right - 1,
                            ),
                            &FieldUpdate::translate(-1, -1, None),
                        )
                        .await?;
                }
                self.store.delete_node(node_id).await?;
                self.close_gap(&interval.root, interval.right, 2).await?;
                for child_id in &reparented {
                    self.set_parent(child_id, Some(parent_id.clone())).await?;
                }
            }
            None => {
                // Each child subtree becomes its own tree
                for child in &children {
                    if let Some(child_interval) = child.interval() {
                        self.store
                            .bulk_update(
                                &NodePredicate::span(
                                    &interval.root,
                                    child_interval.left,
                                    child_interval.right,
                                ),
                                &FieldUpdate::translate(
                                    1 - child_interval.left,
                                    -1,
                                    Some(child.id.clone()),
                                ),
                            )
                            .await?;
                    }
                    self.set_parent(&child.id, None).await?;
                }
                self.store.delete_node(node_id).await?;
            }
        }

        tracing::debug!(
            "Removed node '{}', {} children reparented",
            node_id,
            reparented.len()
        );
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
        let (_, interval) = self.placed(node_id).await?;
        ensure_covered(node_id, &interval, roots)?;
        let removed = self
            .store
            .delete_matching(&NodePredicate::span(&interval.root, interval.left, interval.right))
            .await?;
        self.close_gap(&interval.root, interval.right, interval.width())
            .await?;
        tracing::debug!("Removed subtree of '{}' ({} records)", node_id, removed);
        Ok(RemovalSummary {
            removed,
            reparented: Vec::new(),
        })
    }

    async fn move_among_siblings(
        &self,
        node_id: &str,
        steps: Steps,
        up: bool,
    ) -> Result<bool, TreeError> {
        let (node, _) = self.placed(node_id).await?;
        let parent_id = node.parent_id.ok_or_else(|| {
            TreeError::invalid_position(node_id, "root nodes have no ordered siblings")
        })?;
        let siblings = self
            .store
            .children_of(Some(&parent_id), ChildOrder::by_position())
            .await?;
        let index = siblings
            .iter()
            .position(|s| s.id == node_id)
            .ok_or_else(|| TreeError::stale_state(node_id, "missing from its parent's children"))?;

        let last = siblings.len() - 1;
        let target_index = match (steps, up) {
            (Steps::Count(n), true) => index.saturating_sub(n),
            (Steps::Count(n), false) => index.saturating_add(n).min(last),
            (Steps::ToEnd, true) => 0,
            (Steps::ToEnd, false) => last,
        };
        if target_index == index {
            return Ok(false);
        }

        let anchor = siblings[target_index].id.clone();
        let position = if up {
            InsertPosition::PrevSiblingOf(anchor)
        } else {
            InsertPosition::NextSiblingOf(anchor)
        };
        self.move_node(node_id, position).await?;
        Ok(true)
    }

    async fn reorder_locked(
        &self,
        node_id: &str,
        order: ChildOrder,
        roots: &[String],
    ) -> Result<usize, TreeError> {
        let (node, interval) = self.placed(node_id).await?;
        ensure_covered(node_id, &interval, roots)?;
        let events = traversal::walk(&self.store, node, order).await?;
        let assigned = assign_intervals(events, interval.left, interval.level, &interval.root);

        let outer_right = assigned
            .last()
            .and_then(|(n, _)| n.interval())
            .map(|i| i.right);
        if outer_right != Some(interval.right) {
            return Err(TreeError::invalid_position(
                node_id,
                "subtree bounds disagree with parent links; run recover first",
            ));
        }

        let mut changed = 0;
        for (node, is_changed) in assigned {
            if is_changed {
                self.store.update_node(node).await?;
                changed += 1;
            }
        }
        tracing::debug!("Reordered subtree of '{}' ({} records changed)", node_id, changed);
        Ok(changed)
    }

    /// Walk up from `start` to its topmost ancestor, clearing the first
    /// missing or cyclic parent link on the way.
    async fn detach_top(
        &self,
        start: &str,
        promoted: &mut Vec<String>,
    ) -> Result<TreeNode, TreeError> {
        let mut current = traversal::require_node(&self.store, start).await?;
        let mut seen = HashSet::from([current.id.clone()]);

        while let Some(parent_id) = current.parent_id.clone() {
            match self.store.get_node(&parent_id).await? {
                Some(parent) if seen.insert(parent.id.clone()) => current = parent,
                found => {
                    let reason = if found.is_some() {
                        "parent links form a cycle"
                    } else {
                        "parent is missing"
                    };
                    tracing::warn!("Promoting '{}' to root: {}", current.id, reason);
                    current.parent_id = None;
                    self.store.update_node(current.clone()).await?;
                    promoted.push(current.id.clone());
                }
            }
        }
        Ok(current)
    }

    /// Cover a further tree reached while recovering another one.
    ///
    /// Returns false when another writer holds its root lock.
    async fn join_tree(
        &self,
        root_id: &str,
        held: &mut Vec<RootLockGuard>,
    ) -> Result<bool, TreeError> {
        let locks = match &self.locks {
            Some(locks) if !self.store.supports_transactions() => locks,
            _ => return Ok(true),
        };
        match locks.acquire(root_id).await {
            Ok(guard) => {
                held.push(guard);
                Ok(true)
            }
            Err(TreeError::LockContention { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn recover_locked(
        &self,
        root_id: &str,
        held: &mut Vec<RootLockGuard>,
    ) -> Result<RecoveryReport, TreeError> {
        let mut report = RecoveryReport {
            root_id: root_id.to_string(),
            ..RecoveryReport::default()
        };
        let mut pending = vec![root_id.to_string()];
        let mut done = HashSet::new();
        let mut reachable = HashSet::new();
        let mut scanned = HashSet::new();

        while let Some(start) = pending.pop() {
            let top = self.detach_top(&start, &mut report.promoted_roots).await?;
            if !done.insert(top.id.clone()) {
                continue;
            }
            let top_id = top.id.clone();
            let foreign = top_id != root_id && !report.promoted_roots.contains(&top_id);
            if foreign && !self.join_tree(&top_id, held).await? {
                tracing::warn!(
                    "Tree '{}' is locked by another writer; recover it separately",
                    top_id
                );
                report.deferred_trees.push(top_id);
                continue;
            }

            let events = traversal::walk(&self.store, top, ChildOrder::by_position()).await?;
            for (node, changed) in assign_intervals(events, 1, 0, &top_id) {
                reachable.insert(node.id.clone());
                if changed {
                    self.store.update_node(node).await?;
                    report.renumbered += 1;
                }
            }
            report.trees.push(top_id.clone());

            // Nodes still tagged with this tree but not reachable from its root
            for tag in [top_id, root_id.to_string()] {
                if !scanned.insert(tag.clone()) {
                    continue;
                }
                for stray in self.store.nodes_matching(&NodePredicate::InTree(tag)).await? {
                    if !reachable.contains(&stray.id) {
                        tracing::debug!("Found stray node '{}'", stray.id);
                        pending.push(stray.id);
                    }
                }
            }
        }

        tracing::info!(
            "Recovered tree '{}': {} records renumbered across {} trees",
            root_id,
            report.renumbered,
            report.trees.len()
        );
        Ok(report)
    }
}

/// Assign bounds to a walk: `left` on entry, `right` on exit, from one counter.
///
/// Returns every walked node with its new position and whether it changed.
fn assign_intervals(
    events: Vec<WalkEvent>,
    start: i64,
    base_level: i64,
    root: &str,
) -> Vec<(TreeNode, bool)> {
    let mut counter = start;
    let mut open: Vec<(TreeNode, i64, i64)> = Vec::new();
    let mut assigned = Vec::new();

    for event in events {
        match event {
            WalkEvent::Enter { node, depth } => {
                open.push((node, counter, base_level + depth));
                counter += 1;
            }
            WalkEvent::Exit { .. } => {
                if let Some((mut node, left, level)) = open.pop() {
                    let position =
                        NodePosition::NestedSet(Interval::new(left, counter, level, root));
                    counter += 1;
                    let changed = node.position != position;
                    node.position = position;
                    assigned.push((node, changed));
                }
            }
        }
    }
    assigned
}

#[async_trait]
impl TreeEngine for NestedSetEngine {
    fn strategy(&self) -> TreeStrategy {
        TreeStrategy::NestedSet
    }

    fn store(&self) -> &Arc<dyn StorageGateway> {
        &self.store
    }

    async fn insert(
        &self,
        mut node: TreeNode,
        position: InsertPosition,
    ) -> Result<TreeNode, TreeError> {
        if self.store.get_node(&node.id).await?.is_some() {
            return Err(TreeError::invalid_position(
                &node.id,
                "node already exists; use move_node to relocate it",
            ));
        }

        let Some(reference_id) = position.reference().map(str::to_string) else {
            // A new tree has nothing to lock, but still joins any transaction
            let unit = self.begin(Vec::new(), "nested set root insert").await?;
            node.parent_id = None;
            node.position = NodePosition::NestedSet(Interval::new(1, 2, 0, node.id.clone()));
            let result = self.store.insert_node(node.clone()).await.map_err(TreeError::from);
            let node = unit.finish(result.map(|_| node)).await?;
            tracing::debug!("Inserted root '{}'", node.id);
            return Ok(node);
        };

        let (reference, interval) = self.reference(&node.id, &reference_id).await?;
        Self::target(&node.id, &position, &reference, &interval)?;

        let roots = vec![interval.root];
        let unit = self.begin(roots.clone(), "nested set insert").await?;
        let result = self
            .insert_locked(node, &position, &reference_id, &roots)
            .await;
        unit.finish(result).await
    }

    async fn move_node(
        &self,
        node_id: &str,
        position: InsertPosition,
    ) -> Result<TreeNode, TreeError> {
        let (node, interval) = self.placed(node_id).await?;
        let mut roots = vec![interval.root.clone()];

        match position.reference() {
            None if node.parent_id.is_none() => {
                tracing::debug!("Node '{}' is already a root", node_id);
                return Ok(node);
            }
            None => {}
            Some(reference_id) => {
                let (reference, reference_interval) =
                    self.destination(node_id, &interval, reference_id).await?;
                Self::target(node_id, &position, &reference, &reference_interval)?;
                roots.push(reference_interval.root);
            }
        }

        let unit = self.begin(roots.clone(), "nested set move").await?;
        let result = self.relocate(node_id, &position, &roots).await;
        unit.finish(result).await
    }

    async fn remove_single_node(&self, node_id: &str) -> Result<RemovalSummary, TreeError> {
        let (_, interval) = self.placed(node_id).await?;
        let roots = vec![interval.root];
        let unit = self
            .begin(roots.clone(), "nested set single removal")
            .await?;
        let result = self.remove_single_locked(node_id, &roots).await;
        unit.finish(result).await
    }

    async fn remove_subtree(&self, node_id: &str) -> Result<RemovalSummary, TreeError> {
        let (_, interval) = self.placed(node_id).await?;
        let roots = vec![interval.root];
        let unit = self
            .begin(roots.clone(), "nested set subtree removal")
            .await?;
        let result = self.remove_subtree_locked(node_id, &roots).await;
        unit.finish(result).await
    }

    async fn descendants(&self, node_id: &str) -> Result<Vec<TreeNode>, TreeError> {
        let (_, interval) = self.placed(node_id).await?;
        let mut nodes = self
            .store
            .nodes_matching(&NodePredicate::span(
                &interval.root,
                interval.left + 1,
                interval.right,
            ))
            .await?;
        nodes.sort_by(|a, b| ChildOrder::by_position().compare(a, b));
        Ok(nodes)
    }
}

#[async_trait]
impl TreeRepair for NestedSetEngine {
    async fn verify(&self, root_id: &str) -> Result<VerificationReport, TreeError> {
        let Some(root) = self.store.get_node(root_id).await? else {
            return Ok(VerificationReport {
                root_id: root_id.to_string(),
                node_count: 0,
                violations: vec![Violation::MissingRoot {
                    root_id: root_id.to_string(),
                }],
            });
        };

        let mut nodes = self
            .store
            .nodes_matching(&NodePredicate::InTree(root_id.to_string()))
            .await?;
        nodes.sort_by(|a, b| ChildOrder::by_position().compare(a, b));
        let expected_right = 2 * nodes.len() as i64;
        let mut violations = Vec::new();

        if let Some(parent_id) = &root.parent_id {
            violations.push(Violation::RootHasParent {
                root_id: root_id.to_string(),
                parent_id: parent_id.clone(),
            });
        }
        match root.interval() {
            Some(interval) if interval.root == root_id => {
                if interval.left != 1 || interval.right != expected_right {
                    violations.push(Violation::RootBoundsMismatch {
                        root_id: root_id.to_string(),
                        left: interval.left,
                        right: interval.right,
                        expected_right,
                    });
                }
                if interval.level != 0 {
                    violations.push(Violation::LevelMismatch {
                        node_id: root_id.to_string(),
                        expected: 0,
                        actual: interval.level,
                    });
                }
            }
            other => violations.push(Violation::RootMismatch {
                node_id: root_id.to_string(),
                expected_root: root_id.to_string(),
                actual_root: other.map(|i| i.root.clone()),
            }),
        }

        // Bounds and slot usage
        let mut slots: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for node in &nodes {
            let Some(interval) = node.interval() else {
                continue;
            };
            if interval.left >= interval.right {
                violations.push(Violation::InvalidBounds {
                    node_id: node.id.clone(),
                    left: interval.left,
                    right: interval.right,
                });
            } else if (interval.right - interval.left) % 2 == 0 {
                violations.push(Violation::EvenWidth {
                    node_id: node.id.clone(),
                    left: interval.left,
                    right: interval.right,
                });
            }
            slots.entry(interval.left).or_default().push(node.id.clone());
            slots.entry(interval.right).or_default().push(node.id.clone());
        }
        for index in 1..=expected_right {
            match slots.get(&index) {
                None => violations.push(Violation::MissingIndex { index }),
                Some(ids) if ids.len() > 1 => violations.push(Violation::DuplicateIndex {
                    index,
                    node_ids: ids.clone(),
                }),
                Some(_) => {}
            }
        }

        // Parent containment, levels and sibling order
        let by_id: HashMap<&str, &TreeNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut siblings: BTreeMap<&str, Vec<(&str, &Interval)>> = BTreeMap::new();
        for node in &nodes {
            if node.id == root_id {
                continue;
            }
            let Some(interval) = node.interval() else {
                continue;
            };
            let parent = node
                .parent_id
                .as_deref()
                .and_then(|p| by_id.get(p))
                .and_then(|p| p.interval().map(|i| (p.id.as_str(), i)));
            match parent {
                Some((parent_id, parent_interval)) => {
                    if !parent_interval.contains(interval) {
                        violations.push(Violation::OutsideParent {
                            node_id: node.id.clone(),
                            parent_id: parent_id.to_string(),
                        });
                    }
                    if interval.level != parent_interval.level + 1 {
                        violations.push(Violation::LevelMismatch {
                            node_id: node.id.clone(),
                            expected: parent_interval.level + 1,
                            actual: interval.level,
                        });
                    }
                    siblings
                        .entry(parent_id)
                        .or_default()
                        .push((node.id.as_str(), interval));
                }
                None => violations.push(Violation::OrphanedNode {
                    node_id: node.id.clone(),
                    parent_id: node.parent_id.clone(),
                }),
            }
        }
        for children in siblings.values() {
            for pair in children.windows(2) {
                let ((first_id, first), (second_id, second)) = (pair[0], pair[1]);
                if first.right >= second.left {
                    violations.push(Violation::SiblingOverlap {
                        first_id: first_id.to_string(),
                        second_id: second_id.to_string(),
                    });
                }
            }
        }

        // Children by parent link must carry the same tree id
        for node in &nodes {
            for child in self
                .store
                .children_of(Some(&node.id), ChildOrder::by_position())
                .await?
            {
                match child.interval() {
                    Some(interval) if interval.root == root_id => {}
                    other => violations.push(Violation::RootMismatch {
                        node_id: child.id.clone(),
                        expected_root: root_id.to_string(),
                        actual_root: other.map(|i| i.root.clone()),
                    }),
                }
            }
        }

        if !violations.is_empty() {
            tracing::warn!(
                "Tree '{}' failed verification with {} violations",
                root_id,
                violations.len()
            );
        }
        Ok(VerificationReport {
            root_id: root_id.to_string(),
            node_count: nodes.len(),
            violations,
        })
    }

    async fn recover(&self, root_id: &str) -> Result<RecoveryReport, TreeError> {
        traversal::require_node(&self.store, root_id).await?;
        let unit = self
            .begin(vec![root_id.to_string()], "nested set recovery")
            .await?;
        let mut held = Vec::new();
        let result = self.recover_locked(root_id, &mut held).await;
        release_all(held).await;
        unit.finish(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use tokio_test::assert_ok;

    fn engine() -> (NestedSetEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (NestedSetEngine::new(store.clone(), &TreeConfig::default()), store)
    }

    async fn bounds(store: &MemoryStore, id: &str) -> (i64, i64, i64) {
        let node = store.get_node(id).await.unwrap().unwrap();
        let interval = node.interval().unwrap();
        (interval.left, interval.right, interval.level)
    }

    /// Food { Fruits, Veg { Carrots } }
    async fn food_tree(engine: &NestedSetEngine) {
        engine
            .insert(TreeNode::with_id("food", "Food"), InsertPosition::Root)
            .await
            .unwrap();
        engine
            .insert(
                TreeNode::with_id("fruits", "Fruits"),
                InsertPosition::first_child_of("food"),
            )
            .await
            .unwrap();
        engine
            .insert(TreeNode::with_id("veg", "Veg"), InsertPosition::last_child_of("food"))
            .await
            .unwrap();
        engine
            .insert(
                TreeNode::with_id("carrots", "Carrots"),
                InsertPosition::first_child_of("veg"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_builds_expected_bounds() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        assert_eq!(bounds(&store, "food").await, (1, 8, 0));
        assert_eq!(bounds(&store, "fruits").await, (2, 3, 1));
        assert_eq!(bounds(&store, "veg").await, (4, 7, 1));
        assert_eq!(bounds(&store, "carrots").await, (5, 6, 2));
    }

    #[tokio::test]
    async fn test_sibling_inserts() {
        let (engine, store) = engine();
        food_tree(&engine).await;
        engine
            .insert(TreeNode::with_id("nuts", "Nuts"), InsertPosition::next_sibling_of("fruits"))
            .await
            .unwrap();
        engine
            .insert(TreeNode::with_id("grain", "Grain"), InsertPosition::prev_sibling_of("fruits"))
            .await
            .unwrap();

        assert_eq!(bounds(&store, "grain").await, (2, 3, 1));
        assert_eq!(bounds(&store, "fruits").await, (4, 5, 1));
        assert_eq!(bounds(&store, "nuts").await, (6, 7, 1));
        assert_eq!(bounds(&store, "food").await, (1, 12, 0));
        assert!(engine.verify("food").await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_insert_rejects_bad_positions() {
        let (engine, _store) = engine();
        food_tree(&engine).await;

        let missing = engine
            .insert(TreeNode::with_id("x", "X"), InsertPosition::first_child_of("nope"))
            .await;
        assert!(matches!(missing, Err(TreeError::InvalidPosition { .. })));

        let sibling_of_root = engine
            .insert(TreeNode::with_id("x", "X"), InsertPosition::next_sibling_of("food"))
            .await;
        assert!(matches!(sibling_of_root, Err(TreeError::InvalidPosition { .. })));
    }

    #[tokio::test]
    async fn test_move_up_one_step() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        assert!(engine.move_up("veg", Steps::Count(1)).await.unwrap());
        assert_eq!(bounds(&store, "veg").await, (2, 5, 1));
        assert_eq!(bounds(&store, "carrots").await, (3, 4, 2));
        assert_eq!(bounds(&store, "fruits").await, (6, 7, 1));
        assert!(engine.verify("food").await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_move_steps_clamp_and_noop() {
        let (engine, _store) = engine();
        food_tree(&engine).await;

        assert!(!engine.move_up("fruits", Steps::Count(5)).await.unwrap());
        assert!(!engine.move_down("veg", Steps::ToEnd).await.unwrap());
        assert!(!engine.move_down("fruits", Steps::Count(0)).await.unwrap());
        assert!(engine.move_down("fruits", Steps::Count(10)).await.unwrap());

        let children = engine.children("food").await.unwrap();
        let ids: Vec<_> = children.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["veg", "fruits"]);

        let root = engine.move_up("food", Steps::Count(1)).await;
        assert!(matches!(root, Err(TreeError::InvalidPosition { .. })));
    }

    #[tokio::test]
    async fn test_remove_single_node_promotes_children() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        let summary = engine.remove_single_node("veg").await.unwrap();
        assert_eq!(summary.reparented, vec!["carrots".to_string()]);
        assert_eq!(bounds(&store, "food").await, (1, 6, 0));
        assert_eq!(bounds(&store, "carrots").await, (4, 5, 1));
        let carrots = store.get_node("carrots").await.unwrap().unwrap();
        assert_eq!(carrots.parent_id.as_deref(), Some("food"));
        assert!(engine.verify("food").await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_remove_root_splits_tree() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        engine.remove_single_node("food").await.unwrap();
        assert_eq!(bounds(&store, "fruits").await, (1, 2, 0));
        assert_eq!(bounds(&store, "veg").await, (1, 4, 0));
        assert_eq!(bounds(&store, "carrots").await, (2, 3, 1));
        assert!(engine.verify("fruits").await.unwrap().is_valid());
        assert!(engine.verify("veg").await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        let summary = engine.remove_subtree("veg").await.unwrap();
        assert_eq!(summary.removed, 2);
        assert!(store.get_node("carrots").await.unwrap().is_none());
        assert_eq!(bounds(&store, "food").await, (1, 4, 0));
    }

    #[tokio::test]
    async fn test_move_into_own_subtree_rejected() {
        let (engine, store) = engine();
        food_tree(&engine).await;
        let before = store.all_nodes().unwrap();

        let result = engine
            .move_node("veg", InsertPosition::first_child_of("carrots"))
            .await;
        assert!(matches!(result, Err(TreeError::CyclicMove { .. })));
        let onto_self = engine
            .move_node("veg", InsertPosition::next_sibling_of("veg"))
            .await;
        assert!(matches!(onto_self, Err(TreeError::CyclicMove { .. })));
        assert_eq!(store.all_nodes().unwrap(), before);
    }

    #[tokio::test]
    async fn test_move_to_root_and_back() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        engine.move_node("veg", InsertPosition::Root).await.unwrap();
        assert_eq!(bounds(&store, "veg").await, (1, 4, 0));
        assert_eq!(bounds(&store, "food").await, (1, 4, 0));
        assert!(engine.verify("veg").await.unwrap().is_valid());
        assert!(engine.verify("food").await.unwrap().is_valid());

        engine
            .move_node("veg", InsertPosition::last_child_of("fruits"))
            .await
            .unwrap();
        assert_eq!(bounds(&store, "fruits").await, (2, 7, 1));
        assert_eq!(bounds(&store, "carrots").await, (4, 5, 3));
        assert!(engine.verify("food").await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_reorder_by_label_descending() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        let changed = engine
            .reorder(
                "food",
                ChildOrder::by(crate::models::SortField::Label, crate::models::SortDirection::Descending),
            )
            .await
            .unwrap();
        assert_eq!(changed, 3);
        assert_eq!(bounds(&store, "veg").await, (2, 5, 1));
        assert_eq!(bounds(&store, "fruits").await, (6, 7, 1));
        assert!(engine.verify("food").await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_verify_reports_corruption() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        let mut carrots = store.get_node("carrots").await.unwrap().unwrap();
        carrots.position = NodePosition::NestedSet(Interval::new(9, 10, 5, "food"));
        store.update_node(carrots).await.unwrap();

        let report = engine.verify("food").await.unwrap();
        assert!(!report.is_valid());
        assert!(report
            .violations
            .contains(&Violation::MissingIndex { index: 5 }));
        assert!(report.violations.contains(&Violation::OutsideParent {
            node_id: "carrots".to_string(),
            parent_id: "veg".to_string(),
        }));

        let missing = engine.verify("nope").await.unwrap();
        assert_eq!(
            missing.violations,
            vec![Violation::MissingRoot {
                root_id: "nope".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_recover_rebuilds_and_is_idempotent() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        let mut veg = store.get_node("veg").await.unwrap().unwrap();
        veg.position = NodePosition::NestedSet(Interval::new(40, 41, 7, "food"));
        store.update_node(veg).await.unwrap();
        assert!(!engine.verify("food").await.unwrap().is_valid());

        let report = assert_ok!(engine.recover("food").await);
        assert_eq!(report.trees, vec!["food".to_string()]);
        assert!(engine.verify("food").await.unwrap().is_valid());
        let snapshot = store.all_nodes().unwrap();

        let again = engine.recover("food").await.unwrap();
        assert_eq!(again.renumbered, 0);
        assert_eq!(store.all_nodes().unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_recover_promotes_orphans() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        let mut carrots = store.get_node("carrots").await.unwrap().unwrap();
        carrots.parent_id = Some("ghost".to_string());
        store.update_node(carrots).await.unwrap();

        let report = engine.recover("food").await.unwrap();
        assert_eq!(report.promoted_roots, vec!["carrots".to_string()]);
        assert!(report.trees.contains(&"carrots".to_string()));
        assert_eq!(bounds(&store, "carrots").await, (1, 2, 0));
        assert_eq!(bounds(&store, "food").await, (1, 6, 0));
        assert!(engine.verify("food").await.unwrap().is_valid());
        assert!(engine.verify("carrots").await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_descendants_and_ancestors() {
        let (engine, _store) = engine();
        food_tree(&engine).await;

        let descendants = engine.descendants("food").await.unwrap();
        let ids: Vec<_> = descendants.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["fruits", "veg", "carrots"]);

        let ancestors = engine.ancestors("carrots").await.unwrap();
        let ids: Vec<_> = ancestors.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["veg", "food"]);
    }

    #[tokio::test]
    async fn test_unit_rejects_trees_it_does_not_cover() {
        let (engine, store) = engine();
        food_tree(&engine).await;
        engine
            .insert(TreeNode::with_id("drinks", "Drinks"), InsertPosition::Root)
            .await
            .unwrap();
        let before = store.all_nodes().unwrap();

        // Destination tree not covered
        let food_only = vec!["food".to_string()];
        let result = engine
            .relocate("veg", &InsertPosition::last_child_of("drinks"), &food_only)
            .await;
        assert!(matches!(result, Err(TreeError::StaleState { .. })));

        // Moved node no longer in the covered tree
        let drinks_only = vec!["drinks".to_string()];
        let result = engine
            .relocate("veg", &InsertPosition::last_child_of("drinks"), &drinks_only)
            .await;
        assert!(matches!(result, Err(TreeError::StaleState { .. })));
        let result = engine.remove_subtree_locked("veg", &drinks_only).await;
        assert!(matches!(result, Err(TreeError::StaleState { .. })));

        assert_eq!(store.all_nodes().unwrap(), before);
    }
}
