//! Parent-link traversal shared by the engines.
//!
//! Parent links are the one field every encoding keeps, so these walks are
//! what rebuild and recovery trust when derived fields are suspect.

use crate::db::StorageGateway;
use crate::models::{ChildOrder, InsertPosition, TreeNode};
use crate::services::error::TreeError;
use std::collections::HashSet;
use std::sync::Arc;

/// Upper bound on parent hops before a chain is treated as corrupt.
pub(crate) const MAX_DEPTH: usize = 1000;

/// One step of a depth-first walk.
#[derive(Debug, Clone)]
pub(crate) enum WalkEvent {
    Enter { node: TreeNode, depth: i64 },
    Exit { id: String },
}

pub(crate) async fn require_node(
    store: &Arc<dyn StorageGateway>,
    id: &str,
) -> Result<TreeNode, TreeError> {
    store
        .get_node(id)
        .await?
        .ok_or_else(|| TreeError::node_not_found(id))
}

/// Ancestors of `id`, nearest first.
pub(crate) async fn ancestor_chain(
    store: &Arc<dyn StorageGateway>,
    id: &str,
) -> Result<Vec<TreeNode>, TreeError> {
    let node = require_node(store, id).await?;
    let mut seen = HashSet::from([node.id.clone()]);
    let mut chain = Vec::new();
    let mut next = node.parent_id;

    while let Some(parent_id) = next {
        if !seen.insert(parent_id.clone()) || chain.len() >= MAX_DEPTH {
            return Err(TreeError::invalid_position(
                id,
                "parent links form a cycle",
            ));
        }
        let Some(parent) = store.get_node(&parent_id).await? else {
            tracing::warn!("Node '{}' references missing parent '{}'", id, parent_id);
            break;
        };
        next = parent.parent_id.clone();
        chain.push(parent);
    }
    Ok(chain)
}

/// Id of the topmost ancestor of `id` (itself when it has no parent).
pub(crate) async fn root_of(store: &Arc<dyn StorageGateway>, id: &str) -> Result<String, TreeError> {
    let chain = ancestor_chain(store, id).await?;
    Ok(chain.last().map_or_else(|| id.to_string(), |top| top.id.clone()))
}

/// Fails with `StaleState` when `id` now belongs to a tree outside `roots`.
pub(crate) async fn ensure_covered(
    store: &Arc<dyn StorageGateway>,
    id: &str,
    roots: &[String],
) -> Result<(), TreeError> {
    let root = root_of(store, id).await?;
    if roots.contains(&root) {
        Ok(())
    } else {
        Err(TreeError::stale_state(
            id,
            format!("moved to tree '{}' after the unit started", root),
        ))
    }
}

/// Parent a position resolves to, for encodings that keep no sibling order.
///
/// Child positions resolve to the reference itself and sibling positions to
/// the reference's parent. `None` means the node becomes a root.
pub(crate) async fn parent_for_position(
    store: &Arc<dyn StorageGateway>,
    node_id: &str,
    position: &InsertPosition,
) -> Result<Option<TreeNode>, TreeError> {
    let Some(reference_id) = position.reference() else {
        return Ok(None);
    };
    let reference = store.get_node(reference_id).await?.ok_or_else(|| {
        TreeError::invalid_position(
            node_id,
            format!("reference node '{}' does not exist", reference_id),
        )
    })?;
    if !position.is_sibling() {
        return Ok(Some(reference));
    }

    let parent_id = reference.parent_id.ok_or_else(|| {
        TreeError::invalid_position(
            node_id,
            format!("'{}' is a root and cannot have siblings", reference_id),
        )
    })?;
    let parent = store.get_node(&parent_id).await?.ok_or_else(|| {
        TreeError::invalid_position(
            node_id,
            format!("parent '{}' of '{}' does not exist", parent_id, reference_id),
        )
    })?;
    Ok(Some(parent))
}

/// Depth-first walk below `start` following parent links.
///
/// Emits `Enter` before a node's children and `Exit` after them. A node seen
/// twice (only possible with corrupt links) is skipped.
pub(crate) async fn walk(
    store: &Arc<dyn StorageGateway>,
    start: TreeNode,
    order: ChildOrder,
) -> Result<Vec<WalkEvent>, TreeError> {
    enum Step {
        Visit(TreeNode, i64),
        Leave(String),
    }

    let mut events = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![Step::Visit(start, 0)];

    while let Some(step) = stack.pop() {
        match step {
            Step::Visit(node, depth) => {
                if !seen.insert(node.id.clone()) {
                    tracing::warn!("Skipping node '{}' reached twice during walk", node.id);
                    continue;
                }
                let children = store.children_of(Some(&node.id), order).await?;
                stack.push(Step::Leave(node.id.clone()));
                for child in children.into_iter().rev() {
                    stack.push(Step::Visit(child, depth + 1));
                }
                events.push(WalkEvent::Enter { node, depth });
            }
            Step::Leave(id) => events.push(WalkEvent::Exit { id }),
        }
    }
    Ok(events)
}

/// Nodes of a walk in pre-order with their depth below the start.
pub(crate) fn preorder(events: Vec<WalkEvent>) -> Vec<(TreeNode, i64)> {
    events
        .into_iter()
        .filter_map(|event| match event {
            WalkEvent::Enter { node, depth } => Some((node, depth)),
            WalkEvent::Exit { .. } => None,
        })
        .collect()
}
