//! Materialized Path Engine
//!
//! Each node stores the chain of segments from its root down to itself, joined
//! by the configured separator. Descendants are found by prefix match, so a
//! move rewrites the prefix of every record below the moved node. That rewrite
//! is the widest write in the crate and is why moves run under a transaction
//! or the root lock.
//!
//! A segment is the node's label, suffixed with `-<id>` unless the label is
//! declared unique (`path_source_unique`).

use crate::config::{TreeConfig, TreeStrategy};
use crate::db::{FieldUpdate, NodePredicate, StorageGateway};
use crate::models::{ChildOrder, InsertPosition, NodePosition, PathPosition, TreeNode};
use crate::services::engine::{RemovalSummary, TreeEngine};
use crate::services::error::TreeError;
use crate::services::lock_manager::LockManager;
use crate::services::traversal;
use crate::services::unit_of_work::UnitOfWork;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub struct MaterializedPathEngine {
    store: Arc<dyn StorageGateway>,
    locks: Option<LockManager>,
    separator: String,
    source_unique: bool,
    starts_with_separator: bool,
    ends_with_separator: bool,
}

impl MaterializedPathEngine {
    pub fn new(store: Arc<dyn StorageGateway>, config: &TreeConfig) -> Self {
        let locks = config
            .locking
            .then(|| LockManager::new(store.clone(), config.lock_timeout()));
        Self {
            store,
            locks,
            separator: config.path_separator.clone(),
            source_unique: config.path_source_unique,
            starts_with_separator: config.starts_with_separator,
            ends_with_separator: config.ends_with_separator,
        }
    }

    /// Path segment contributed by `node`.
    pub fn segment(&self, node: &TreeNode) -> Result<String, TreeError> {
        if node.label.is_empty() {
            return Err(TreeError::invalid_path_source(&node.id, "path source is empty"));
        }
        let segment = if self.source_unique {
            node.label.clone()
        } else {
            format!("{}-{}", node.label, node.id)
        };
        if segment.contains(self.separator.as_str()) {
            return Err(TreeError::invalid_path_source(
                &node.id,
                format!("segment '{}' contains separator '{}'", segment, self.separator),
            ));
        }
        Ok(segment)
    }

    /// Full path of a node with `segment` placed below `parent_path`.
    pub fn compose(&self, parent_path: Option<&str>, segment: &str) -> String {
        let trail = if self.ends_with_separator {
            self.separator.as_str()
        } else {
            ""
        };
        match parent_path {
            None => {
                let lead = if self.starts_with_separator {
                    self.separator.as_str()
                } else {
                    ""
                };
                format!("{}{}{}", lead, segment, trail)
            }
            Some(parent) => format!("{}{}{}", self.descendant_prefix(parent), segment, trail),
        }
    }

    /// Prefix shared by every descendant of the node at `path`.
    pub fn descendant_prefix(&self, path: &str) -> String {
        if self.ends_with_separator {
            path.to_string()
        } else {
            format!("{}{}", path, self.separator)
        }
    }

    /// Recompute path and level of every node below `root_id` from parent links.
    ///
    /// Returns the number of records changed.
    pub async fn rebuild(&self, root_id: &str) -> Result<usize, TreeError> {
        let top = traversal::root_of(&self.store, root_id).await?;
        let unit = self.begin(vec![top], "path rebuild").await?;
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

    async fn member(&self, id: &str) -> Result<(TreeNode, PathPosition), TreeError> {
        let node = traversal::require_node(&self.store, id).await?;
        let path = node.path().cloned().ok_or_else(|| {
            TreeError::invalid_position(id, "node is not part of a materialized path tree")
        })?;
        Ok((node, path))
    }

    async fn resolve_parent(
        &self,
        node_id: &str,
        position: &InsertPosition,
    ) -> Result<Option<(TreeNode, PathPosition)>, TreeError> {
        let Some(parent) = traversal::parent_for_position(&self.store, node_id, position).await?
        else {
            return Ok(None);
        };
        let path = parent.path().cloned().ok_or_else(|| {
            TreeError::invalid_position(
                node_id,
                format!("'{}' is not part of a materialized path tree", parent.id),
            )
        })?;
        Ok(Some((parent, path)))
    }

    fn position_under(
        &self,
        node: &TreeNode,
        parent: Option<&PathPosition>,
    ) -> Result<PathPosition, TreeError> {
        let segment = self.segment(node)?;
        Ok(PathPosition {
            path: self.compose(parent.map(|p| p.path.as_str()), &segment),
            level: parent.map_or(0, |p| p.level + 1),
        })
    }

    fn reject_cycle(
        &self,
        node_id: &str,
        path: &PathPosition,
        parent: &TreeNode,
        parent_path: &PathPosition,
    ) -> Result<(), TreeError> {
        let prefix = self.descendant_prefix(&path.path);
        if parent.id == node_id || parent_path.path.starts_with(prefix.as_str()) {
            return Err(TreeError::cyclic_move(node_id, &parent.id));
        }
        Ok(())
    }

    async fn insert_locked(
        &self,
        mut node: TreeNode,
        position: &InsertPosition,
        roots: &[String],
    ) -> Result<TreeNode, TreeError> {
        // The parent's path may have been rewritten before the unit started
        let parent = self.resolve_parent(&node.id, position).await?;
        if let Some((parent, _)) = &parent {
            traversal::ensure_covered(&self.store, &parent.id, roots).await?;
        }
        let path = self.position_under(&node, parent.as_ref().map(|(_, p)| p))?;

        node.parent_id = parent.map(|(p, _)| p.id);
        node.position = NodePosition::MaterializedPath(path);
        self.store.insert_node(node.clone()).await?;
        tracing::debug!("Inserted node '{}' at {:?}", node.id, node.position);
        Ok(node)
    }

    /// Re-check a move under the unit, then rewrite the paths.
    async fn move_locked(
        &self,
        node_id: &str,
        position: &InsertPosition,
        roots: &[String],
    ) -> Result<TreeNode, TreeError> {
        let (_, path) = self.member(node_id).await?;
        traversal::ensure_covered(&self.store, node_id, roots).await?;
        let parent = self.resolve_parent(node_id, position).await?;
        if let Some((parent, parent_path)) = &parent {
            self.reject_cycle(node_id, &path, parent, parent_path)?;
            traversal::ensure_covered(&self.store, &parent.id, roots).await?;
        }
        self.relocate(node_id, parent.map(|(p, path)| (p.id, path)))
            .await
    }

    /// Move `node_id` below `parent`, rewriting the prefix of its descendants.
    async fn relocate(
        &self,
        node_id: &str,
        parent: Option<(String, PathPosition)>,
    ) -> Result<TreeNode, TreeError> {
        let (mut node, old) = self.member(node_id).await?;
        let new = self.position_under(&node, parent.as_ref().map(|(_, p)| p))?;

        let old_prefix = self.descendant_prefix(&old.path);
        let new_prefix = self.descendant_prefix(&new.path);
        let rewritten = self
            .store
            .bulk_update(
                &NodePredicate::PathPrefix(old_prefix.clone()),
                &FieldUpdate::PathPrefix {
                    from: old_prefix,
                    to: new_prefix,
                    level: new.level - old.level,
                },
            )
            .await?;

        // With a trailing separator the prefix also matched the node; re-read it
        if self.ends_with_separator {
            node = traversal::require_node(&self.store, node_id).await?;
        }
        node.parent_id = parent.map(|(id, _)| id);
        node.position = NodePosition::MaterializedPath(new);
        self.store.update_node(node.clone()).await?;
        tracing::debug!(
            "Moved '{}' from '{}' ({} descendant paths rewritten)",
            node_id,
            old.path,
            rewritten
        );
        Ok(node)
    }

    async fn remove_single_locked(
        &self,
        node_id: &str,
        roots: &[String],
    ) -> Result<RemovalSummary, TreeError> {
        let (node, _) = self.member(node_id).await?;
        traversal::ensure_covered(&self.store, node_id, roots).await?;
        let parent = match &node.parent_id {
            Some(parent_id) => {
                let (_, path) = self.member(parent_id).await?;
                Some((parent_id.clone(), path))
            }
            None => None,
        };

        let children = self
            .store
            .children_of(Some(node_id), ChildOrder::by_position())
            .await?;
        let mut reparented = Vec::with_capacity(children.len());
        for child in children {
            self.relocate(&child.id, parent.clone()).await?;
            reparented.push(child.id);
        }

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
        let (_, path) = self.member(node_id).await?;
        traversal::ensure_covered(&self.store, node_id, roots).await?;
        let mut removed = self
            .store
            .delete_matching(&NodePredicate::PathPrefix(self.descendant_prefix(&path.path)))
            .await?;
        if self.store.delete_node(node_id).await? {
            removed += 1;
        }
        tracing::debug!("Removed subtree of '{}' ({} records)", node_id, removed);
        Ok(RemovalSummary {
            removed,
            reparented: Vec::new(),
        })
    }

    async fn rebuild_locked(&self, root_id: &str) -> Result<usize, TreeError> {
        let start = traversal::require_node(&self.store, root_id).await?;
        let base = match &start.parent_id {
            Some(parent_id) => Some(self.member(parent_id).await?.1),
            None => None,
        };
        let walked = traversal::preorder(
            traversal::walk(&self.store, start, ChildOrder::by_position()).await?,
        );

        // Compute everything first so an invalid segment fails before any write
        let mut positions: HashMap<String, PathPosition> = HashMap::new();
        let mut updates = Vec::new();
        for (mut node, _) in walked {
            let parent = match &node.parent_id {
                Some(parent_id) if node.id != root_id => positions.get(parent_id).cloned(),
                _ => base.clone(),
            };
            let position = self.position_under(&node, parent.as_ref())?;
            positions.insert(node.id.clone(), position.clone());

            let position = NodePosition::MaterializedPath(position);
            if node.position != position {
                node.position = position;
                updates.push(node);
            }
        }

        let changed = updates.len();
        for node in updates {
            self.store.update_node(node).await?;
        }
        tracing::info!("Rebuilt paths below '{}' ({} records changed)", root_id, changed);
        Ok(changed)
    }
}

#[async_trait]
impl TreeEngine for MaterializedPathEngine {
    fn strategy(&self) -> TreeStrategy {
        TreeStrategy::MaterializedPath
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
        self.segment(&node)?;
        let parent = self.resolve_parent(&node.id, &position).await?;

        let roots = match &parent {
            Some((parent, _)) => vec![traversal::root_of(&self.store, &parent.id).await?],
            None => Vec::new(),
        };
        let unit = self.begin(roots.clone(), "path insert").await?;
        let result = self.insert_locked(node, &position, &roots).await;
        unit.finish(result).await
    }

    async fn move_node(
        &self,
        node_id: &str,
        position: InsertPosition,
    ) -> Result<TreeNode, TreeError> {
        let (node, path) = self.member(node_id).await?;
        if let Some(reference_id) = position.reference() {
            if reference_id == node_id {
                return Err(TreeError::cyclic_move(node_id, reference_id));
            }
        }

        let parent = self.resolve_parent(node_id, &position).await?;
        if let Some((parent, parent_path)) = &parent {
            self.reject_cycle(node_id, &path, parent, parent_path)?;
        }
        // Fail on a bad segment before touching anything
        let new = self.position_under(&node, parent.as_ref().map(|(_, p)| p))?;
        let new_parent_id = parent.as_ref().map(|(p, _)| p.id.clone());
        if new == path && new_parent_id == node.parent_id {
            tracing::debug!("Node '{}' already has the requested path", node_id);
            return Ok(node);
        }

        let mut roots = vec![traversal::root_of(&self.store, node_id).await?];
        if let Some(parent_id) = &new_parent_id {
            roots.push(traversal::root_of(&self.store, parent_id).await?);
        }
        let unit = self.begin(roots.clone(), "path move").await?;
        let result = self.move_locked(node_id, &position, &roots).await;
        unit.finish(result).await
    }

    async fn remove_single_node(&self, node_id: &str) -> Result<RemovalSummary, TreeError> {
        self.member(node_id).await?;
        let roots = vec![traversal::root_of(&self.store, node_id).await?];
        let unit = self.begin(roots.clone(), "path single removal").await?;
        let result = self.remove_single_locked(node_id, &roots).await;
        unit.finish(result).await
    }

    async fn remove_subtree(&self, node_id: &str) -> Result<RemovalSummary, TreeError> {
        self.member(node_id).await?;
        let roots = vec![traversal::root_of(&self.store, node_id).await?];
        let unit = self.begin(roots.clone(), "path subtree removal").await?;
        let result = self.remove_subtree_locked(node_id, &roots).await;
        unit.finish(result).await
    }

    async fn descendants(&self, node_id: &str) -> Result<Vec<TreeNode>, TreeError> {
        let (_, path) = self.member(node_id).await?;
        let mut nodes: Vec<TreeNode> = self
            .store
            .nodes_matching(&NodePredicate::PathPrefix(self.descendant_prefix(&path.path)))
            .await?
            .into_iter()
            .filter(|n| n.id != node_id)
            .collect();
        nodes.sort_by(|a, b| ChildOrder::by_position().compare(a, b));
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn engine_with(config: TreeConfig) -> (MaterializedPathEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (MaterializedPathEngine::new(store.clone(), &config), store)
    }

    fn engine() -> (MaterializedPathEngine, Arc<MemoryStore>) {
        engine_with(TreeConfig::for_strategy(TreeStrategy::MaterializedPath))
    }

    async fn path_of(store: &MemoryStore, id: &str) -> (String, i64) {
        let node = store.get_node(id).await.unwrap().unwrap();
        let path = node.path().unwrap();
        (path.path.clone(), path.level)
    }

    async fn food_tree(engine: &MaterializedPathEngine) {
        let steps = [
            ("1", "Food", InsertPosition::Root),
            ("2", "Fruits", InsertPosition::first_child_of("1")),
            ("3", "Veg", InsertPosition::last_child_of("1")),
            ("4", "Carrots", InsertPosition::first_child_of("3")),
        ];
        for (id, label, position) in steps {
            engine
                .insert(TreeNode::with_id(id, label), position)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_insert_composes_paths() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        assert_eq!(path_of(&store, "1").await, ("Food-1".to_string(), 0));
        assert_eq!(path_of(&store, "2").await, ("Food-1,Fruits-2".to_string(), 1));
        assert_eq!(path_of(&store, "4").await, ("Food-1,Veg-3,Carrots-4".to_string(), 2));
    }

    #[tokio::test]
    async fn test_separator_options() {
        let mut config = TreeConfig::for_strategy(TreeStrategy::MaterializedPath);
        config.path_separator = "/".to_string();
        config.path_source_unique = true;
        config.starts_with_separator = true;
        config.ends_with_separator = true;
        let (engine, store) = engine_with(config);
        food_tree(&engine).await;

        assert_eq!(path_of(&store, "1").await, ("/Food/".to_string(), 0));
        assert_eq!(path_of(&store, "4").await, ("/Food/Veg/Carrots/".to_string(), 2));

        engine
            .move_node("3", InsertPosition::first_child_of("2"))
            .await
            .unwrap();
        assert_eq!(path_of(&store, "3").await, ("/Food/Fruits/Veg/".to_string(), 2));
        assert_eq!(
            path_of(&store, "4").await,
            ("/Food/Fruits/Veg/Carrots/".to_string(), 3)
        );
    }

    #[tokio::test]
    async fn test_separator_in_label_rejected() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        let result = engine
            .insert(TreeNode::with_id("5", "Nuts, Seeds"), InsertPosition::last_child_of("1"))
            .await;
        assert!(matches!(result, Err(TreeError::InvalidPathSource { .. })));
        assert!(store.get_node("5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_move_rewrites_descendant_prefixes() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        engine.move_node("3", InsertPosition::Root).await.unwrap();
        assert_eq!(path_of(&store, "3").await, ("Veg-3".to_string(), 0));
        assert_eq!(path_of(&store, "4").await, ("Veg-3,Carrots-4".to_string(), 1));
        assert_eq!(path_of(&store, "2").await, ("Food-1,Fruits-2".to_string(), 1));
    }

    #[tokio::test]
    async fn test_cyclic_move_rejected() {
        let (engine, store) = engine();
        food_tree(&engine).await;
        let before = store.all_nodes().unwrap();

        let result = engine
            .move_node("3", InsertPosition::first_child_of("4"))
            .await;
        assert!(matches!(result, Err(TreeError::CyclicMove { .. })));
        assert_eq!(store.all_nodes().unwrap(), before);
    }

    #[tokio::test]
    async fn test_remove_single_node_rewrites_children() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        let summary = engine.remove_single_node("3").await.unwrap();
        assert_eq!(summary.reparented, vec!["4".to_string()]);
        assert_eq!(path_of(&store, "4").await, ("Food-1,Carrots-4".to_string(), 1));
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        let summary = engine.remove_subtree("3").await.unwrap();
        assert_eq!(summary.removed, 2);
        assert_eq!(store.all_nodes().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_repairs_paths() {
        let (engine, store) = engine();
        food_tree(&engine).await;

        let mut carrots = store.get_node("4").await.unwrap().unwrap();
        carrots.position = NodePosition::MaterializedPath(PathPosition {
            path: "garbage".to_string(),
            level: 9,
        });
        store.update_node(carrots).await.unwrap();

        assert_eq!(engine.rebuild("1").await.unwrap(), 1);
        assert_eq!(path_of(&store, "4").await, ("Food-1,Veg-3,Carrots-4".to_string(), 2));
        assert_eq!(engine.rebuild("1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_descendants_by_prefix() {
        let (engine, _store) = engine();
        food_tree(&engine).await;

        let descendants = engine.descendants("1").await.unwrap();
        let ids: Vec<_> = descendants.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_move_rechecked_under_unit() {
        let (engine, store) = engine();
        food_tree(&engine).await;
        engine
            .insert(TreeNode::with_id("5", "Drinks"), InsertPosition::Root)
            .await
            .unwrap();
        let before = store.all_nodes().unwrap();
        let food_only = vec!["1".to_string()];

        let result = engine
            .move_locked("3", &InsertPosition::first_child_of("4"), &food_only)
            .await;
        assert!(matches!(result, Err(TreeError::CyclicMove { .. })));

        let result = engine
            .move_locked("3", &InsertPosition::first_child_of("5"), &food_only)
            .await;
        assert!(matches!(result, Err(TreeError::StaleState { .. })));

        // Parent moved to an uncovered tree before the insert ran
        let result = engine
            .insert_locked(
                TreeNode::with_id("6", "Tea"),
                &InsertPosition::last_child_of("5"),
                &food_only,
            )
            .await;
        assert!(matches!(result, Err(TreeError::StaleState { .. })));

        assert_eq!(store.all_nodes().unwrap(), before);
    }
}
