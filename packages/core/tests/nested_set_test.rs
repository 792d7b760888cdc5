//! Integration tests for the nested set engine
//!
//! Tests cover:
//! - The canonical Food tree layout
//! - Sibling moves and single-node removal
//! - Rejected cyclic moves leaving the store untouched
//! - Transactional rollback on write failure
//! - Degraded mode: partial writes detected by verify and repaired by recover
//! - Recovery leaving trees locked by other writers untouched
//! - Randomized mutation sequences keeping the invariants

use anyhow::Result;
use arbor_core::{
    config::TreeConfig,
    db::{MemoryStore, StorageGateway},
    models::{InsertPosition, Interval, NodePosition, Steps, TreeNode},
    services::{LockManager, NestedSetEngine, TreeEngine, TreeError, TreeRepair},
};
use std::collections::HashMap;
use std::sync::Arc;

/// Test helper: engine over a fresh in-memory store
fn create_test_env(store: MemoryStore) -> (NestedSetEngine, Arc<MemoryStore>) {
    let store = Arc::new(store);
    let engine = NestedSetEngine::new(store.clone(), &TreeConfig::default());
    (engine, store)
}

/// Food { Fruits, Vegetables { Carrots } }
async fn build_food_tree(engine: &NestedSetEngine) -> Result<()> {
    engine
        .insert(TreeNode::with_id("food", "Food"), InsertPosition::Root)
        .await?;
    engine
        .insert(
            TreeNode::with_id("fruits", "Fruits"),
            InsertPosition::last_child_of("food"),
        )
        .await?;
    engine
        .insert(
            TreeNode::with_id("veg", "Vegetables"),
            InsertPosition::last_child_of("food"),
        )
        .await?;
    engine
        .insert(
            TreeNode::with_id("carrots", "Carrots"),
            InsertPosition::last_child_of("veg"),
        )
        .await?;
    Ok(())
}

fn layout(store: &MemoryStore) -> Result<HashMap<String, (i64, i64, i64)>> {
    Ok(store
        .all_nodes()?
        .into_iter()
        .filter_map(|n| {
            let interval = n.interval()?.clone();
            Some((n.id, (interval.left, interval.right, interval.level)))
        })
        .collect())
}

// =========================================================================
// Canonical Scenarios
// =========================================================================

#[tokio::test]
async fn test_food_tree_layout() -> Result<()> {
    let (engine, store) = create_test_env(MemoryStore::new());
    build_food_tree(&engine).await?;

    let layout = layout(&store)?;
    assert_eq!(layout["food"], (1, 8, 0));
    assert_eq!(layout["fruits"], (2, 3, 1));
    assert_eq!(layout["veg"], (4, 7, 1));
    assert_eq!(layout["carrots"], (5, 6, 2));

    let report = engine.verify("food").await?;
    assert!(report.is_valid(), "violations: {:?}", report.violations);
    assert_eq!(report.node_count, 4);
    Ok(())
}

#[tokio::test]
async fn test_move_up_swaps_with_left_sibling() -> Result<()> {
    let (engine, store) = create_test_env(MemoryStore::new());
    build_food_tree(&engine).await?;

    assert!(engine.move_up("veg", Steps::Count(1)).await?);

    let layout = layout(&store)?;
    assert_eq!(layout["veg"], (2, 5, 1));
    assert_eq!(layout["carrots"], (3, 4, 2));
    assert_eq!(layout["fruits"], (6, 7, 1));
    assert_eq!(layout["food"], (1, 8, 0));
    Ok(())
}

#[tokio::test]
async fn test_remove_single_node_reparents_children() -> Result<()> {
    let (engine, store) = create_test_env(MemoryStore::new());
    build_food_tree(&engine).await?;

    let summary = engine.remove_single_node("veg").await?;
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.reparented, vec!["carrots".to_string()]);

    let layout = layout(&store)?;
    assert_eq!(layout["food"], (1, 6, 0));
    assert_eq!(layout["carrots"].1 - layout["carrots"].0, 1);
    assert_eq!(layout["carrots"].2, 1);

    let children = engine.children("food").await?;
    let ids: Vec<_> = children.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["fruits", "carrots"]);
    assert!(engine.verify("food").await?.is_valid());
    Ok(())
}

#[tokio::test]
async fn test_cyclic_move_leaves_store_unmodified() -> Result<()> {
    let (engine, store) = create_test_env(MemoryStore::without_transactions());
    build_food_tree(&engine).await?;
    let before = store.all_nodes()?;
    let writes_before = store.write_count();

    for position in [
        InsertPosition::first_child_of("carrots"),
        InsertPosition::last_child_of("food"),
        InsertPosition::next_sibling_of("veg"),
    ] {
        let result = engine.move_node("food", position).await;
        assert!(
            matches!(result, Err(TreeError::CyclicMove { .. })),
            "expected CyclicMove, got {:?}",
            result
        );
    }

    assert_eq!(store.all_nodes()?, before);
    assert_eq!(store.write_count(), writes_before);
    Ok(())
}

// =========================================================================
// Failure Handling
// =========================================================================

#[tokio::test]
async fn test_failed_move_rolls_back_in_transaction() -> Result<()> {
    let (engine, store) = create_test_env(MemoryStore::new());
    build_food_tree(&engine).await?;
    let before = store.all_nodes()?;

    // Let the source gap close, then fail while opening the destination gap
    store.fail_writes_after(2);
    let result = engine
        .move_node("veg", InsertPosition::prev_sibling_of("fruits"))
        .await;
    store.clear_faults();

    assert!(matches!(result, Err(TreeError::Store(_))));
    assert_eq!(store.all_nodes()?, before);
    assert!(engine.verify("food").await?.is_valid());
    Ok(())
}

#[tokio::test]
async fn test_degraded_mode_detected_and_recovered() -> Result<()> {
    let (engine, store) = create_test_env(MemoryStore::without_transactions());
    build_food_tree(&engine).await?;

    store.fail_writes_after(2);
    let result = engine.move_up("veg", Steps::Count(1)).await;
    store.clear_faults();
    assert!(result.is_err());

    // The lock was released even though the move failed
    let root = store.get_node("food").await?.expect("root exists");
    assert!(root.lock_time.is_none());

    let report = engine.verify("food").await?;
    assert!(!report.is_valid(), "partial move should be detectable");

    let recovery = engine.recover("food").await?;
    assert!(recovery.renumbered > 0);
    let report = engine.verify("food").await?;
    assert!(report.is_valid(), "violations: {:?}", report.violations);
    Ok(())
}

#[tokio::test]
async fn test_recover_is_idempotent() -> Result<()> {
    let (engine, store) = create_test_env(MemoryStore::new());
    build_food_tree(&engine).await?;

    // Scramble every bound; only parent links remain trustworthy
    for (i, mut node) in store.all_nodes()?.into_iter().enumerate() {
        if let Some(interval) = node.interval().cloned() {
            node.position = NodePosition::NestedSet(Interval::new(
                interval.left * 10,
                interval.left * 10 + i as i64,
                7,
                "food",
            ));
            store.update_node(node).await?;
        }
    }
    assert!(!engine.verify("food").await?.is_valid());

    engine.recover("food").await?;
    assert!(engine.verify("food").await?.is_valid());
    let first = layout(&store)?;

    let second_report = engine.recover("food").await?;
    assert_eq!(second_report.renumbered, 0);
    assert_eq!(layout(&store)?, first);

    // Last-known order is preserved
    assert_eq!(first["fruits"], (2, 3, 1));
    assert_eq!(first["veg"], (4, 7, 1));
    Ok(())
}

#[tokio::test]
async fn test_recover_defers_tree_locked_by_another_writer() -> Result<()> {
    let (engine, store) = create_test_env(MemoryStore::without_transactions());
    build_food_tree(&engine).await?;
    engine
        .insert(TreeNode::with_id("drinks", "Drinks"), InsertPosition::Root)
        .await?;
    engine
        .insert(
            TreeNode::with_id("tea", "Tea"),
            InsertPosition::last_child_of("drinks"),
        )
        .await?;

    // Half-finished move: carrots points at drinks but is still tagged food
    let mut carrots = store.get_node("carrots").await?.expect("carrots exists");
    carrots.parent_id = Some("drinks".to_string());
    store.update_node(carrots).await?;

    let locks = LockManager::new(store.clone(), TreeConfig::default().lock_timeout());
    let other_writer = locks.acquire("drinks").await?;
    let drinks_before: Vec<TreeNode> = store
        .all_nodes()?
        .into_iter()
        .filter(|n| n.interval().is_some_and(|i| i.root == "drinks"))
        .collect();

    let report = engine.recover("food").await?;
    assert_eq!(report.deferred_trees, vec!["drinks".to_string()]);
    assert_eq!(report.trees, vec!["food".to_string()]);
    let drinks_after: Vec<TreeNode> = store
        .all_nodes()?
        .into_iter()
        .filter(|n| n.interval().is_some_and(|i| i.root == "drinks"))
        .collect();
    assert_eq!(drinks_after, drinks_before);
    assert!(locks.is_locked("drinks").await?);
    assert!(!locks.is_locked("food").await?);

    other_writer.release().await?;
    let report = engine.recover("drinks").await?;
    assert!(report.deferred_trees.is_empty());
    for root in ["food", "drinks"] {
        let report = engine.verify(root).await?;
        assert!(report.is_valid(), "violations: {:?}", report.violations);
    }
    assert_eq!(engine.verify("drinks").await?.node_count, 3);
    Ok(())
}

#[tokio::test]
async fn test_recover_locks_every_tree_it_renumbers() -> Result<()> {
    let (engine, store) = create_test_env(MemoryStore::without_transactions());
    build_food_tree(&engine).await?;
    engine
        .insert(TreeNode::with_id("drinks", "Drinks"), InsertPosition::Root)
        .await?;

    let mut carrots = store.get_node("carrots").await?.expect("carrots exists");
    carrots.parent_id = Some("drinks".to_string());
    store.update_node(carrots).await?;

    let report = engine.recover("food").await?;
    assert_eq!(report.trees, vec!["food".to_string(), "drinks".to_string()]);
    assert!(report.deferred_trees.is_empty());

    let locks = LockManager::new(store.clone(), TreeConfig::default().lock_timeout());
    assert!(!locks.is_locked("drinks").await?);
    for root in ["food", "drinks"] {
        assert!(engine.verify(root).await?.is_valid());
    }
    Ok(())
}

// =========================================================================
// Randomized Sequences
// =========================================================================

/// Small deterministic generator so failures reproduce
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize) % bound
    }
}

fn check_invariants(nodes: &[TreeNode]) {
    let mut by_root: HashMap<&str, Vec<i64>> = HashMap::new();
    for node in nodes {
        let interval = node.interval().expect("every node is placed");
        assert!(interval.left < interval.right, "bad bounds on {}", node.id);
        assert_eq!((interval.right - interval.left) % 2, 1, "even width on {}", node.id);
        let slots = by_root.entry(interval.root.as_str()).or_default();
        slots.push(interval.left);
        slots.push(interval.right);
    }
    for (root, mut slots) in by_root {
        slots.sort_unstable();
        let expected: Vec<i64> = (1..=slots.len() as i64).collect();
        assert_eq!(slots, expected, "tree {} has gaps or duplicates", root);
    }
}

#[tokio::test]
async fn test_random_mutations_keep_invariants() -> Result<()> {
    let (engine, store) = create_test_env(MemoryStore::new());
    engine
        .insert(TreeNode::with_id("n0", "n0"), InsertPosition::Root)
        .await?;
    let mut rng = Lcg(7);
    let mut next_id = 1;

    for _ in 0..120 {
        let nodes = store.all_nodes()?;
        let pick = nodes[rng.next(nodes.len())].id.clone();

        match rng.next(4) {
            0 | 1 => {
                let id = format!("n{}", next_id);
                next_id += 1;
                let position = match rng.next(3) {
                    0 => InsertPosition::first_child_of(&pick),
                    1 => InsertPosition::last_child_of(&pick),
                    _ => InsertPosition::next_sibling_of(&pick),
                };
                match engine.insert(TreeNode::with_id(&id, &id), position).await {
                    Ok(_) | Err(TreeError::InvalidPosition { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            2 => {
                let target = nodes[rng.next(nodes.len())].id.clone();
                let position = if rng.next(2) == 0 {
                    InsertPosition::last_child_of(&target)
                } else {
                    InsertPosition::prev_sibling_of(&target)
                };
                match engine.move_node(&pick, position).await {
                    Ok(_)
                    | Err(TreeError::CyclicMove { .. })
                    | Err(TreeError::InvalidPosition { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            _ if nodes.len() > 1 => {
                engine.remove_single_node(&pick).await?;
            }
            _ => {}
        }

        let nodes = store.all_nodes()?;
        check_invariants(&nodes);
    }

    for root in store.children_of(None, Default::default()).await? {
        let report = engine.verify(&root.id).await?;
        assert!(report.is_valid(), "violations: {:?}", report.violations);
    }
    Ok(())
}
