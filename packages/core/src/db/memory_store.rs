//! In-memory StorageGateway
//!
//! `MemoryStore` keeps nodes and closure rows in process memory. It is the
//! reference backend for tests and for embedding a tree in a short-lived
//! process, and it can deliberately behave like a weaker backend:
//!
//! - [`MemoryStore::new`] supports snapshot transactions; the snapshot covers
//!   the whole store, so a second `begin` waits until the open transaction
//!   commits or rolls back
//! - [`MemoryStore::without_transactions`] makes transactions a pass-through,
//!   so engines must fall back to root locking
//! - [`MemoryStore::fail_writes_after`] injects write failures to exercise the
//!   rollback and verify/recover paths

use crate::db::error::StoreError;
use crate::db::gateway::{StorageGateway, StoreResult};
use crate::db::predicate::{ClosurePredicate, FieldUpdate, NodePredicate};
use crate::models::{ChildOrder, ClosureRow, TreeNode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct StoreState {
    nodes: HashMap<String, TreeNode>,
    /// (ancestor, descendant) -> depth
    closure: BTreeMap<(String, String), u32>,
}

/// Open transaction: the state to restore and the turn it holds.
struct OpenTransaction {
    saved: StoreState,
    _turn: OwnedMutexGuard<()>,
}

pub struct MemoryStore {
    state: Mutex<StoreState>,
    snapshot: Mutex<Option<OpenTransaction>>,
    /// One transaction at a time
    turn: Arc<AsyncMutex<()>>,
    transactional: bool,
    /// Remaining successful writes before injected failures start
    fail_after: Mutex<Option<u64>>,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Transactional in-memory store.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Store whose transaction calls do nothing.
    pub fn without_transactions() -> Self {
        Self::build(false)
    }

    fn build(transactional: bool) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot: Mutex::new(None),
            turn: Arc::new(AsyncMutex::new(())),
            transactional,
            fail_after: Mutex::new(None),
            writes: AtomicU64::new(0),
        }
    }

    /// Let `count` more node/closure writes succeed, then fail every write
    /// until [`MemoryStore::clear_faults`] is called.
    ///
    /// Lock writes are never failed so lock release stays observable.
    pub fn fail_writes_after(&self, count: u64) {
        if let Ok(mut fail_after) = self.fail_after.lock() {
            *fail_after = Some(count);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut fail_after) = self.fail_after.lock() {
            *fail_after = None;
        }
    }

    /// Number of successful node/closure write calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy of every stored node, sorted by id.
    pub fn all_nodes(&self) -> StoreResult<Vec<TreeNode>> {
        let state = self.lock_state()?;
        let mut nodes: Vec<TreeNode> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    /// Copy of every closure row, sorted by (ancestor, descendant).
    pub fn all_closure_rows(&self) -> StoreResult<Vec<ClosureRow>> {
        let state = self.lock_state()?;
        Ok(state
            .closure
            .iter()
            .map(|((ancestor, descendant), depth)| ClosureRow::new(ancestor, descendant, *depth))
            .collect())
    }

    fn lock_state(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn record_write(&self) -> StoreResult<()> {
        let mut fail_after = self.fail_after.lock().map_err(|_| StoreError::LockPoisoned)?;
        match fail_after.as_mut() {
            Some(0) => Err(StoreError::write_failed("injected write failure")),
            Some(remaining) => {
                *remaining -= 1;
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageGateway for MemoryStore {
    async fn get_node(&self, id: &str) -> StoreResult<Option<TreeNode>> {
        let state = self.lock_state()?;
        Ok(state.nodes.get(id).cloned())
    }

    async fn insert_node(&self, node: TreeNode) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        if state.nodes.contains_key(&node.id) {
            return Err(StoreError::duplicate_record(node.id));
        }
        self.record_write()?;
        state.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn update_node(&self, node: TreeNode) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        if !state.nodes.contains_key(&node.id) {
            return Err(StoreError::record_not_found(node.id));
        }
        self.record_write()?;
        state.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> StoreResult<bool> {
        let mut state = self.lock_state()?;
        if !state.nodes.contains_key(id) {
            return Ok(false);
        }
        self.record_write()?;
        Ok(state.nodes.remove(id).is_some())
    }

    async fn children_of(
        &self,
        parent_id: Option<&str>,
        order: ChildOrder,
    ) -> StoreResult<Vec<TreeNode>> {
        let state = self.lock_state()?;
        let mut children: Vec<TreeNode> = state
            .nodes
            .values()
            .filter(|node| node.parent_id.as_deref() == parent_id)
            .cloned()
            .collect();
        children.sort_by(|a, b| order.compare(a, b));
        Ok(children)
    }

    async fn nodes_matching(&self, predicate: &NodePredicate) -> StoreResult<Vec<TreeNode>> {
        let state = self.lock_state()?;
        Ok(state
            .nodes
            .values()
            .filter(|node| predicate.matches(node))
            .cloned()
            .collect())
    }

    async fn bulk_update(
        &self,
        predicate: &NodePredicate,
        update: &FieldUpdate,
    ) -> StoreResult<u64> {
        let mut state = self.lock_state()?;
        self.record_write()?;
        let mut changed = 0;
        for node in state.nodes.values_mut() {
            if predicate.matches(node) && update.apply(node) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_matching(&self, predicate: &NodePredicate) -> StoreResult<u64> {
        let mut state = self.lock_state()?;
        self.record_write()?;
        let before = state.nodes.len();
        state.nodes.retain(|_, node| !predicate.matches(node));
        Ok((before - state.nodes.len()) as u64)
    }

    async fn compare_and_set_lock(
        &self,
        root_id: &str,
        expected: Option<DateTime<Utc>>,
        new: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let mut state = self.lock_state()?;
        let node = state
            .nodes
            .get_mut(root_id)
            .ok_or_else(|| StoreError::record_not_found(root_id))?;
        if node.lock_time != expected {
            return Ok(false);
        }
        node.lock_time = new;
        Ok(true)
    }

    async fn write_lock(&self, root_id: &str, value: Option<DateTime<Utc>>) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        let node = state
            .nodes
            .get_mut(root_id)
            .ok_or_else(|| StoreError::record_not_found(root_id))?;
        node.lock_time = value;
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn begin_transaction(&self) -> StoreResult<()> {
        if !self.transactional {
            return Ok(());
        }
        let turn = self.turn.clone().lock_owned().await;
        let state = self.lock_state()?;
        let mut snapshot = self.snapshot.lock().map_err(|_| StoreError::LockPoisoned)?;
        *snapshot = Some(OpenTransaction {
            saved: state.clone(),
            _turn: turn,
        });
        Ok(())
    }

    async fn commit_transaction(&self) -> StoreResult<()> {
        if !self.transactional {
            return Ok(());
        }
        let mut snapshot = self.snapshot.lock().map_err(|_| StoreError::LockPoisoned)?;
        match snapshot.take() {
            Some(_) => Ok(()),
            None => Err(StoreError::transaction_failed("no transaction to commit")),
        }
    }

    async fn rollback_transaction(&self) -> StoreResult<()> {
        if !self.transactional {
            return Ok(());
        }
        let mut state = self.lock_state()?;
        let mut snapshot = self.snapshot.lock().map_err(|_| StoreError::LockPoisoned)?;
        match snapshot.take() {
            Some(open) => {
                *state = open.saved;
                Ok(())
            }
            None => Err(StoreError::transaction_failed("no transaction to roll back")),
        }
    }

    async fn insert_closure_rows(&self, rows: Vec<ClosureRow>) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        self.record_write()?;
        for row in rows {
            state
                .closure
                .insert((row.ancestor_id, row.descendant_id), row.depth);
        }
        Ok(())
    }

    async fn closure_rows(&self, predicate: &ClosurePredicate) -> StoreResult<Vec<ClosureRow>> {
        let state = self.lock_state()?;
        let mut rows: Vec<ClosureRow> = state
            .closure
            .iter()
            .map(|((ancestor, descendant), depth)| ClosureRow::new(ancestor, descendant, *depth))
            .filter(|row| predicate.matches(row))
            .collect();
        rows.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then_with(|| a.ancestor_id.cmp(&b.ancestor_id))
                .then_with(|| a.descendant_id.cmp(&b.descendant_id))
        });
        Ok(rows)
    }

    async fn delete_closure_rows(&self, predicate: &ClosurePredicate) -> StoreResult<u64> {
        let mut state = self.lock_state()?;
        self.record_write()?;
        let before = state.closure.len();
        state.closure.retain(|(ancestor, descendant), depth| {
            !predicate.matches(&ClosureRow::new(ancestor.as_str(), descendant.as_str(), *depth))
        });
        Ok((before - state.closure.len()) as u64)
    }
}
