//! Root-level cooperative locking
//!
//! Backends that cannot group many record writes into one transaction still
//! need mutations on the same tree to be serialized. The lock lives in the
//! root node's `lock_time` field and is taken with a compare-and-set, so any
//! store offering a single-record conditional write can host it.
//!
//! # Protocol
//!
//! 1. Read the root's `lock_time`
//! 2. Absent or older than the timeout: compare-and-set it to `now`
//! 3. Present and fresh, or the compare-and-set lost a race: `LockContention`
//! 4. Clear it unconditionally when the mutation finishes
//!
//! The timeout bounds the damage of a holder that crashed without releasing.

use crate::db::{StorageGateway, StoreError};
use crate::services::error::TreeError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Acquires and releases root locks through the storage gateway.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn StorageGateway>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn StorageGateway>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire the lock on `root_id` at the current time.
    pub async fn acquire(&self, root_id: &str) -> Result<RootLockGuard, TreeError> {
        self.acquire_at(root_id, Utc::now()).await
    }

    /// Acquire the lock on `root_id` as if the clock read `now`.
    ///
    /// # Errors
    ///
    /// - `NodeNotFound` if the root record does not exist
    /// - `LockContention` if a fresh lock is held or another writer won the race
    pub async fn acquire_at(
        &self,
        root_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RootLockGuard, TreeError> {
        let root = self
            .store
            .get_node(root_id)
            .await?
            .ok_or_else(|| TreeError::node_not_found(root_id))?;

        let current = root.lock_time;
        if let Some(locked_at) = current {
            if !self.is_expired(locked_at, now) {
                tracing::debug!("Tree '{}' is locked since {}", root_id, locked_at);
                return Err(TreeError::lock_contention(root_id, Some(locked_at)));
            }
            tracing::warn!(
                "Reclaiming expired lock on tree '{}' (held since {})",
                root_id,
                locked_at
            );
        }

        if !self
            .store
            .compare_and_set_lock(root_id, current, Some(now))
            .await?
        {
            let latest = self
                .store
                .get_node(root_id)
                .await?
                .and_then(|node| node.lock_time);
            tracing::warn!("Lost lock race on tree '{}'", root_id);
            return Err(TreeError::lock_contention(root_id, latest));
        }

        tracing::debug!("Acquired lock on tree '{}'", root_id);
        Ok(RootLockGuard {
            root_id: root_id.to_string(),
            acquired_at: now,
            store: self.store.clone(),
            released: false,
        })
    }

    /// Clear the lock on `root_id` regardless of who holds it.
    pub async fn release(&self, root_id: &str) -> Result<(), TreeError> {
        self.store.write_lock(root_id, None).await?;
        Ok(())
    }

    /// Whether `root_id` currently carries an unexpired lock.
    pub async fn is_locked(&self, root_id: &str) -> Result<bool, TreeError> {
        let root = self
            .store
            .get_node(root_id)
            .await?
            .ok_or_else(|| TreeError::node_not_found(root_id))?;
        Ok(root
            .lock_time
            .is_some_and(|locked_at| !self.is_expired(locked_at, Utc::now())))
    }

    fn is_expired(&self, locked_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let age_ms = now.signed_duration_since(locked_at).num_milliseconds();
        age_ms > i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Held root lock.
///
/// Call [`RootLockGuard::release`] on every path. A guard dropped without
/// release (panic, cancelled future) schedules the release on the current
/// tokio runtime; without a runtime the lock simply expires.
pub struct RootLockGuard {
    root_id: String,
    acquired_at: DateTime<Utc>,
    store: Arc<dyn StorageGateway>,
    released: bool,
}

impl RootLockGuard {
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Clear the lock. A root deleted while locked counts as released.
    pub async fn release(mut self) -> Result<(), TreeError> {
        self.released = true;
        match self.store.write_lock(&self.root_id, None).await {
            Ok(()) => {
                tracing::debug!("Released lock on tree '{}'", self.root_id);
                Ok(())
            }
            Err(StoreError::RecordNotFound { .. }) => {
                tracing::debug!("Locked root '{}' was removed", self.root_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RootLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(
            "Lock on tree '{}' dropped without release; releasing in background",
            self.root_id
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let root_id = std::mem::take(&mut self.root_id);
                handle.spawn(async move {
                    if let Err(e) = store.write_lock(&root_id, None).await {
                        tracing::warn!("Background release of '{}' failed: {}", root_id, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    "No async runtime to release lock on '{}'; it expires after the timeout",
                    self.root_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::TreeNode;
    use chrono::Duration as ChronoDuration;
    use tokio_test::assert_ok;

    async fn setup() -> (LockManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::without_transactions());
        store
            .insert_node(TreeNode::with_id("root", "Food"))
            .await
            .unwrap();
        let manager = LockManager::new(store.clone(), Duration::from_secs(3));
        (manager, store)
    }

    #[tokio::test]
    async fn test_acquire_sets_lock_time() {
        let (manager, store) = setup().await;
        let now = Utc::now();

        let guard = manager.acquire_at("root", now).await.unwrap();
        assert_eq!(guard.root_id(), "root");
        let root = store.get_node("root").await.unwrap().unwrap();
        assert_eq!(root.lock_time, Some(now));

        assert_ok!(guard.release().await);
        let root = store.get_node("root").await.unwrap().unwrap();
        assert!(root.lock_time.is_none());
    }

    #[tokio::test]
    async fn test_fresh_lock_blocks_second_writer() {
        let (manager, _store) = setup().await;
        let now = Utc::now();
        let guard = manager.acquire_at("root", now).await.unwrap();

        let err = manager
            .acquire_at("root", now + ChronoDuration::seconds(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            TreeError::LockContention { locked_at: Some(t), .. } if t == now
        ));

        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let (manager, store) = setup().await;
        let then = Utc::now();
        let stale = manager.acquire_at("root", then).await.unwrap();
        std::mem::forget(stale);

        let later = then + ChronoDuration::milliseconds(3_001);
        let guard = manager.acquire_at("root", later).await.unwrap();
        let root = store.get_node("root").await.unwrap().unwrap();
        assert_eq!(root.lock_time, Some(later));
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_at_exact_timeout_still_held() {
        let (manager, _store) = setup().await;
        let then = Utc::now();
        let guard = manager.acquire_at("root", then).await.unwrap();

        let result = manager
            .acquire_at("root", then + ChronoDuration::milliseconds(3_000))
            .await;
        assert!(matches!(result, Err(TreeError::LockContention { .. })));
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_huge_timeout_never_expires() {
        let (_, store) = setup().await;
        let manager = LockManager::new(store.clone(), Duration::from_secs(u64::MAX));
        let then = Utc::now();
        let guard = manager.acquire_at("root", then).await.unwrap();

        let result = manager
            .acquire_at("root", then + ChronoDuration::days(365))
            .await;
        assert!(matches!(result, Err(TreeError::LockContention { .. })));
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_root() {
        let (manager, _store) = setup().await;
        let result = manager.acquire("nope").await;
        assert!(matches!(result, Err(TreeError::NodeNotFound { .. })));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let (manager, store) = setup().await;
        {
            let _guard = manager.acquire("root").await.unwrap();
        }
        // Let the spawned release run
        for _ in 0..10 {
            tokio::task::yield_now().await;
            if !manager.is_locked("root").await.unwrap() {
                break;
            }
        }
        let root = store.get_node("root").await.unwrap().unwrap();
        assert!(root.lock_time.is_none());
    }
}
