//! Atomic grouping for multi-record mutations.
//!
//! A `UnitOfWork` wraps one engine mutation. With a transactional store it is
//! a transaction: committed on success, rolled back on failure. Otherwise the
//! roots of every tree the mutation touches are locked for its duration, and
//! the locks are released on both outcomes.

use crate::db::StorageGateway;
use crate::services::error::TreeError;
use crate::services::lock_manager::{LockManager, RootLockGuard};
use std::sync::Arc;

enum Guard {
    Transaction,
    Locks(Vec<RootLockGuard>),
    Unguarded,
}

pub(crate) struct UnitOfWork {
    store: Arc<dyn StorageGateway>,
    guard: Guard,
    operation: &'static str,
}

impl UnitOfWork {
    /// Start a unit covering the trees rooted at `roots`.
    ///
    /// Locks are taken in sorted order so two writers touching the same pair
    /// of trees cannot each hold one of them.
    pub(crate) async fn begin(
        store: &Arc<dyn StorageGateway>,
        locks: Option<&LockManager>,
        roots: &[String],
        operation: &'static str,
    ) -> Result<Self, TreeError> {
        let guard = if store.supports_transactions() {
            store.begin_transaction().await?;
            Guard::Transaction
        } else if let Some(locks) = locks {
            let mut ordered: Vec<&String> = roots.iter().collect();
            ordered.sort();
            ordered.dedup();

            let mut held = Vec::with_capacity(ordered.len());
            for root_id in ordered {
                match locks.acquire(root_id).await {
                    Ok(guard) => held.push(guard),
                    Err(e) => {
                        release_all(held).await;
                        return Err(e);
                    }
                }
            }
            Guard::Locks(held)
        } else {
            Guard::Unguarded
        };

        Ok(Self {
            store: store.clone(),
            guard,
            operation,
        })
    }

    /// Close the unit with the mutation's outcome and pass the outcome through.
    pub(crate) async fn finish<T>(self, result: Result<T, TreeError>) -> Result<T, TreeError> {
        match self.guard {
            Guard::Transaction => match result {
                Ok(value) => {
                    self.store.commit_transaction().await?;
                    Ok(value)
                }
                Err(e) => {
                    tracing::warn!("Rolling back {}: {}", self.operation, e);
                    if let Err(rollback) = self.store.rollback_transaction().await {
                        tracing::warn!("Rollback of {} failed: {}", self.operation, rollback);
                    }
                    Err(e)
                }
            },
            Guard::Locks(held) => {
                if let Err(e) = &result {
                    tracing::warn!(
                        "{} failed under root lock, tree may need recovery: {}",
                        self.operation,
                        e
                    );
                }
                release_all(held).await;
                result
            }
            Guard::Unguarded => {
                if let Err(e) = &result {
                    tracing::warn!(
                        "{} failed without transaction or lock, tree may need recovery: {}",
                        self.operation,
                        e
                    );
                }
                result
            }
        }
    }
}

pub(crate) async fn release_all(held: Vec<RootLockGuard>) {
    for guard in held {
        let root_id = guard.root_id().to_string();
        if let Err(e) = guard.release().await {
            tracing::warn!("Failed to release lock on '{}': {}", root_id, e);
        }
    }
}
