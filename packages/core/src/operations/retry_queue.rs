//! Lock retry queue for tree mutations
//!
//! Engines running on a store without transactions fail fast with
//! `LockContention` when another writer holds the root lock. Contention is
//! transient, so instead of surfacing it to the caller this queue re-runs the
//! operation with exponential backoff.
//!
//! # Example
//!
//! ```rust,no_run
//! use arbor_core::models::InsertPosition;
//! use arbor_core::operations::LockRetryQueue;
//! use arbor_core::services::TreeEngine;
//!
//! # async fn example(engine: &dyn TreeEngine) -> Result<(), arbor_core::services::TreeError> {
//! let queue = LockRetryQueue::new(3);
//!
//! // Retries up to 3 times with backoff (10ms, 20ms, 40ms)
//! queue
//!     .run("move", || engine.move_node("node-1", InsertPosition::first_child_of("node-2")))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::services::TreeError;
use std::future::Future;
use tokio::time::Duration;

/// Default retry budget, giving up after roughly 150ms of backoff
pub const DEFAULT_MAX_RETRIES: usize = 4;

/// Retries operations that fail with `LockContention`
#[derive(Debug, Clone, Copy)]
pub struct LockRetryQueue {
    max_retries: usize,
}

impl Default for LockRetryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl LockRetryQueue {
    /// Create a queue allowing `max_retries` retries (0 = single attempt)
    pub fn new(max_retries: usize) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Run `operation`, retrying it while it fails with lock contention.
    ///
    /// # Retry Behavior
    ///
    /// - **Retry on**: `TreeError::LockContention` only
    /// - **Backoff**: Exponential (10ms, 20ms, 40ms, 80ms, ...)
    /// - **Fresh state**: each attempt calls `operation` again, so it re-reads the store
    /// - **Other errors**: Fail immediately without retry
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, TreeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TreeError>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(
                            "Tree operation '{}' succeeded after {} retry(ies)",
                            label,
                            attempt
                        );
                    }
                    return Ok(value);
                }

                Err(TreeError::LockContention { ref root_id, .. }) if attempt < self.max_retries => {
                    tracing::debug!(
                        "Lock contention on attempt {}/{} for tree '{}' ({}). Retrying...",
                        attempt + 1,
                        self.max_retries + 1,
                        root_id,
                        label
                    );

                    // Exponential backoff: 10ms, 20ms, 40ms, 80ms, ...
                    let backoff_ms = 10u64 * (1 << attempt);
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                    attempt += 1;
                }

                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(
                            "Max retries ({}) exceeded for tree operation '{}'",
                            self.max_retries,
                            label
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}
