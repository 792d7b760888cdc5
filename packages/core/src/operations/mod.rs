//! Tree Operation Helpers
//!
//! Wrappers callers put around engine calls. Currently only the lock retry
//! queue, which absorbs transient root lock contention.

pub mod retry_queue;

// Re-export types for convenience
pub use retry_queue::{LockRetryQueue, DEFAULT_MAX_RETRIES};
