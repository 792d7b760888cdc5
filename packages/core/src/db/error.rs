//! Storage Error Types
//!
//! This module defines error types for storage gateway operations, giving
//! engines a single error surface regardless of the backend behind the gateway.

use thiserror::Error;

/// Storage gateway errors
///
/// Covers record lookups, writes, transaction control and backend failures.
/// Tree-level rule violations are reported by the service layer instead.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A record addressed by id does not exist
    #[error("Record not found: {id}")]
    RecordNotFound { id: String },

    /// Insert of an id that already exists
    #[error("Duplicate record: {id}")]
    DuplicateRecord { id: String },

    /// Begin/commit/rollback could not be performed
    #[error("Transaction failed: {context}")]
    TransactionFailed { context: String },

    /// A write was rejected by the backend
    #[error("Write failed: {context}")]
    WriteFailed { context: String },

    /// Internal state lock was poisoned by a panicking writer
    #[error("Store state lock poisoned")]
    LockPoisoned,

    /// Error raised by a third-party backend implementation
    #[error("Backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Create a record not found error
    pub fn record_not_found(id: impl Into<String>) -> Self {
        Self::RecordNotFound { id: id.into() }
    }

    /// Create a duplicate record error
    pub fn duplicate_record(id: impl Into<String>) -> Self {
        Self::DuplicateRecord { id: id.into() }
    }

    /// Create a transaction failed error
    pub fn transaction_failed(context: impl Into<String>) -> Self {
        Self::TransactionFailed {
            context: context.into(),
        }
    }

    /// Create a write failed error
    pub fn write_failed(context: impl Into<String>) -> Self {
        Self::WriteFailed {
            context: context.into(),
        }
    }
}
