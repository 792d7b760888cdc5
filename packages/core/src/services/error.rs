//! Engine Error Types
//!
//! This module defines the errors tree engines return. Verification problems
//! are not errors: `verify` returns them as data in a `VerificationReport`.

use crate::db::StoreError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Tree engine errors
///
/// Every variant except `Store` is raised before the engine writes anything,
/// so no partial state is visible to the caller.
#[derive(Error, Debug)]
pub enum TreeError {
    /// Reference node missing, unplaced, or in an incompatible tree
    #[error("Invalid position for node '{node_id}': {reason}")]
    InvalidPosition { node_id: String, reason: String },

    /// Node addressed by the operation does not exist
    #[error("Node not found: {id}")]
    NodeNotFound { id: String },

    /// Destination lies inside the moved node's own subtree
    #[error("Cyclic move: node '{node_id}' cannot be placed relative to '{target_id}' inside its own subtree")]
    CyclicMove { node_id: String, target_id: String },

    /// Root lock held by another writer and not yet expired
    #[error("Tree '{root_id}' is locked (lock time: {locked_at:?}); retry later")]
    LockContention {
        root_id: String,
        locked_at: Option<DateTime<Utc>>,
    },

    /// Caller holds a copy of a node that no longer matches the store
    #[error("Stale node '{node_id}': {reason}; re-fetch before mutating")]
    StaleState { node_id: String, reason: String },

    /// Path source value cannot form a path segment
    #[error("Invalid path source for node '{node_id}': {reason}")]
    InvalidPathSource { node_id: String, reason: String },

    /// Tree configuration rejected
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Gateway operation failed
    #[error("Storage operation failed: {0}")]
    Store(#[from] StoreError),
}

impl TreeError {
    /// Create an invalid position error
    pub fn invalid_position(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPosition {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a node not found error
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NodeNotFound { id: id.into() }
    }

    /// Create a cyclic move error
    pub fn cyclic_move(node_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self::CyclicMove {
            node_id: node_id.into(),
            target_id: target_id.into(),
        }
    }

    /// Create a lock contention error
    pub fn lock_contention(root_id: impl Into<String>, locked_at: Option<DateTime<Utc>>) -> Self {
        Self::LockContention {
            root_id: root_id.into(),
            locked_at,
        }
    }

    /// Create a stale state error
    pub fn stale_state(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StaleState {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid path source error
    pub fn invalid_path_source(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPathSource {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Only lock contention is worth retrying as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, TreeError::LockContention { .. })
    }
}
