//! Tree Node Data Structures
//!
//! This module defines the `TreeNode` record and the strategy-specific derived
//! fields the engines maintain on it.
//!
//! # Architecture
//!
//! - **Flat records**: every node is an ordinary record in the backing store
//! - **Child → parent only**: a node stores its parent id; children are a query
//! - **Derived position**: `NodePosition` holds the fields owned by the engine
//!   (interval bounds, materialized path), never touched by application code
//!
//! # Examples
//!
//! ```rust
//! use arbor_core::models::{NodePosition, TreeNode};
//!
//! let node = TreeNode::with_id("1", "Food");
//! assert!(node.parent_id.is_none());
//! assert_eq!(node.position, NodePosition::Detached);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Nested set bounds of one node.
///
/// `root` is the id of the tree root this node belongs to, which lets one record
/// set hold many independent trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interval {
    pub left: i64,
    pub right: i64,
    pub level: i64,
    pub root: String,
}

impl Interval {
    pub fn new(left: i64, right: i64, level: i64, root: impl Into<String>) -> Self {
        Self {
            left,
            right,
            level,
            root: root.into(),
        }
    }

    /// Number of integer slots the subtree occupies (`right - left + 1`).
    pub fn width(&self) -> i64 {
        self.right - self.left + 1
    }

    /// Count of descendants encoded by the bounds.
    pub fn descendant_count(&self) -> i64 {
        (self.right - self.left - 1) / 2
    }

    /// True when `other` lies strictly inside this interval of the same tree.
    pub fn contains(&self, other: &Interval) -> bool {
        self.root == other.root && self.left < other.left && other.right < self.right
    }
}

/// Materialized path fields of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPosition {
    pub path: String,
    pub level: i64,
}

/// Engine-owned derived fields, tagged by the strategy that wrote them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "camelCase")]
pub enum NodePosition {
    /// Not yet placed in any tree
    #[default]
    Detached,
    NestedSet(Interval),
    /// Closure rows live in their own relation; the node carries nothing
    ClosureTable,
    MaterializedPath(PathPosition),
}

impl NodePosition {
    pub fn interval(&self) -> Option<&Interval> {
        match self {
            NodePosition::NestedSet(interval) => Some(interval),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&PathPosition> {
        match self {
            NodePosition::MaterializedPath(path) => Some(path),
            _ => None,
        }
    }

    /// Depth from the root when the strategy stores one.
    pub fn level(&self) -> Option<i64> {
        match self {
            NodePosition::NestedSet(interval) => Some(interval.level),
            NodePosition::MaterializedPath(path) => Some(path.level),
            _ => None,
        }
    }
}

/// A tree node record.
///
/// # Fields
///
/// - `id`: unique identifier (UUID unless the caller supplies one)
/// - `parent_id`: optional parent reference; `None` means the node is a root
/// - `label`: application value used as the materialized path source
/// - `position`: derived fields maintained by the engine
/// - `lock_time`: root lock timestamp, only meaningful on root nodes
/// - `created_at`: creation timestamp, usable as a sort key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub label: String,
    #[serde(default)]
    pub position: NodePosition,
    #[serde(default)]
    pub lock_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TreeNode {
    /// Create a detached node with a generated UUID.
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), label)
    }

    /// Create a detached node with a caller-chosen id.
    pub fn with_id(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            label: label.into(),
            position: NodePosition::Detached,
            lock_time: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn interval(&self) -> Option<&Interval> {
        self.position.interval()
    }

    pub fn path(&self) -> Option<&PathPosition> {
        self.position.path()
    }

    pub fn level(&self) -> Option<i64> {
        self.position.level()
    }
}
