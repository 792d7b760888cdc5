//! Bulk Update Vocabulary
//!
//! Predicates select the records a bulk operation touches; field updates say
//! what happens to each match. Backends translate these into their own query
//! language (an SQL backend maps `BoundFrom` to `WHERE root = ? AND lft >= ?`).
//! The `matches` / `apply` helpers define the reference semantics and are what
//! [`crate::db::MemoryStore`] executes directly.

use crate::models::{ClosureRow, NodePosition, TreeNode};
use serde::{Deserialize, Serialize};

/// Which nested set bound a predicate compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Bound {
    Left,
    Right,
}

/// Record selection for bulk reads, updates and deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodePredicate {
    /// Every nested set node whose `root` equals the id
    InTree(String),
    /// Nested set nodes of `root` with `bound >= min`, minus `excluding`
    BoundFrom {
        root: String,
        bound: Bound,
        min: i64,
        excluding: Vec<String>,
    },
    /// Nested set nodes of `root` with `left` in `[left, right]`
    Span { root: String, left: i64, right: i64 },
    Ids(Vec<String>),
    /// Materialized path nodes whose path starts with the prefix
    PathPrefix(String),
}

impl NodePredicate {
    pub fn bound_from(root: impl Into<String>, bound: Bound, min: i64) -> Self {
        Self::BoundFrom {
            root: root.into(),
            bound,
            min,
            excluding: Vec::new(),
        }
    }

    pub fn span(root: impl Into<String>, left: i64, right: i64) -> Self {
        Self::Span {
            root: root.into(),
            left,
            right,
        }
    }

    pub fn matches(&self, node: &TreeNode) -> bool {
        match self {
            NodePredicate::InTree(root) => node.interval().is_some_and(|i| &i.root == root),
            NodePredicate::BoundFrom {
                root,
                bound,
                min,
                excluding,
            } => {
                let Some(interval) = node.interval() else {
                    return false;
                };
                if &interval.root != root || excluding.iter().any(|id| id == &node.id) {
                    return false;
                }
                match bound {
                    Bound::Left => interval.left >= *min,
                    Bound::Right => interval.right >= *min,
                }
            }
            NodePredicate::Span { root, left, right } => node
                .interval()
                .is_some_and(|i| &i.root == root && i.left >= *left && i.left <= *right),
            NodePredicate::Ids(ids) => ids.iter().any(|id| id == &node.id),
            NodePredicate::PathPrefix(prefix) => {
                node.path().is_some_and(|p| p.path.starts_with(prefix.as_str()))
            }
        }
    }
}

/// Change applied to every record matched by a predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldUpdate {
    /// Add deltas to nested set fields; `root` replaces the tree id when set.
    ///
    /// When used with [`NodePredicate::BoundFrom`] only the compared bound
    /// should move; [`FieldUpdate::shift`] builds that form.
    Interval {
        left: i64,
        right: i64,
        level: i64,
        root: Option<String>,
    },
    /// Replace the `from` prefix of the path with `to` and add to `level`
    PathPrefix { from: String, to: String, level: i64 },
}

impl FieldUpdate {
    /// Shift a single bound by `by`.
    pub fn shift(bound: Bound, by: i64) -> Self {
        match bound {
            Bound::Left => Self::Interval {
                left: by,
                right: 0,
                level: 0,
                root: None,
            },
            Bound::Right => Self::Interval {
                left: 0,
                right: by,
                level: 0,
                root: None,
            },
        }
    }

    /// Shift both bounds and the level, optionally re-rooting.
    pub fn translate(by: i64, level: i64, root: Option<String>) -> Self {
        Self::Interval {
            left: by,
            right: by,
            level,
            root,
        }
    }

    /// Apply to one record. Returns false when the record has no matching fields.
    pub fn apply(&self, node: &mut TreeNode) -> bool {
        match (self, &mut node.position) {
            (
                FieldUpdate::Interval {
                    left,
                    right,
                    level,
                    root,
                },
                NodePosition::NestedSet(interval),
            ) => {
                interval.left += left;
                interval.right += right;
                interval.level += level;
                if let Some(root) = root {
                    interval.root = root.clone();
                }
                true
            }
            (FieldUpdate::PathPrefix { from, to, level }, NodePosition::MaterializedPath(path)) => {
                match path.path.strip_prefix(from.as_str()) {
                    Some(rest) => {
                        path.path = format!("{}{}", to, rest);
                        path.level += level;
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }
}

/// Closure row selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClosurePredicate {
    /// Rows whose descendant is the id (its ancestor chain, self row included)
    AncestorsOf(String),
    /// Rows whose ancestor is the id (its subtree, self row included)
    DescendantsOf(String),
    /// Rows where the id is ancestor or descendant
    Touching(String),
    DescendantIn(Vec<String>),
    /// Rows pairing any listed ancestor with any listed descendant
    Between {
        ancestors: Vec<String>,
        descendants: Vec<String>,
    },
}

impl ClosurePredicate {
    pub fn matches(&self, row: &ClosureRow) -> bool {
        match self {
            ClosurePredicate::AncestorsOf(id) => &row.descendant_id == id,
            ClosurePredicate::DescendantsOf(id) => &row.ancestor_id == id,
            ClosurePredicate::Touching(id) => &row.ancestor_id == id || &row.descendant_id == id,
            ClosurePredicate::DescendantIn(ids) => ids.iter().any(|id| id == &row.descendant_id),
            ClosurePredicate::Between {
                ancestors,
                descendants,
            } => {
                ancestors.iter().any(|id| id == &row.ancestor_id)
                    && descendants.iter().any(|id| id == &row.descendant_id)
            }
        }
    }
}
