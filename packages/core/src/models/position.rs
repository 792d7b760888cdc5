//! Placement and ordering requests
//!
//! Types callers use to say *where* a node goes and *how* siblings are ordered.

use crate::models::TreeNode;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Target position for an insert or a move.
///
/// The payload is the id of the reference node the position is relative to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reference", rename_all = "camelCase")]
pub enum InsertPosition {
    /// Start a new tree
    Root,
    FirstChildOf(String),
    LastChildOf(String),
    NextSiblingOf(String),
    PrevSiblingOf(String),
}

impl InsertPosition {
    pub fn first_child_of(id: impl Into<String>) -> Self {
        Self::FirstChildOf(id.into())
    }

    pub fn last_child_of(id: impl Into<String>) -> Self {
        Self::LastChildOf(id.into())
    }

    pub fn next_sibling_of(id: impl Into<String>) -> Self {
        Self::NextSiblingOf(id.into())
    }

    pub fn prev_sibling_of(id: impl Into<String>) -> Self {
        Self::PrevSiblingOf(id.into())
    }

    /// Id of the reference node, `None` for [`InsertPosition::Root`].
    pub fn reference(&self) -> Option<&str> {
        match self {
            InsertPosition::Root => None,
            InsertPosition::FirstChildOf(id)
            | InsertPosition::LastChildOf(id)
            | InsertPosition::NextSiblingOf(id)
            | InsertPosition::PrevSiblingOf(id) => Some(id),
        }
    }

    pub fn is_sibling(&self) -> bool {
        matches!(
            self,
            InsertPosition::NextSiblingOf(_) | InsertPosition::PrevSiblingOf(_)
        )
    }
}

/// How far `move_up` / `move_down` travel among siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Steps {
    /// Move past this many siblings (clamped to the first/last slot)
    Count(usize),
    /// Move to the first (up) or last (down) slot
    ToEnd,
}

impl From<usize> for Steps {
    fn from(count: usize) -> Self {
        Steps::Count(count)
    }
}

/// Field used to order siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    /// Stored position: interval `left` or materialized `path`
    #[default]
    Position,
    Label,
    Id,
    CreatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Ordering applied when listing children.
///
/// Ties are always broken by node id so listings are deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildOrder {
    pub field: SortField,
    pub direction: SortDirection,
}

impl ChildOrder {
    pub fn by_position() -> Self {
        Self::default()
    }

    pub fn by(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    /// Compare two nodes under this ordering.
    ///
    /// Nodes without a stored position sort after positioned ones regardless
    /// of direction.
    pub fn compare(&self, a: &TreeNode, b: &TreeNode) -> Ordering {
        let primary = match self.field {
            SortField::Position => {
                let by_left = compare_missing_last(
                    a.interval().map(|i| i.left),
                    b.interval().map(|i| i.left),
                    self.direction,
                );
                by_left.then_with(|| {
                    compare_missing_last(
                        a.path().map(|p| p.path.as_str()),
                        b.path().map(|p| p.path.as_str()),
                        self.direction,
                    )
                })
            }
            SortField::Label => directed(a.label.cmp(&b.label), self.direction),
            SortField::Id => directed(a.id.cmp(&b.id), self.direction),
            SortField::CreatedAt => directed(a.created_at.cmp(&b.created_at), self.direction),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Ascending => ordering,
        SortDirection::Descending => ordering.reverse(),
    }
}

fn compare_missing_last<T: Ord>(a: Option<T>, b: Option<T>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => directed(a.cmp(&b), direction),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
