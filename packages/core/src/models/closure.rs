//! Closure table rows

use serde::{Deserialize, Serialize};

/// One `(ancestor, descendant, depth)` triple.
///
/// Every node owns a self row with `depth == 0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureRow {
    pub ancestor_id: String,
    pub descendant_id: String,
    pub depth: u32,
}

impl ClosureRow {
    pub fn new(ancestor_id: impl Into<String>, descendant_id: impl Into<String>, depth: u32) -> Self {
        Self {
            ancestor_id: ancestor_id.into(),
            descendant_id: descendant_id.into(),
            depth,
        }
    }

    pub fn self_row(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id, 0)
    }

    pub fn is_self_row(&self) -> bool {
        self.depth == 0 && self.ancestor_id == self.descendant_id
    }
}
