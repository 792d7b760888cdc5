//! Data Models
//!
//! This module contains the plain data structures shared by every engine:
//!
//! - `TreeNode` - one record per tree node, with engine-owned `NodePosition`
//! - `InsertPosition` / `Steps` / `ChildOrder` - placement and ordering requests
//! - `ClosureRow` - ancestor/descendant pairs for the closure table strategy
//!
//! Models carry no behaviour beyond small accessors; all tree maintenance lives
//! in the service layer.

mod closure;
mod node;
mod position;

pub use closure::ClosureRow;
pub use node::{Interval, NodePosition, PathPosition, TreeNode};
pub use position::{ChildOrder, InsertPosition, SortDirection, SortField, Steps};
