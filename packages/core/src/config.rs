//! Tree configuration
//!
//! `TreeConfig` is the single source of truth for how one kind of tree is
//! encoded. It is built once (in code or from JSON) and handed to the engine;
//! nothing is looked up from global state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lock expiry for the root lock
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 3_000;

/// Default separator between materialized path segments
pub const DEFAULT_PATH_SEPARATOR: &str = ",";

/// Encoding used to keep hierarchy queryable in a flat store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TreeStrategy {
    #[default]
    NestedSet,
    ClosureTable,
    MaterializedPath,
}

/// Configuration for one tree type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TreeConfig {
    pub strategy: TreeStrategy,

    /// Separator placed between materialized path segments
    pub path_separator: String,

    /// Whether the path source is unique on its own; when false the node id
    /// is appended to each segment
    pub path_source_unique: bool,

    pub starts_with_separator: bool,

    pub ends_with_separator: bool,

    /// Take the root lock when the store cannot run transactions
    pub locking: bool,

    /// Age after which a root lock is considered abandoned
    pub lock_timeout_ms: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            strategy: TreeStrategy::default(),
            path_separator: DEFAULT_PATH_SEPARATOR.to_string(),
            path_source_unique: false,
            starts_with_separator: false,
            ends_with_separator: false,
            locking: true,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl TreeConfig {
    /// Default configuration for the given strategy
    pub fn for_strategy(strategy: TreeStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Parse a JSON document and validate it. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let config: TreeConfig =
            serde_json::from_str(json).map_err(|e| format!("invalid tree config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.path_separator.is_empty() {
            return Err("path_separator cannot be empty".to_string());
        }

        // Non-unique segments are "<label>-<id>"
        if !self.path_source_unique && self.path_separator.contains('-') {
            return Err(
                "path_separator cannot contain '-' unless path_source_unique is set".to_string(),
            );
        }

        if self.lock_timeout_ms == 0 {
            return Err("lock_timeout_ms must be greater than 0".to_string());
        }

        Ok(())
    }
}
