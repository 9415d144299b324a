//! Store configuration.

use serde::{Deserialize, Serialize};

use crate::cache::CachePolicy;
use crate::error::{Error, Result};

/// Settings for one [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Release unretained nodes at the end of each transaction.
    pub retention_enabled: bool,
    /// Graph chains deeper than this are flattened when forked.
    pub graph_compaction_depth: usize,
    /// Cache policy for selectors that do not declare one.
    pub default_cache_policy: CachePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_enabled: true,
            graph_compaction_depth: 3,
            default_cache_policy: CachePolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::msg(format!("invalid store config: {}", e)))
    }
}
