//! Registry entries for pools and branches.

use serde::{Deserialize, Serialize};
use silt_storage::{Id, Layout, DEFAULT_SEEK_STRIDE};

use crate::registry::Entry;

/// Default object size threshold: loads split and compaction rewrites at
/// this many bytes.
pub const DEFAULT_THRESHOLD: u64 = 500 * 1024 * 1024;

/// Name of the branch every pool starts with.
pub const MAIN_BRANCH: &str = "main";

/// Configuration of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Human name, unique across the lake.
    pub name: String,
    /// Immutable id; names the pool's directory.
    pub id: Id,
    /// Sort key layout.
    pub layout: Layout,
    /// Seek stride of data objects written to the pool.
    pub seek_stride: u64,
    /// Object size threshold in bytes.
    pub threshold: u64,
    /// Unix milliseconds of creation.
    pub created: i64,
}

impl PoolConfig {
    /// New pool configuration with a fresh id.
    pub fn new(name: &str, layout: Layout, seek_stride: u64, threshold: u64) -> Self {
        Self {
            name: name.to_string(),
            id: Id::new(),
            layout,
            seek_stride: if seek_stride == 0 {
                DEFAULT_SEEK_STRIDE
            } else {
                seek_stride
            },
            threshold: if threshold == 0 {
                DEFAULT_THRESHOLD
            } else {
                threshold
            },
            created: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl Entry for PoolConfig {
    fn key(&self) -> &str {
        &self.name
    }

    fn with_key(&self, key: &str) -> Self {
        Self {
            name: key.to_string(),
            ..self.clone()
        }
    }
}

/// A branch: a name and the commit it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Branch name, unique within the pool.
    pub name: String,
    /// Tip commit; nil for a branch with no commits.
    pub commit: Id,
}

impl BranchConfig {
    /// Branch `name` at `commit`.
    pub fn new(name: &str, commit: Id) -> Self {
        Self {
            name: name.to_string(),
            commit,
        }
    }
}

impl Entry for BranchConfig {
    fn key(&self) -> &str {
        &self.name
    }

    fn with_key(&self, key: &str) -> Self {
        Self {
            name: key.to_string(),
            commit: self.commit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_defaults() {
        let p = PoolConfig::new("logs", Layout::asc("ts"), 0, 0);
        assert_eq!(p.seek_stride, DEFAULT_SEEK_STRIDE);
        assert_eq!(p.threshold, DEFAULT_THRESHOLD);
        assert!(!p.id.is_nil());
    }

    #[test]
    fn test_rename_keeps_identity() {
        let p = PoolConfig::new("logs", Layout::desc("ts"), 1024, 4096);
        let q = p.with_key("events");
        assert_eq!(q.id, p.id);
        assert_eq!(q.layout, p.layout);
        assert_eq!(q.key(), "events");
    }
}
