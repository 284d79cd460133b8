//! Configuration for `silt manage` and the CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use silt_meta::MAIN_BRANCH;

use crate::compactor::Policy;
use crate::error::{MgmtError, MgmtResult};

/// Per-pool settings that replace the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOverride {
    /// Seconds between compaction cycles.
    pub interval_secs: Option<u64>,
    /// Build vector blobs for objects that stay alone in their run.
    pub vectors: Option<bool>,
    /// Branch to maintain.
    pub branch: Option<String>,
}

/// Settings for lake maintenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManageConfig {
    /// Lake location: a storage URI or path, or the URL of a lake service.
    pub lake: String,
    /// Directory holding credentials; `token` inside it is sent to lake services.
    pub credentials_dir: Option<PathBuf>,
    /// Seconds between compaction cycles.
    pub interval_secs: u64,
    /// Seconds an object must exist before it may be compacted.
    pub cold_threshold_secs: u64,
    /// Build vector blobs for objects that stay alone in their run.
    pub vectors: bool,
    /// Branch maintained in every pool.
    pub branch: String,
    /// Seconds to wait before reconnecting to a lake that refused us.
    pub reconnect_delay_secs: u64,
    /// Overrides keyed by pool name.
    pub pools: HashMap<String, PoolOverride>,
}

impl Default for ManageConfig {
    fn default() -> Self {
        Self {
            lake: String::from("http://localhost:9867"),
            credentials_dir: None,
            interval_secs: 600,
            cold_threshold_secs: 300,
            vectors: false,
            branch: String::from(MAIN_BRANCH),
            reconnect_delay_secs: 5,
            pools: HashMap::new(),
        }
    }
}

impl ManageConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> MgmtResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => Err(MgmtError::Config(format!(
                "unsupported config file extension: {:?}",
                ext
            ))),
        }
    }

    fn pool(&self, pool: &str) -> Option<&PoolOverride> {
        self.pools.get(pool)
    }

    /// Cycle interval for `pool`.
    pub fn interval(&self, pool: &str) -> Duration {
        let secs = self
            .pool(pool)
            .and_then(|o| o.interval_secs)
            .unwrap_or(self.interval_secs);
        Duration::from_secs(secs.max(1))
    }

    /// Branch maintained in `pool`.
    pub fn branch(&self, pool: &str) -> &str {
        self.pool(pool)
            .and_then(|o| o.branch.as_deref())
            .unwrap_or(&self.branch)
    }

    /// Compaction policy for `pool`.
    pub fn policy(&self, pool: &str) -> Policy {
        Policy {
            cold_threshold: Duration::from_secs(self.cold_threshold_secs),
            vectors: self.pool(pool).and_then(|o| o.vectors).unwrap_or(self.vectors),
        }
    }

    /// Delay before reconnecting after a refused connection.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Bearer token from `credentials_dir/token`, if present.
    pub fn token(&self) -> MgmtResult<Option<String>> {
        let Some(dir) = &self.credentials_dir else {
            return Ok(None);
        };
        match std::fs::read_to_string(dir.join("token")) {
            Ok(token) => Ok(Some(token.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
