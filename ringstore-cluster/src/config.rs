//! Cluster configuration
//!
//! Supports loading from TOML files and environment variables.
//!
//! ```toml
//! ring_size = 360
//! shutdown_grace_period_ms = 5000
//!
//! [[nodes]]
//! id = "node-1"
//! address = "10.0.0.1:7000"
//! range_start = 0
//! range_length = 360
//!
//! [coordinator]
//! minimal_oks = 1
//! optimal_oks = 2
//! max_oks = 2
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ringstore_core::DEFAULT_COMPRESS_THRESHOLD;
use ringstore_storage::StoreConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::{ClusterNode, KeyRange, NodeId, RingTopology};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Acknowledgement thresholds and retry policy for client operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Successes required before an operation counts as done at all
    pub minimal_oks: usize,
    /// Successes a caller normally waits for
    pub optimal_oks: usize,
    /// Successes after which no more nodes are contacted
    pub max_oks: usize,
    /// Retry failed nodes once every candidate was tried
    pub allow_retries: bool,
    /// Number of retry rounds per operation
    pub max_retry_rounds: u32,
    /// Pause before each retry round
    pub retry_delay_ms: u64,
    /// Per-call limit; 0 disables it
    pub call_timeout_ms: u64,
    /// Contact one more candidate when no call answered for this long;
    /// 0 disables hedging
    pub hedge_delay_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            minimal_oks: 1,
            optimal_oks: 2,
            max_oks: 3,
            allow_retries: true,
            max_retry_rounds: 2,
            retry_delay_ms: 200,
            call_timeout_ms: 5_000,
            hedge_delay_ms: 0,
        }
    }
}

impl CoordinatorConfig {
    /// Set all three thresholds
    pub fn with_thresholds(mut self, minimal: usize, optimal: usize, maximal: usize) -> Self {
        self.minimal_oks = minimal;
        self.optimal_oks = optimal;
        self.max_oks = maximal;
        self
    }

    /// Enable/disable retries
    pub fn with_retries(mut self, allow: bool) -> Self {
        self.allow_retries = allow;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn hedge_delay(&self) -> Duration {
        Duration::from_millis(self.hedge_delay_ms)
    }

    /// Thresholds must satisfy 1 <= minimal <= optimal <= max
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.minimal_oks == 0 {
            return Err(ConfigError::ValidationError(
                "minimal_oks must be at least 1".to_string(),
            ));
        }
        if self.minimal_oks > self.optimal_oks || self.optimal_oks > self.max_oks {
            return Err(ConfigError::ValidationError(format!(
                "thresholds must be ordered minimal <= optimal <= max, got {}/{}/{}",
                self.minimal_oks, self.optimal_oks, self.max_oks
            )));
        }
        Ok(())
    }
}

/// Client side of peer synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run sync agents at all
    pub enabled: bool,
    /// Pause between cycles when a peer has nothing more to send
    pub check_period_ms: u64,
    /// Most entries requested per listing
    pub max_list_entries: usize,
    /// Most entries fetched per pull call
    pub max_pull_batch: usize,
    /// Per-call limit; 0 disables it
    pub call_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_period_ms: 1_000,
            max_list_entries: 500,
            max_pull_batch: 50,
            call_timeout_ms: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.check_period_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Request handling on a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Content at least this large is stored LZF-compressed; 0 disables
    pub compress_threshold: usize,
    /// Entries younger than this are left out of sync listings
    pub sync_grace_period_ms: u64,
    /// Size of the per-key write lock table
    pub lock_stripes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            sync_grace_period_ms: 10_000,
            lock_stripes: 64,
        }
    }
}

impl ServiceConfig {
    pub fn sync_grace_period(&self) -> Duration {
        Duration::from_millis(self.sync_grace_period_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_stripes == 0 {
            return Err(ConfigError::ValidationError(
                "lock_stripes must be positive".to_string(),
            ));
        }
        // a listing cursor must stay behind stamps still being handed out
        if self.sync_grace_period_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sync_grace_period_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Garbage collection of tombstones and expired entries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Pause between cleanup passes
    pub period_ms: u64,
    /// Age after which tombstones are removed
    pub tombstone_ttl_ms: u64,
    /// Entries examined per store scan
    pub scan_batch: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 60_000,
            tombstone_ttl_ms: 24 * 60 * 60 * 1000, // 1 day
            scan_batch: 1_000,
        }
    }
}

impl CleanupConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// A node entry in the cluster file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub id: NodeId,
    pub address: String,
    pub range_start: u32,
    pub range_length: u32,
}

/// Complete cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of positions on the ring
    pub ring_size: u32,

    /// Members and their ranges
    pub nodes: Vec<NodeSettings>,

    pub coordinator: CoordinatorConfig,
    pub sync: SyncConfig,
    pub service: ServiceConfig,
    pub cleanup: CleanupConfig,
    pub storage: StoreConfig,

    /// How long a stopping node waits for background tasks
    pub shutdown_grace_period_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ring_size: 1024,
            nodes: Vec::new(),
            coordinator: CoordinatorConfig::default(),
            sync: SyncConfig::default(),
            service: ServiceConfig::default(),
            cleanup: CleanupConfig::default(),
            storage: StoreConfig::default(),
            shutdown_grace_period_ms: 5_000,
        }
    }
}

impl ClusterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Add a node
    pub fn with_node(
        mut self,
        id: impl Into<NodeId>,
        address: impl Into<String>,
        range_start: u32,
        range_length: u32,
    ) -> Self {
        self.nodes.push(NodeSettings {
            id: id.into(),
            address: address.into(),
            range_start,
            range_length,
        });
        self
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    /// Build the ring topology described by `nodes`
    pub fn topology(&self) -> Result<RingTopology, ConfigError> {
        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                KeyRange::new(n.range_start, n.range_length, self.ring_size)
                    .map(|range| ClusterNode::new(n.id.clone(), n.address.clone(), range))
            })
            .collect::<ringstore_core::Result<Vec<_>>>()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        RingTopology::new(self.ring_size, nodes)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordinator.validate()?;
        self.topology()?;

        if self.coordinator.max_oks > self.nodes.len() {
            return Err(ConfigError::ValidationError(format!(
                "max_oks {} exceeds the {} configured nodes",
                self.coordinator.max_oks,
                self.nodes.len()
            )));
        }
        if self.sync.max_list_entries == 0 || self.sync.max_pull_batch == 0 {
            return Err(ConfigError::ValidationError(
                "sync batch sizes must be positive".to_string(),
            ));
        }
        self.service.validate()?;
        Ok(())
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("RINGSTORE_MINIMAL_OKS") {
            self.coordinator.minimal_oks = v;
        }
        if let Some(v) = env_parse("RINGSTORE_OPTIMAL_OKS") {
            self.coordinator.optimal_oks = v;
        }
        if let Some(v) = env_parse("RINGSTORE_MAX_OKS") {
            self.coordinator.max_oks = v;
        }
        if let Ok(v) = std::env::var("RINGSTORE_ALLOW_RETRIES") {
            self.coordinator.allow_retries = v == "true" || v == "1";
        }
        if let Some(v) = env_parse("RINGSTORE_HEDGE_DELAY_MS") {
            self.coordinator.hedge_delay_ms = v;
        }
        if let Some(v) = env_parse("RINGSTORE_SYNC_PERIOD_MS") {
            self.sync.check_period_ms = v;
        }
        if let Some(v) = env_parse("RINGSTORE_SYNC_GRACE_MS") {
            self.service.sync_grace_period_ms = v;
        }
        if let Ok(dir) = std::env::var("RINGSTORE_DATA_DIR") {
            self.storage.path = dir.into();
        }
        if let Some(v) = env_parse("RINGSTORE_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace_period_ms = v;
        }
        self
    }
}
