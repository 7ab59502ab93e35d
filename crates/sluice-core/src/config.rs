//! Engine configuration
//!
//! Builder-pattern config structs per engine area. All durations are wall
//! clock; all byte thresholds are pre-encoding sizes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Staging area configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Root directory for file-backed staged resources
    pub dir: PathBuf,
    /// Bytes buffered in memory before a resource promotes to a file
    pub memory_threshold_bytes: usize,
    /// Age after which unreferenced resources are purged
    pub purge_ttl: Duration,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./staging"),
            memory_threshold_bytes: 64 * 1024,
            purge_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Router and batch partitioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Close an open batch once it holds this many rows
    pub max_batch_rows: u64,
    /// Close an open batch once it holds this many (estimated) bytes
    pub max_batch_bytes: u64,
    /// Close an open batch once it has been open this long
    pub max_batch_open: Duration,
    /// Never split a source transaction across batches. When set, the
    /// row/byte limits become advisory for in-flight transactions.
    pub atomic_transactions: bool,
    /// Routing passes a detected hole is re-checked before it is declared a
    /// gap (covers commit-order skew between concurrent writers)
    pub gap_retry_count: u32,
    /// Age after which a hole is declared a permanent gap regardless of
    /// retry count (covers long uncommitted transactions)
    pub gap_timeout: Duration,
    /// Rows read from the change log per routing pass
    pub read_limit: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_batch_rows: 1_000,
            max_batch_bytes: 1_048_576,
            max_batch_open: Duration::from_secs(60),
            atomic_transactions: true,
            gap_retry_count: 3,
            gap_timeout: Duration::from_secs(60),
            read_limit: 10_000,
        }
    }
}

/// Loader behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Convert a conflicting insert into an update by key
    pub fallback_update: bool,
    /// Convert a zero-row update into an insert
    pub fallback_insert: bool,
    /// Treat a zero-row delete as success-with-warning instead of failure
    pub allow_missing_delete: bool,
    /// Commit incrementally after this many applied rows within one batch.
    /// Zero disables incremental commit.
    pub max_rows_before_commit: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            fallback_update: true,
            fallback_insert: true,
            allow_missing_delete: true,
            max_rows_before_commit: 10_000,
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Base URL per peer node id, e.g. `002 -> http://host:31415/sync`
    pub peers: HashMap<String, String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Maximum simultaneous outbound node connections
    pub max_concurrent_nodes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            peers: HashMap::new(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            max_concurrent_nodes: 4,
        }
    }
}

/// Cluster lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Identity recorded as the lock holder; unique per server instance
    pub server_id: String,
    /// A lock held longer than this is considered abandoned and reclaimable
    pub lock_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            server_id: "server-1".to_string(),
            lock_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Job scheduling intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub route_interval: Duration,
    pub push_interval: Duration,
    pub pull_interval: Duration,
    pub purge_interval: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            route_interval: Duration::from_secs(10),
            push_interval: Duration::from_secs(10),
            pull_interval: Duration::from_secs(10),
            purge_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// This node's external id
    pub node_id: String,
    pub staging: StagingConfig,
    pub router: RouterConfig,
    pub loader: LoaderConfig,
    pub transport: TransportConfig,
    pub lock: LockConfig,
    pub jobs: JobConfig,
}

impl EngineConfig {
    pub fn builder(node_id: impl Into<String>) -> EngineConfigBuilder {
        EngineConfigBuilder::new(node_id)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: "000".to_string(),
            staging: StagingConfig::default(),
            router: RouterConfig::default(),
            loader: LoaderConfig::default(),
            transport: TransportConfig::default(),
            lock: LockConfig::default(),
            jobs: JobConfig::default(),
        }
    }
}

/// Builder for [`EngineConfig`].
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new(node_id: impl Into<String>) -> Self {
        let mut config = EngineConfig::default();
        config.node_id = node_id.into();
        config.lock.server_id = format!("{}-server", config.node_id);
        Self { config }
    }

    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging.dir = dir.into();
        self
    }

    pub fn memory_threshold_bytes(mut self, bytes: usize) -> Self {
        self.config.staging.memory_threshold_bytes = bytes;
        self
    }

    pub fn max_batch_rows(mut self, rows: u64) -> Self {
        self.config.router.max_batch_rows = rows;
        self
    }

    pub fn max_batch_bytes(mut self, bytes: u64) -> Self {
        self.config.router.max_batch_bytes = bytes;
        self
    }

    pub fn atomic_transactions(mut self, v: bool) -> Self {
        self.config.router.atomic_transactions = v;
        self
    }

    pub fn peer(mut self, node_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.config
            .transport
            .peers
            .insert(node_id.into(), base_url.into());
        self
    }

    pub fn loader(mut self, loader: LoaderConfig) -> Self {
        self.config.loader = loader;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
