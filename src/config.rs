use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::record::codec::Compression;
use crate::remote::{Member, RemoteSettings, RetryPolicy};
use crate::worker::{OverflowPolicy, QueueConfig, SelectionStrategy};

/// Top-level configuration for an apmflow node.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Name of this node in the cluster. Required.
    #[serde(default)]
    pub node_name: String,

    /// Static cluster membership.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Outbound cluster transport.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Aggregation worker pools.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Persistence worker pools.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Hour and day roll-ups.
    #[serde(default)]
    pub downsampling: DownsamplingConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Static cluster membership.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Address the inbound batch endpoint listens on. Default: ":11800".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address other members use to reach this node. Defaults to
    /// `listen_addr`.
    #[serde(default)]
    pub advertise_addr: String,

    /// Every member of the cluster. This node is added when missing.
    #[serde(default)]
    pub members: Vec<Member>,
}

/// Outbound cluster transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Limit for one send attempt. Default: 10s.
    #[serde(default = "default_remote_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Retries after the first failed attempt. Default: 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, doubled on each retry. Default: 200ms.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for the retry delay. Default: 5s.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Envelopes per batch. Default: 256.
    #[serde(default = "default_remote_batch_size")]
    pub batch_size: usize,

    /// Envelopes queued per peer before senders block. Default: 10000.
    #[serde(default = "default_remote_queue_size")]
    pub queue_size: usize,

    /// Batch compression: none, gzip, zstd, zlib, snappy. Default: gzip.
    #[serde(default)]
    pub compression: Compression,
}

/// Aggregation worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Instances per aggregation role. Default: 4.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Reduction window. Default: 1s.
    #[serde(default = "default_aggregation_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Mailboxes facing ingestion. Default: 1024, reject.
    #[serde(default = "QueueConfig::ingest")]
    pub ingest_queue: QueueConfig,

    /// Mailboxes between stages. Default: 1024, block.
    #[serde(default = "QueueConfig::internal")]
    pub internal_queue: QueueConfig,
}

/// Persistence worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Instances per persistence role. Default: 2.
    #[serde(default = "default_persistence_pool_size")]
    pub pool_size: usize,

    /// Instance selection. Default: affinity.
    #[serde(default)]
    pub selector: SelectionStrategy,

    /// Storage flush cadence. Default: 3s.
    #[serde(default = "default_persistence_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Read stored state before writing records with Sum columns.
    /// Default: true.
    #[serde(default = "default_true")]
    pub read_merge_write: bool,

    /// Pending records kept per instance while storage fails.
    /// Default: 100000.
    #[serde(default = "default_max_pending_records")]
    pub max_pending_records: usize,

    /// Persistence mailboxes. Default: 1024, block.
    #[serde(default = "QueueConfig::internal")]
    pub queue: QueueConfig,
}

/// Hour and day roll-up toggles.
#[derive(Debug, Clone, Deserialize)]
pub struct DownsamplingConfig {
    /// Roll minute records up into hour records. Default: true.
    #[serde(default = "default_true")]
    pub hour: bool,

    /// Roll hour records up into day records. Default: true.
    #[serde(default = "default_true")]
    pub day: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    ":11800".to_string()
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_remote_batch_size() -> usize {
    256
}

fn default_remote_queue_size() -> usize {
    10_000
}

fn default_pool_size() -> usize {
    4
}

fn default_aggregation_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_persistence_pool_size() -> usize {
    2
}

fn default_persistence_flush_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_max_pending_records() -> usize {
    100_000
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node_name: String::new(),
            cluster: ClusterConfig::default(),
            remote: RemoteConfig::default(),
            aggregation: AggregationConfig::default(),
            persistence: PersistenceConfig::default(),
            downsampling: DownsamplingConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_addr: String::new(),
            members: Vec::new(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout: default_remote_timeout(),
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            batch_size: default_remote_batch_size(),
            queue_size: default_remote_queue_size(),
            compression: Compression::default(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            flush_interval: default_aggregation_flush_interval(),
            ingest_queue: QueueConfig::ingest(),
            internal_queue: QueueConfig::internal(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            pool_size: default_persistence_pool_size(),
            selector: SelectionStrategy::default(),
            flush_interval: default_persistence_flush_interval(),
            read_merge_write: true,
            max_pending_records: default_max_pending_records(),
            queue: QueueConfig::internal(),
        }
    }
}

impl Default for DownsamplingConfig {
    fn default() -> Self {
        Self {
            hour: true,
            day: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Derived settings ---

impl ClusterConfig {
    /// The address peers reach this node on.
    pub fn advertised(&self) -> String {
        if !self.advertise_addr.is_empty() {
            return self.advertise_addr.clone();
        }
        if self.listen_addr.starts_with(':') {
            format!("127.0.0.1{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }
}

impl RemoteConfig {
    /// Dispatcher settings derived from this section.
    pub fn settings(&self) -> RemoteSettings {
        RemoteSettings {
            batch_size: self.batch_size,
            queue_size: self.queue_size,
            compression: self.compression,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                initial_backoff: self.initial_backoff,
                max_backoff: self.max_backoff,
                timeout: self.timeout,
            },
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            bail!("node_name is required");
        }

        if self.cluster.listen_addr.is_empty() {
            bail!("cluster.listen_addr is required");
        }

        let mut names = HashSet::new();
        for member in &self.cluster.members {
            if member.name.is_empty() || member.address.is_empty() {
                bail!("cluster.members entries need a name and an address");
            }
            if !names.insert(member.name.as_str()) {
                bail!("cluster member {} listed twice", member.name);
            }
        }

        if self.remote.timeout.is_zero() {
            bail!("remote.timeout must be positive");
        }
        if self.remote.batch_size == 0 {
            bail!("remote.batch_size must be positive");
        }
        if self.remote.queue_size == 0 {
            bail!("remote.queue_size must be positive");
        }
        if self.remote.initial_backoff > self.remote.max_backoff {
            bail!(
                "remote.initial_backoff {:?} exceeds remote.max_backoff {:?}",
                self.remote.initial_backoff,
                self.remote.max_backoff
            );
        }

        if self.aggregation.pool_size == 0 {
            bail!("aggregation.pool_size must be positive");
        }
        if self.aggregation.flush_interval.is_zero() {
            bail!("aggregation.flush_interval must be positive");
        }
        validate_queue("aggregation.ingest_queue", &self.aggregation.ingest_queue)?;
        validate_queue("aggregation.internal_queue", &self.aggregation.internal_queue)?;
        if self.aggregation.internal_queue.overflow == OverflowPolicy::Reject {
            bail!("aggregation.internal_queue.overflow cannot be reject");
        }

        if self.persistence.pool_size == 0 {
            bail!("persistence.pool_size must be positive");
        }
        if self.persistence.flush_interval.is_zero() {
            bail!("persistence.flush_interval must be positive");
        }
        if self.persistence.max_pending_records == 0 {
            bail!("persistence.max_pending_records must be positive");
        }
        validate_queue("persistence.queue", &self.persistence.queue)?;

        if self.downsampling.day && !self.downsampling.hour {
            bail!("downsampling.day requires downsampling.hour");
        }

        Ok(())
    }
}

fn validate_queue(section: &str, queue: &QueueConfig) -> Result<()> {
    if queue.capacity == 0 {
        bail!("{section}.capacity must be positive");
    }
    Ok(())
}
