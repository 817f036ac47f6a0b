//! Node configuration.
//!
//! Deserializable from a JSON file and overridable from the command line in
//! the binary. Every tunable the core recognizes lives here; defaults are
//! production-shaped and tests construct small variants inline.

use std::collections::HashMap;

use serde::Deserialize;
use squall_core::partition::PARTITION_COUNT;
use squall_core::protocol::Consistency;

/// How peers are discovered at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discovery {
    /// Dial the configured `peers` list.
    #[default]
    Manual,
    /// Resolve the headless-service DNS name in `peers` on each retry,
    /// dialing every address it returns.
    Kubernetes,
}

/// TLS material for a listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// Sliding-window rate limit applied per client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_ops: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { window_ms: 1_000, max_ops: 1_000 }
    }
}

/// Striped backpressure thresholds for the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureConfig {
    /// Pending ops per stripe beyond which enqueue blocks.
    pub max_pending: usize,
    /// Every Nth saturation event is logged at warn level; the rest count
    /// only toward metrics.
    pub sync_frequency: u32,
    /// Bound on how long a blocked enqueue waits before failing the op.
    pub backoff_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { max_pending: 4_096, sync_frequency: 16, backoff_ms: 2_000 }
    }
}

/// Worker stripes applying writes; events for one `(map, key)` always share
/// a stripe, which is what gives per-key serial order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolConfig {
    /// Stripes kept even when idle. The pool is fixed-size, so this is
    /// informational unless `max` is lowered below it.
    pub min: usize,
    /// Stripes spawned; the effective pool size.
    pub max: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { min: 2, max: 8 }
    }
}

/// Full-text indexing for one map.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMapConfig {
    /// Document fields tokenized into the inverted index.
    pub fields: Vec<String>,
}

/// A coarse allow rule: principals holding `role` may perform `actions` on
/// maps whose name starts with `map_prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    pub role: String,
    pub map_prefix: String,
    pub actions: Vec<MapAction>,
}

/// Actions a policy can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapAction {
    Read,
    Write,
}

/// Outbound batching thresholds for the per-socket coalescing writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoalescingConfig {
    pub max_batch_size: usize,
    pub max_batch_bytes: usize,
    pub max_delay_ms: u64,
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self { max_batch_size: 64, max_batch_bytes: 256 * 1024, max_delay_ms: 5 }
    }
}

/// Replication pipeline tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationConfig {
    pub enabled: bool,
    /// Backups per partition (the replication factor R).
    pub factor: u32,
    /// Coalescing interval for outbound batches.
    pub flush_interval_ms: u64,
    /// Flush immediately once a peer batch reaches this size.
    pub max_batch_ops: usize,
    /// Per-peer pending threshold beyond which the pipeline reports unhealthy.
    pub unhealthy_pending: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            factor: 1,
            flush_interval_ms: 20,
            max_batch_ops: 256,
            unhealthy_pending: 10_000,
        }
    }
}

/// Authentication material.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// HMAC secret for JWT validation. When unset, JWTs are rejected.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// Static tokens accepted as-is, mapped to a principal id.
    #[serde(default)]
    pub static_tokens: HashMap<String, String>,
    /// How long an accepted socket may stay unauthenticated.
    #[serde(default = "default_auth_deadline_ms")]
    pub deadline_ms: u64,
}

fn default_auth_deadline_ms() -> u64 {
    10_000
}

/// Top-level node configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    /// Unique node id; must not contain `:`.
    pub node_id: String,
    /// Host peers use to reach this node.
    pub host: String,
    /// Client WebSocket port.
    pub port: u16,
    /// Cluster TCP port.
    pub cluster_port: u16,
    /// Logical cluster name; peers with a different name are rejected.
    pub cluster_name: String,
    /// Seed peers (`host:clusterPort`), or the service name for kubernetes.
    pub peers: Vec<String>,
    pub discovery: Discovery,
    pub tls: Option<TlsConfig>,
    pub cluster_tls: Option<TlsConfig>,
    /// Fixed partition count; configurable for tests only.
    pub partition_count: u32,
    pub replication: ReplicationConfig,
    pub default_consistency: Consistency,
    /// Tombstones younger than this never prune (default 30 days).
    pub gc_age_ms: u64,
    /// Cadence of the GC sweep.
    pub gc_interval_ms: u64,
    /// Extra slack subtracted from the cluster-safe cutoff.
    pub gc_grace_ms: u64,
    /// Cadence of peer Merkle repair rounds.
    pub anti_entropy_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Authenticated clients silent longer than this are evicted (4002).
    pub client_timeout_ms: u64,
    /// Peers silent longer than this are declared dead.
    pub peer_timeout_ms: u64,
    /// Deadline for distributed subscription registration acks.
    pub ack_timeout_ms: u64,
    /// Deadline for QUORUM/ALL write acknowledgement.
    pub write_ack_timeout_ms: u64,
    pub rate_limit: RateLimitConfig,
    pub worker_pool: WorkerPoolConfig,
    pub backpressure: BackpressureConfig,
    pub coalescing: CoalescingConfig,
    pub auth: AuthConfig,
    pub security_policies: Vec<SecurityPolicy>,
    /// Map name -> indexed fields.
    pub full_text_search: HashMap<String, SearchMapConfig>,
    /// Reciprocal-Rank-Fusion rank constant.
    pub search_rrf_k: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            cluster_port: 7000,
            cluster_name: "squall".to_string(),
            peers: Vec::new(),
            discovery: Discovery::Manual,
            tls: None,
            cluster_tls: None,
            partition_count: PARTITION_COUNT,
            replication: ReplicationConfig::default(),
            default_consistency: Consistency::Eventual,
            gc_age_ms: 30 * 24 * 60 * 60 * 1_000,
            gc_interval_ms: 60_000,
            gc_grace_ms: 60_000,
            anti_entropy_interval_ms: 30_000,
            heartbeat_interval_ms: 15_000,
            client_timeout_ms: 60_000,
            peer_timeout_ms: 20_000,
            ack_timeout_ms: 5_000,
            write_ack_timeout_ms: 5_000,
            rate_limit: RateLimitConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            backpressure: BackpressureConfig::default(),
            coalescing: CoalescingConfig::default(),
            auth: AuthConfig::default(),
            security_policies: Vec::new(),
            full_text_search: HashMap::new(),
            search_rrf_k: 60.0,
        }
    }
}

impl NodeConfig {
    /// Validates invariants a misconfigured node would trip over at runtime.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first violated invariant.
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.is_empty() {
            return Err("nodeId must be set".to_string());
        }
        if self.node_id.contains(':') {
            return Err("nodeId must not contain ':'".to_string());
        }
        if self.partition_count == 0 {
            return Err("partitionCount must be positive".to_string());
        }
        if self.worker_pool.max == 0 {
            return Err("workerPool.max must be positive".to_string());
        }
        if self.partition_count != PARTITION_COUNT {
            return Err(format!(
                "partitionCount is fixed at {PARTITION_COUNT} for ring compatibility"
            ));
        }
        if self.coalescing.max_batch_size == 0 {
            return Err("coalescing.maxBatchSize must be positive".to_string());
        }
        if self.rate_limit.window_ms == 0 {
            return Err("rateLimit.windowMs must be positive".to_string());
        }
        Ok(())
    }
}
