//! Garbage collection: TTL expiry and tombstone pruning under the
//! cluster-safe cutoff.
//!
//! The sweep runs in two phases. Phase one converts TTL-expired records into
//! tombstones stamped at their exact expiration instant — deterministic
//! across replicas — and replicates them through the ordinary pipeline (no
//! cluster broadcast). Phase two prunes tombstones strictly older than the
//! safe cutoff: the minimum last-active HLC reported by every connected
//! client and peer, minus a grace period, and never younger than `gcAgeMs`.
//! When no activity has been reported the cutoff is indeterminate and
//! nothing is pruned.
//!
//! The cutoff used by each prune is recorded as the map's GC watermark; a
//! client whose sync state predates it is told `SYNC_RESET_REQUIRED` instead
//! of being allowed to race a pruned tombstone.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use squall_core::protocol::peer::PeerMessage;
use squall_core::protocol::OpBody;
use squall_core::{Hlc, Timestamp};
use tokio::sync::watch;

use crate::partitions::PartitionService;
use crate::queries::QueryRegistry;
use crate::replication::ReplicationPipeline;
use crate::search::SearchService;
use crate::subs::SubscriptionCoordinator;
use crate::storage::StorageManager;

/// Where an activity report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivitySource {
    Client,
    Peer,
}

/// Totals from one GC sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// TTL-expired records converted to tombstones.
    pub expired: usize,
    /// Tombstones pruned under the safe cutoff.
    pub pruned: usize,
    /// Whether the prune phase ran at all.
    pub prune_ran: bool,
}

/// The garbage collector.
pub struct GcService {
    node_id: String,
    hlc: Hlc,
    gc_age_ms: u64,
    grace_ms: u64,
    storage: Arc<StorageManager>,
    partitions: Arc<PartitionService>,
    replication: Arc<ReplicationPipeline>,
    registry: Arc<QueryRegistry>,
    search: Arc<SearchService>,
    subs: Arc<SubscriptionCoordinator>,
    /// `(source kind, id)` -> newest last-active HLC reported.
    activity: DashMap<(ActivitySource, String), Timestamp>,
}

impl GcService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        hlc: Hlc,
        gc_age_ms: u64,
        grace_ms: u64,
        storage: Arc<StorageManager>,
        partitions: Arc<PartitionService>,
        replication: Arc<ReplicationPipeline>,
        registry: Arc<QueryRegistry>,
        search: Arc<SearchService>,
        subs: Arc<SubscriptionCoordinator>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            hlc,
            gc_age_ms,
            grace_ms,
            storage,
            partitions,
            replication,
            registry,
            search,
            subs,
            activity: DashMap::new(),
        }
    }

    /// Records a client's or peer's newest observed HLC.
    pub fn report_activity(&self, source: ActivitySource, id: &str, last_active: Timestamp) {
        self.activity
            .entry((source, id.to_string()))
            .and_modify(|seen| {
                if last_active > *seen {
                    *seen = last_active.clone();
                }
            })
            .or_insert(last_active);
    }

    /// Drops the report for a disconnected client or departed peer.
    pub fn forget(&self, source: ActivitySource, id: &str) {
        self.activity.remove(&(source, id.to_string()));
    }

    /// The hint this node gossips: the oldest last-active HLC among its own
    /// clients, or the node's current time when no client is connected.
    #[must_use]
    pub fn local_hint(&self) -> Timestamp {
        self.activity
            .iter()
            .filter(|entry| entry.key().0 == ActivitySource::Client)
            .map(|entry| entry.value().clone())
            .min()
            .unwrap_or_else(|| self.hlc.now())
    }

    /// The cluster-safe prune cutoff, or `None` when indeterminate.
    ///
    /// `min(everything reported) - grace`, and never younger than
    /// `now - gcAgeMs` so recent tombstones survive regardless of activity.
    #[must_use]
    pub fn safe_cutoff(&self) -> Option<Timestamp> {
        let min_reported = self
            .activity
            .iter()
            .map(|entry| entry.value().clone())
            .min()?;
        let floor = min_reported.millis.saturating_sub(self.grace_ms);
        let age_bound = self.hlc.wall_millis().saturating_sub(self.gc_age_ms);
        Some(Timestamp::new(floor.min(age_bound), 0, ""))
    }

    /// Runs one full sweep over every materialized map.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = self.safe_cutoff();
        report.prune_ran = cutoff.is_some();

        for map_name in self.storage.map_names() {
            let Some(slot) = self.storage.existing(&map_name) else {
                continue;
            };

            // Phase 1: TTL expiry -> deterministic tombstones, replicated as
            // ordinary ops.
            let sweep = { slot.write().expire_overdue() };
            for (key, tombstone) in &sweep.lww_tombstones {
                report.expired += 1;
                let body = OpBody::Put { record: tombstone.clone() };
                let targets = self.partitions.replica_targets_for_key(key);
                self.replication.enqueue(&targets, &map_name, key, &body);
                self.after_expiry(&map_name, key, &tombstone.timestamp, &slot).await;
            }
            for (key, tag) in &sweep.or_tags {
                report.expired += 1;
                let body = OpBody::OrRemove { tag: tag.clone() };
                let targets = self.partitions.replica_targets_for_key(key);
                self.replication.enqueue(&targets, &map_name, key, &body);
                let timestamp = tag.parse::<Timestamp>().unwrap_or_else(|_| self.hlc.now());
                self.after_expiry(&map_name, key, &timestamp, &slot).await;
            }

            // Phase 2: prune under the safe cutoff.
            if let Some(cutoff) = &cutoff {
                let outcome = { slot.write().prune(cutoff) };
                report.pruned += outcome.total();
                for key in &outcome.lww_keys {
                    if let Err(err) = self.storage.persist_key(&map_name, key).await {
                        tracing::error!(map = %map_name, key, error = %err, "prune persist failed");
                    }
                }
                if !outcome.or_tags.is_empty() {
                    if let Err(err) = self.storage.persist_or_tombstones(&map_name).await {
                        tracing::error!(map = %map_name, error = %err, "sentinel persist failed");
                    }
                }
                self.storage.record_gc_watermark(&map_name, cutoff.clone());
            }
        }

        if report.expired > 0 || report.pruned > 0 {
            tracing::info!(
                expired = report.expired,
                pruned = report.pruned,
                "gc sweep completed"
            );
        }
        metrics::counter!("squall_gc_expired_total").increment(report.expired as u64);
        metrics::counter!("squall_gc_pruned_total").increment(report.pruned as u64);
        report
    }

    /// Runs the periodic sweep and GC-hint gossip until shutdown.
    pub async fn run(
        self: Arc<Self>,
        interval_ms: u64,
        cluster: Arc<crate::cluster::ClusterManager>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    cluster.broadcast(&PeerMessage::ClusterGcHint {
                        node_id: self.node_id.clone(),
                        last_active: self.local_hint(),
                    });
                    self.sweep().await;
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn after_expiry(
        &self,
        map_name: &str,
        key: &str,
        timestamp: &Timestamp,
        slot: &Arc<crate::storage::MapSlot>,
    ) {
        let live = { slot.read().live_value(key) };
        self.search.on_write(map_name, key, live.as_ref());
        let updates = self
            .registry
            .updates_for_write(map_name, key, live.as_ref(), &self.search);
        self.subs.route_updates(key, timestamp, updates);
        if let Err(err) = self.storage.persist_key(map_name, key).await {
            tracing::error!(map = %map_name, key, error = %err, "expiry persist failed");
        }
    }
}
