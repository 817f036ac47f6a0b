//! Partition service: the node-local view of partition ownership.
//!
//! Readers take a lock-free snapshot through `ArcSwap`; writers publish a
//! whole new map atomically. Rebalances are derived from the sorted member
//! list (see [`squall_core::partition`]) and announced with the set of moved
//! partitions so the storage layer can run its migration hooks.

use std::sync::Arc;

use arc_swap::ArcSwap;
use squall_core::partition::{relevant_partitions, PartitionMap};
use squall_core::Query;
use tokio::sync::broadcast;

/// Announcement of a published rebalance.
#[derive(Debug, Clone)]
pub struct RebalanceEvent {
    pub version: u64,
    /// Partitions whose owner changed.
    pub moved: Vec<u32>,
}

/// One partition hand-off computed from a rebalance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTask {
    pub partition_id: u32,
    pub source: String,
    pub destination: String,
    /// The destination already held a backup replica.
    pub backup_promotion: bool,
}

/// Orders migration tasks for availability: backup promotions first, then
/// partitions with the fewest replicas (most exposed to loss), then id.
pub fn order_migrations(tasks: &mut [MigrationTask], previous: &PartitionMap) {
    tasks.sort_by(|a, b| {
        b.backup_promotion
            .cmp(&a.backup_promotion)
            .then_with(|| {
                let replicas =
                    |pid| previous.replicas_for(pid).map_or(0, |r| 1 + r.backups.len());
                replicas(a.partition_id).cmp(&replicas(b.partition_id))
            })
            .then_with(|| a.partition_id.cmp(&b.partition_id))
    });
}

/// Computes the ordered hand-off plan between two published maps.
#[must_use]
pub fn plan_migrations(previous: &PartitionMap, next: &PartitionMap) -> Vec<MigrationTask> {
    let mut tasks: Vec<MigrationTask> = next
        .moved_since(previous)
        .into_iter()
        .filter_map(|pid| {
            let old = previous.replicas_for(pid)?;
            let new = next.replicas_for(pid)?;
            Some(MigrationTask {
                partition_id: pid,
                source: old.owner.clone(),
                destination: new.owner.clone(),
                backup_promotion: old.backups.contains(&new.owner),
            })
        })
        .collect();
    order_migrations(&mut tasks, previous);
    tasks
}

/// The node-local partition ownership service.
pub struct PartitionService {
    node_id: String,
    backup_count: u32,
    map: ArcSwap<PartitionMap>,
    events_tx: broadcast::Sender<RebalanceEvent>,
}

impl PartitionService {
    /// Creates a service with an unassigned map.
    #[must_use]
    pub fn new(node_id: impl Into<String>, backup_count: u32) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            node_id: node_id.into(),
            backup_count,
            map: ArcSwap::from_pointee(PartitionMap::empty()),
            events_tx,
        }
    }

    /// Lock-free snapshot of the current map.
    #[must_use]
    pub fn current(&self) -> Arc<PartitionMap> {
        self.map.load_full()
    }

    /// Subscribes to rebalance announcements.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RebalanceEvent> {
        self.events_tx.subscribe()
    }

    /// Recomputes ownership for a membership change and publishes it.
    ///
    /// Returns the ordered migration plan for partitions that moved.
    pub fn rebalance(&self, members: &[String]) -> Vec<MigrationTask> {
        let previous = self.current();
        let next = PartitionMap::compute(members, self.backup_count, previous.version + 1);
        let plan = plan_migrations(&previous, &next);
        let event = RebalanceEvent {
            version: next.version,
            moved: plan.iter().map(|t| t.partition_id).collect(),
        };
        tracing::info!(
            version = next.version,
            members = members.len(),
            moved = event.moved.len(),
            "partition map rebalanced"
        );
        self.map.store(Arc::new(next));
        metrics::counter!("squall_partition_rebalances_total").increment(1);
        let _ = self.events_tx.send(event);
        plan
    }

    /// Adopts a gossiped map when it is newer than the local one.
    pub fn adopt_remote(&self, remote: PartitionMap) -> bool {
        let previous = self.current();
        if remote.version <= previous.version {
            return false;
        }
        let moved = remote.moved_since(&previous);
        let version = remote.version;
        self.map.store(Arc::new(remote));
        let _ = self.events_tx.send(RebalanceEvent { version, moved });
        true
    }

    /// Owner node for `key`, if the map is assigned.
    #[must_use]
    pub fn owner_for_key(&self, key: &str) -> Option<String> {
        self.current()
            .replicas_for_key(key)
            .map(|r| r.owner.clone())
    }

    /// Whether this node owns the partition holding `key`.
    ///
    /// An unassigned map means a single-node bootstrap: the local node is
    /// the owner of everything it stores.
    #[must_use]
    pub fn is_local_owner(&self, key: &str) -> bool {
        let map = self.current();
        !map.is_assigned() || map.is_owner(&self.node_id, key)
    }

    /// Backup nodes for `key`, excluding this node.
    #[must_use]
    pub fn backups_for_key(&self, key: &str) -> Vec<String> {
        self.current()
            .replicas_for_key(key)
            .map(|r| {
                r.backups
                    .iter()
                    .filter(|id| *id != &self.node_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replica set (owner + backups) for `key`, excluding this node.
    #[must_use]
    pub fn replica_targets_for_key(&self, key: &str) -> Vec<String> {
        self.current()
            .replicas_for_key(key)
            .map(|r| {
                std::iter::once(&r.owner)
                    .chain(r.backups.iter())
                    .filter(|id| *id != &self.node_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes a query must be evaluated on: the owners of its relevant
    /// partitions, or every member when the query cannot be pruned.
    #[must_use]
    pub fn target_nodes_for_query(&self, query: &Query, all_members: &[String]) -> Vec<String> {
        let map = self.current();
        match relevant_partitions(query) {
            Some(pids) if map.is_assigned() => map.owner_nodes_for_partitions(&pids),
            _ => all_members.to_vec(),
        }
    }
}
