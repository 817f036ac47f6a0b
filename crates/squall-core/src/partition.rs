//! Partition math: key routing, the ownership map, and predicate pruning.
//!
//! The key space is divided into a fixed ring of 271 partitions (a prime, for
//! uniform modulo distribution). Ownership is derived deterministically from
//! the sorted member list — `owner = members[pid mod N]`, backups are the
//! next `min(R, N-1)` members — so every node computes the identical map from
//! the identical membership view without coordination.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::hash::fnv1a;
use crate::predicate::{Predicate, Query};
use crate::value::Value;

/// Number of partitions in the ring.
pub const PARTITION_COUNT: u32 = 271;

/// Maps a key to its partition id in `[0, PARTITION_COUNT)`.
#[must_use]
pub fn partition_for_key(key: &str) -> u32 {
    fnv1a(key) % PARTITION_COUNT
}

/// Owner and backups of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionReplicas {
    /// Node responsible for writes to this partition.
    pub owner: String,
    /// Nodes holding replicas, in deterministic order.
    pub backups: Vec<String>,
}

/// The versioned partition ownership map.
///
/// Either empty (no members yet) or fully populated with one entry per
/// partition id. The version increments on every membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMap {
    pub version: u64,
    /// Indexed by partition id; empty until the first member is known.
    pub replicas: Vec<PartitionReplicas>,
}

impl PartitionMap {
    /// An unpopulated map at version 0.
    #[must_use]
    pub fn empty() -> Self {
        Self { version: 0, replicas: Vec::new() }
    }

    /// Derives the map for a member list.
    ///
    /// Members are sorted internally, so callers may pass them in any order.
    /// With a single member there are no backups; otherwise each partition
    /// gets `min(backup_count, N-1)` backups following the owner in the
    /// sorted ring.
    #[must_use]
    pub fn compute(members: &[String], backup_count: u32, version: u64) -> Self {
        let mut sorted: Vec<&String> = members.iter().collect();
        sorted.sort();
        sorted.dedup();

        let n = sorted.len();
        if n == 0 {
            return Self { version, replicas: Vec::new() };
        }

        let per_partition_backups = (backup_count as usize).min(n - 1);
        let mut replicas = Vec::with_capacity(PARTITION_COUNT as usize);
        for pid in 0..PARTITION_COUNT as usize {
            let owner_idx = pid % n;
            let backups = (1..=per_partition_backups)
                .map(|i| sorted[(owner_idx + i) % n].clone())
                .collect();
            replicas.push(PartitionReplicas {
                owner: sorted[owner_idx].clone(),
                backups,
            });
        }
        Self { version, replicas }
    }

    /// Whether the map has been populated.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        !self.replicas.is_empty()
    }

    /// Replica set for a partition id, if assigned.
    #[must_use]
    pub fn replicas_for(&self, partition_id: u32) -> Option<&PartitionReplicas> {
        self.replicas.get(partition_id as usize)
    }

    /// Owner node of a partition id, if assigned.
    #[must_use]
    pub fn owner_of(&self, partition_id: u32) -> Option<&str> {
        self.replicas_for(partition_id).map(|r| r.owner.as_str())
    }

    /// Replica set for a key, if assigned.
    #[must_use]
    pub fn replicas_for_key(&self, key: &str) -> Option<&PartitionReplicas> {
        self.replicas_for(partition_for_key(key))
    }

    /// Whether `node_id` owns the partition holding `key`.
    #[must_use]
    pub fn is_owner(&self, node_id: &str, key: &str) -> bool {
        self.replicas_for_key(key)
            .is_some_and(|r| r.owner == node_id)
    }

    /// Deduplicated owner nodes for a set of partition ids, in first-seen order.
    #[must_use]
    pub fn owner_nodes_for_partitions(&self, partition_ids: &[u32]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut owners = Vec::new();
        for pid in partition_ids {
            if let Some(owner) = self.owner_of(*pid) {
                if seen.insert(owner.to_string()) {
                    owners.push(owner.to_string());
                }
            }
        }
        owners
    }

    /// Partition ids owned by `node_id`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn partitions_owned_by(&self, node_id: &str) -> Vec<u32> {
        self.replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| r.owner == node_id)
            .map(|(pid, _)| pid as u32)
            .collect()
    }

    /// Partition ids whose owner differs between `self` and `previous`.
    ///
    /// Feeds the migration hooks on rebalance: these are the partitions whose
    /// data has a new home.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn moved_since(&self, previous: &PartitionMap) -> Vec<u32> {
        self.replicas
            .iter()
            .enumerate()
            .filter(|(pid, r)| {
                previous
                    .replicas_for(*pid as u32)
                    .is_some_and(|old| old.owner != r.owner)
            })
            .map(|(pid, _)| pid as u32)
            .collect()
    }
}

impl Default for PartitionMap {
    fn default() -> Self {
        Self::empty()
    }
}

// ---------------------------------------------------------------------------
// Predicate pruning
// ---------------------------------------------------------------------------

/// Extracts the partitions a query can possibly touch, or `None` for all.
///
/// Pruning succeeds only when the filter pins the entry key: a key-field
/// equality or membership literal, possibly nested under `And`. Any `Or` or
/// `Not` disqualifies the whole query, as do non-key comparisons at the top
/// level. The result is deduplicated and sorted.
#[must_use]
pub fn relevant_partitions(query: &Query) -> Option<Vec<u32>> {
    let predicate = query.predicate.as_ref()?;
    let keys = key_literals(predicate)?;
    let mut pids: Vec<u32> = keys.iter().map(|k| partition_for_key(k)).collect();
    pids.sort_unstable();
    pids.dedup();
    Some(pids)
}

/// Collects key literals that bound a predicate, or `None` when unbounded.
fn key_literals(predicate: &Predicate) -> Option<Vec<String>> {
    match predicate {
        Predicate::Eq { field, value } if Predicate::is_key_field(field) => {
            literal_key(value).map(|k| vec![k])
        }
        Predicate::In { field, values } if Predicate::is_key_field(field) => {
            let keys: Vec<String> = values.iter().filter_map(literal_key).collect();
            (!keys.is_empty()).then_some(keys)
        }
        Predicate::And { all } => {
            // Any key-bounded child bounds the conjunction; the union over
            // bounded children is a superset of the true match set.
            let mut keys = Vec::new();
            for child in all {
                if let Some(child_keys) = key_literals(child) {
                    keys.extend(child_keys);
                }
            }
            (!keys.is_empty()).then_some(keys)
        }
        _ => None,
    }
}

/// A key literal from a predicate value: strings directly, integers via
/// their decimal form.
fn literal_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}
