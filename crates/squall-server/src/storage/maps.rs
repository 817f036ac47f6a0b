//! The `CrdtMap` sum type: one handle over both map flavors.
//!
//! Server components never branch on map internals; they speak this shared
//! capability surface (apply, merge, prune, expire, snapshot, root hash).
//! A map's flavor is decided by its first write or by what storage reveals
//! on load; an empty provisional LWW map upgrades to OR when either source
//! turns out to be OR-shaped.

use squall_core::merkle::MerkleTree;
use squall_core::protocol::peer::MapKind;
use squall_core::protocol::{EventKind, OpBody};
use squall_core::record::{LwwRecord, OrRecord};
use squall_core::{Hlc, LwwMap, OrMap, Timestamp, Value};

use super::store::StorageValue;
use crate::error::GridError;

/// Caller's expectation of a map's flavor when first touching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKindHint {
    Lww,
    Or,
}

/// Result of applying one mutation to a map.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Whether local state changed (idempotent re-applies report `false`).
    pub changed: bool,
    /// Mutation class for `SERVER_EVENT` emission.
    pub event: EventKind,
    /// Live value for the key after the apply; `None` when nothing lives.
    pub live: Option<Value>,
    /// Timestamp associated with the mutation.
    pub timestamp: Timestamp,
}

/// Tombstone work produced by a TTL expiry sweep, ready for replication.
#[derive(Debug, Default)]
pub struct ExpirySweep {
    /// LWW tombstones stamped at exact expiration, as `(key, record)`.
    pub lww_tombstones: Vec<(String, LwwRecord<Value>)>,
    /// OR tags tombstoned by expiry, as `(key, tag)`.
    pub or_tags: Vec<(String, String)>,
}

/// What a tombstone prune removed.
#[derive(Debug, Default)]
pub struct PruneOutcome {
    /// LWW keys whose tombstones were dropped; their persisted entries go too.
    pub lww_keys: Vec<String>,
    /// OR tombstone tags dropped.
    pub or_tags: Vec<String>,
}

impl PruneOutcome {
    /// Total tombstones removed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.lww_keys.len() + self.or_tags.len()
    }
}

impl ExpirySweep {
    /// Whether the sweep produced any work.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lww_tombstones.is_empty() && self.or_tags.is_empty()
    }
}

/// A CRDT map of either flavor.
pub enum CrdtMap {
    Lww(LwwMap<Value>),
    Or(OrMap<Value>),
}

impl CrdtMap {
    /// Creates an empty map of the hinted flavor.
    #[must_use]
    pub fn new(hint: MapKindHint, hlc: Hlc) -> Self {
        match hint {
            MapKindHint::Lww => CrdtMap::Lww(LwwMap::new(hlc)),
            MapKindHint::Or => CrdtMap::Or(OrMap::new(hlc)),
        }
    }

    /// The map's wire flavor.
    #[must_use]
    pub fn kind(&self) -> MapKind {
        match self {
            CrdtMap::Lww(_) => MapKind::Lww,
            CrdtMap::Or(_) => MapKind::Or,
        }
    }

    /// Upgrades an empty provisional LWW map to OR.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Validation`] when the map already holds LWW data:
    /// a populated map's flavor is settled.
    pub fn upgrade_to_or(&mut self) -> Result<(), GridError> {
        match self {
            CrdtMap::Or(_) => Ok(()),
            CrdtMap::Lww(map) if map.is_empty() => {
                let hlc = map.hlc().clone();
                *self = CrdtMap::Or(OrMap::new(hlc));
                Ok(())
            }
            CrdtMap::Lww(_) => Err(GridError::Validation(
                "cannot apply OR operation to a populated LWW map".to_string(),
            )),
        }
    }

    /// Applies one mutation body under `key`.
    ///
    /// An OR mutation arriving at an empty LWW map upgrades it first; the
    /// reverse (LWW write to an OR map) is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Validation`] on a flavor mismatch that cannot be
    /// resolved by upgrading.
    pub fn apply_body(&mut self, key: &str, body: OpBody) -> Result<ApplyOutcome, GridError> {
        match body {
            OpBody::Put { record } => {
                let CrdtMap::Lww(map) = self else {
                    return Err(GridError::Validation(
                        "cannot apply LWW operation to an OR map".to_string(),
                    ));
                };
                let timestamp = record.timestamp.clone();
                let event = if record.is_tombstone() { EventKind::Delete } else { EventKind::Set };
                let changed = map.merge(key, record);
                Ok(ApplyOutcome {
                    changed,
                    event,
                    live: map.get(key).cloned(),
                    timestamp,
                })
            }
            OpBody::OrAdd { record } => {
                self.upgrade_to_or()?;
                let CrdtMap::Or(map) = self else { unreachable!() };
                let timestamp = record.timestamp.clone();
                let changed = map.apply(key, record);
                let live = {
                    let values: Vec<Value> = map.get(key).into_iter().cloned().collect();
                    (!values.is_empty()).then_some(Value::Array(values))
                };
                Ok(ApplyOutcome { changed, event: EventKind::OrAdd, live, timestamp })
            }
            OpBody::OrRemove { tag } => {
                self.upgrade_to_or()?;
                let CrdtMap::Or(map) = self else { unreachable!() };
                let changed = !map.is_tombstoned(&tag);
                let timestamp = tag
                    .parse::<Timestamp>()
                    .unwrap_or_else(|_| map.hlc().now());
                map.apply_tombstone(&tag);
                let live = {
                    let values: Vec<Value> = map.get(key).into_iter().cloned().collect();
                    (!values.is_empty()).then_some(Value::Array(values))
                };
                Ok(ApplyOutcome { changed, event: EventKind::OrRemove, live, timestamp })
            }
        }
    }

    /// The live value under `key` as seen by queries.
    ///
    /// LWW maps yield the record's value; OR maps yield the array of live
    /// values, or `None` when no value lives.
    #[must_use]
    pub fn live_value(&self, key: &str) -> Option<Value> {
        match self {
            CrdtMap::Lww(map) => map.get(key).cloned(),
            CrdtMap::Or(map) => {
                let values: Vec<Value> = map.get(key).into_iter().cloned().collect();
                (!values.is_empty()).then_some(Value::Array(values))
            }
        }
    }

    /// The LWW record under `key`, for `SERVER_EVENT` payloads.
    #[must_use]
    pub fn lww_record(&self, key: &str) -> Option<LwwRecord<Value>> {
        match self {
            CrdtMap::Lww(map) => map.get_record(key).cloned(),
            CrdtMap::Or(_) => None,
        }
    }

    /// Snapshot of all live entries as query-visible `(key, value)` pairs.
    #[must_use]
    pub fn snapshot_entries(&self) -> Vec<(String, Value)> {
        match self {
            CrdtMap::Lww(map) => map
                .entries()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            CrdtMap::Or(map) => {
                let keys: Vec<String> = map.all_keys().cloned().collect();
                keys.into_iter()
                    .filter_map(|key| self.live_value(&key).map(|value| (key, value)))
                    .collect()
            }
        }
    }

    /// Timestamp of the record currently winning under `key`, for update
    /// deduplication. OR maps report the max live record timestamp.
    #[must_use]
    pub fn timestamp_of(&self, key: &str) -> Option<Timestamp> {
        match self {
            CrdtMap::Lww(map) => map.get_record(key).map(|r| r.timestamp.clone()),
            CrdtMap::Or(map) => map
                .get_records(key)
                .into_iter()
                .map(|r| r.timestamp.clone())
                .max(),
        }
    }

    /// Anti-entropy root hash.
    #[must_use]
    pub fn root_hash(&self) -> u32 {
        self.merkle().root_hash()
    }

    /// The underlying Merkle tree.
    #[must_use]
    pub fn merkle(&self) -> &MerkleTree {
        match self {
            CrdtMap::Lww(map) => map.merkle(),
            CrdtMap::Or(map) => map.merkle(),
        }
    }

    /// Runs the TTL expiry phase; see [`ExpirySweep`].
    pub fn expire_overdue(&mut self) -> ExpirySweep {
        match self {
            CrdtMap::Lww(map) => ExpirySweep {
                lww_tombstones: map.expire_overdue(),
                or_tags: Vec::new(),
            },
            CrdtMap::Or(map) => ExpirySweep {
                lww_tombstones: Vec::new(),
                or_tags: map.expire_overdue(),
            },
        }
    }

    /// Prunes tombstones strictly older than the cutoff.
    pub fn prune(&mut self, older_than: &Timestamp) -> PruneOutcome {
        match self {
            CrdtMap::Lww(map) => PruneOutcome {
                lww_keys: map.prune(older_than),
                or_tags: Vec::new(),
            },
            CrdtMap::Or(map) => PruneOutcome {
                lww_keys: Vec::new(),
                or_tags: map.prune(older_than),
            },
        }
    }

    /// Entry count (LWW: records incl. tombstones; OR: keys with live records).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            CrdtMap::Lww(map) => map.len(),
            CrdtMap::Or(map) => map.len(),
        }
    }

    /// Whether the map holds nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            CrdtMap::Lww(map) => map.is_empty(),
            CrdtMap::Or(map) => map.is_empty() && map.tombstones().next().is_none(),
        }
    }

    /// The persisted form of `key`'s current state, or `None` to delete.
    #[must_use]
    pub fn storage_value_for(&self, key: &str) -> Option<StorageValue> {
        match self {
            CrdtMap::Lww(map) => map
                .get_record(key)
                .map(|record| StorageValue::Lww { record: record.clone() }),
            CrdtMap::Or(map) => {
                let records: Vec<OrRecord<Value>> =
                    map.get_records(key).into_iter().cloned().collect();
                (!records.is_empty()).then_some(StorageValue::Or { records })
            }
        }
    }

    /// The persisted tombstone sentinel for OR maps.
    #[must_use]
    pub fn tombstones_storage_value(&self) -> Option<StorageValue> {
        match self {
            CrdtMap::Lww(_) => None,
            CrdtMap::Or(map) => Some(StorageValue::OrTombstones {
                tags: map.tombstones().cloned().collect(),
            }),
        }
    }

    /// Merges one LWW record from a sync exchange.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Validation`] when the map is OR-flavored.
    pub fn merge_lww(
        &mut self,
        key: &str,
        record: LwwRecord<Value>,
    ) -> Result<bool, GridError> {
        match self {
            CrdtMap::Lww(map) => Ok(map.merge(key, record)),
            CrdtMap::Or(_) => Err(GridError::Validation(
                "LWW sync entry for an OR map".to_string(),
            )),
        }
    }

    /// Merges one key's OR records and tombstones from a sync exchange.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Validation`] when the map holds LWW data.
    pub fn merge_or_key(
        &mut self,
        key: &str,
        records: Vec<OrRecord<Value>>,
        tombstones: &[String],
    ) -> Result<squall_core::MergeStats, GridError> {
        self.upgrade_to_or()?;
        let CrdtMap::Or(map) = self else { unreachable!() };
        Ok(map.merge_key(key, records, tombstones))
    }

    /// Absorbs one loaded storage entry.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Validation`] when an OR-shaped entry cannot be
    /// absorbed because the map is already populated as LWW.
    pub fn absorb_storage(&mut self, key: &str, value: StorageValue) -> Result<(), GridError> {
        match value {
            StorageValue::Lww { record } => match self {
                CrdtMap::Lww(map) => {
                    map.merge(key, record);
                    Ok(())
                }
                CrdtMap::Or(_) => Err(GridError::Validation(format!(
                    "LWW entry {key} in OR map"
                ))),
            },
            StorageValue::Or { records } => {
                self.upgrade_to_or()?;
                let CrdtMap::Or(map) = self else { unreachable!() };
                map.merge_key(key, records, &[]);
                Ok(())
            }
            StorageValue::OrTombstones { tags } => {
                self.upgrade_to_or()?;
                let CrdtMap::Or(map) = self else { unreachable!() };
                for tag in tags {
                    map.apply_tombstone(&tag);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use squall_core::SystemClock;

    use super::*;

    fn hlc() -> Hlc {
        Hlc::new("test-node", Arc::new(SystemClock))
    }

    fn put_body(value: i64, millis: u64) -> OpBody {
        OpBody::Put {
            record: LwwRecord::live(Value::Int(value), Timestamp::new(millis, 0, "c"), None),
        }
    }

    #[test]
    fn lww_apply_reports_events_and_live_value() {
        let mut map = CrdtMap::new(MapKindHint::Lww, hlc());
        let outcome = map.apply_body("k", put_body(1, 100)).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.event, EventKind::Set);
        assert_eq!(outcome.live, Some(Value::Int(1)));

        let delete = OpBody::Put {
            record: LwwRecord::tombstone(Timestamp::new(200, 0, "c")),
        };
        let outcome = map.apply_body("k", delete).unwrap();
        assert_eq!(outcome.event, EventKind::Delete);
        assert_eq!(outcome.live, None);
    }

    #[test]
    fn stale_apply_reports_unchanged() {
        let mut map = CrdtMap::new(MapKindHint::Lww, hlc());
        map.apply_body("k", put_body(2, 200)).unwrap();
        let outcome = map.apply_body("k", put_body(1, 100)).unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.live, Some(Value::Int(2)));
    }

    #[test]
    fn or_ops_upgrade_an_empty_lww_map() {
        let mut map = CrdtMap::new(MapKindHint::Lww, hlc());
        let record = OrRecord {
            value: Value::from("x"),
            timestamp: Timestamp::new(1, 0, "c"),
            tag: "1:0:c".into(),
            ttl_ms: None,
        };
        let outcome = map.apply_body("k", OpBody::OrAdd { record }).unwrap();
        assert!(outcome.changed);
        assert_eq!(map.kind(), MapKind::Or);
        assert_eq!(outcome.live, Some(Value::Array(vec![Value::from("x")])));
    }

    #[test]
    fn or_ops_rejected_on_populated_lww_map() {
        let mut map = CrdtMap::new(MapKindHint::Lww, hlc());
        map.apply_body("k", put_body(1, 100)).unwrap();
        let record = OrRecord {
            value: Value::from("x"),
            timestamp: Timestamp::new(1, 0, "c"),
            tag: "1:0:c".into(),
            ttl_ms: None,
        };
        assert!(map.apply_body("k", OpBody::OrAdd { record }).is_err());
    }

    #[test]
    fn lww_put_rejected_on_or_map() {
        let mut map = CrdtMap::new(MapKindHint::Or, hlc());
        assert!(map.apply_body("k", put_body(1, 100)).is_err());
    }

    #[test]
    fn or_remove_is_idempotent_in_outcome() {
        let mut map = CrdtMap::new(MapKindHint::Or, hlc());
        let record = OrRecord {
            value: Value::from("x"),
            timestamp: Timestamp::new(1, 0, "c"),
            tag: "1:0:c".into(),
            ttl_ms: None,
        };
        map.apply_body("k", OpBody::OrAdd { record }).unwrap();
        let first = map
            .apply_body("k", OpBody::OrRemove { tag: "1:0:c".into() })
            .unwrap();
        assert!(first.changed);
        assert_eq!(first.live, None);
        let second = map
            .apply_body("k", OpBody::OrRemove { tag: "1:0:c".into() })
            .unwrap();
        assert!(!second.changed);
    }

    #[test]
    fn snapshot_entries_cover_both_flavors() {
        let mut lww = CrdtMap::new(MapKindHint::Lww, hlc());
        lww.apply_body("a", put_body(1, 100)).unwrap();
        lww.apply_body("b", put_body(2, 100)).unwrap();
        assert_eq!(lww.snapshot_entries().len(), 2);

        let mut or = CrdtMap::new(MapKindHint::Or, hlc());
        let record = OrRecord {
            value: Value::from("x"),
            timestamp: Timestamp::new(1, 0, "c"),
            tag: "1:0:c".into(),
            ttl_ms: None,
        };
        or.apply_body("k", OpBody::OrAdd { record }).unwrap();
        let snapshot = or.snapshot_entries();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].1, Value::Array(vec![Value::from("x")]));
    }

    #[test]
    fn storage_roundtrip_preserves_flavor() {
        let mut or = CrdtMap::new(MapKindHint::Or, hlc());
        let record = OrRecord {
            value: Value::from("x"),
            timestamp: Timestamp::new(1, 0, "c"),
            tag: "1:0:c".into(),
            ttl_ms: None,
        };
        or.apply_body("k", OpBody::OrAdd { record }).unwrap();
        or.apply_body("k", OpBody::OrRemove { tag: "1:0:c".into() })
            .unwrap();

        let entry = or.storage_value_for("k");
        assert!(entry.is_none(), "fully removed key persists as a delete");
        let tombstones = or.tombstones_storage_value().unwrap();

        // A fresh provisional LWW map rebuilt from storage becomes OR again.
        let mut rebuilt = CrdtMap::new(MapKindHint::Lww, hlc());
        rebuilt.absorb_storage("__tombstones__", tombstones).unwrap();
        assert_eq!(rebuilt.kind(), MapKind::Or);
        let CrdtMap::Or(map) = &rebuilt else { panic!() };
        assert!(map.is_tombstoned("1:0:c"));
    }

    #[test]
    fn expiry_sweep_splits_by_flavor() {
        let mut lww = CrdtMap::new(MapKindHint::Lww, hlc());
        let sweep = lww.expire_overdue();
        assert!(sweep.is_empty());
    }
}
