//! Last-Writer-Wins map.
//!
//! Concurrent writes to one key are resolved by keeping the record with the
//! greater [`Timestamp`]; the node id inside the timestamp breaks exact ties,
//! so resolution is total and every replica picks the same winner. Deletions
//! are tombstones that win merges like any other record and are pruned later
//! by garbage collection under the cluster-safe cutoff.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::{Hlc, Timestamp};
use crate::merkle::MerkleTree;
use crate::record::LwwRecord;

/// A Last-Writer-Wins map from string keys to records of `V`.
pub struct LwwMap<V> {
    data: HashMap<String, LwwRecord<V>>,
    hlc: Hlc,
    merkle: MerkleTree,
}

impl<V> LwwMap<V>
where
    V: Clone + Serialize + DeserializeOwned + PartialEq,
{
    /// Creates an empty map stamping mutations with `hlc`.
    #[must_use]
    pub fn new(hlc: Hlc) -> Self {
        Self {
            data: HashMap::new(),
            hlc,
            merkle: MerkleTree::default_depth(),
        }
    }

    /// Stores `value` under a fresh HLC timestamp; returns the stored record.
    pub fn set(&mut self, key: impl Into<String>, value: V, ttl_ms: Option<u64>) -> LwwRecord<V> {
        let key = key.into();
        let record = LwwRecord::live(value, self.hlc.now(), ttl_ms);
        self.track(&key, &record);
        self.data.insert(key, record.clone());
        record
    }

    /// Writes a tombstone under a fresh HLC timestamp; returns it.
    ///
    /// A tombstone is written even when the key was never present, so that a
    /// delete observed before the corresponding set still wins the merge.
    pub fn remove(&mut self, key: &str) -> LwwRecord<V> {
        let record = LwwRecord::tombstone(self.hlc.now());
        self.track(key, &record);
        self.data.insert(key.to_string(), record.clone());
        record
    }

    /// The live value for `key`: `None` for missing, tombstoned, or expired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&V> {
        let record = self.data.get(key)?;
        if record.is_expired(self.hlc.wall_millis()) {
            return None;
        }
        record.value.as_ref()
    }

    /// The raw record for `key`, tombstones and expired records included.
    #[must_use]
    pub fn get_record(&self, key: &str) -> Option<&LwwRecord<V>> {
        self.data.get(key)
    }

    /// Merges a remote record; returns `true` when local state changed.
    ///
    /// The HLC observes the remote timestamp regardless of the outcome so
    /// later local writes causally follow it. The remote record is accepted
    /// when no local record exists or its timestamp is strictly greater;
    /// merging an identical record is a no-op.
    pub fn merge(&mut self, key: impl Into<String>, remote: LwwRecord<V>) -> bool {
        let _ = self.hlc.observe(&remote.timestamp);

        let key = key.into();
        let accept = match self.data.get(&key) {
            None => true,
            Some(local) => remote.timestamp > local.timestamp,
        };
        if accept {
            self.track(&key, &remote);
            self.data.insert(key, remote);
        }
        accept
    }

    /// Converts TTL-expired live records into tombstones.
    ///
    /// Each produced tombstone is stamped at exactly the record's expiration
    /// instant, keeping the original counter and node id, so every replica
    /// running expiry derives byte-identical tombstones independently.
    /// Returns the `(key, tombstone)` pairs produced.
    pub fn expire_overdue(&mut self) -> Vec<(String, LwwRecord<V>)> {
        let now = self.hlc.wall_millis();
        let due: Vec<(String, Timestamp)> = self
            .data
            .iter()
            .filter(|(_, record)| !record.is_tombstone() && record.is_expired(now))
            .map(|(key, record)| {
                let at = record
                    .expires_at()
                    .expect("expired record always has a TTL");
                (
                    key.clone(),
                    Timestamp::new(at, record.timestamp.counter, record.timestamp.node_id.clone()),
                )
            })
            .collect();

        let mut produced = Vec::with_capacity(due.len());
        for (key, at) in due {
            let tombstone = LwwRecord::tombstone(at);
            self.track(&key, &tombstone);
            self.data.insert(key.clone(), tombstone.clone());
            produced.push((key, tombstone));
        }
        produced
    }

    /// Drops tombstones strictly older than `older_than`; returns their keys.
    ///
    /// Live records are never pruned regardless of age.
    pub fn prune(&mut self, older_than: &Timestamp) -> Vec<String> {
        let doomed: Vec<String> = self
            .data
            .iter()
            .filter(|(_, record)| record.is_tombstone() && record.timestamp < *older_than)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.data.remove(key);
            self.merkle.remove(key);
        }
        doomed
    }

    /// Iterates live entries, skipping tombstones and expired records.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &V)> {
        let now = self.hlc.wall_millis();
        self.data.iter().filter_map(move |(key, record)| {
            if record.is_expired(now) {
                return None;
            }
            record.value.as_ref().map(|value| (key, value))
        })
    }

    /// Iterates all raw records, tombstones included.
    pub fn records(&self) -> impl Iterator<Item = (&String, &LwwRecord<V>)> {
        self.data.iter()
    }

    /// All keys, tombstones included.
    pub fn all_keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    /// Entry count, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the map holds no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read access to the anti-entropy Merkle tree.
    #[must_use]
    pub fn merkle(&self) -> &MerkleTree {
        &self.merkle
    }

    /// The clock handle this map stamps with.
    #[must_use]
    pub fn hlc(&self) -> &Hlc {
        &self.hlc
    }

    fn track(&mut self, key: &str, record: &LwwRecord<V>) {
        self.merkle.update(key, record.merkle_hash(key));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::sync::{atomic::AtomicU64, Arc};

    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::value::Value;

    fn make_map(initial: u64) -> (LwwMap<Value>, Arc<AtomicU64>) {
        let (clock, time) = ManualClock::new(initial);
        (LwwMap::new(Hlc::new("test-node", clock)), time)
    }

    fn record_at(value: &str, millis: u64, node: &str) -> LwwRecord<Value> {
        LwwRecord::live(Value::from(value), Timestamp::new(millis, 0, node), None)
    }

    // ---- basic reads and writes ----

    #[test]
    fn set_then_get() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::from("v1"), None);
        assert_eq!(map.get("key1"), Some(&Value::from("v1")));
        assert_eq!(map.get("missing"), None);
    }

    #[test]
    fn set_overwrites_and_bumps_timestamp() {
        let (mut map, _) = make_map(1_000_000);
        let first = map.set("key1", Value::Int(1), None);
        let second = map.set("key1", Value::Int(2), None);
        assert!(second.timestamp > first.timestamp);
        assert_eq!(map.get("key1"), Some(&Value::Int(2)));
    }

    #[test]
    fn remove_leaves_a_readable_tombstone() {
        let (mut map, _) = make_map(1_000_000);
        map.set("key1", Value::Int(1), None);
        map.remove("key1");
        assert_eq!(map.get("key1"), None);
        assert!(map.get_record("key1").unwrap().is_tombstone());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_unknown_key_still_writes_tombstone() {
        let (mut map, _) = make_map(1_000_000);
        let tombstone = map.remove("phantom");
        assert!(tombstone.is_tombstone());
        assert_eq!(map.len(), 1);
    }

    // ---- TTL ----

    #[test]
    fn expired_records_read_as_absent() {
        let (mut map, time) = make_map(1_000_000);
        map.set("temp", Value::Int(1), Some(500));
        assert_eq!(map.get("temp"), Some(&Value::Int(1)));
        time.store(1_000_501, AtomicOrdering::Relaxed);
        assert_eq!(map.get("temp"), None);
        // The raw record is still there until GC runs.
        assert!(map.get_record("temp").is_some());
    }

    #[test]
    fn entries_skip_tombstones_and_expired() {
        let (mut map, time) = make_map(1_000_000);
        map.set("live", Value::Int(1), None);
        map.set("short", Value::Int(2), Some(100));
        map.set("gone", Value::Int(3), None);
        map.remove("gone");
        time.store(1_000_200, AtomicOrdering::Relaxed);

        let mut live: Vec<&String> = map.entries().map(|(k, _)| k).collect();
        live.sort();
        assert_eq!(live, vec!["live"]);
    }

    #[test]
    fn expire_overdue_produces_deterministic_tombstones() {
        let (mut map, time) = make_map(1_000_000);
        map.set("temp", Value::Int(1), Some(400));
        time.store(1_000_401, AtomicOrdering::Relaxed);

        let produced = map.expire_overdue();
        assert_eq!(produced.len(), 1);
        let (key, tombstone) = &produced[0];
        assert_eq!(key, "temp");
        assert!(tombstone.is_tombstone());
        // Stamped at exactly the expiration instant with the writer identity.
        assert_eq!(tombstone.timestamp.millis, 1_000_400);
        assert_eq!(tombstone.timestamp.node_id, "test-node");

        // Idempotent: a second sweep finds nothing.
        assert!(map.expire_overdue().is_empty());
    }

    #[test]
    fn expire_overdue_matches_across_replicas() {
        let (mut a, time_a) = make_map(1_000_000);
        let (clock_b, time_b) = ManualClock::new(1_000_000);
        let mut b: LwwMap<Value> = LwwMap::new(Hlc::new("node-b", clock_b));

        let record = a.set("temp", Value::Int(1), Some(300));
        b.merge("temp", record);

        time_a.store(2_000_000, AtomicOrdering::Relaxed);
        time_b.store(2_000_000, AtomicOrdering::Relaxed);
        let from_a = a.expire_overdue();
        let from_b = b.expire_overdue();
        assert_eq!(from_a[0].1.timestamp, from_b[0].1.timestamp);
        assert_eq!(a.merkle().root_hash(), b.merkle().root_hash());
    }

    // ---- merge ----

    #[test]
    fn newer_timestamp_wins_either_order() {
        let older = record_at("old", 100, "a");
        let newer = record_at("new", 200, "b");

        let (mut forward, _) = make_map(1_000_000);
        forward.merge("k", older.clone());
        forward.merge("k", newer.clone());

        let (mut reverse, _) = make_map(1_000_000);
        reverse.merge("k", newer);
        reverse.merge("k", older);

        assert_eq!(forward.get("k"), Some(&Value::from("new")));
        assert_eq!(forward.get("k"), reverse.get("k"));
    }

    #[test]
    fn node_id_breaks_exact_ties() {
        let a = record_at("from-a", 100, "node-a");
        let b = record_at("from-b", 100, "node-b");

        let (mut one, _) = make_map(1_000_000);
        one.merge("k", a.clone());
        one.merge("k", b.clone());
        let (mut two, _) = make_map(1_000_000);
        two.merge("k", b);
        two.merge("k", a);

        assert_eq!(one.get("k"), Some(&Value::from("from-b")));
        assert_eq!(one.get("k"), two.get("k"));
    }

    #[test]
    fn merge_is_idempotent() {
        let (mut map, _) = make_map(1_000_000);
        let record = record_at("v", 500, "peer");
        assert!(map.merge("k", record.clone()));
        let root = map.merkle().root_hash();
        assert!(!map.merge("k", record));
        assert_eq!(map.merkle().root_hash(), root);
    }

    #[test]
    fn merge_advances_local_clock() {
        let (mut map, _) = make_map(1_000_000);
        map.merge("k", record_at("v", 5_000_000, "peer"));
        let next = map.set("other", Value::Int(1), None);
        assert!(next.timestamp.millis >= 5_000_000);
    }

    // ---- prune ----

    #[test]
    fn prune_removes_only_old_tombstones() {
        let (mut map, _) = make_map(1_000_000);
        map.set("keep", Value::Int(1), None);
        map.set("dead", Value::Int(2), None);
        let tombstone = map.remove("dead");

        let before = Timestamp::new(tombstone.timestamp.millis, 0, "");
        assert!(map.prune(&before).is_empty(), "cutoff at tombstone age keeps it");

        let after = Timestamp::new(tombstone.timestamp.millis + 1, 0, "");
        assert_eq!(map.prune(&after), vec!["dead".to_string()]);
        assert!(map.get_record("dead").is_none());
        assert!(map.get_record("keep").is_some(), "live records survive any cutoff");
    }

    // ---- merkle integration ----

    #[test]
    fn merkle_tracks_set_remove_prune() {
        let (mut map, _) = make_map(1_000_000);
        assert_eq!(map.merkle().root_hash(), 0);
        map.set("k", Value::Int(1), None);
        let after_set = map.merkle().root_hash();
        assert_ne!(after_set, 0);

        let tombstone = map.remove("k");
        assert_ne!(map.merkle().root_hash(), after_set);

        let cutoff = Timestamp::new(tombstone.timestamp.millis + 1, 0, "");
        map.prune(&cutoff);
        assert_eq!(map.merkle().root_hash(), 0);
    }

    #[test]
    fn replicas_with_same_records_agree_on_root() {
        let (mut a, _) = make_map(1_000_000);
        let (mut b, _) = make_map(1_000_000);
        for i in 0..20 {
            let record = record_at("v", 100 + i, "writer");
            a.merge(format!("key-{i}"), record.clone());
            b.merge(format!("key-{i}"), record);
        }
        assert_eq!(a.merkle().root_hash(), b.merkle().root_hash());
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::value::Value;

    fn make_map() -> LwwMap<Value> {
        let (clock, _) = ManualClock::new(u64::MAX / 2);
        LwwMap::new(Hlc::new("prop-node", clock))
    }

    fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_u64..1_000_000_000, 0_u32..1_000, "[a-z]{1,6}")
            .prop_map(|(millis, counter, node_id)| Timestamp { millis, counter, node_id })
    }

    fn arb_record() -> impl Strategy<Value = LwwRecord<Value>> {
        (
            prop::option::of(any::<i64>().prop_map(Value::Int)),
            arb_timestamp(),
        )
            .prop_map(|(value, timestamp)| LwwRecord { value, timestamp, ttl_ms: None })
    }

    proptest! {
        /// Merging any two records in either order converges.
        #[test]
        fn merge_commutes(r1 in arb_record(), r2 in arb_record()) {
            let mut one = make_map();
            one.merge("k", r1.clone());
            one.merge("k", r2.clone());

            let mut two = make_map();
            two.merge("k", r2);
            two.merge("k", r1);

            prop_assert_eq!(one.get_record("k"), two.get_record("k"));
            prop_assert_eq!(one.merkle().root_hash(), two.merkle().root_hash());
        }

        /// Re-merging a record never changes state.
        #[test]
        fn merge_idempotent(r in arb_record()) {
            let mut map = make_map();
            map.merge("k", r.clone());
            let snapshot = map.get_record("k").cloned();
            let root = map.merkle().root_hash();
            prop_assert!(!map.merge("k", r));
            prop_assert_eq!(map.get_record("k").cloned(), snapshot);
            prop_assert_eq!(map.merkle().root_hash(), root);
        }

        /// The stored record is the supremum of everything merged.
        #[test]
        fn stored_record_is_supremum(records in prop::collection::vec(arb_record(), 1..8)) {
            let mut map = make_map();
            for record in &records {
                map.merge("k", record.clone());
            }
            let expected = records
                .iter()
                .max_by(|a, b| a.timestamp.cmp(&b.timestamp))
                .unwrap();
            prop_assert_eq!(map.get_record("k"), Some(expected));
        }

        /// Permutations of merges over several keys converge.
        #[test]
        fn multi_key_convergence(
            pairs in prop::collection::vec(("[a-d]", arb_record()), 1..10),
        ) {
            let mut forward = make_map();
            for (key, record) in &pairs {
                forward.merge(key.clone(), record.clone());
            }
            let mut reverse = make_map();
            for (key, record) in pairs.iter().rev() {
                reverse.merge(key.clone(), record.clone());
            }
            for (key, _) in &pairs {
                prop_assert_eq!(forward.get_record(key), reverse.get_record(key));
            }
            prop_assert_eq!(forward.merkle().root_hash(), reverse.merkle().root_hash());
        }
    }
}
