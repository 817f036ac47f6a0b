//! Observed-Remove map.
//!
//! Each key holds a set of tagged value additions. A removal tombstones the
//! tags it has *observed*; an addition made concurrently on another node
//! carries a different tag and survives the merge. This is the classic
//! OR-Set add-wins construction lifted to a multimap.
//!
//! A tag is the display form of the addition's HLC timestamp, which makes it
//! globally unique and lets tombstone pruning order tags by age without any
//! side table.

use std::collections::{HashMap, HashSet};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::{Hlc, Timestamp};
use crate::hash::fnv1a;
use crate::merkle::MerkleTree;
use crate::record::{MergeStats, OrRecord};

/// An Observed-Remove map from string keys to tagged multisets of `V`.
pub struct OrMap<V> {
    /// key -> tag -> record, live records only.
    items: HashMap<String, HashMap<String, OrRecord<V>>>,
    /// Tags whose additions have been removed.
    tombstones: HashSet<String>,
    hlc: Hlc,
    merkle: MerkleTree,
}

impl<V> OrMap<V>
where
    V: Clone + Serialize + DeserializeOwned + PartialEq,
{
    /// Creates an empty map stamping additions with `hlc`.
    #[must_use]
    pub fn new(hlc: Hlc) -> Self {
        Self {
            items: HashMap::new(),
            tombstones: HashSet::new(),
            hlc,
            merkle: MerkleTree::default_depth(),
        }
    }

    /// Adds `value` under `key` with a fresh unique tag; returns the record.
    pub fn add(&mut self, key: impl Into<String>, value: V, ttl_ms: Option<u64>) -> OrRecord<V> {
        let key = key.into();
        let timestamp = self.hlc.now();
        let record = OrRecord {
            value,
            tag: timestamp.to_string(),
            timestamp,
            ttl_ms,
        };
        self.items
            .entry(key.clone())
            .or_default()
            .insert(record.tag.clone(), record.clone());
        self.refresh_merkle(&key);
        record
    }

    /// Removes every observed addition of `value` under `key`.
    ///
    /// Returns the tags that were tombstoned. Additions this node has not yet
    /// seen keep their tags and survive, which is exactly the observed-remove
    /// guarantee.
    pub fn remove(&mut self, key: &str, value: &V) -> Vec<String> {
        let Some(entries) = self.items.get_mut(key) else {
            return Vec::new();
        };
        let removed: Vec<String> = entries
            .iter()
            .filter(|(_, record)| &record.value == value)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in &removed {
            entries.remove(tag);
            self.tombstones.insert(tag.clone());
        }
        if entries.is_empty() {
            self.items.remove(key);
        }
        self.refresh_merkle(key);
        removed
    }

    /// Live values under `key`, skipping tombstoned tags and expired records.
    #[must_use]
    pub fn get(&self, key: &str) -> Vec<&V> {
        self.live_records(key).map(|r| &r.value).collect()
    }

    /// Live records under `key`.
    #[must_use]
    pub fn get_records(&self, key: &str) -> Vec<&OrRecord<V>> {
        self.live_records(key).collect()
    }

    /// Applies a remote addition; returns `false` when its tag is tombstoned.
    ///
    /// The HLC observes the record's timestamp either way.
    pub fn apply(&mut self, key: impl Into<String>, record: OrRecord<V>) -> bool {
        let _ = self.hlc.observe(&record.timestamp);
        if self.tombstones.contains(&record.tag) {
            return false;
        }
        let key = key.into();
        self.items
            .entry(key.clone())
            .or_default()
            .insert(record.tag.clone(), record);
        self.refresh_merkle(&key);
        true
    }

    /// Applies a remote removal of one tag.
    ///
    /// The tag joins the tombstone set and its record, if present anywhere,
    /// is dropped. Tags are globally unique so at most one key is affected.
    pub fn apply_tombstone(&mut self, tag: &str) {
        self.tombstones.insert(tag.to_string());
        let holder = self
            .items
            .iter_mut()
            .find_map(|(key, entries)| entries.remove(tag).map(|_| key.clone()));
        if let Some(key) = holder {
            if self.items.get(&key).is_some_and(HashMap::is_empty) {
                self.items.remove(&key);
            }
            self.refresh_merkle(&key);
        }
    }

    /// Merges remote records and tombstones for one key.
    ///
    /// Tombstones apply first, then records: tombstoned tags are skipped, new
    /// tags are added, and known tags are replaced when the remote copy is
    /// newer. Causality is tracked for every remote timestamp.
    pub fn merge_key(
        &mut self,
        key: impl Into<String>,
        remote_records: Vec<OrRecord<V>>,
        remote_tombstones: &[String],
    ) -> MergeStats {
        let key = key.into();
        let mut stats = MergeStats::default();

        for tag in remote_tombstones {
            self.tombstones.insert(tag.clone());
        }

        let entries = self.items.entry(key.clone()).or_default();
        entries.retain(|tag, _| !self.tombstones.contains(tag));

        for remote in remote_records {
            let _ = self.hlc.observe(&remote.timestamp);
            if self.tombstones.contains(&remote.tag) {
                continue;
            }
            match entries.get(&remote.tag) {
                Some(local) if remote.timestamp <= local.timestamp => {}
                Some(_) => {
                    entries.insert(remote.tag.clone(), remote);
                    stats.updated += 1;
                }
                None => {
                    entries.insert(remote.tag.clone(), remote);
                    stats.added += 1;
                }
            }
        }

        if entries.is_empty() {
            self.items.remove(&key);
        }
        self.refresh_merkle(&key);
        stats
    }

    /// Tombstones every TTL-expired record; returns `(key, tag)` pairs.
    ///
    /// Tags encode the addition timestamp, so the resulting tombstones are
    /// identical on every replica that runs expiry.
    pub fn expire_overdue(&mut self) -> Vec<(String, String)> {
        let now = self.hlc.wall_millis();
        let mut expired: Vec<(String, String)> = Vec::new();
        for (key, entries) in &self.items {
            for (tag, record) in entries {
                if record.is_expired(now) {
                    expired.push((key.clone(), tag.clone()));
                }
            }
        }
        for (_, tag) in &expired {
            self.apply_tombstone(tag);
        }
        expired
    }

    /// Drops tombstones whose encoded timestamp is strictly older than
    /// `older_than`; returns the pruned tags.
    pub fn prune(&mut self, older_than: &Timestamp) -> Vec<String> {
        let doomed: Vec<String> = self
            .tombstones
            .iter()
            .filter(|tag| {
                tag.parse::<Timestamp>()
                    .map(|ts| ts < *older_than)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for tag in &doomed {
            self.tombstones.remove(tag);
        }
        doomed
    }

    /// Keys currently holding at least one live record.
    pub fn all_keys(&self) -> impl Iterator<Item = &String> {
        self.items.keys()
    }

    /// All tombstoned tags.
    pub fn tombstones(&self) -> impl Iterator<Item = &String> {
        self.tombstones.iter()
    }

    /// Whether `tag` has been tombstoned.
    #[must_use]
    pub fn is_tombstoned(&self, tag: &str) -> bool {
        self.tombstones.contains(tag)
    }

    /// Number of keys with live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no key holds a live record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
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

    fn live_records(&self, key: &str) -> impl Iterator<Item = &OrRecord<V>> {
        let now = self.hlc.wall_millis();
        self.items
            .get(key)
            .into_iter()
            .flat_map(|entries| entries.values())
            .filter(move |record| {
                !self.tombstones.contains(&record.tag) && !record.is_expired(now)
            })
    }

    /// Recomputes the Merkle entry for `key` from its current tag set.
    ///
    /// Tags are sorted before hashing so the entry hash is independent of
    /// map iteration order. A key without records leaves the tree.
    fn refresh_merkle(&mut self, key: &str) {
        match self.items.get(key) {
            Some(entries) if !entries.is_empty() => {
                let mut tags: Vec<&String> = entries.keys().collect();
                tags.sort();
                let mut input = String::with_capacity(key.len() + tags.len() * 24);
                input.push_str(key);
                for tag in tags {
                    input.push('|');
                    input.push_str(tag);
                }
                let hash = fnv1a(&input);
                self.merkle.update(key, hash);
            }
            _ => self.merkle.remove(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::sync::{atomic::AtomicU64, Arc};

    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::value::Value;

    fn make_map(node: &str, initial: u64) -> (OrMap<Value>, Arc<AtomicU64>) {
        let (clock, time) = ManualClock::new(initial);
        (OrMap::new(Hlc::new(node, clock)), time)
    }

    // ---- add / get / remove ----

    #[test]
    fn add_then_get() {
        let (mut map, _) = make_map("n1", 1_000_000);
        map.add("k", Value::from("x"), None);
        assert_eq!(map.get("k"), vec![&Value::from("x")]);
    }

    #[test]
    fn duplicate_adds_get_distinct_tags() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let first = map.add("k", Value::from("x"), None);
        let second = map.add("k", Value::from("x"), None);
        assert_ne!(first.tag, second.tag);
        assert_eq!(map.get("k").len(), 2);
    }

    #[test]
    fn remove_tombstones_all_matching_tags() {
        let (mut map, _) = make_map("n1", 1_000_000);
        map.add("k", Value::from("x"), None);
        map.add("k", Value::from("x"), None);
        map.add("k", Value::from("y"), None);

        let removed = map.remove("k", &Value::from("x"));
        assert_eq!(removed.len(), 2);
        assert_eq!(map.get("k"), vec![&Value::from("y")]);
        for tag in &removed {
            assert!(map.is_tombstoned(tag));
        }
    }

    #[test]
    fn remove_missing_value_is_a_noop() {
        let (mut map, _) = make_map("n1", 1_000_000);
        map.add("k", Value::from("x"), None);
        assert!(map.remove("k", &Value::from("nope")).is_empty());
        assert!(map.remove("other", &Value::from("x")).is_empty());
    }

    // ---- apply / apply_tombstone ----

    #[test]
    fn apply_rejects_tombstoned_tag() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let record = map.add("k", Value::from("x"), None);
        map.remove("k", &Value::from("x"));
        assert!(!map.apply("k", record));
        assert!(map.get("k").is_empty());
    }

    #[test]
    fn tombstone_then_late_add_stays_removed() {
        // The remove arrives before the add it observed: once the tag is
        // tombstoned the late-arriving add must not resurrect the value.
        let (mut a, _) = make_map("a", 1_000_000);
        let record = a.add("k", Value::from("x"), None);

        let (mut b, _) = make_map("b", 1_000_000);
        b.apply_tombstone(&record.tag);
        assert!(!b.apply("k", record));
        assert!(b.get("k").is_empty());
    }

    // ---- the OR-Map litmus test ----

    #[test]
    fn concurrent_add_survives_concurrent_remove() {
        // Node A adds X (tag tA), node B concurrently adds X (tag tB),
        // node A removes X having observed only tA. After full exchange
        // every replica keeps exactly B's addition.
        let (mut a, _) = make_map("node-a", 1_000_000);
        let (mut b, _) = make_map("node-b", 1_000_000);

        let add_a = a.add("k", Value::from("X"), None);
        let add_b = b.add("k", Value::from("X"), None);
        let removed = a.remove("k", &Value::from("X"));
        assert_eq!(removed, vec![add_a.tag.clone()]);

        // Exchange: B learns A's add and tombstone; A learns B's add.
        let stats = b.merge_key("k", vec![add_a.clone()], &removed);
        assert_eq!(stats.added, 0, "tombstoned add must not land");
        a.merge_key("k", vec![add_b.clone()], &[]);

        assert_eq!(a.get("k"), vec![&Value::from("X")]);
        assert_eq!(b.get("k"), vec![&Value::from("X")]);
        assert_eq!(a.get_records("k")[0].tag, add_b.tag);
        assert!(a.is_tombstoned(&add_a.tag));
        assert!(b.is_tombstoned(&add_a.tag));
        assert_eq!(a.merkle().root_hash(), b.merkle().root_hash());
    }

    #[test]
    fn merge_key_counts_added_and_updated() {
        let (mut a, _) = make_map("a", 1_000_000);
        let (mut b, _) = make_map("b", 2_000_000);

        let r1 = a.add("k", Value::from("x"), None);
        let mut newer = r1.clone();
        newer.timestamp = Timestamp::new(r1.timestamp.millis + 10, 0, "b");
        let r2 = b.add("k", Value::from("y"), None);

        let stats = a.merge_key("k", vec![newer, r2], &[]);
        assert_eq!(stats, MergeStats { added: 1, updated: 1 });
    }

    #[test]
    fn merge_key_is_idempotent() {
        let (mut a, _) = make_map("a", 1_000_000);
        let (mut b, _) = make_map("b", 1_000_000);
        let record = b.add("k", Value::from("x"), None);

        a.merge_key("k", vec![record.clone()], &[]);
        let root = a.merkle().root_hash();
        let stats = a.merge_key("k", vec![record], &[]);
        assert!(!stats.changed());
        assert_eq!(a.merkle().root_hash(), root);
    }

    // ---- TTL ----

    #[test]
    fn expired_records_are_hidden_then_tombstoned() {
        let (mut map, time) = make_map("n1", 1_000_000);
        let record = map.add("k", Value::from("x"), Some(200));
        time.store(1_000_300, AtomicOrdering::Relaxed);

        assert!(map.get("k").is_empty());
        let expired = map.expire_overdue();
        assert_eq!(expired, vec![("k".to_string(), record.tag.clone())]);
        assert!(map.is_tombstoned(&record.tag));
        assert!(map.expire_overdue().is_empty());
    }

    // ---- prune ----

    #[test]
    fn prune_drops_only_old_tombstones() {
        let (mut map, time) = make_map("n1", 1_000_000);
        map.add("k", Value::from("x"), None);
        let old_tags = map.remove("k", &Value::from("x"));

        time.store(2_000_000, AtomicOrdering::Relaxed);
        map.add("k", Value::from("y"), None);
        let new_tags = map.remove("k", &Value::from("y"));

        let cutoff = Timestamp::new(1_500_000, 0, "");
        let pruned = map.prune(&cutoff);
        assert_eq!(pruned, old_tags);
        assert!(!map.is_tombstoned(&old_tags[0]));
        assert!(map.is_tombstoned(&new_tags[0]));
    }

    #[test]
    fn prune_ignores_unparseable_tags() {
        let (mut map, _) = make_map("n1", 1_000_000);
        map.apply_tombstone("not-a-timestamp");
        let pruned = map.prune(&Timestamp::new(u64::MAX, 0, "z"));
        assert!(pruned.is_empty());
        assert!(map.is_tombstoned("not-a-timestamp"));
    }

    // ---- merkle ----

    #[test]
    fn merkle_entry_is_tag_order_independent() {
        let (mut a, _) = make_map("w", 1_000_000);
        let (mut b, _) = make_map("x", 1_000_000);
        let r1 = a.add("k", Value::from("one"), None);
        let r2 = a.add("k", Value::from("two"), None);

        b.merge_key("k", vec![r2, r1], &[]);
        assert_eq!(a.merkle().root_hash(), b.merkle().root_hash());
    }

    #[test]
    fn emptied_key_leaves_the_merkle_tree() {
        let (mut map, _) = make_map("n1", 1_000_000);
        map.add("k", Value::from("x"), None);
        assert_ne!(map.merkle().root_hash(), 0);
        map.remove("k", &Value::from("x"));
        assert_eq!(map.merkle().root_hash(), 0);
    }
}
