//! Record types shared by the CRDT maps.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::hash::fnv1a;

/// A Last-Writer-Wins record: a value (or tombstone) under a causal timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(serialize = "V: Serialize", deserialize = "V: DeserializeOwned"))]
pub struct LwwRecord<V> {
    /// The stored value; `None` marks a tombstone.
    pub value: Option<V>,
    /// Timestamp assigned by the writer's HLC.
    pub timestamp: Timestamp,
    /// Optional time-to-live in milliseconds, measured from `timestamp.millis`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl_ms: Option<u64>,
}

impl<V> LwwRecord<V> {
    /// A live record carrying `value`.
    #[must_use]
    pub fn live(value: V, timestamp: Timestamp, ttl_ms: Option<u64>) -> Self {
        Self { value: Some(value), timestamp, ttl_ms }
    }

    /// A tombstone at `timestamp`.
    #[must_use]
    pub fn tombstone(timestamp: Timestamp) -> Self {
        Self { value: None, timestamp, ttl_ms: None }
    }

    /// Whether this record is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// The wall-clock millisecond at which the TTL elapses, if any.
    #[must_use]
    pub fn expires_at(&self) -> Option<u64> {
        self.ttl_ms.map(|ttl| self.timestamp.millis.saturating_add(ttl))
    }

    /// Whether the TTL has elapsed at wall time `now_millis`.
    ///
    /// The expiry instant itself is still live; expiry takes effect strictly
    /// after `timestamp.millis + ttl_ms`.
    #[must_use]
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at().is_some_and(|at| at < now_millis)
    }

    /// Hash folded into the Merkle tree for this record under `key`.
    ///
    /// Depends only on the key and timestamp: a record's timestamp uniquely
    /// identifies the write, so replicas agree on the hash without hashing
    /// the payload.
    #[must_use]
    pub fn merkle_hash(&self, key: &str) -> u32 {
        fnv1a(&format!("{key}@{}", self.timestamp))
    }
}

/// An Observed-Remove record: one tagged addition of a value under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(serialize = "V: Serialize", deserialize = "V: DeserializeOwned"))]
pub struct OrRecord<V> {
    /// The stored value.
    pub value: V,
    /// Timestamp assigned by the writer's HLC.
    pub timestamp: Timestamp,
    /// Globally unique tag for this addition, the timestamp's display form.
    pub tag: String,
    /// Optional time-to-live in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl_ms: Option<u64>,
}

impl<V> OrRecord<V> {
    /// Whether the TTL has elapsed at wall time `now_millis`.
    #[must_use]
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.ttl_ms
            .is_some_and(|ttl| self.timestamp.millis.saturating_add(ttl) < now_millis)
    }
}

/// Counts reported by a bulk CRDT merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Records that did not exist locally before the merge.
    pub added: usize,
    /// Records replaced by a newer remote version.
    pub updated: usize,
}

impl MergeStats {
    /// Whether the merge changed any local state.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.added > 0 || self.updated > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn ts(millis: u64) -> Timestamp {
        Timestamp::new(millis, 0, "n1")
    }

    #[test]
    fn tombstone_has_no_value_or_ttl() {
        let record: LwwRecord<Value> = LwwRecord::tombstone(ts(5));
        assert!(record.is_tombstone());
        assert_eq!(record.expires_at(), None);
    }

    #[test]
    fn expiry_is_strictly_after_the_boundary() {
        let record = LwwRecord::live(Value::Int(1), ts(1_000), Some(500));
        assert_eq!(record.expires_at(), Some(1_500));
        assert!(!record.is_expired(1_500));
        assert!(record.is_expired(1_501));
    }

    #[test]
    fn no_ttl_never_expires() {
        let record = LwwRecord::live(Value::Int(1), ts(1_000), None);
        assert!(!record.is_expired(u64::MAX));
    }

    #[test]
    fn merkle_hash_ignores_payload_but_not_timestamp() {
        let a = LwwRecord::live(Value::Int(1), ts(9), None);
        let b = LwwRecord::live(Value::Int(2), ts(9), None);
        let c = LwwRecord::live(Value::Int(1), ts(10), None);
        assert_eq!(a.merkle_hash("k"), b.merkle_hash("k"));
        assert_ne!(a.merkle_hash("k"), c.merkle_hash("k"));
        assert_ne!(a.merkle_hash("k"), a.merkle_hash("other"));
    }

    #[test]
    fn records_roundtrip_msgpack() {
        let lww = LwwRecord::live(Value::from("v"), ts(7), Some(100));
        let bytes = rmp_serde::to_vec_named(&lww).unwrap();
        let back: LwwRecord<Value> = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(lww, back);

        let or = OrRecord {
            value: Value::from("x"),
            timestamp: ts(8),
            tag: ts(8).to_string(),
            ttl_ms: None,
        };
        let bytes = rmp_serde::to_vec_named(&or).unwrap();
        let back: OrRecord<Value> = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(or, back);
    }

    #[test]
    fn merge_stats_changed() {
        assert!(!MergeStats::default().changed());
        assert!(MergeStats { added: 1, updated: 0 }.changed());
    }
}
