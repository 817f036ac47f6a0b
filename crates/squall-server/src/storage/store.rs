//! The persistence contract.
//!
//! The engine is deliberately storage-agnostic: it calls exactly these six
//! operations against a key-addressable store of [`StorageValue`]s, one
//! namespace per map. Real backends live outside the core; the in-memory
//! engine in [`super::memory`] is the reference implementation and the test
//! double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use squall_core::record::{LwwRecord, OrRecord};
use squall_core::Value;

/// Reserved key holding a map's OR tombstone tags.
pub const TOMBSTONES_KEY: &str = "__tombstones__";

/// One persisted entry.
///
/// The variant tags double as the map-type record: a namespace containing
/// `Or` values or an `OrTombstones` sentinel is an OR map, anything else is
/// LWW. Type inference on load never needs a separate metadata entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageValue {
    Lww { record: LwwRecord<Value> },
    Or { records: Vec<OrRecord<Value>> },
    OrTombstones { tags: Vec<String> },
}

/// Errors surfaced by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt entry for {map_name}/{key}: {detail}")]
    Corrupt { map_name: String, key: String, detail: String },
}

/// Key-addressable persistence for CRDT maps.
///
/// All methods take `&self`; implementations are internally synchronized and
/// shared as `Arc<dyn MapStore>`.
#[async_trait]
pub trait MapStore: Send + Sync {
    /// Loads one entry, or `None` when absent.
    async fn load(&self, map_name: &str, key: &str) -> Result<Option<StorageValue>, StoreError>;

    /// Loads many entries; absent keys are omitted from the result.
    async fn load_all(
        &self,
        map_name: &str,
        keys: &[String],
    ) -> Result<Vec<(String, StorageValue)>, StoreError>;

    /// Lists every key in a map's namespace, sentinels included.
    async fn load_all_keys(&self, map_name: &str) -> Result<Vec<String>, StoreError>;

    /// Inserts or replaces one entry.
    async fn store(
        &self,
        map_name: &str,
        key: &str,
        value: StorageValue,
    ) -> Result<(), StoreError>;

    /// Deletes one entry; absent keys are a no-op.
    async fn delete(&self, map_name: &str, key: &str) -> Result<(), StoreError>;

    /// Flushes and releases backend resources.
    async fn close(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use squall_core::Timestamp;

    use super::*;

    #[test]
    fn storage_value_roundtrips_msgpack() {
        let values = vec![
            StorageValue::Lww {
                record: LwwRecord::live(Value::Int(1), Timestamp::new(1, 0, "n"), None),
            },
            StorageValue::Or {
                records: vec![OrRecord {
                    value: Value::from("x"),
                    timestamp: Timestamp::new(2, 0, "n"),
                    tag: "2:0:n".into(),
                    ttl_ms: Some(50),
                }],
            },
            StorageValue::OrTombstones { tags: vec!["1:0:n".into()] },
        ];
        for value in values {
            let bytes = rmp_serde::to_vec_named(&value).unwrap();
            let back: StorageValue = rmp_serde::from_slice(&bytes).unwrap();
            assert_eq!(value, back);
        }
    }
}
