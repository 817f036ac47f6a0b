//! In-memory storage engine.
//!
//! The reference [`MapStore`]: a two-level concurrent map with no I/O. Used
//! by default, in every test, and as the model for real backends.

use async_trait::async_trait;
use dashmap::DashMap;

use super::store::{MapStore, StorageValue, StoreError};

/// Volatile storage over nested `DashMap`s.
#[derive(Default)]
pub struct MemoryStore {
    maps: DashMap<String, DashMap<String, StorageValue>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries across all namespaces, sentinels included.
    #[must_use]
    pub fn total_entries(&self) -> usize {
        self.maps.iter().map(|ns| ns.len()).sum()
    }
}

#[async_trait]
impl MapStore for MemoryStore {
    async fn load(&self, map_name: &str, key: &str) -> Result<Option<StorageValue>, StoreError> {
        Ok(self
            .maps
            .get(map_name)
            .and_then(|ns| ns.get(key).map(|entry| entry.clone())))
    }

    async fn load_all(
        &self,
        map_name: &str,
        keys: &[String],
    ) -> Result<Vec<(String, StorageValue)>, StoreError> {
        let Some(ns) = self.maps.get(map_name) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| ns.get(key).map(|entry| (key.clone(), entry.clone())))
            .collect())
    }

    async fn load_all_keys(&self, map_name: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .maps
            .get(map_name)
            .map(|ns| ns.iter().map(|entry| entry.key().clone()).collect())
            .unwrap_or_default())
    }

    async fn store(
        &self,
        map_name: &str,
        key: &str,
        value: StorageValue,
    ) -> Result<(), StoreError> {
        self.maps
            .entry(map_name.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, map_name: &str, key: &str) -> Result<(), StoreError> {
        if let Some(ns) = self.maps.get(map_name) {
            ns.remove(key);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
