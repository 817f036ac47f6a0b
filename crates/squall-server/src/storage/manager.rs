//! The storage manager: owner of all in-memory CRDT maps.
//!
//! Maps are created on first touch and lazily hydrated from the backing
//! store. `get_map` returns immediately — possibly with an empty map still
//! loading — while `get_map_async` awaits hydration. Load completion is
//! announced on a channel so the query registry can re-evaluate
//! subscriptions that raced the load.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use squall_core::{Hlc, Timestamp};
use tokio::sync::{mpsc, watch};

use super::maps::{CrdtMap, MapKindHint};
use super::store::{MapStore, StoreError, TOMBSTONES_KEY};

/// Announcement that a map finished hydrating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapLoaded {
    pub map_name: String,
    /// Entries absorbed from storage.
    pub entries: usize,
}

/// One map and its hydration state.
pub struct MapSlot {
    map: RwLock<CrdtMap>,
    loaded: watch::Receiver<bool>,
}

impl MapSlot {
    /// Read access to the map.
    pub fn read(&self) -> RwLockReadGuard<'_, CrdtMap> {
        self.map.read()
    }

    /// Write access to the map.
    pub fn write(&self) -> RwLockWriteGuard<'_, CrdtMap> {
        self.map.write()
    }

    /// Whether hydration has completed.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Waits until hydration has completed.
    pub async fn wait_loaded(&self) {
        let mut rx = self.loaded.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Owns every in-memory map on this node.
pub struct StorageManager {
    hlc: Hlc,
    store: Arc<dyn MapStore>,
    maps: DashMap<String, Arc<MapSlot>>,
    loads_tx: mpsc::UnboundedSender<MapLoaded>,
    loads_rx: Mutex<Option<mpsc::UnboundedReceiver<MapLoaded>>>,
    /// Per-map cutoff used at the last tombstone prune; gates zombie clients.
    gc_watermarks: DashMap<String, Timestamp>,
}

impl StorageManager {
    /// Creates a manager over the given store.
    #[must_use]
    pub fn new(hlc: Hlc, store: Arc<dyn MapStore>) -> Self {
        let (loads_tx, loads_rx) = mpsc::unbounded_channel();
        Self {
            hlc,
            store,
            maps: DashMap::new(),
            loads_tx,
            loads_rx: Mutex::new(Some(loads_rx)),
            gc_watermarks: DashMap::new(),
        }
    }

    /// The node id of the clock this manager stamps with.
    #[must_use]
    pub fn node_id(&self) -> &str {
        self.hlc.node_id()
    }

    /// Wall time as seen by the grid's clock source.
    #[must_use]
    pub fn wall_millis(&self) -> u64 {
        self.hlc.wall_millis()
    }

    /// Takes the load-completion receiver; the query registry consumes it.
    ///
    /// Returns `None` after the first call.
    pub fn take_load_events(&self) -> Option<mpsc::UnboundedReceiver<MapLoaded>> {
        self.loads_rx.lock().take()
    }

    /// Returns the map slot, creating and hydrating it on first touch.
    ///
    /// The returned slot is usable immediately; reads may observe an empty
    /// map until hydration completes.
    pub fn get_map(&self, map_name: &str, hint: MapKindHint) -> Arc<MapSlot> {
        if let Some(slot) = self.maps.get(map_name) {
            return slot.clone();
        }

        let (loaded_tx, loaded_rx) = watch::channel(false);
        let slot = Arc::new(MapSlot {
            map: RwLock::new(CrdtMap::new(hint, self.hlc.clone())),
            loaded: loaded_rx,
        });

        match self.maps.entry(map_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(slot.clone());
                let store = Arc::clone(&self.store);
                let loads_tx = self.loads_tx.clone();
                let name = map_name.to_string();
                let task_slot = slot.clone();
                tokio::spawn(async move {
                    let entries = hydrate(&store, &name, &task_slot).await;
                    let _ = loaded_tx.send(true);
                    let _ = loads_tx.send(MapLoaded { map_name: name, entries });
                });
                metrics::gauge!("squall_maps_materialized").set(self.maps.len() as f64);
                slot
            }
        }
    }

    /// Returns the map slot once hydration has completed.
    pub async fn get_map_async(&self, map_name: &str, hint: MapKindHint) -> Arc<MapSlot> {
        let slot = self.get_map(map_name, hint);
        slot.wait_loaded().await;
        slot
    }

    /// The slot for a map that has already been touched.
    #[must_use]
    pub fn existing(&self, map_name: &str) -> Option<Arc<MapSlot>> {
        self.maps.get(map_name).map(|slot| slot.clone())
    }

    /// Names of every map this node has materialized.
    #[must_use]
    pub fn map_names(&self) -> Vec<String> {
        self.maps.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Persists the current state of one key, deleting on full removal.
    ///
    /// OR maps also rewrite their tombstone sentinel so a restart observes
    /// removals made since the last write.
    ///
    /// # Errors
    ///
    /// Propagates backend failures; callers treat them as fatal for
    /// durability but the in-memory apply has already happened.
    pub async fn persist_key(&self, map_name: &str, key: &str) -> Result<(), StoreError> {
        let Some(slot) = self.existing(map_name) else {
            return Ok(());
        };
        let (entry, sentinel) = {
            let map = slot.read();
            (map.storage_value_for(key), map.tombstones_storage_value())
        };
        match entry {
            Some(value) => self.store.store(map_name, key, value).await?,
            None => self.store.delete(map_name, key).await?,
        }
        if let Some(sentinel) = sentinel {
            self.store.store(map_name, TOMBSTONES_KEY, sentinel).await?;
        }
        Ok(())
    }

    /// Rewrites the OR tombstone sentinel for `map_name` after a prune.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn persist_or_tombstones(&self, map_name: &str) -> Result<(), StoreError> {
        let Some(slot) = self.existing(map_name) else {
            return Ok(());
        };
        let sentinel = slot.read().tombstones_storage_value();
        if let Some(sentinel) = sentinel {
            self.store.store(map_name, TOMBSTONES_KEY, sentinel).await?;
        }
        Ok(())
    }

    /// Records the cutoff used by a completed prune of `map_name`.
    pub fn record_gc_watermark(&self, map_name: &str, cutoff: Timestamp) {
        self.gc_watermarks.insert(map_name.to_string(), cutoff);
    }

    /// The last prune cutoff for `map_name`, if any prune has run.
    #[must_use]
    pub fn gc_watermark(&self, map_name: &str) -> Option<Timestamp> {
        self.gc_watermarks.get(map_name).map(|ts| ts.clone())
    }

    /// Whether a client syncing from `last_sync` must reset `map_name`.
    ///
    /// True when tombstones the client never saw may already be pruned —
    /// that is, when `last_sync` predates the map's GC watermark.
    #[must_use]
    pub fn needs_sync_reset(&self, map_name: &str, last_sync: &Timestamp) -> bool {
        self.gc_watermark(map_name)
            .is_some_and(|watermark| *last_sync < watermark)
    }

    /// Flushes and closes the backing store.
    ///
    /// # Errors
    ///
    /// Propagates the backend's close failure.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.store.close().await
    }

}

/// Loads a map's namespace from the store into its slot.
async fn hydrate(store: &Arc<dyn MapStore>, map_name: &str, slot: &MapSlot) -> usize {
    let keys = match store.load_all_keys(map_name).await {
        Ok(keys) => keys,
        Err(err) => {
            tracing::warn!(map = map_name, error = %err, "map hydration failed");
            return 0;
        }
    };
    if keys.is_empty() {
        return 0;
    }
    let entries = match store.load_all(map_name, &keys).await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(map = map_name, error = %err, "map hydration failed");
            return 0;
        }
    };

    let mut absorbed = 0_usize;
    {
        let mut map = slot.write();
        // Sentinels first, so the map settles its flavor before records land.
        for (key, value) in entries
            .iter()
            .filter(|(key, _)| key == TOMBSTONES_KEY)
            .chain(entries.iter().filter(|(key, _)| key != TOMBSTONES_KEY))
        {
            match map.absorb_storage(key, value.clone()) {
                Ok(()) => absorbed += 1,
                Err(err) => {
                    tracing::warn!(map = map_name, key, error = %err, "skipping corrupt entry");
                }
            }
        }
    }
    tracing::debug!(map = map_name, entries = absorbed, "map hydrated");
    absorbed
}

#[cfg(test)]
mod tests {
    use squall_core::protocol::OpBody;
    use squall_core::record::LwwRecord;
    use squall_core::{SystemClock, Value};

    use super::super::memory::MemoryStore;
    use super::super::store::StorageValue;
    use super::*;

    fn manager_with_store(store: Arc<MemoryStore>) -> Arc<StorageManager> {
        let hlc = Hlc::new("node-1", Arc::new(SystemClock));
        Arc::new(StorageManager::new(hlc, store))
    }

    fn lww_put(value: i64, millis: u64) -> OpBody {
        OpBody::Put {
            record: LwwRecord::live(Value::Int(value), Timestamp::new(millis, 0, "c"), None),
        }
    }

    #[tokio::test]
    async fn get_map_creates_and_reports_load() {
        let manager = manager_with_store(Arc::new(MemoryStore::new()));
        let mut loads = manager.take_load_events().unwrap();
        assert!(manager.take_load_events().is_none());

        let slot = manager.get_map_async("users", MapKindHint::Lww).await;
        assert!(slot.is_loaded());
        assert_eq!(slot.read().len(), 0);

        let event = loads.recv().await.unwrap();
        assert_eq!(event.map_name, "users");
        assert_eq!(event.entries, 0);
    }

    #[tokio::test]
    async fn get_map_returns_same_slot() {
        let manager = manager_with_store(Arc::new(MemoryStore::new()));
        let a = manager.get_map("users", MapKindHint::Lww);
        let b = manager.get_map("users", MapKindHint::Lww);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.map_names(), vec!["users"]);
    }

    #[tokio::test]
    async fn hydration_restores_persisted_records() {
        let store = Arc::new(MemoryStore::new());
        {
            let manager = manager_with_store(store.clone());
            let slot = manager.get_map_async("users", MapKindHint::Lww).await;
            slot.write().apply_body("100", lww_put(7, 100)).unwrap();
            manager.persist_key("users", "100").await.unwrap();
        }

        // A fresh manager over the same store sees the record.
        let manager = manager_with_store(store);
        let slot = manager.get_map_async("users", MapKindHint::Lww).await;
        assert_eq!(slot.read().live_value("100"), Some(Value::Int(7)));
    }

    #[tokio::test]
    async fn or_sentinels_upgrade_provisional_lww() {
        let store = Arc::new(MemoryStore::new());
        {
            let manager = manager_with_store(store.clone());
            let slot = manager.get_map_async("tags", MapKindHint::Or).await;
            let record = squall_core::record::OrRecord {
                value: Value::from("x"),
                timestamp: Timestamp::new(1, 0, "c"),
                tag: "1:0:c".into(),
                ttl_ms: None,
            };
            slot.write()
                .apply_body("k", OpBody::OrAdd { record })
                .unwrap();
            manager.persist_key("tags", "k").await.unwrap();
        }

        // Reopened with an LWW hint, storage reveals the OR flavor.
        let manager = manager_with_store(store);
        let slot = manager.get_map_async("tags", MapKindHint::Lww).await;
        assert_eq!(
            slot.read().kind(),
            squall_core::protocol::peer::MapKind::Or
        );
    }

    #[tokio::test]
    async fn persist_key_deletes_fully_removed_entries() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with_store(store.clone());
        let slot = manager.get_map_async("tags", MapKindHint::Or).await;
        let record = squall_core::record::OrRecord {
            value: Value::from("x"),
            timestamp: Timestamp::new(1, 0, "c"),
            tag: "1:0:c".into(),
            ttl_ms: None,
        };
        slot.write()
            .apply_body("k", OpBody::OrAdd { record })
            .unwrap();
        manager.persist_key("tags", "k").await.unwrap();
        assert!(store.load("tags", "k").await.unwrap().is_some());

        slot.write()
            .apply_body("k", OpBody::OrRemove { tag: "1:0:c".into() })
            .unwrap();
        manager.persist_key("tags", "k").await.unwrap();
        assert!(store.load("tags", "k").await.unwrap().is_none());
        // The tombstone sentinel records the removal.
        let sentinel = store.load("tags", TOMBSTONES_KEY).await.unwrap().unwrap();
        assert_eq!(sentinel, StorageValue::OrTombstones { tags: vec!["1:0:c".into()] });
    }

    #[tokio::test]
    async fn gc_watermark_gates_sync_reset() {
        let manager = manager_with_store(Arc::new(MemoryStore::new()));
        let old_client = Timestamp::new(100, 0, "client");
        assert!(!manager.needs_sync_reset("m", &old_client), "no prune yet");

        manager.record_gc_watermark("m", Timestamp::new(1_000, 0, ""));
        assert!(manager.needs_sync_reset("m", &old_client));
        let fresh_client = Timestamp::new(2_000, 0, "client");
        assert!(!manager.needs_sync_reset("m", &fresh_client));
    }
}
