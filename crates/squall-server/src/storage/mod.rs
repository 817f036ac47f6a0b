//! Storage: the pluggable persistence contract, the in-memory engine, the
//! `CrdtMap` sum type, and the lazy-loading storage manager.

pub mod manager;
pub mod maps;
pub mod memory;
pub mod store;

pub use manager::{MapLoaded, MapSlot, StorageManager};
pub use maps::{ApplyOutcome, CrdtMap, ExpirySweep, MapKindHint, PruneOutcome};
pub use memory::MemoryStore;
pub use store::{MapStore, StorageValue, StoreError, TOMBSTONES_KEY};
