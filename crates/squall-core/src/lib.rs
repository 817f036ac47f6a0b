//! Squall core — CRDT maps, hybrid logical clock, Merkle trees, partition
//! math, and the wire protocol.
//!
//! This crate is the foundation layer of the squall data grid:
//!
//! - **Clock** ([`clock`]): hybrid logical timestamps and the process-wide
//!   [`Hlc`] handle every mutation path stamps with
//! - **Hash** ([`hash`]): the 32-bit FNV-1a hash shared by partition routing
//!   and Merkle bucketing
//! - **Merkle** ([`merkle`]): order-independent prefix trees for delta sync
//! - **Records** ([`record`]): [`LwwRecord`] and [`OrRecord`] with TTL
//! - **Maps** ([`lww`], [`ormap`]): the two CRDT map flavors
//! - **Values** ([`value`]): the closed dynamic [`Value`] type
//! - **Queries** ([`predicate`]): the predicate AST and its interpreter
//! - **Partitions** ([`partition`]): the 271-way ring and predicate pruning
//! - **Protocol** ([`protocol`]): tagged client and peer message envelopes

pub mod clock;
pub mod hash;
pub mod lww;
pub mod merkle;
pub mod ormap;
pub mod partition;
pub mod predicate;
pub mod protocol;
pub mod record;
pub mod value;

pub use clock::{ClockSource, Hlc, SystemClock, Timestamp};
pub use hash::fnv1a;
pub use lww::LwwMap;
pub use merkle::MerkleTree;
pub use ormap::OrMap;
pub use partition::{partition_for_key, PartitionMap, PartitionReplicas, PARTITION_COUNT};
pub use predicate::{Predicate, Query, SortDirection, SortSpec};
pub use record::{LwwRecord, MergeStats, OrRecord};
pub use value::Value;
