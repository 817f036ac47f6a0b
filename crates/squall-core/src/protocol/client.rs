//! Client ↔ server messages.
//!
//! Adjacently tagged: the wire form is `{type: "...", payload: {...}}`.
//! Variant names render in `SCREAMING_SNAKE_CASE`, so `QuerySub` travels as
//! `QUERY_SUB` and `LwwSyncInit` as `LWW_SYNC_INIT`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::predicate::Query;
use crate::record::{LwwRecord, OrRecord};
use crate::value::Value;

/// Acknowledgement level requested for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Consistency {
    /// Acknowledge after the local apply; replication is asynchronous.
    Eventual,
    /// Acknowledge once a majority of backups have applied.
    Quorum,
    /// Acknowledge once every backup has applied.
    All,
}

/// The CRDT mutation carried by a client operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "opType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpBody {
    /// LWW set or delete; a tombstone record encodes the delete.
    Put { record: LwwRecord<Value> },
    /// OR-Map tagged addition.
    OrAdd { record: OrRecord<Value> },
    /// OR-Map removal of one observed tag.
    OrRemove { tag: String },
}

impl OpBody {
    /// The timestamp carried by the mutation, when it carries one.
    #[must_use]
    pub fn timestamp(&self) -> Option<&Timestamp> {
        match self {
            OpBody::Put { record } => Some(&record.timestamp),
            OpBody::OrAdd { record } => Some(&record.timestamp),
            OpBody::OrRemove { .. } => None,
        }
    }
}

/// One client write operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOp {
    /// Monotonic per-connection id used for batch idempotency.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u64>,
    pub map_name: String,
    pub key: String,
    pub op: OpBody,
    /// Requested write concern; the server default applies when absent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub consistency: Option<Consistency>,
    /// Per-op ack deadline override in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout_ms: Option<u64>,
}

/// Full-text search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Free-text query; tokenized the same way documents are.
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<u32>,
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Auth(AuthPayload),
    Ping {
        timestamp: u64,
    },
    ClientOp(ClientOp),
    OpBatch {
        ops: Vec<ClientOp>,
    },
    QuerySub {
        query_id: String,
        map_name: String,
        query: Query,
    },
    QueryUnsub {
        query_id: String,
    },
    Search {
        request_id: String,
        map_name: String,
        query: SearchQuery,
    },
    SearchSub {
        query_id: String,
        map_name: String,
        query: SearchQuery,
    },
    /// Begins LWW anti-entropy; `last_sync` gates the GC zombie check.
    LwwSyncInit {
        map_name: String,
        root_hash: u32,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        last_sync: Option<Timestamp>,
    },
    LwwMerkleReqBucket {
        map_name: String,
        path: String,
    },
    LwwDiffRequest {
        map_name: String,
        keys: Vec<String>,
    },
    LwwPushDiff {
        map_name: String,
        entries: Vec<LwwDiffEntry>,
    },
    OrmapSyncInit {
        map_name: String,
        root_hash: u32,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        last_sync: Option<Timestamp>,
    },
    OrmapMerkleReqBucket {
        map_name: String,
        path: String,
    },
    OrmapDiffRequest {
        map_name: String,
        keys: Vec<String>,
    },
    OrmapPushDiff {
        map_name: String,
        entries: Vec<OrDiffEntry>,
        tombstones: Vec<String>,
    },
}

/// Credentials presented on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub protocol_version: Option<u32>,
}

/// One LWW record shipped during sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LwwDiffEntry {
    pub key: String,
    pub record: LwwRecord<Value>,
}

/// One OR-Map key's records shipped during sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrDiffEntry {
    pub key: String,
    pub records: Vec<OrRecord<Value>>,
}

/// Kind of change reported by a live query or search update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// The entry newly satisfies the query.
    Enter,
    /// The entry still satisfies the query with a changed value.
    Update,
    /// The entry no longer satisfies the query.
    Leave,
}

/// Kind of mutation reported by a `SERVER_EVENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Set,
    Delete,
    OrAdd,
    OrRemove,
}

/// One entry in query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryHit {
    pub key: String,
    pub value: Value,
    /// Timestamp of the record that produced this hit; duplicate suppression
    /// during merge keys on `(key, timestamp)`.
    pub timestamp: Timestamp,
}

/// One entry in ranked search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub key: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub matched_terms: Option<Vec<String>>,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    AuthAck {
        node_id: String,
    },
    AuthFail {
        reason: String,
    },
    Pong {
        timestamp: u64,
        server_time: u64,
    },
    OpAck {
        /// Highest op id accepted from the batch (or the single op).
        #[serde(skip_serializing_if = "Option::is_none", default)]
        last_id: Option<u64>,
        /// Backups that did not acknowledge within the write-concern deadline.
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        failed_nodes: Vec<String>,
    },
    QueryResp {
        query_id: String,
        results: Vec<QueryHit>,
        registered_nodes: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        failed_nodes: Vec<String>,
    },
    QueryUpdate {
        query_id: String,
        change: ChangeKind,
        key: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        value: Option<Value>,
    },
    SearchResp {
        request_id: String,
        results: Vec<SearchHit>,
        total_count: u64,
    },
    SearchUpdate {
        query_id: String,
        change: ChangeKind,
        key: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        score: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        value: Option<Value>,
    },
    ServerEvent {
        map_name: String,
        key: String,
        event: EventKind,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        record: Option<LwwRecord<Value>>,
    },
    /// The client's `last_sync` predates the GC cutoff: local state for this
    /// map must be discarded and re-synced from scratch.
    SyncResetRequired {
        map_name: String,
    },
    ShutdownPending {
        retry_after_ms: u64,
    },
    Error {
        code: u16,
        message: String,
    },
    /// Coalesced frame carrying several messages in queue order.
    Batch {
        messages: Vec<ServerMessage>,
    },
    LwwSyncResp {
        map_name: String,
        root_hash: u32,
        in_sync: bool,
    },
    LwwMerkleRespBucket {
        map_name: String,
        path: String,
        /// Child hashes keyed by next hex digit; empty at leaf level.
        #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
        children: BTreeMap<String, u32>,
        /// Leaf keys; populated only at leaf level.
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        keys: Vec<String>,
    },
    LwwDiffResp {
        map_name: String,
        entries: Vec<LwwDiffEntry>,
    },
    OrmapSyncResp {
        map_name: String,
        root_hash: u32,
        in_sync: bool,
    },
    OrmapMerkleRespBucket {
        map_name: String,
        path: String,
        #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
        children: BTreeMap<String, u32>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        keys: Vec<String>,
    },
    OrmapDiffResp {
        map_name: String,
        entries: Vec<OrDiffEntry>,
        tombstones: Vec<String>,
    },
}

impl ServerMessage {
    /// Whether this message should bypass the coalescing writer's batching.
    ///
    /// Auth outcomes, shutdown notice, and heartbeat replies are urgent:
    /// delaying them by a batch window serves no one.
    #[must_use]
    pub fn is_urgent(&self) -> bool {
        matches!(
            self,
            ServerMessage::AuthAck { .. }
                | ServerMessage::AuthFail { .. }
                | ServerMessage::Pong { .. }
                | ServerMessage::ShutdownPending { .. }
        )
    }
}
