//! Peer ↔ peer cluster messages.
//!
//! Same envelope discipline as the client protocol: adjacently tagged MsgPack
//! over the length-prefixed TCP transport. Replication, membership gossip,
//! distributed subscriptions, scatter-gather queries, GC hints, and Merkle
//! repair all travel as variants of [`PeerMessage`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::partition::PartitionMap;
use crate::predicate::Query;
use crate::protocol::client::{LwwDiffEntry, OpBody, OrDiffEntry, QueryHit, SearchHit, SearchQuery};

/// One cluster member as gossiped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub node_id: String,
    pub host: String,
    pub cluster_port: u16,
    pub client_port: u16,
}

/// Versioned membership view; higher versions replace lower ones.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembersView {
    pub version: u64,
    pub members: Vec<MemberInfo>,
}

impl MembersView {
    /// Sorted node ids of every member in the view.
    #[must_use]
    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.members.iter().map(|m| m.node_id.clone()).collect();
        ids.sort();
        ids
    }

    /// Looks up a member by node id.
    #[must_use]
    pub fn member(&self, node_id: &str) -> Option<&MemberInfo> {
        self.members.iter().find(|m| m.node_id == node_id)
    }
}

/// A write being shipped to a backup owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedOp {
    /// Id assigned by the origin node; acks echo it back.
    pub op_id: u64,
    pub map_name: String,
    pub key: String,
    pub op: OpBody,
}

/// Which CRDT flavor an anti-entropy exchange addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MapKind {
    Lww,
    Or,
}

/// What a distributed subscription evaluates on each replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubSpec {
    Query { query: Query },
    Search { search: SearchQuery },
}

/// A subscription registration shipped to a replica node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRegistration {
    pub subscription_id: String,
    /// Node that owns the client socket and merges updates.
    pub coordinator: String,
    pub map_name: String,
    pub spec: SubSpec,
}

/// Messages exchanged between cluster peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerMessage {
    /// First frame on a fresh peer connection, sent by the initiator.
    ClusterHello {
        member: MemberInfo,
        cluster_name: String,
        protocol_version: u32,
    },
    /// Accepting side's reply, carrying its current membership view.
    ClusterHelloAck {
        member: MemberInfo,
        view: MembersView,
    },
    /// Membership gossip.
    ClusterMembers {
        view: MembersView,
    },
    /// Partition map gossip, published after every rebalance.
    PartitionMapUpdate {
        map: PartitionMap,
    },
    /// Batched replicated writes from an owner to a backup.
    OpForward {
        origin: String,
        ops: Vec<ReplicatedOp>,
    },
    /// Per-op acknowledgement of previously forwarded writes.
    OpAckCluster {
        from: String,
        op_ids: Vec<u64>,
    },
    ClusterSubRegister {
        registration: SubscriptionRegistration,
    },
    ClusterSubAck {
        subscription_id: String,
        from: String,
        success: bool,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        initial_query: Vec<QueryHit>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        initial_search: Vec<SearchHit>,
        total_hits: u64,
    },
    /// A replica-local write relevant to a registered subscription.
    ClusterSubUpdate {
        subscription_id: String,
        from: String,
        key: String,
        /// Live value after the write; `None` for delete/expiry.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        value: Option<crate::value::Value>,
        timestamp: Timestamp,
        /// Search relevance when the subscription is a search.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        score: Option<f64>,
    },
    ClusterSubUnregister {
        subscription_id: String,
    },
    /// Scatter-gather fallback for one-shot query execution.
    ClusterQueryExec {
        request_id: String,
        from: String,
        map_name: String,
        query: Query,
    },
    ClusterQueryResult {
        request_id: String,
        from: String,
        results: Vec<QueryHit>,
    },
    /// Graceful departure notice; peers treat it as an immediate member-left.
    NodeLeaving {
        node_id: String,
    },
    /// Per-node GC safety report: the oldest HLC any of this node's clients
    /// may still replay. The cluster cutoff is the minimum over all hints.
    ClusterGcHint {
        node_id: String,
        last_active: Timestamp,
    },
    SyncInit {
        map_name: String,
        kind: MapKind,
        root_hash: u32,
    },
    SyncRoot {
        map_name: String,
        kind: MapKind,
        root_hash: u32,
        in_sync: bool,
    },
    MerkleReqBucket {
        map_name: String,
        kind: MapKind,
        path: String,
    },
    MerkleRespBucket {
        map_name: String,
        kind: MapKind,
        path: String,
        #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
        children: BTreeMap<String, u32>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        keys: Vec<String>,
        at_leaf: bool,
    },
    DiffRequest {
        map_name: String,
        kind: MapKind,
        keys: Vec<String>,
    },
    DiffResponse {
        map_name: String,
        kind: MapKind,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        lww_entries: Vec<LwwDiffEntry>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        or_entries: Vec<OrDiffEntry>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        or_tombstones: Vec<String>,
    },
}
