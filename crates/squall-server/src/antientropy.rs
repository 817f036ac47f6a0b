//! Anti-entropy: Merkle repair between peers, and the server side of
//! client-driven sync.
//!
//! Peer repair is a request/response descent: roots are compared with
//! `SYNC_INIT`, mismatched subtrees are walked with `MERKLE_REQ_BUCKET`
//! until leaf level, and the divergent keys are exchanged with
//! `DIFF_REQUEST`/`DIFF_RESPONSE` in both directions, then merged. Because
//! every exchanged record is a CRDT record, repair is safe to run against a
//! live map.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use squall_core::protocol::client::{ClientMessage, LwwDiffEntry, OrDiffEntry, ServerMessage};
use squall_core::protocol::peer::{MapKind, PeerMessage};
use squall_core::Timestamp;
use tokio::sync::watch;

use crate::replication::PeerSender;
use crate::storage::{MapKindHint, MapSlot, StorageManager};

/// Peer-to-peer Merkle repair driver and responder.
pub struct AntiEntropy {
    storage: Arc<StorageManager>,
    peers: Arc<dyn PeerSender>,
}

impl AntiEntropy {
    #[must_use]
    pub fn new(storage: Arc<StorageManager>, peers: Arc<dyn PeerSender>) -> Self {
        Self { storage, peers }
    }

    /// Opens a repair round against one peer: one `SYNC_INIT` per map.
    pub fn start_round(&self, peer: &str) {
        for map_name in self.storage.map_names() {
            let Some(slot) = self.storage.existing(&map_name) else {
                continue;
            };
            let (kind, root_hash) = {
                let map = slot.read();
                (map.kind(), map.root_hash())
            };
            self.peers.send_peer(
                peer,
                PeerMessage::SyncInit { map_name: map_name.clone(), kind, root_hash },
            );
        }
    }

    /// Handles one inbound repair message, returning the replies to send.
    pub async fn handle(&self, from: &str, message: PeerMessage) -> Vec<PeerMessage> {
        match message {
            PeerMessage::SyncInit { map_name, kind, root_hash } => {
                let slot = self.slot_for(&map_name, kind).await;
                let local_root = slot.read().root_hash();
                vec![PeerMessage::SyncRoot {
                    map_name,
                    kind,
                    root_hash: local_root,
                    in_sync: local_root == root_hash,
                }]
            }
            PeerMessage::SyncRoot { map_name, kind, in_sync, .. } => {
                if in_sync {
                    Vec::new()
                } else {
                    // Roots differ: walk from the top.
                    vec![PeerMessage::MerkleReqBucket { map_name, kind, path: String::new() }]
                }
            }
            PeerMessage::MerkleReqBucket { map_name, kind, path } => {
                let slot = self.slot_for(&map_name, kind).await;
                let map = slot.read();
                let merkle = map.merkle();
                match merkle.child_hashes(&path) {
                    Some(children) => vec![PeerMessage::MerkleRespBucket {
                        map_name,
                        kind,
                        path,
                        children,
                        keys: Vec::new(),
                        at_leaf: false,
                    }],
                    None => vec![PeerMessage::MerkleRespBucket {
                        map_name,
                        kind,
                        keys: merkle.keys_under(&path),
                        path,
                        children: BTreeMap::new(),
                        at_leaf: true,
                    }],
                }
            }
            PeerMessage::MerkleRespBucket { map_name, kind, path, children, keys, at_leaf } => {
                self.descend(from, &map_name, kind, &path, &children, keys, at_leaf)
                    .await
            }
            PeerMessage::DiffRequest { map_name, kind, keys } => {
                let slot = self.slot_for(&map_name, kind).await;
                vec![build_diff_response(&slot, &map_name, kind, &keys)]
            }
            PeerMessage::DiffResponse { map_name, kind, lww_entries, or_entries, or_tombstones } => {
                self.absorb_diff(&map_name, kind, lww_entries, or_entries, &or_tombstones)
                    .await;
                Vec::new()
            }
            other => {
                tracing::debug!(from, message = ?other, "unexpected repair message");
                Vec::new()
            }
        }
    }

    /// Runs periodic repair rounds against a rotating peer until shutdown.
    pub async fn run(
        self: Arc<Self>,
        interval_ms: u64,
        cluster: Arc<crate::cluster::ClusterManager>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cursor = 0_usize;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let peers = cluster.connected_peer_ids();
                    if peers.is_empty() {
                        continue;
                    }
                    let peer = &peers[cursor % peers.len()];
                    cursor = cursor.wrapping_add(1);
                    self.start_round(peer);
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn descend(
        &self,
        from: &str,
        map_name: &str,
        kind: MapKind,
        path: &str,
        remote_children: &BTreeMap<String, u32>,
        remote_keys: Vec<String>,
        at_leaf: bool,
    ) -> Vec<PeerMessage> {
        let slot = self.slot_for(map_name, kind).await;

        if at_leaf {
            // Union of both sides' keys in this bucket: fetch theirs, push ours.
            let mut keys = remote_keys;
            {
                let map = slot.read();
                for key in map.merkle().keys_under(path) {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
            keys.sort();
            if keys.is_empty() {
                return Vec::new();
            }
            let push = build_diff_response(&slot, map_name, kind, &keys);
            return vec![
                PeerMessage::DiffRequest {
                    map_name: map_name.to_string(),
                    kind,
                    keys,
                },
                push,
            ];
        }

        let local_children = {
            let map = slot.read();
            map.merkle().child_hashes(path).unwrap_or_default()
        };
        let mut requests = Vec::new();
        let digits: std::collections::BTreeSet<&String> =
            remote_children.keys().chain(local_children.keys()).collect();
        for digit in digits {
            if remote_children.get(digit) != local_children.get(digit) {
                requests.push(PeerMessage::MerkleReqBucket {
                    map_name: map_name.to_string(),
                    kind,
                    path: format!("{path}{digit}"),
                });
            }
        }
        if requests.is_empty() {
            tracing::debug!(from, map = map_name, path, "buckets converged during descent");
        }
        requests
    }

    async fn absorb_diff(
        &self,
        map_name: &str,
        kind: MapKind,
        lww_entries: Vec<LwwDiffEntry>,
        or_entries: Vec<OrDiffEntry>,
        or_tombstones: &[String],
    ) {
        let slot = self.slot_for(map_name, kind).await;
        let mut touched = Vec::new();
        {
            let mut map = slot.write();
            for entry in lww_entries {
                match map.merge_lww(&entry.key, entry.record) {
                    Ok(true) => touched.push(entry.key),
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(map = map_name, key = %entry.key, error = %err, "diff entry rejected");
                    }
                }
            }
            for entry in or_entries {
                match map.merge_or_key(&entry.key, entry.records, or_tombstones) {
                    Ok(stats) if stats.changed() => touched.push(entry.key),
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(map = map_name, key = %entry.key, error = %err, "diff entry rejected");
                    }
                }
            }
        }
        for key in touched {
            if let Err(err) = self.storage.persist_key(map_name, &key).await {
                tracing::error!(map = map_name, key, error = %err, "repair persist failed");
            }
        }
        metrics::counter!("squall_repair_rounds_total").increment(1);
    }

    async fn slot_for(&self, map_name: &str, kind: MapKind) -> Arc<MapSlot> {
        let hint = match kind {
            MapKind::Lww => MapKindHint::Lww,
            MapKind::Or => MapKindHint::Or,
        };
        self.storage.get_map_async(map_name, hint).await
    }
}

fn build_diff_response(
    slot: &Arc<MapSlot>,
    map_name: &str,
    kind: MapKind,
    keys: &[String],
) -> PeerMessage {
    let map = slot.read();
    match kind {
        MapKind::Lww => {
            let entries = keys
                .iter()
                .filter_map(|key| {
                    map.lww_record(key)
                        .map(|record| LwwDiffEntry { key: key.clone(), record })
                })
                .collect();
            PeerMessage::DiffResponse {
                map_name: map_name.to_string(),
                kind,
                lww_entries: entries,
                or_entries: Vec::new(),
                or_tombstones: Vec::new(),
            }
        }
        MapKind::Or => {
            let (or_entries, or_tombstones) = or_diff_for_keys(&map, keys);
            PeerMessage::DiffResponse {
                map_name: map_name.to_string(),
                kind,
                lww_entries: Vec::new(),
                or_entries,
                or_tombstones,
            }
        }
    }
}

fn or_diff_for_keys(
    map: &crate::storage::CrdtMap,
    keys: &[String],
) -> (Vec<OrDiffEntry>, Vec<String>) {
    let crate::storage::CrdtMap::Or(or_map) = map else {
        return (Vec::new(), Vec::new());
    };
    let entries = keys
        .iter()
        .map(|key| OrDiffEntry {
            key: key.clone(),
            records: or_map.get_records(key).into_iter().cloned().collect(),
        })
        .filter(|entry| !entry.records.is_empty())
        .collect();
    let tombstones = or_map.tombstones().cloned().collect();
    (entries, tombstones)
}

// ---------------------------------------------------------------------------
// Client-driven sync (server side)
// ---------------------------------------------------------------------------

/// Server-side handling of client sync messages.
///
/// The client drives the same descent a peer would; the server only answers.
/// A `SYNC_INIT` whose `last_sync` predates the map's GC watermark is
/// answered with `SYNC_RESET_REQUIRED` instead of a root hash, because
/// tombstones the client never observed may already be pruned.
pub async fn handle_client_sync(
    storage: &Arc<StorageManager>,
    message: ClientMessage,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::LwwSyncInit { map_name, root_hash, last_sync } => {
            if stale_sync(storage, &map_name, last_sync.as_ref()) {
                return Some(ServerMessage::SyncResetRequired { map_name });
            }
            let slot = storage.get_map_async(&map_name, MapKindHint::Lww).await;
            let local_root = slot.read().root_hash();
            Some(ServerMessage::LwwSyncResp {
                map_name,
                root_hash: local_root,
                in_sync: local_root == root_hash,
            })
        }
        ClientMessage::OrmapSyncInit { map_name, root_hash, last_sync } => {
            if stale_sync(storage, &map_name, last_sync.as_ref()) {
                return Some(ServerMessage::SyncResetRequired { map_name });
            }
            let slot = storage.get_map_async(&map_name, MapKindHint::Or).await;
            let local_root = slot.read().root_hash();
            Some(ServerMessage::OrmapSyncResp {
                map_name,
                root_hash: local_root,
                in_sync: local_root == root_hash,
            })
        }
        ClientMessage::LwwMerkleReqBucket { map_name, path } => {
            let slot = storage.get_map_async(&map_name, MapKindHint::Lww).await;
            let map = slot.read();
            let (children, keys) = bucket_answer(map.merkle(), &path);
            Some(ServerMessage::LwwMerkleRespBucket { map_name, path, children, keys })
        }
        ClientMessage::OrmapMerkleReqBucket { map_name, path } => {
            let slot = storage.get_map_async(&map_name, MapKindHint::Or).await;
            let map = slot.read();
            let (children, keys) = bucket_answer(map.merkle(), &path);
            Some(ServerMessage::OrmapMerkleRespBucket { map_name, path, children, keys })
        }
        ClientMessage::LwwDiffRequest { map_name, keys } => {
            let slot = storage.get_map_async(&map_name, MapKindHint::Lww).await;
            let map = slot.read();
            let entries = keys
                .iter()
                .filter_map(|key| {
                    map.lww_record(key)
                        .map(|record| LwwDiffEntry { key: key.clone(), record })
                })
                .collect();
            Some(ServerMessage::LwwDiffResp { map_name, entries })
        }
        ClientMessage::OrmapDiffRequest { map_name, keys } => {
            let slot = storage.get_map_async(&map_name, MapKindHint::Or).await;
            let (entries, tombstones) = {
                let map = slot.read();
                or_diff_for_keys(&map, &keys)
            };
            Some(ServerMessage::OrmapDiffResp { map_name, entries, tombstones })
        }
        ClientMessage::LwwPushDiff { map_name, entries } => {
            let slot = storage.get_map_async(&map_name, MapKindHint::Lww).await;
            let mut touched = Vec::new();
            {
                let mut map = slot.write();
                for entry in entries {
                    if map.merge_lww(&entry.key, entry.record).unwrap_or(false) {
                        touched.push(entry.key);
                    }
                }
            }
            persist_keys(storage, &map_name, touched).await;
            None
        }
        ClientMessage::OrmapPushDiff { map_name, entries, tombstones } => {
            let slot = storage.get_map_async(&map_name, MapKindHint::Or).await;
            let mut touched = Vec::new();
            {
                let mut map = slot.write();
                for entry in entries {
                    match map.merge_or_key(&entry.key, entry.records, &tombstones) {
                        Ok(stats) if stats.changed() => touched.push(entry.key),
                        _ => {}
                    }
                }
            }
            persist_keys(storage, &map_name, touched).await;
            None
        }
        _ => None,
    }
}

fn stale_sync(
    storage: &Arc<StorageManager>,
    map_name: &str,
    last_sync: Option<&Timestamp>,
) -> bool {
    last_sync.is_some_and(|ts| storage.needs_sync_reset(map_name, ts))
}

fn bucket_answer(
    merkle: &squall_core::MerkleTree,
    path: &str,
) -> (BTreeMap<String, u32>, Vec<String>) {
    match merkle.child_hashes(path) {
        Some(children) => (children, Vec::new()),
        None => (BTreeMap::new(), merkle.keys_under(path)),
    }
}

async fn persist_keys(storage: &Arc<StorageManager>, map_name: &str, keys: Vec<String>) {
    for key in keys {
        if let Err(err) = storage.persist_key(map_name, &key).await {
            tracing::error!(map = map_name, key, error = %err, "sync persist failed");
        }
    }
}
