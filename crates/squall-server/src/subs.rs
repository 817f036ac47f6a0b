//! Distributed subscription coordinator.
//!
//! The node a client is connected to coordinates its subscriptions: it
//! computes the targeted owners via partition pruning, registers the
//! subscription on each of them, merges their initial results (union with
//! duplicate suppression for queries, Reciprocal-Rank-Fusion for searches),
//! and afterwards turns replica updates into `ENTER`/`UPDATE`/`LEAVE`
//! deltas for the client.
//!
//! Subscription state lives in two flat side tables — this coordinator's
//! `subs` map and the replica-side [`QueryRegistry`] — keyed by subscription
//! id, so teardown after a disconnect or a coordinator crash is a scan, not
//! a pointer chase.
//!
//! Lifecycle per subscription:
//!
//! ```text
//! CREATED -> REGISTERING -> (all acks)   ACTIVE -> (unsub | close) CLOSED
//!                        -> (ack timeout) PARTIAL -> (late acks)   ACTIVE
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use squall_core::protocol::peer::{PeerMessage, SubSpec, SubscriptionRegistration};
use squall_core::protocol::{ChangeKind, QueryHit, SearchHit, SearchQuery, ServerMessage};
use squall_core::{Query, Timestamp, Value};
use tokio::sync::Notify;

use crate::partitions::PartitionService;
use crate::queries::{evaluate_initial, OutboundSubUpdate, QueryRegistry};
use crate::replication::PeerSender;
use crate::search::SearchService;
use crate::storage::{MapKindHint, StorageManager};

/// Delivery of server messages to connected clients.
pub trait ClientSink: Send + Sync {
    /// Enqueues a message to one client; `false` when the connection is gone.
    fn deliver(&self, connection: u64, message: ServerMessage) -> bool;
}

/// Source of the current member list.
pub trait Members: Send + Sync {
    /// Sorted ids of every cluster member, self included.
    fn member_ids(&self) -> Vec<String>;
}

impl Members for crate::cluster::ClusterManager {
    fn member_ids(&self) -> Vec<String> {
        self.member_ids()
    }
}

/// Coordinator-side lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Registering,
    Active,
    Partial,
    Closed,
}

struct CoordSub {
    client_query_id: String,
    connection: u64,
    map_name: String,
    spec: SubSpec,
    targeted: HashSet<String>,
    registered: HashSet<String>,
    failed: HashSet<String>,
    state: SubState,
    pending_query: Vec<QueryHit>,
    pending_search: Vec<Vec<SearchHit>>,
    total_hits: u64,
    /// key -> value for entries currently in the result set.
    current: HashMap<String, Value>,
    /// Newest update timestamp observed per key; stale replica updates
    /// (including ones arriving after a LEAVE) are dropped against this.
    seen: HashMap<String, Timestamp>,
    done: Arc<Notify>,
}

impl CoordSub {
    fn acks_complete(&self) -> bool {
        self.targeted
            .iter()
            .all(|node| self.registered.contains(node) || self.failed.contains(node))
    }
}

/// Coordinates distributed subscriptions for locally-connected clients.
pub struct SubscriptionCoordinator {
    node_id: String,
    ack_timeout: Duration,
    subs: DashMap<String, Mutex<CoordSub>>,
    by_connection: DashMap<u64, HashSet<String>>,
    peers: Arc<dyn PeerSender>,
    clients: Arc<dyn ClientSink>,
    registry: Arc<QueryRegistry>,
    search: Arc<SearchService>,
    partitions: Arc<PartitionService>,
    storage: Arc<StorageManager>,
}

impl SubscriptionCoordinator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        ack_timeout: Duration,
        peers: Arc<dyn PeerSender>,
        clients: Arc<dyn ClientSink>,
        registry: Arc<QueryRegistry>,
        search: Arc<SearchService>,
        partitions: Arc<PartitionService>,
        storage: Arc<StorageManager>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            ack_timeout,
            subs: DashMap::new(),
            by_connection: DashMap::new(),
            peers,
            clients,
            registry,
            search,
            partitions,
            storage,
        }
    }

    // ---- client-facing entry points ----

    /// Handles a `QUERY_SUB`: fan-out, merge, and the `QUERY_RESP` reply.
    pub async fn subscribe_query(
        &self,
        connection: u64,
        query_id: &str,
        map_name: &str,
        query: Query,
        members: &dyn Members,
    ) -> ServerMessage {
        let all_members = members.member_ids();
        let targeted = self.partitions.target_nodes_for_query(&query, &all_members);
        let spec = SubSpec::Query { query };
        let sub_id = self
            .begin(connection, query_id, map_name, spec, targeted)
            .await;
        self.await_acks(&sub_id).await;
        self.finish_query(&sub_id)
    }

    /// Handles a `SEARCH_SUB`: searches cannot be partition-pruned, so the
    /// fan-out targets every member.
    pub async fn subscribe_search(
        &self,
        connection: u64,
        query_id: &str,
        map_name: &str,
        search: SearchQuery,
        members: &dyn Members,
    ) -> ServerMessage {
        let targeted = members.member_ids();
        let spec = SubSpec::Search { search };
        let sub_id = self
            .begin(connection, query_id, map_name, spec, targeted)
            .await;
        self.await_acks(&sub_id).await;
        self.finish_search(&sub_id)
    }

    /// Handles a one-shot `SEARCH`: same fan-out as a search subscription,
    /// but the registration is torn down as soon as the merge completes.
    pub async fn search_once(
        &self,
        connection: u64,
        request_id: &str,
        map_name: &str,
        search: SearchQuery,
        members: &dyn Members,
    ) -> ServerMessage {
        let targeted = members.member_ids();
        let spec = SubSpec::Search { search };
        let sub_id = self
            .begin(connection, request_id, map_name, spec, targeted)
            .await;
        self.await_acks(&sub_id).await;
        let response = self.finish_search(&sub_id);
        self.teardown(&sub_id);
        response
    }

    /// Handles a `QUERY_UNSUB` for one client query id.
    pub fn unsubscribe(&self, connection: u64, client_query_id: &str) {
        let ids: Vec<String> = self
            .by_connection
            .get(&connection)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        for sub_id in ids {
            let matches = self
                .subs
                .get(&sub_id)
                .is_some_and(|sub| sub.lock().client_query_id == client_query_id);
            if matches {
                self.teardown(&sub_id);
            }
        }
    }

    /// Tears down every subscription owned by a closed connection.
    pub fn on_client_disconnect(&self, connection: u64) {
        let ids: Vec<String> = self
            .by_connection
            .remove(&connection)
            .map(|(_, ids)| ids.into_iter().collect())
            .unwrap_or_default();
        for sub_id in ids {
            self.teardown(&sub_id);
        }
    }

    // ---- cluster-facing entry points ----

    /// Processes a replica's `CLUSTER_SUB_ACK`.
    pub fn on_sub_ack(
        &self,
        from: &str,
        subscription_id: &str,
        success: bool,
        initial_query: Vec<QueryHit>,
        initial_search: Vec<SearchHit>,
        total_hits: u64,
    ) {
        let Some(entry) = self.subs.get(subscription_id) else {
            return;
        };
        let mut sub = entry.lock();
        if !sub.targeted.contains(from) {
            return;
        }
        if success {
            sub.registered.insert(from.to_string());
            sub.failed.remove(from);
        } else {
            sub.failed.insert(from.to_string());
        }
        sub.pending_query.extend(initial_query);
        if !initial_search.is_empty() {
            sub.pending_search.push(initial_search);
        }
        sub.total_hits += total_hits;

        // A late ack after the deadline promotes PARTIAL back to ACTIVE.
        if sub.state == SubState::Partial && sub.acks_complete() && sub.failed.is_empty() {
            sub.state = SubState::Active;
        }
        if sub.acks_complete() {
            sub.done.notify_waiters();
        }
    }

    /// Processes a replica's `CLUSTER_SUB_UPDATE`, diffing it against the
    /// current result set and emitting the client-facing delta.
    pub fn on_sub_update(
        &self,
        subscription_id: &str,
        key: &str,
        value: Option<Value>,
        timestamp: Timestamp,
        score: Option<f64>,
    ) {
        let Some(entry) = self.subs.get(subscription_id) else {
            return;
        };
        let (connection, message) = {
            let mut sub = entry.lock();
            if sub.state == SubState::Closed {
                return;
            }
            // Stale replica update: a newer version of this key has already
            // been reflected in the result set (or diffed out of it).
            if sub.seen.get(key).is_some_and(|newest| timestamp < *newest) {
                return;
            }
            sub.seen.insert(key.to_string(), timestamp);
            let change = match (sub.current.contains_key(key), &value) {
                (false, Some(new_value)) => {
                    sub.current.insert(key.to_string(), new_value.clone());
                    Some(ChangeKind::Enter)
                }
                (true, None) => {
                    sub.current.remove(key);
                    Some(ChangeKind::Leave)
                }
                (true, Some(new_value)) => {
                    let changed = sub.current.get(key).is_some_and(|old| old != new_value);
                    sub.current.insert(key.to_string(), new_value.clone());
                    changed.then_some(ChangeKind::Update)
                }
                (false, None) => None,
            };
            let Some(change) = change else {
                return;
            };
            let message = match &sub.spec {
                SubSpec::Query { .. } => ServerMessage::QueryUpdate {
                    query_id: sub.client_query_id.clone(),
                    change,
                    key: key.to_string(),
                    value: value.clone(),
                },
                SubSpec::Search { .. } => ServerMessage::SearchUpdate {
                    query_id: sub.client_query_id.clone(),
                    change,
                    key: key.to_string(),
                    score,
                    value: value.clone(),
                },
            };
            (sub.connection, message)
        };
        self.clients.deliver(connection, message);
    }

    /// Routes the updates produced by a local write: updates for
    /// subscriptions this node coordinates are diffed directly, the rest are
    /// forwarded to their coordinators.
    pub fn route_updates(&self, key: &str, timestamp: &Timestamp, updates: Vec<OutboundSubUpdate>) {
        for update in updates {
            if update.coordinator == self.node_id {
                self.on_sub_update(
                    &update.subscription_id,
                    key,
                    update.value,
                    timestamp.clone(),
                    update.score,
                );
            } else {
                self.peers.send_peer(
                    &update.coordinator,
                    PeerMessage::ClusterSubUpdate {
                        subscription_id: update.subscription_id,
                        from: self.node_id.clone(),
                        key: key.to_string(),
                        value: update.value,
                        timestamp: timestamp.clone(),
                        score: update.score,
                    },
                );
            }
        }
    }

    /// Drops coordinator-side registration state for a departed member.
    ///
    /// Acked nodes that remain keep streaming updates; the subscription
    /// stays usable for the survivors.
    pub fn on_member_left(&self, node_id: &str) {
        for entry in &self.subs {
            let mut sub = entry.value().lock();
            sub.targeted.remove(node_id);
            sub.registered.remove(node_id);
            sub.failed.remove(node_id);
            if sub.acks_complete() {
                sub.done.notify_waiters();
            }
        }
    }

    /// Connections holding at least one subscription on `map_name`, for
    /// `SERVER_EVENT` fan-out.
    #[must_use]
    pub fn connections_on_map(&self, map_name: &str) -> Vec<u64> {
        let mut connections: Vec<u64> = self
            .subs
            .iter()
            .filter_map(|entry| {
                let sub = entry.value().lock();
                (sub.map_name == map_name && sub.state != SubState::Closed)
                    .then_some(sub.connection)
            })
            .collect();
        connections.sort_unstable();
        connections.dedup();
        connections
    }

    /// Delivers a message to every connection subscribed on `map_name`.
    pub fn broadcast_map_event(&self, map_name: &str, message: &ServerMessage) {
        for connection in self.connections_on_map(map_name) {
            self.clients.deliver(connection, message.clone());
        }
    }

    /// Coordinator-side state of a subscription, for tests and introspection.
    #[must_use]
    pub fn state_of(&self, subscription_id: &str) -> Option<SubState> {
        self.subs
            .get(subscription_id)
            .map(|sub| sub.lock().state)
    }

    /// Number of live coordinator-side subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Whether no subscriptions are coordinated here.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    // ---- internals ----

    async fn begin(
        &self,
        connection: u64,
        client_query_id: &str,
        map_name: &str,
        spec: SubSpec,
        targeted: Vec<String>,
    ) -> String {
        let subscription_id = uuid::Uuid::new_v4().to_string();
        let sub = CoordSub {
            client_query_id: client_query_id.to_string(),
            connection,
            map_name: map_name.to_string(),
            spec: spec.clone(),
            targeted: targeted.iter().cloned().collect(),
            registered: HashSet::new(),
            failed: HashSet::new(),
            state: SubState::Registering,
            pending_query: Vec::new(),
            pending_search: Vec::new(),
            total_hits: 0,
            current: HashMap::new(),
            seen: HashMap::new(),
            done: Arc::new(Notify::new()),
        };
        self.subs.insert(subscription_id.clone(), Mutex::new(sub));
        self.by_connection
            .entry(connection)
            .or_default()
            .insert(subscription_id.clone());
        metrics::gauge!("squall_coordinated_subscriptions").set(self.subs.len() as f64);

        let registration = SubscriptionRegistration {
            subscription_id: subscription_id.clone(),
            coordinator: self.node_id.clone(),
            map_name: map_name.to_string(),
            spec,
        };

        for target in targeted {
            if target == self.node_id {
                let ack = register_replica(
                    &self.registry,
                    &self.storage,
                    &self.search,
                    registration.clone(),
                )
                .await;
                if let PeerMessage::ClusterSubAck {
                    from,
                    success,
                    initial_query,
                    initial_search,
                    total_hits,
                    ..
                } = ack
                {
                    self.on_sub_ack(
                        &from,
                        &subscription_id,
                        success,
                        initial_query,
                        initial_search,
                        total_hits,
                    );
                }
            } else if !self.peers.send_peer(
                &target,
                PeerMessage::ClusterSubRegister { registration: registration.clone() },
            ) {
                self.on_sub_ack(&target, &subscription_id, false, vec![], vec![], 0);
            }
        }
        subscription_id
    }

    async fn await_acks(&self, subscription_id: &str) {
        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        loop {
            let (complete, done) = {
                let Some(entry) = self.subs.get(subscription_id) else {
                    return;
                };
                let sub = entry.lock();
                (sub.acks_complete(), sub.done.clone())
            };
            if complete {
                return;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return;
            }
            let _ = tokio::time::timeout_at(deadline, done.notified()).await;
        }
    }

    fn finish_query(&self, subscription_id: &str) -> ServerMessage {
        let Some(entry) = self.subs.get(subscription_id) else {
            return ServerMessage::Error {
                code: squall_core::protocol::codes::BAD_REQUEST,
                message: "subscription vanished during registration".to_string(),
            };
        };
        let mut sub = entry.lock();

        // Union with duplicate suppression on (key, timestamp): the newest
        // record per key wins across nodes.
        let mut best: HashMap<String, QueryHit> = HashMap::new();
        for hit in sub.pending_query.drain(..) {
            match best.get(&hit.key) {
                Some(existing) if existing.timestamp >= hit.timestamp => {}
                _ => {
                    best.insert(hit.key.clone(), hit);
                }
            }
        }
        let query = match &sub.spec {
            SubSpec::Query { query } => query.clone(),
            SubSpec::Search { .. } => Query::match_all(),
        };
        let mut entries: Vec<(String, Value)> = best
            .values()
            .map(|hit| (hit.key.clone(), hit.value.clone()))
            .collect();
        query.order_entries(&mut entries);
        if let Some(limit) = query.limit {
            entries.truncate(limit as usize);
        }
        let results: Vec<QueryHit> = entries
            .into_iter()
            .map(|(key, value)| {
                let timestamp = best[&key].timestamp.clone();
                QueryHit { key, value, timestamp }
            })
            .collect();

        for hit in &results {
            sub.current.insert(hit.key.clone(), hit.value.clone());
            sub.seen.insert(hit.key.clone(), hit.timestamp.clone());
        }

        let mut registered: Vec<String> = sub.registered.iter().cloned().collect();
        registered.sort();
        let mut failed: Vec<String> = sub
            .targeted
            .iter()
            .filter(|node| !sub.registered.contains(*node))
            .cloned()
            .collect();
        failed.sort();

        sub.state = if failed.is_empty() { SubState::Active } else { SubState::Partial };

        ServerMessage::QueryResp {
            query_id: sub.client_query_id.clone(),
            results,
            registered_nodes: registered,
            failed_nodes: failed,
        }
    }

    fn finish_search(&self, subscription_id: &str) -> ServerMessage {
        let Some(entry) = self.subs.get(subscription_id) else {
            return ServerMessage::Error {
                code: squall_core::protocol::codes::BAD_REQUEST,
                message: "subscription vanished during registration".to_string(),
            };
        };
        let mut sub = entry.lock();
        let limit = match &sub.spec {
            SubSpec::Search { search } => search.limit,
            SubSpec::Query { .. } => None,
        };
        let lists = std::mem::take(&mut sub.pending_search);
        let results = self.search.rrf_merge(&lists, limit);
        for hit in &results {
            sub.current.insert(hit.key.clone(), Value::Null);
            sub.seen.insert(hit.key.clone(), Timestamp::zero());
        }
        let total = sub.total_hits;
        let mut failed: Vec<String> = sub
            .targeted
            .iter()
            .filter(|node| !sub.registered.contains(*node))
            .cloned()
            .collect();
        failed.sort();
        sub.state = if failed.is_empty() { SubState::Active } else { SubState::Partial };

        ServerMessage::SearchResp {
            request_id: sub.client_query_id.clone(),
            results,
            total_count: total,
        }
    }

    fn teardown(&self, subscription_id: &str) {
        let Some((_, sub)) = self.subs.remove(subscription_id) else {
            return;
        };
        let sub = sub.into_inner();
        if let Some(mut ids) = self.by_connection.get_mut(&sub.connection) {
            ids.remove(subscription_id);
        }
        for node in &sub.registered {
            if node == &self.node_id {
                self.registry.unregister(subscription_id);
            } else {
                self.peers.send_peer(
                    node,
                    PeerMessage::ClusterSubUnregister {
                        subscription_id: subscription_id.to_string(),
                    },
                );
            }
        }
        metrics::gauge!("squall_coordinated_subscriptions").set(self.subs.len() as f64);
    }
}

/// Replica-side handling of a `CLUSTER_SUB_REGISTER`: register locally and
/// produce the `CLUSTER_SUB_ACK` with this node's initial results.
pub async fn register_replica(
    registry: &Arc<QueryRegistry>,
    storage: &Arc<StorageManager>,
    search: &Arc<SearchService>,
    registration: SubscriptionRegistration,
) -> PeerMessage {
    let subscription_id = registration.subscription_id.clone();
    let node_id = storage_node_id(storage);
    let map_name = registration.map_name.clone();
    let spec = registration.spec.clone();
    registry.register(registration);

    let slot = storage.get_map_async(&map_name, MapKindHint::Lww).await;
    let (initial_query, initial_search, total_hits) = match &spec {
        SubSpec::Query { query } => {
            let hits = evaluate_initial(&slot.read(), query);
            let total = hits.len() as u64;
            (hits, Vec::new(), total)
        }
        SubSpec::Search { search: search_query } => {
            let (hits, total) = search.search(&map_name, search_query);
            (Vec::new(), hits, total)
        }
    };

    PeerMessage::ClusterSubAck {
        subscription_id,
        from: node_id,
        success: true,
        initial_query,
        initial_search,
        total_hits,
    }
}

fn storage_node_id(storage: &Arc<StorageManager>) -> String {
    storage.node_id().to_string()
}
