//! Node coordinator: wiring, startup order, peer routing, graceful shutdown.
//!
//! Components come up leaves-first — clock, storage, partitions, cluster,
//! replication, operation pipeline, subscriptions, search, GC, anti-entropy,
//! WebSocket frontend — and the node flips to `Ready` only once every
//! background task is running. Shutdown walks the same order backwards:
//! clients are told `SHUTDOWN_PENDING`, in-flight work drains, the
//! replication pipeline flushes, peers get `NODE_LEAVING`, sockets close,
//! storage closes last.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use squall_core::protocol::peer::PeerMessage;
use squall_core::{Hlc, SystemClock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::antientropy::AntiEntropy;
use crate::auth::Authenticator;
use crate::cluster::{ClusterEvent, ClusterManager, InboundPeerMessage};
use crate::config::NodeConfig;
use crate::error::GridError;
use crate::gc::{ActivitySource, GcService};
use crate::interceptor::{InterceptorChain, RateLimiter};
use crate::lifecycle::Lifecycle;
use crate::net::ws::{self, WsState};
use crate::net::ConnectionRegistry;
use crate::ops::OperationHandler;
use crate::partitions::PartitionService;
use crate::queries::{evaluate_initial, QueryRegistry};
use crate::replication::ReplicationPipeline;
use crate::search::SearchService;
use crate::storage::{MapKindHint, MemoryStore, StorageManager};
use crate::stripes::StripedExecutor;
use crate::subs::{register_replica, SubscriptionCoordinator};

/// A running grid node.
pub struct Node {
    config: Arc<NodeConfig>,
    lifecycle: Arc<Lifecycle>,
    cluster: Arc<ClusterManager>,
    replication: Arc<ReplicationPipeline>,
    storage: Arc<StorageManager>,
    partitions: Arc<PartitionService>,
    queries: Arc<QueryRegistry>,
    search: Arc<SearchService>,
    subs: Arc<SubscriptionCoordinator>,
    gc: Arc<GcService>,
    antientropy: Arc<AntiEntropy>,
    ws_state: WsState,
    client_addr: SocketAddr,
    cluster_addr: SocketAddr,
}

impl Node {
    /// Builds and starts a node; returns once it is accepting traffic.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Fatal`] for invalid configuration or an
    /// unbindable listener — the conditions under which a node must not
    /// join the cluster.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>, GridError> {
        config.validate().map_err(GridError::Fatal)?;
        let config = Arc::new(config);
        let lifecycle = Arc::new(Lifecycle::new());
        let shutdown = lifecycle.shutdown_watch();

        // Leaves first: clock, storage, partition math.
        let hlc = Hlc::new(config.node_id.clone(), Arc::new(SystemClock));
        let storage = Arc::new(StorageManager::new(hlc.clone(), Arc::new(MemoryStore::new())));
        let partitions = Arc::new(PartitionService::new(
            config.node_id.clone(),
            config.replication.factor,
        ));

        // Cluster fabric.
        let (cluster, peer_rx) = ClusterManager::new(&config, shutdown.clone());
        let cluster_addr = ClusterManager::start(&cluster)
            .await
            .map_err(|err| GridError::Fatal(format!("cluster listener: {err}")))?;
        partitions.rebalance(&cluster.member_ids());

        // Replication.
        let replication = Arc::new(ReplicationPipeline::new(
            config.node_id.clone(),
            config.replication,
            cluster.clone(),
        ));
        tokio::spawn(Arc::clone(&replication).run_flusher(shutdown.clone()));

        // Query, search, subscription fabric.
        let queries = Arc::new(QueryRegistry::new());
        let search_fields = config
            .full_text_search
            .iter()
            .map(|(map, cfg)| (map.clone(), cfg.fields.clone()))
            .collect();
        let search = Arc::new(SearchService::new(search_fields, config.search_rrf_k));
        let connections = Arc::new(ConnectionRegistry::new(config.backpressure.max_pending));
        let subs = Arc::new(SubscriptionCoordinator::new(
            config.node_id.clone(),
            Duration::from_millis(config.ack_timeout_ms),
            cluster.clone(),
            connections.clone(),
            queries.clone(),
            search.clone(),
            partitions.clone(),
            storage.clone(),
        ));

        // Operation pipeline.
        let auth = Arc::new(Authenticator::new(&config.auth, config.security_policies.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit, Arc::new(SystemClock)));
        let ops = Arc::new(OperationHandler::new(
            hlc.clone(),
            config.default_consistency,
            Duration::from_millis(config.write_ack_timeout_ms),
            auth.clone(),
            rate_limiter.clone(),
            InterceptorChain::new(),
            StripedExecutor::new(&config.worker_pool, &config.backpressure),
            storage.clone(),
            partitions.clone(),
            replication.clone(),
            queries.clone(),
            search.clone(),
            subs.clone(),
        ));

        // Late hydration: when a lazily-loaded map finishes, re-announce its
        // entries so subscriptions registered during the load see them.
        if let Some(mut loads) = storage.take_load_events() {
            let storage_for_loads = storage.clone();
            let queries_for_loads = queries.clone();
            let search_for_loads = search.clone();
            let subs_for_loads = subs.clone();
            tokio::spawn(async move {
                while let Some(event) = loads.recv().await {
                    if event.entries == 0 {
                        continue;
                    }
                    let Some(slot) = storage_for_loads.existing(&event.map_name) else {
                        continue;
                    };
                    let entries = { slot.read().snapshot_entries() };
                    tracing::debug!(
                        map = %event.map_name,
                        entries = entries.len(),
                        "re-evaluating subscriptions after load"
                    );
                    for (key, value) in entries {
                        let timestamp = { slot.read().timestamp_of(&key) }
                            .unwrap_or_else(squall_core::Timestamp::zero);
                        let updates = queries_for_loads.updates_for_write(
                            &event.map_name,
                            &key,
                            Some(&value),
                            &search_for_loads,
                        );
                        subs_for_loads.route_updates(&key, &timestamp, updates);
                    }
                }
            });
        }

        // Background correctness machinery.
        let gc = Arc::new(GcService::new(
            config.node_id.clone(),
            hlc.clone(),
            config.gc_age_ms,
            config.gc_grace_ms,
            storage.clone(),
            partitions.clone(),
            replication.clone(),
            queries.clone(),
            search.clone(),
            subs.clone(),
        ));
        tokio::spawn(Arc::clone(&gc).run(
            config.gc_interval_ms,
            cluster.clone(),
            shutdown.clone(),
        ));
        let antientropy = Arc::new(AntiEntropy::new(storage.clone(), cluster.clone()));
        tokio::spawn(Arc::clone(&antientropy).run(
            config.anti_entropy_interval_ms,
            cluster.clone(),
            shutdown.clone(),
        ));

        // Client frontend.
        let ws_state = WsState {
            config: config.clone(),
            auth,
            registry: connections,
            ops: ops.clone(),
            subs: subs.clone(),
            storage: storage.clone(),
            gc: gc.clone(),
            rate_limiter,
            cluster: cluster.clone(),
            lifecycle: lifecycle.clone(),
        };
        let client_listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|err| GridError::Fatal(format!("client listener: {err}")))?;
        let client_addr = client_listener
            .local_addr()
            .map_err(|err| GridError::Fatal(format!("client listener: {err}")))?;
        tokio::spawn(ws::serve(ws_state.clone(), client_listener, shutdown.clone()));
        tokio::spawn(ws::run_sweeper(ws_state.clone(), shutdown.clone()));

        let node = Arc::new(Self {
            config,
            lifecycle,
            cluster,
            replication,
            storage,
            partitions,
            queries,
            search,
            subs,
            gc,
            antientropy,
            ws_state,
            client_addr,
            cluster_addr,
        });

        tokio::spawn(Arc::clone(&node).route_peer_messages(peer_rx, ops));
        tokio::spawn(Arc::clone(&node).watch_membership());

        node.lifecycle.set_ready();
        tracing::info!(
            node_id = %node.config.node_id,
            client = %node.client_addr,
            cluster = %node.cluster_addr,
            "node started"
        );
        Ok(node)
    }

    /// Address of the client WebSocket listener.
    #[must_use]
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Address of the cluster listener.
    #[must_use]
    pub fn cluster_addr(&self) -> SocketAddr {
        self.cluster_addr
    }

    /// The lifecycle controller, for health probes and shutdown signals.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Graceful shutdown in dependency order.
    pub async fn shutdown(&self) {
        tracing::info!(node_id = %self.config.node_id, "shutdown started");
        // 1. Tell clients, stop accepting, let in-flight work drain.
        self.lifecycle.trigger_shutdown();
        ws::broadcast_shutdown(&self.ws_state, 2_000);
        self.lifecycle.wait_for_drain(Duration::from_secs(2)).await;

        // 2. Flush what replication still holds, bounded.
        let flushed = self.replication.flush_now();
        if flushed > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // 3. Tell peers and close cluster connections.
        self.cluster.shutdown().await;
        // Brief pause for peers to reassign ownership before sockets vanish.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 4. Storage closes last.
        if let Err(err) = self.storage.close().await {
            tracing::error!(error = %err, "storage close failed");
        }
        tracing::info!(node_id = %self.config.node_id, "shutdown complete");
    }

    async fn route_peer_messages(
        self: Arc<Self>,
        mut peer_rx: mpsc::Receiver<InboundPeerMessage>,
        ops: Arc<OperationHandler>,
    ) {
        while let Some(inbound) = peer_rx.recv().await {
            let from = inbound.from;
            match inbound.message {
                PeerMessage::OpForward { ops: forwarded, .. } => {
                    let acked = ops.handle_forwarded(&from, forwarded).await;
                    if !acked.is_empty() {
                        self.cluster.send(
                            &from,
                            PeerMessage::OpAckCluster {
                                from: self.config.node_id.clone(),
                                op_ids: acked,
                            },
                        );
                    }
                }
                PeerMessage::OpAckCluster { op_ids, .. } => {
                    self.replication.on_ack(&from, &op_ids);
                }
                PeerMessage::ClusterSubRegister { registration } => {
                    let ack =
                        register_replica(&self.queries, &self.storage, &self.search, registration)
                            .await;
                    self.cluster.send(&from, ack);
                }
                PeerMessage::ClusterSubAck {
                    subscription_id,
                    from: acker,
                    success,
                    initial_query,
                    initial_search,
                    total_hits,
                } => {
                    self.subs.on_sub_ack(
                        &acker,
                        &subscription_id,
                        success,
                        initial_query,
                        initial_search,
                        total_hits,
                    );
                }
                PeerMessage::ClusterSubUpdate {
                    subscription_id,
                    key,
                    value,
                    timestamp,
                    score,
                    ..
                } => {
                    self.subs
                        .on_sub_update(&subscription_id, &key, value, timestamp, score);
                }
                PeerMessage::ClusterSubUnregister { subscription_id } => {
                    self.queries.unregister(&subscription_id);
                }
                PeerMessage::ClusterQueryExec { request_id, from: requester, map_name, query } => {
                    let slot = self.storage.get_map_async(&map_name, MapKindHint::Lww).await;
                    let results = evaluate_initial(&slot.read(), &query);
                    self.cluster.send(
                        &requester,
                        PeerMessage::ClusterQueryResult {
                            request_id,
                            from: self.config.node_id.clone(),
                            results,
                        },
                    );
                }
                PeerMessage::ClusterQueryResult { request_id, .. } => {
                    // Scatter-gather initiation travels through subscription
                    // registration acks; a bare result has no waiter here.
                    tracing::debug!(request_id = %request_id, "unsolicited cluster query result");
                }
                PeerMessage::ClusterGcHint { node_id, last_active } => {
                    self.gc
                        .report_activity(ActivitySource::Peer, &node_id, last_active);
                }
                PeerMessage::PartitionMapUpdate { map } => {
                    self.partitions.adopt_remote(map);
                }
                repair @ (PeerMessage::SyncInit { .. }
                | PeerMessage::SyncRoot { .. }
                | PeerMessage::MerkleReqBucket { .. }
                | PeerMessage::MerkleRespBucket { .. }
                | PeerMessage::DiffRequest { .. }
                | PeerMessage::DiffResponse { .. }) => {
                    for reply in self.antientropy.handle(&from, repair).await {
                        self.cluster.send(&from, reply);
                    }
                }
                other => {
                    tracing::debug!(from = %from, message = ?other, "unrouted peer message");
                }
            }
        }
    }

    async fn watch_membership(self: Arc<Self>) {
        let mut events = self.cluster.subscribe();
        while let Ok(event) = events.recv().await {
            match &event {
                ClusterEvent::MemberJoined(id) => {
                    tracing::info!(member = %id, "member joined");
                }
                ClusterEvent::MemberLeft(id) => {
                    tracing::info!(member = %id, "member left");
                    self.replication.on_peer_left(id);
                    self.subs.on_member_left(id);
                    let dropped = self.queries.drop_coordinator(id);
                    if dropped > 0 {
                        tracing::debug!(member = %id, dropped, "dropped replica subscriptions");
                    }
                    self.gc.forget(ActivitySource::Peer, id);
                }
            }

            // Ownership moved either way: recompute, publish, and pull the
            // partitions that now belong here from their previous owners.
            let plan = self.partitions.rebalance(&self.cluster.member_ids());
            let map = self.partitions.current();
            self.cluster
                .broadcast(&PeerMessage::PartitionMapUpdate { map: (*map).clone() });
            for task in plan {
                if task.destination == self.config.node_id && task.source != self.config.node_id {
                    self.antientropy.start_round(&task.source);
                }
            }
        }
    }
}
