//! Operation handler: the write path.
//!
//! Every client op runs the same pipeline: rate limit → authorize →
//! interceptors → striped local apply (CRDT merge + index + subscription
//! notify + persist) → replication enqueue → write-concern wait → `OP_ACK`.
//! Batches are idempotent by op id: a replayed prefix is absorbed and the
//! ack's `last_id` reports the highest id accepted either way.
//!
//! Ops forwarded by peers re-enter below the client-facing stages: they are
//! already authorized and already replicated, so they only apply locally and
//! are acknowledged per op id.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use squall_core::protocol::peer::ReplicatedOp;
use squall_core::protocol::{ClientOp, Consistency, OpBody, ServerMessage};
use squall_core::Hlc;
use tokio::sync::oneshot;

use crate::auth::{Authenticator, Principal};
use crate::config::MapAction;
use crate::error::GridError;
use crate::interceptor::{InterceptorChain, OpContext, RateLimiter};
use crate::partitions::PartitionService;
use crate::queries::QueryRegistry;
use crate::replication::{acks_needed, ReplicationPipeline};
use crate::search::SearchService;
use crate::storage::{MapKindHint, StorageManager};
use crate::stripes::StripedExecutor;
use crate::subs::SubscriptionCoordinator;

/// The assembled write pipeline.
pub struct OperationHandler {
    hlc: Hlc,
    default_consistency: Consistency,
    write_ack_timeout: Duration,
    auth: Arc<Authenticator>,
    rate_limiter: Arc<RateLimiter>,
    interceptors: InterceptorChain,
    stripes: Arc<StripedExecutor>,
    storage: Arc<StorageManager>,
    partitions: Arc<PartitionService>,
    replication: Arc<ReplicationPipeline>,
    registry: Arc<QueryRegistry>,
    search: Arc<SearchService>,
    subs: Arc<SubscriptionCoordinator>,
    /// Highest op id applied per client, for batch idempotency.
    last_applied: DashMap<String, u64>,
}

impl OperationHandler {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        hlc: Hlc,
        default_consistency: Consistency,
        write_ack_timeout: Duration,
        auth: Arc<Authenticator>,
        rate_limiter: Arc<RateLimiter>,
        interceptors: InterceptorChain,
        stripes: Arc<StripedExecutor>,
        storage: Arc<StorageManager>,
        partitions: Arc<PartitionService>,
        replication: Arc<ReplicationPipeline>,
        registry: Arc<QueryRegistry>,
        search: Arc<SearchService>,
        subs: Arc<SubscriptionCoordinator>,
    ) -> Self {
        Self {
            hlc,
            default_consistency,
            write_ack_timeout,
            auth,
            rate_limiter,
            interceptors,
            stripes,
            storage,
            partitions,
            replication,
            registry,
            search,
            subs,
            last_applied: DashMap::new(),
        }
    }

    /// Handles a single `CLIENT_OP`.
    ///
    /// # Errors
    ///
    /// Returns the pipeline stage's [`GridError`]; the caller projects it
    /// onto the wire.
    pub async fn handle_op(
        &self,
        client_id: &str,
        principal: &Principal,
        op: ClientOp,
    ) -> Result<ServerMessage, GridError> {
        let mut failed_nodes = Vec::new();
        let last_id = self
            .process_one(client_id, principal, op, &mut failed_nodes)
            .await?;
        Ok(ServerMessage::OpAck { last_id, failed_nodes })
    }

    /// Handles an `OP_BATCH`: ops apply in order, replayed ids are absorbed,
    /// and one ack reports the highest id accepted.
    ///
    /// # Errors
    ///
    /// Fails fast on the first rejected op; previously applied ops of the
    /// batch stay applied (they are CRDT merges, reapplying them is safe).
    pub async fn handle_batch(
        &self,
        client_id: &str,
        principal: &Principal,
        ops: Vec<ClientOp>,
    ) -> Result<ServerMessage, GridError> {
        let mut failed_nodes = Vec::new();
        let mut last_id = None;
        for op in ops {
            let applied = self
                .process_one(client_id, principal, op, &mut failed_nodes)
                .await?;
            last_id = last_id.max(applied);
        }
        failed_nodes.sort();
        failed_nodes.dedup();
        Ok(ServerMessage::OpAck { last_id, failed_nodes })
    }

    /// Applies ops forwarded by a peer owner; returns the acknowledged ids.
    pub async fn handle_forwarded(&self, from: &str, ops: Vec<ReplicatedOp>) -> Vec<u64> {
        let mut acked = Vec::with_capacity(ops.len());
        for op in ops {
            if let Some(timestamp) = op.op.timestamp() {
                let _ = self.hlc.observe(timestamp);
            }
            match self.apply_local(&op.map_name, &op.key, op.op).await {
                Ok(()) => acked.push(op.op_id),
                Err(err) => {
                    tracing::warn!(
                        peer = from,
                        map = %op.map_name,
                        key = %op.key,
                        error = %err,
                        "forwarded op rejected"
                    );
                }
            }
        }
        acked
    }

    async fn process_one(
        &self,
        client_id: &str,
        principal: &Principal,
        op: ClientOp,
        failed_nodes: &mut Vec<String>,
    ) -> Result<Option<u64>, GridError> {
        self.rate_limiter.check(client_id)?;

        if op.map_name.is_empty() || op.key.is_empty() {
            return Err(GridError::Validation("mapName and key must be set".to_string()));
        }
        self.auth
            .authorize(principal, &op.map_name, MapAction::Write)?;

        let ctx = OpContext { client_id, principal };
        let Some(op) = self.interceptors.run(&ctx, op)? else {
            // Deliberate interceptor drop: acknowledged, never applied.
            return Ok(None);
        };

        // Replayed batch suffix: absorb without re-applying.
        if let Some(id) = op.id {
            let seen = self.last_applied.get(client_id).map(|v| *v);
            if seen.is_some_and(|high| id <= high) {
                return Ok(Some(id));
            }
        }

        if let Some(timestamp) = op.op.timestamp() {
            let _ = self.hlc.observe(timestamp);
        }

        let consistency = op.consistency.unwrap_or(self.default_consistency);
        let targets = self.partitions.replica_targets_for_key(&op.key);
        let body_for_replication = op.op.clone();

        self.apply_local(&op.map_name, &op.key, op.op).await?;
        metrics::counter!("squall_ops_applied_total").increment(1);

        if let Some(id) = op.id {
            self.last_applied
                .entry(client_id.to_string())
                .and_modify(|high| *high = (*high).max(id))
                .or_insert(id);
        }

        if !targets.is_empty() {
            let op_id =
                self.replication
                    .enqueue(&targets, &op.map_name, &op.key, &body_for_replication);
            let needed = acks_needed(consistency, targets.len());
            if needed > 0 {
                let rx = self.replication.register_waiter(op_id, &targets, needed);
                let deadline = op
                    .timeout_ms
                    .map_or(self.write_ack_timeout, Duration::from_millis);
                let outcome = match tokio::time::timeout(deadline, rx).await {
                    Ok(Ok(outcome)) => outcome,
                    _ => self.replication.take_partial(op_id),
                };
                failed_nodes.extend(outcome.failed);
            }
        }

        Ok(op.id)
    }

    /// The striped local apply: CRDT merge, index, subscriptions, persist.
    async fn apply_local(
        &self,
        map_name: &str,
        key: &str,
        body: OpBody,
    ) -> Result<(), GridError> {
        let hint = match body {
            OpBody::Put { .. } => MapKindHint::Lww,
            OpBody::OrAdd { .. } | OpBody::OrRemove { .. } => MapKindHint::Or,
        };
        let storage = Arc::clone(&self.storage);
        let registry = Arc::clone(&self.registry);
        let search = Arc::clone(&self.search);
        let subs = Arc::clone(&self.subs);
        let map_name_owned = map_name.to_string();
        let key_owned = key.to_string();

        let (done_tx, done_rx) = oneshot::channel::<Result<(), GridError>>();
        let job = Box::pin(async move {
            let slot = storage.get_map(&map_name_owned, hint);
            let applied = slot.write().apply_body(&key_owned, body);
            let result = match applied {
                Ok(outcome) => {
                    search.on_write(&map_name_owned, &key_owned, outcome.live.as_ref());
                    let updates = registry.updates_for_write(
                        &map_name_owned,
                        &key_owned,
                        outcome.live.as_ref(),
                        &search,
                    );
                    subs.route_updates(&key_owned, &outcome.timestamp, updates);
                    let event = ServerMessage::ServerEvent {
                        map_name: map_name_owned.clone(),
                        key: key_owned.clone(),
                        event: outcome.event,
                        record: slot.read().lww_record(&key_owned),
                    };
                    subs.broadcast_map_event(&map_name_owned, &event);
                    if let Err(err) = storage.persist_key(&map_name_owned, &key_owned).await {
                        tracing::error!(
                            map = %map_name_owned,
                            key = %key_owned,
                            error = %err,
                            "persist failed after apply"
                        );
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            };
            let _ = done_tx.send(result);
        });

        self.stripes.submit(map_name, key, job).await?;
        done_rx
            .await
            .map_err(|_| GridError::Fatal("apply job dropped".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use squall_core::protocol::peer::PeerMessage;
    use squall_core::protocol::SearchQuery;
    use squall_core::{LwwRecord, SystemClock, Timestamp, Value};

    use super::*;
    use crate::config::{BackpressureConfig, RateLimitConfig, ReplicationConfig};
    use crate::replication::PeerSender;
    use crate::storage::MemoryStore;
    use crate::subs::ClientSink;

    struct RecordingPeers {
        sent: Mutex<Vec<(String, PeerMessage)>>,
    }

    impl PeerSender for RecordingPeers {
        fn send_peer(&self, node_id: &str, message: PeerMessage) -> bool {
            self.sent.lock().push((node_id.to_string(), message));
            true
        }
    }

    struct NullClients;
    impl ClientSink for NullClients {
        fn deliver(&self, _connection: u64, _message: ServerMessage) -> bool {
            true
        }
    }

    struct Fixture {
        handler: OperationHandler,
        replication: Arc<ReplicationPipeline>,
        peers: Arc<RecordingPeers>,
        storage: Arc<StorageManager>,
        principal: Principal,
    }

    fn fixture(members: &[&str], rate: RateLimitConfig) -> Fixture {
        let node_id = "node-a";
        let hlc = Hlc::new(node_id, Arc::new(SystemClock));
        let peers = Arc::new(RecordingPeers { sent: Mutex::new(Vec::new()) });
        let storage = Arc::new(StorageManager::new(hlc.clone(), Arc::new(MemoryStore::new())));
        let partitions = Arc::new(PartitionService::new(node_id, 1));
        let member_ids: Vec<String> = members.iter().map(|s| (*s).to_string()).collect();
        if !member_ids.is_empty() {
            partitions.rebalance(&member_ids);
        }
        let replication = Arc::new(ReplicationPipeline::new(
            node_id,
            ReplicationConfig::default(),
            peers.clone(),
        ));
        let registry = Arc::new(QueryRegistry::new());
        let search = Arc::new(SearchService::new(std::collections::HashMap::new(), 60.0));
        let subs = Arc::new(SubscriptionCoordinator::new(
            node_id,
            Duration::from_millis(200),
            peers.clone(),
            Arc::new(NullClients),
            registry.clone(),
            search.clone(),
            partitions.clone(),
            storage.clone(),
        ));
        let auth = Arc::new(Authenticator::new(&crate::config::AuthConfig::default(), vec![]));
        let handler = OperationHandler::new(
            hlc,
            Consistency::Eventual,
            Duration::from_millis(200),
            auth,
            Arc::new(RateLimiter::new(rate, Arc::new(SystemClock))),
            InterceptorChain::new(),
            StripedExecutor::new(&crate::config::WorkerPoolConfig::default(), &BackpressureConfig::default()),
            storage.clone(),
            partitions,
            replication.clone(),
            registry,
            search,
            subs,
        );
        Fixture {
            handler,
            replication,
            peers,
            storage,
            principal: Principal { user_id: "u".into(), roles: vec![] },
        }
    }

    fn put_op(id: Option<u64>, key: &str, value: i64, millis: u64) -> ClientOp {
        ClientOp {
            id,
            map_name: "users".into(),
            key: key.into(),
            op: OpBody::Put {
                record: LwwRecord::live(Value::Int(value), Timestamp::new(millis, 0, "client"), None),
            },
            consistency: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn eventual_write_applies_and_acks_immediately() {
        let f = fixture(&[], RateLimitConfig::default());
        let ack = f
            .handler
            .handle_op("c1", &f.principal, put_op(Some(1), "k", 7, 100))
            .await
            .unwrap();
        assert_eq!(
            ack,
            ServerMessage::OpAck { last_id: Some(1), failed_nodes: vec![] }
        );
        let slot = f.storage.get_map_async("users", MapKindHint::Lww).await;
        assert_eq!(slot.read().live_value("k"), Some(Value::Int(7)));
    }

    #[tokio::test]
    async fn validation_rejects_empty_names() {
        let f = fixture(&[], RateLimitConfig::default());
        let mut op = put_op(None, "k", 1, 100);
        op.map_name = String::new();
        let err = f.handler.handle_op("c1", &f.principal, op).await;
        assert!(matches!(err, Err(GridError::Validation(_))));
    }

    #[tokio::test]
    async fn rate_limit_rejects_with_distinct_error() {
        let f = fixture(&[], RateLimitConfig { window_ms: 60_000, max_ops: 1 });
        f.handler
            .handle_op("c1", &f.principal, put_op(Some(1), "k", 1, 100))
            .await
            .unwrap();
        let err = f
            .handler
            .handle_op("c1", &f.principal, put_op(Some(2), "k", 2, 200))
            .await;
        assert!(matches!(err, Err(GridError::RateLimit { .. })));
    }

    #[tokio::test]
    async fn replayed_batch_is_absorbed_with_same_last_id() {
        let f = fixture(&["node-a", "node-b"], RateLimitConfig::default());
        let batch = vec![
            put_op(Some(1), "a", 1, 100),
            put_op(Some(2), "b", 2, 110),
            put_op(Some(3), "c", 3, 120),
        ];

        let first = f
            .handler
            .handle_batch("c1", &f.principal, batch.clone())
            .await
            .unwrap();
        let ServerMessage::OpAck { last_id: Some(3), .. } = first else {
            panic!("expected last_id 3, got {first:?}");
        };
        let enqueued_after_first = f.replication.total_pending();
        assert!(enqueued_after_first > 0, "replicated writes are queued");

        // The exact same batch again: absorbed, same last_id, nothing new queued.
        let second = f
            .handler
            .handle_batch("c1", &f.principal, batch)
            .await
            .unwrap();
        let ServerMessage::OpAck { last_id: Some(3), .. } = second else {
            panic!("expected last_id 3, got {second:?}");
        };
        assert_eq!(f.replication.total_pending(), enqueued_after_first);
    }

    #[tokio::test]
    async fn batch_replays_only_the_unseen_suffix() {
        let f = fixture(&[], RateLimitConfig::default());
        f.handler
            .handle_batch(
                "c1",
                &f.principal,
                vec![put_op(Some(1), "a", 1, 100), put_op(Some(2), "b", 2, 110)],
            )
            .await
            .unwrap();
        // Overlapping resend with one new op.
        let ack = f
            .handler
            .handle_batch(
                "c1",
                &f.principal,
                vec![put_op(Some(2), "b", 2, 110), put_op(Some(3), "c", 3, 120)],
            )
            .await
            .unwrap();
        assert_eq!(
            ack,
            ServerMessage::OpAck { last_id: Some(3), failed_nodes: vec![] }
        );
        let slot = f.storage.get_map_async("users", MapKindHint::Lww).await;
        assert_eq!(slot.read().live_value("c"), Some(Value::Int(3)));
    }

    #[tokio::test]
    async fn quorum_write_reports_failed_nodes_on_timeout() {
        let f = fixture(&["node-a", "node-b"], RateLimitConfig::default());
        // Find a key with at least one remote replica target.
        let key = (0..10_000)
            .map(|i| format!("probe-{i}"))
            .find(|k| !f.handler.partitions.replica_targets_for_key(k).is_empty())
            .expect("some key has a remote replica");

        let mut op = put_op(Some(1), &key, 1, 100);
        op.consistency = Some(Consistency::Quorum);
        op.timeout_ms = Some(100);

        let ack = f.handler.handle_op("c1", &f.principal, op).await.unwrap();
        let ServerMessage::OpAck { failed_nodes, .. } = ack else {
            panic!("expected OpAck");
        };
        assert_eq!(failed_nodes, vec!["node-b".to_string()]);
    }

    #[tokio::test]
    async fn quorum_write_succeeds_when_acks_arrive() {
        let f = fixture(&["node-a", "node-b"], RateLimitConfig::default());
        let key = (0..10_000)
            .map(|i| format!("probe-{i}"))
            .find(|k| f.handler.partitions.replica_targets_for_key(k) == vec!["node-b".to_string()])
            .expect("some key replicates to node-b only");

        let mut op = put_op(Some(1), &key, 1, 100);
        op.consistency = Some(Consistency::Quorum);

        let handler_fut = f.handler.handle_op("c1", &f.principal, op);
        let acker = async {
            // Let the op enqueue, flush it, then ack each forwarded op id.
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.replication.flush_now();
            let op_ids: Vec<u64> = f
                .peers
                .sent
                .lock()
                .iter()
                .filter_map(|(_, msg)| match msg {
                    PeerMessage::OpForward { ops, .. } => {
                        Some(ops.iter().map(|o| o.op_id).collect::<Vec<_>>())
                    }
                    _ => None,
                })
                .flatten()
                .collect();
            f.replication.on_ack("node-b", &op_ids);
        };
        let (ack, ()) = tokio::join!(handler_fut, acker);
        let ServerMessage::OpAck { failed_nodes, .. } = ack.unwrap() else {
            panic!("expected OpAck");
        };
        assert!(failed_nodes.is_empty());
    }

    #[tokio::test]
    async fn forwarded_ops_apply_and_ack_by_id() {
        let f = fixture(&[], RateLimitConfig::default());
        let ops = vec![
            ReplicatedOp {
                op_id: 11,
                map_name: "users".into(),
                key: "k1".into(),
                op: OpBody::Put {
                    record: LwwRecord::live(Value::Int(1), Timestamp::new(50, 0, "peer"), None),
                },
            },
            ReplicatedOp {
                op_id: 12,
                map_name: "users".into(),
                key: "k2".into(),
                op: OpBody::Put {
                    record: LwwRecord::live(Value::Int(2), Timestamp::new(51, 0, "peer"), None),
                },
            },
        ];
        let acked = f.handler.handle_forwarded("node-b", ops).await;
        assert_eq!(acked, vec![11, 12]);
        let slot = f.storage.get_map_async("users", MapKindHint::Lww).await;
        assert_eq!(slot.read().live_value("k1"), Some(Value::Int(1)));
    }

    #[tokio::test]
    async fn search_index_follows_writes_through_the_pipeline() {
        let node_id = "node-a";
        let hlc = Hlc::new(node_id, Arc::new(SystemClock));
        let peers = Arc::new(RecordingPeers { sent: Mutex::new(Vec::new()) });
        let storage = Arc::new(StorageManager::new(hlc.clone(), Arc::new(MemoryStore::new())));
        let partitions = Arc::new(PartitionService::new(node_id, 1));
        let replication = Arc::new(ReplicationPipeline::new(
            node_id,
            ReplicationConfig::default(),
            peers.clone(),
        ));
        let registry = Arc::new(QueryRegistry::new());
        let search = Arc::new(SearchService::new(
            std::collections::HashMap::from([(
                "docs".to_string(),
                vec!["title".to_string()],
            )]),
            60.0,
        ));
        let subs = Arc::new(SubscriptionCoordinator::new(
            node_id,
            Duration::from_millis(200),
            peers.clone(),
            Arc::new(NullClients),
            registry.clone(),
            search.clone(),
            partitions.clone(),
            storage.clone(),
        ));
        let handler = OperationHandler::new(
            hlc,
            Consistency::Eventual,
            Duration::from_millis(200),
            Arc::new(Authenticator::new(&crate::config::AuthConfig::default(), vec![])),
            Arc::new(RateLimiter::new(RateLimitConfig::default(), Arc::new(SystemClock))),
            InterceptorChain::new(),
            StripedExecutor::new(&crate::config::WorkerPoolConfig::default(), &BackpressureConfig::default()),
            storage,
            partitions,
            replication,
            registry,
            search.clone(),
            subs,
        );

        let mut fields = std::collections::BTreeMap::new();
        fields.insert("title".to_string(), Value::from("merkle repair"));
        let op = ClientOp {
            id: Some(1),
            map_name: "docs".into(),
            key: "d1".into(),
            op: OpBody::Put {
                record: LwwRecord::live(Value::Map(fields), Timestamp::new(10, 0, "c"), None),
            },
            consistency: None,
            timeout_ms: None,
        };
        let principal = Principal { user_id: "u".into(), roles: vec![] };
        handler.handle_op("c1", &principal, op).await.unwrap();

        let (hits, total) = search.search(
            "docs",
            &SearchQuery { text: "merkle".into(), limit: None },
        );
        assert_eq!(total, 1);
        assert_eq!(hits[0].key, "d1");
    }
}
