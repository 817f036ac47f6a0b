//! Replication pipeline: batched write forwarding and ack fan-in.
//!
//! Writes destined for backup owners are queued per peer and flushed as one
//! `OP_FORWARD` frame when the coalescing interval elapses or the batch size
//! threshold is hit — never as per-op broadcasts. Acks flow back per op id;
//! write-concern waiters (`QUORUM` / `ALL`) are completed from them, or
//! resolved partially with `failed_nodes` at the deadline.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use squall_core::protocol::peer::{PeerMessage, ReplicatedOp};
use squall_core::protocol::OpBody;
use tokio::sync::{oneshot, watch, Notify};

/// Outcome of an ack-bound write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Backups that acknowledged in time.
    pub acked: Vec<String>,
    /// Backups that did not.
    pub failed: Vec<String>,
}

/// Abstraction over the cluster transport so the pipeline is testable
/// without sockets.
pub trait PeerSender: Send + Sync {
    /// Enqueues a message toward a peer; `false` when undeliverable.
    fn send_peer(&self, node_id: &str, message: PeerMessage) -> bool;
}

impl PeerSender for crate::cluster::ClusterManager {
    fn send_peer(&self, node_id: &str, message: PeerMessage) -> bool {
        self.send(node_id, message)
    }
}

#[derive(Default)]
struct PeerQueue {
    buf: Mutex<Vec<ReplicatedOp>>,
    in_flight: AtomicUsize,
}

struct Waiter {
    needed: usize,
    remaining: HashSet<String>,
    acked: Vec<String>,
    failed: Vec<String>,
    tx: Option<oneshot::Sender<AckOutcome>>,
}

/// Batches outbound replication and tracks per-op acknowledgements.
pub struct ReplicationPipeline {
    node_id: String,
    config: crate::config::ReplicationConfig,
    sender: Arc<dyn PeerSender>,
    queues: DashMap<String, Arc<PeerQueue>>,
    waiters: DashMap<u64, Mutex<Waiter>>,
    next_op_id: AtomicU64,
    kick: Notify,
}

impl ReplicationPipeline {
    /// Creates a pipeline over the given transport.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        config: crate::config::ReplicationConfig,
        sender: Arc<dyn PeerSender>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            sender,
            queues: DashMap::new(),
            waiters: DashMap::new(),
            next_op_id: AtomicU64::new(1),
            kick: Notify::new(),
        }
    }

    /// Queues one write toward every target peer; returns the assigned op id.
    ///
    /// With replication disabled or no targets the op id is still assigned
    /// (the waiter, if any, resolves trivially).
    pub fn enqueue(&self, targets: &[String], map_name: &str, key: &str, op: &OpBody) -> u64 {
        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        if !self.config.enabled || targets.is_empty() {
            return op_id;
        }
        let mut hit_threshold = false;
        for target in targets {
            let queue = self.queues.entry(target.clone()).or_default().clone();
            let mut buf = queue.buf.lock();
            buf.push(ReplicatedOp {
                op_id,
                map_name: map_name.to_string(),
                key: key.to_string(),
                op: op.clone(),
            });
            if buf.len() >= self.config.max_batch_ops {
                hit_threshold = true;
            }
        }
        metrics::counter!("squall_replication_enqueued_total").increment(targets.len() as u64);
        if hit_threshold {
            self.kick.notify_one();
        }
        op_id
    }

    /// Registers an ack waiter for `op_id`.
    ///
    /// The waiter completes once `needed` of `targets` have acknowledged.
    /// Callers race the returned receiver against their deadline and fall
    /// back to [`take_partial`](Self::take_partial).
    pub fn register_waiter(
        &self,
        op_id: u64,
        targets: &[String],
        needed: usize,
    ) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut waiter = Waiter {
            needed,
            remaining: targets.iter().cloned().collect(),
            acked: Vec::new(),
            failed: Vec::new(),
            tx: Some(tx),
        };
        if Self::try_complete(&mut waiter) {
            return rx;
        }
        self.waiters.insert(op_id, Mutex::new(waiter));
        rx
    }

    /// Resolves a deadline-expired waiter into a partial outcome.
    ///
    /// Everything still unacknowledged is reported in `failed`.
    pub fn take_partial(&self, op_id: u64) -> AckOutcome {
        let Some((_, waiter)) = self.waiters.remove(&op_id) else {
            return AckOutcome::default();
        };
        let mut waiter = waiter.into_inner();
        let mut failed = waiter.failed;
        failed.extend(waiter.remaining.drain());
        failed.sort();
        AckOutcome { acked: waiter.acked, failed }
    }

    /// Processes an `OP_ACK_CLUSTER` from a peer.
    pub fn on_ack(&self, from: &str, op_ids: &[u64]) {
        if let Some(queue) = self.queues.get(from) {
            let completed = op_ids.len().min(queue.in_flight.load(Ordering::Relaxed));
            queue.in_flight.fetch_sub(completed, Ordering::Relaxed);
        }
        for op_id in op_ids {
            let mut fire = false;
            if let Some(entry) = self.waiters.get(op_id) {
                let mut waiter = entry.lock();
                if waiter.remaining.remove(from) {
                    waiter.acked.push(from.to_string());
                }
                fire = Self::try_complete(&mut waiter);
            }
            if fire {
                self.waiters.remove(op_id);
            }
        }
    }

    /// Marks a departed peer as failed in every pending waiter and drops its
    /// queue. Waiters that can no longer reach their quorum resolve
    /// immediately with a partial outcome.
    pub fn on_peer_left(&self, node_id: &str) {
        self.queues.remove(node_id);
        let mut done: Vec<u64> = Vec::new();
        for entry in &self.waiters {
            let mut waiter = entry.value().lock();
            if waiter.remaining.remove(node_id) {
                waiter.failed.push(node_id.to_string());
            }
            if Self::try_complete(&mut waiter) || Self::fail_if_unreachable(&mut waiter) {
                done.push(*entry.key());
            }
        }
        for op_id in done {
            self.waiters.remove(&op_id);
        }
    }

    /// Flushes every queue now. Returns how many ops were shipped.
    ///
    /// A batch whose send fails stays queued and is retried on a later tick;
    /// that is the whole of the transient-peer retry policy.
    pub fn flush_now(&self) -> usize {
        let mut shipped = 0;
        for entry in &self.queues {
            let peer = entry.key().clone();
            let queue = entry.value().clone();
            let batch: Vec<ReplicatedOp> = {
                let buf = queue.buf.lock();
                buf.clone()
            };
            if batch.is_empty() {
                continue;
            }
            let count = batch.len();
            let message = PeerMessage::OpForward { origin: self.node_id.clone(), ops: batch };
            if self.sender.send_peer(&peer, message) {
                // Drop exactly what we shipped; concurrent enqueues appended
                // behind it stay queued.
                queue.buf.lock().drain(..count);
                queue.in_flight.fetch_add(count, Ordering::Relaxed);
                shipped += count;
                metrics::counter!("squall_replication_shipped_total").increment(count as u64);
            } else {
                tracing::debug!(peer = %peer, ops = count, "peer send failed; batch retained");
            }
        }
        shipped
    }

    /// Total ops queued or awaiting ack across all peers.
    #[must_use]
    pub fn total_pending(&self) -> usize {
        self.queues
            .iter()
            .map(|q| q.buf.lock().len() + q.in_flight.load(Ordering::Relaxed))
            .sum()
    }

    /// Healthy iff no peer's backlog exceeds the configured threshold.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.queues
            .iter()
            .all(|q| q.buf.lock().len() + q.in_flight.load(Ordering::Relaxed)
                <= self.config.unhealthy_pending)
    }

    /// Runs the periodic flusher until shutdown, then flushes once more.
    pub async fn run_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.flush_interval_ms.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => { self.flush_now(); }
                _ = self.kick.notified() => { self.flush_now(); }
                _ = shutdown.changed() => {
                    self.flush_now();
                    return;
                }
            }
        }
    }

    fn try_complete(waiter: &mut Waiter) -> bool {
        if waiter.tx.is_some() && waiter.acked.len() >= waiter.needed {
            let outcome = AckOutcome { acked: waiter.acked.clone(), failed: waiter.failed.clone() };
            if let Some(tx) = waiter.tx.take() {
                let _ = tx.send(outcome);
            }
            return true;
        }
        false
    }

    fn fail_if_unreachable(waiter: &mut Waiter) -> bool {
        if waiter.tx.is_some() && waiter.acked.len() + waiter.remaining.len() < waiter.needed {
            let mut failed = waiter.failed.clone();
            failed.sort();
            let outcome = AckOutcome { acked: waiter.acked.clone(), failed };
            if let Some(tx) = waiter.tx.take() {
                let _ = tx.send(outcome);
            }
            return true;
        }
        false
    }

}

/// Backups needed for one write at the given concern.
#[must_use]
pub fn acks_needed(concern: squall_core::protocol::Consistency, replica_count: usize) -> usize {
    use squall_core::protocol::Consistency;
    match concern {
        Consistency::Eventual => 0,
        Consistency::Quorum => (replica_count + 2) / 2, // ceil((R+1)/2)
        Consistency::All => replica_count,
    }
}
