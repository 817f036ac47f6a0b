//! Cluster manager: peer connections, membership gossip, failure detection.
//!
//! Peers speak [`PeerMessage`] frames over TCP. Membership is a versioned
//! view gossiped on every change and on a heartbeat cadence; higher versions
//! replace lower ones. To avoid duplicate simultaneous connects, the side
//! with the lexicographically lower node id initiates (`should_initiate`),
//! and a handshake landing on an already-connected peer is dropped.
//!
//! Failure detection is deadline-based: a peer silent for `peer_timeout_ms`
//! is disconnected and announced as left, exactly once. A graceful
//! `NODE_LEAVING` shortcuts the deadline.

pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use squall_core::protocol;
use squall_core::protocol::peer::{MemberInfo, MembersView, PeerMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{Discovery, NodeConfig};
use transport::PeerFramed;

/// Cluster protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Membership change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    MemberJoined(String),
    MemberLeft(String),
}

/// A peer message delivered to the node's router.
#[derive(Debug)]
pub struct InboundPeerMessage {
    pub from: String,
    pub message: PeerMessage,
}

/// Whether the local node is responsible for dialing `other`.
///
/// The Low-ID Initiator Policy: the lexicographically smaller node id dials,
/// the larger one accepts.
#[must_use]
pub fn should_initiate(local_id: &str, other_id: &str) -> bool {
    local_id < other_id
}

struct PeerHandle {
    member: MemberInfo,
    tx: mpsc::Sender<PeerMessage>,
    last_seen_ms: AtomicU64,
    reader: JoinHandle<()>,
}

/// Peer discovery, connections, and membership for one node.
pub struct ClusterManager {
    local: MemberInfo,
    cluster_name: String,
    seeds: Vec<String>,
    discovery: Discovery,
    peer_timeout: Duration,
    gossip_interval: Duration,
    members: RwLock<MembersView>,
    peers: DashMap<String, Arc<PeerHandle>>,
    events_tx: broadcast::Sender<ClusterEvent>,
    inbound_tx: mpsc::Sender<InboundPeerMessage>,
    epoch: Instant,
    shutdown: watch::Receiver<bool>,
}

impl ClusterManager {
    /// Creates a manager; the returned receiver yields routed peer messages.
    #[must_use]
    pub fn new(
        config: &NodeConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, mpsc::Receiver<InboundPeerMessage>) {
        let local = MemberInfo {
            node_id: config.node_id.clone(),
            host: config.host.clone(),
            cluster_port: config.cluster_port,
            client_port: config.port,
        };
        let (events_tx, _) = broadcast::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(4_096);
        let manager = Arc::new(Self {
            members: RwLock::new(MembersView { version: 1, members: vec![local.clone()] }),
            local,
            cluster_name: config.cluster_name.clone(),
            seeds: config.peers.clone(),
            discovery: config.discovery,
            peer_timeout: Duration::from_millis(config.peer_timeout_ms),
            gossip_interval: Duration::from_millis(config.heartbeat_interval_ms),
            peers: DashMap::new(),
            events_tx,
            inbound_tx,
            epoch: Instant::now(),
            shutdown,
        });
        (manager, inbound_rx)
    }

    /// This node's advertised member record.
    #[must_use]
    pub fn local_member(&self) -> &MemberInfo {
        &self.local
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.local.node_id
    }

    /// Snapshot of the current membership view (self included).
    #[must_use]
    pub fn members(&self) -> MembersView {
        self.members.read().clone()
    }

    /// Sorted node ids of every known member.
    #[must_use]
    pub fn member_ids(&self) -> Vec<String> {
        self.members.read().node_ids()
    }

    /// Node ids of peers with a live connection.
    #[must_use]
    pub fn connected_peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Subscribes to membership change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events_tx.subscribe()
    }

    /// Binds the cluster listener and starts discovery and the sweeper.
    ///
    /// Returns the bound address (useful when configured with port 0).
    ///
    /// # Errors
    ///
    /// Returns the bind error; a node that cannot listen is fatal.
    pub async fn start(this: &Arc<Self>) -> std::io::Result<std::net::SocketAddr> {
        let listener =
            TcpListener::bind(("0.0.0.0", this.local.cluster_port)).await?;
        let addr = listener.local_addr()?;
        Self::start_with_listener(this, listener);
        Ok(addr)
    }

    /// Starts the manager over a pre-bound listener.
    pub fn start_with_listener(this: &Arc<Self>, listener: TcpListener) {
        let accept = Arc::clone(this);
        tokio::spawn(async move { accept.accept_loop(listener).await });

        let dialer = Arc::clone(this);
        tokio::spawn(async move { dialer.discovery_loop().await });

        let sweeper = Arc::clone(this);
        tokio::spawn(async move { sweeper.sweep_loop().await });
    }

    /// Enqueues a unicast message; `false` when the peer is unknown or its
    /// outbound queue is full.
    pub fn send(&self, node_id: &str, message: PeerMessage) -> bool {
        let Some(peer) = self.peers.get(node_id) else {
            return false;
        };
        match peer.tx.try_send(message) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(peer = node_id, error = %err, "dropping outbound peer message");
                false
            }
        }
    }

    /// Enqueues a message to every connected peer.
    pub fn broadcast(&self, message: &PeerMessage) {
        for peer in &self.peers {
            let _ = peer.tx.try_send(message.clone());
        }
    }

    /// Announces departure and closes every peer connection.
    pub async fn shutdown(&self) {
        self.broadcast(&PeerMessage::NodeLeaving { node_id: self.local.node_id.clone() });
        // Give the writers a moment to flush the notice.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ids: Vec<String> = self.connected_peer_ids();
        for id in ids {
            self.drop_peer(&id, true);
        }
    }

    // ---- connection establishment ----

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(err) =
                                    Self::handshake_inbound(&manager, stream).await
                                {
                                    tracing::debug!(%addr, error = %err, "inbound handshake failed");
                                }
                            });
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "cluster accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn handshake_inbound(
        this: &Arc<Self>,
        stream: TcpStream,
    ) -> Result<(), transport::TransportError> {
        let mut framed = transport::frame(stream);
        let hello = tokio::time::timeout(Duration::from_secs(5), transport::recv(&mut framed))
            .await
            .map_err(|_| transport::TransportError::Closed)??;

        let PeerMessage::ClusterHello { member, cluster_name, protocol_version } = hello else {
            return Err(transport::TransportError::Closed);
        };
        if cluster_name != this.cluster_name || protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                peer = %member.node_id,
                cluster = %cluster_name,
                "rejecting peer from foreign cluster"
            );
            return Err(transport::TransportError::Closed);
        }

        transport::send(
            &mut framed,
            &PeerMessage::ClusterHelloAck { member: this.local.clone(), view: this.members() },
        )
        .await?;

        Self::register_peer(this, member, framed);
        Ok(())
    }

    async fn connect_to(this: &Arc<Self>, addr: &str) -> Result<(), transport::TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = transport::frame(stream);
        transport::send(
            &mut framed,
            &PeerMessage::ClusterHello {
                member: this.local.clone(),
                cluster_name: this.cluster_name.clone(),
                protocol_version: PROTOCOL_VERSION,
            },
        )
        .await?;
        let ack = tokio::time::timeout(Duration::from_secs(5), transport::recv(&mut framed))
            .await
            .map_err(|_| transport::TransportError::Closed)??;
        let PeerMessage::ClusterHelloAck { member, view } = ack else {
            return Err(transport::TransportError::Closed);
        };
        let remote_view = view;
        Self::register_peer(this, member, framed);
        Self::integrate_view(this, remote_view);
        Ok(())
    }

    /// Registers a handshaken peer, spawning its reader and writer loops.
    ///
    /// A second connection to an already-registered peer is dropped here,
    /// which together with `should_initiate` keeps one link per pair.
    fn register_peer(this: &Arc<Self>, member: MemberInfo, framed: PeerFramed) {
        if member.node_id == this.local.node_id {
            return;
        }
        if this.peers.contains_key(&member.node_id) {
            tracing::debug!(peer = %member.node_id, "dropping duplicate peer connection");
            return;
        }

        let (tx, mut rx) = mpsc::channel::<PeerMessage>(1_024);
        let (mut sink, mut stream) = framed.split();

        let writer_peer = member.node_id.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let bytes = match protocol::encode(&message) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::error!(peer = %writer_peer, error = %err, "peer encode failed");
                        continue;
                    }
                };
                if sink.send(bytes::Bytes::from(bytes)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_manager = Arc::clone(this);
        let reader_peer = member.node_id.clone();
        let reader = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(frame)) => match protocol::decode::<PeerMessage>(&frame) {
                        Ok(message) => {
                            Self::on_peer_message(&reader_manager, &reader_peer, message).await;
                        }
                        Err(err) => {
                            tracing::warn!(peer = %reader_peer, error = %err, "bad peer frame");
                        }
                    },
                    Some(Err(err)) => {
                        tracing::debug!(peer = %reader_peer, error = %err, "peer read failed");
                        break;
                    }
                    None => break,
                }
            }
            reader_manager.drop_peer(&reader_peer, false);
        });

        let handle = Arc::new(PeerHandle {
            member: member.clone(),
            tx,
            last_seen_ms: AtomicU64::new(this.uptime_ms()),
            reader,
        });
        this.peers.insert(member.node_id.clone(), handle);
        tracing::info!(peer = %member.node_id, "peer connected");
        metrics::gauge!("squall_cluster_peers").set(this.peers.len() as f64);

        this.add_member(member);
    }

    // ---- inbound routing ----

    async fn on_peer_message(this: &Arc<Self>, from: &str, message: PeerMessage) {
        if let Some(peer) = this.peers.get(from) {
            peer.last_seen_ms.store(this.uptime_ms(), Ordering::Relaxed);
        }
        match message {
            PeerMessage::ClusterMembers { view } => Self::integrate_view(this, view),
            PeerMessage::NodeLeaving { node_id } => {
                tracing::info!(peer = %node_id, "peer leaving");
                this.drop_peer(&node_id, true);
            }
            other => {
                let inbound = InboundPeerMessage { from: from.to_string(), message: other };
                if this.inbound_tx.send(inbound).await.is_err() {
                    tracing::warn!("inbound peer channel closed; dropping message");
                }
            }
        }
    }

    // ---- membership ----

    fn add_member(&self, member: MemberInfo) {
        let added = {
            let mut view = self.members.write();
            if view.member(&member.node_id).is_some() {
                false
            } else {
                view.members.push(member.clone());
                view.members.sort_by(|a, b| a.node_id.cmp(&b.node_id));
                view.version += 1;
                true
            }
        };
        if added {
            let _ = self.events_tx.send(ClusterEvent::MemberJoined(member.node_id));
            self.gossip();
        }
    }

    fn remove_member(&self, node_id: &str) {
        let removed = {
            let mut view = self.members.write();
            let before = view.members.len();
            view.members.retain(|m| m.node_id != node_id);
            if view.members.len() != before {
                view.version += 1;
                true
            } else {
                false
            }
        };
        if removed {
            let _ = self.events_tx.send(ClusterEvent::MemberLeft(node_id.to_string()));
            self.gossip();
        }
    }

    /// Merges a gossiped view; higher versions replace the local one.
    fn integrate_view(this: &Arc<Self>, incoming: MembersView) {
        let (joined, left) = {
            let mut view = this.members.write();
            if incoming.version <= view.version {
                return;
            }
            let old_ids = view.node_ids();
            let mut merged = incoming;
            // The local node is always a member of its own view.
            if merged.member(&this.local.node_id).is_none() {
                merged.members.push(this.local.clone());
                merged.version += 1;
            }
            merged.members.sort_by(|a, b| a.node_id.cmp(&b.node_id));
            let new_ids = merged.node_ids();
            *view = merged;

            let joined: Vec<String> =
                new_ids.iter().filter(|id| !old_ids.contains(id)).cloned().collect();
            let left: Vec<String> =
                old_ids.iter().filter(|id| !new_ids.contains(id)).cloned().collect();
            (joined, left)
        };

        for id in &left {
            this.drop_peer(id, true);
            let _ = this.events_tx.send(ClusterEvent::MemberLeft(id.clone()));
        }
        for id in &joined {
            if id != &this.local.node_id {
                let _ = this.events_tx.send(ClusterEvent::MemberJoined(id.clone()));
            }
        }

        // Dial newly-learned members we are responsible for.
        let to_dial: Vec<MemberInfo> = {
            let view = this.members.read();
            view.members
                .iter()
                .filter(|m| {
                    m.node_id != this.local.node_id
                        && !this.peers.contains_key(&m.node_id)
                        && should_initiate(&this.local.node_id, &m.node_id)
                })
                .cloned()
                .collect()
        };
        for member in to_dial {
            let manager = Arc::clone(this);
            tokio::spawn(async move {
                let addr = format!("{}:{}", member.host, member.cluster_port);
                if let Err(err) = Self::connect_to(&manager, &addr).await {
                    tracing::debug!(peer = %member.node_id, error = %err, "dial failed");
                }
            });
        }
    }

    fn gossip(&self) {
        let view = self.members();
        self.broadcast(&PeerMessage::ClusterMembers { view });
    }

    // ---- background loops ----

    async fn discovery_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => Self::dial_seeds(&self).await,
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn dial_seeds(this: &Arc<Self>) {
        let connected_addrs: Vec<String> = this
            .peers
            .iter()
            .map(|p| format!("{}:{}", p.member.host, p.member.cluster_port))
            .collect();

        for seed in &this.seeds {
            let addrs: Vec<String> = match this.discovery {
                Discovery::Manual => vec![seed.clone()],
                Discovery::Kubernetes => match tokio::net::lookup_host(seed.as_str()).await {
                    Ok(resolved) => resolved.map(|a| a.to_string()).collect(),
                    Err(err) => {
                        tracing::debug!(seed = %seed, error = %err, "discovery lookup failed");
                        continue;
                    }
                },
            };
            for addr in addrs {
                if connected_addrs.contains(&addr) {
                    continue;
                }
                let manager = Arc::clone(this);
                tokio::spawn(async move {
                    if let Err(err) = Self::connect_to(&manager, &addr).await {
                        tracing::debug!(%addr, error = %err, "seed dial failed");
                    }
                });
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut tick = tokio::time::interval(self.gossip_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    // Gossip doubles as the peer heartbeat.
                    self.gossip();
                    let now = self.uptime_ms();
                    let timeout = self.peer_timeout.as_millis() as u64;
                    let dead: Vec<String> = self
                        .peers
                        .iter()
                        .filter(|p| now.saturating_sub(p.last_seen_ms.load(Ordering::Relaxed)) > timeout)
                        .map(|p| p.key().clone())
                        .collect();
                    for id in dead {
                        tracing::warn!(peer = %id, "peer timed out");
                        self.drop_peer(&id, true);
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Disconnects a peer and, when `announce`, removes it from membership.
    ///
    /// Idempotent: the peer table entry is the once-guard, so `memberLeft`
    /// fires at most once per connection.
    fn drop_peer(&self, node_id: &str, announce: bool) {
        if let Some((_, handle)) = self.peers.remove(node_id) {
            if !handle.reader.is_finished() {
                handle.reader.abort();
            }
            metrics::gauge!("squall_cluster_peers").set(self.peers.len() as f64);
            self.remove_member(node_id);
        } else if announce {
            self.remove_member(node_id);
        }
    }

    fn uptime_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
