//! Client-facing network layer: connection registry, coalescing writer, and
//! the WebSocket frontend.

pub mod writer;
pub mod ws;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use squall_core::protocol::ServerMessage;
use squall_core::Timestamp;
use tokio::sync::mpsc;

use crate::auth::Principal;
use crate::subs::ClientSink;
use writer::Outbound;

/// Mutable per-connection state.
#[derive(Debug)]
pub struct ConnMeta {
    pub authenticated: bool,
    pub principal: Option<Principal>,
    /// Last application-level `PING` received.
    pub last_ping: Instant,
    /// Newest HLC timestamp observed from this client's writes.
    pub last_active_hlc: Option<Timestamp>,
}

impl Default for ConnMeta {
    fn default() -> Self {
        Self {
            authenticated: false,
            principal: None,
            last_ping: Instant::now(),
            last_active_hlc: None,
        }
    }
}

/// One live client connection.
pub struct ClientConnection {
    pub id: u64,
    /// Outbound queue drained by this connection's coalescing writer.
    pub tx: mpsc::Sender<Outbound>,
    pub meta: RwLock<ConnMeta>,
    pub connected_at: Instant,
}

impl ClientConnection {
    /// Stable per-connection client id used for rate limiting and GC
    /// activity tracking.
    #[must_use]
    pub fn client_key(&self) -> String {
        format!("conn-{}", self.id)
    }

    /// Enqueues without blocking; a full queue drops the message (the
    /// subscriber will repair via sync).
    pub fn push(&self, item: Outbound) -> bool {
        self.tx.try_send(item).is_ok()
    }
}

/// Registry of live client connections.
pub struct ConnectionRegistry {
    connections: DashMap<u64, Arc<ClientConnection>>,
    next_id: AtomicU64,
    outbound_capacity: usize,
}

impl ConnectionRegistry {
    /// Creates an empty registry; ids start at 1.
    #[must_use]
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    /// Registers a connection; the receiver feeds its coalescing writer.
    pub fn register(&self) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        let connection = Arc::new(ClientConnection {
            id,
            tx,
            meta: RwLock::new(ConnMeta::default()),
            connected_at: Instant::now(),
        });
        self.connections.insert(id, connection.clone());
        metrics::gauge!("squall_client_connections").set(self.connections.len() as f64);
        (connection, rx)
    }

    /// Removes a connection, returning it if it was present.
    pub fn remove(&self, id: u64) -> Option<Arc<ClientConnection>> {
        let removed = self.connections.remove(&id).map(|(_, c)| c);
        metrics::gauge!("squall_client_connections").set(self.connections.len() as f64);
        removed
    }

    /// Looks up a connection.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<ClientConnection>> {
        self.connections.get(&id).map(|c| c.clone())
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of all connections, for sweeps and broadcasts.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|c| c.clone()).collect()
    }

    /// Sends a message to every authenticated connection; full queues are
    /// skipped rather than blocking the broadcast.
    pub fn broadcast(&self, message: &ServerMessage) {
        for connection in &self.connections {
            if connection.meta.read().authenticated {
                let _ = connection.push(Outbound::Message(message.clone()));
            }
        }
    }
}

impl ClientSink for ConnectionRegistry {
    fn deliver(&self, connection: u64, message: ServerMessage) -> bool {
        self.get(connection)
            .is_some_and(|c| c.push(Outbound::Message(message)))
    }
}
