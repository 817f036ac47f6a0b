//! WebSocket frontend: socket lifecycle, auth gating, message dispatch,
//! and the heartbeat sweeper.
//!
//! Each socket gets a registry entry and a coalescing writer. The read loop
//! decodes tagged client messages and dispatches them; the first message
//! must be `AUTH`, and everything else is rejected until it succeeds. The
//! sweeper evicts authenticated clients whose heartbeats stopped (close
//! code 4002) and sockets that never authenticated within the deadline
//! (close code 4000).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use squall_core::protocol::{self, codes, ClientMessage, ServerMessage};
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::writer::{run_writer, FrameSink, Outbound};
use super::{ClientConnection, ConnectionRegistry};
use crate::antientropy;
use crate::auth::Authenticator;
use crate::cluster::ClusterManager;
use crate::config::NodeConfig;
use crate::error::GridError;
use crate::gc::{ActivitySource, GcService};
use crate::interceptor::RateLimiter;
use crate::lifecycle::Lifecycle;
use crate::ops::OperationHandler;
use crate::storage::StorageManager;
use crate::subs::SubscriptionCoordinator;

/// Shared state behind the WebSocket route.
#[derive(Clone)]
pub struct WsState {
    pub config: Arc<NodeConfig>,
    pub auth: Arc<Authenticator>,
    pub registry: Arc<ConnectionRegistry>,
    pub ops: Arc<OperationHandler>,
    pub subs: Arc<SubscriptionCoordinator>,
    pub storage: Arc<StorageManager>,
    pub gc: Arc<GcService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cluster: Arc<ClusterManager>,
    pub lifecycle: Arc<Lifecycle>,
}

/// Builds the client-facing router.
pub fn router(state: WsState) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

/// Serves the client frontend until the shutdown signal fires.
///
/// # Errors
///
/// Returns the underlying accept-loop error, which is fatal for the node.
pub async fn serve(
    state: WsState,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

async fn ws_upgrade(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

struct WsFrameSink {
    sink: SplitSink<WebSocket, WsMessage>,
}

#[async_trait::async_trait]
impl FrameSink for WsFrameSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> bool {
        self.sink
            .send(WsMessage::Binary(frame.into()))
            .await
            .is_ok()
    }

    async fn send_close(&mut self, code: u16, reason: String) {
        let _ = self
            .sink
            .send(WsMessage::Close(Some(CloseFrame { code, reason: reason.into() })))
            .await;
    }
}

async fn handle_socket(state: WsState, socket: WebSocket) {
    if !state.lifecycle.is_accepting() {
        // Draining: turn the socket away immediately.
        let (mut sink, _) = socket.split();
        let _ = sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: codes::CONNECTION_REJECTED,
                reason: "node is shutting down".into(),
            })))
            .await;
        return;
    }

    let (sink, mut stream) = socket.split();
    let (connection, outbound_rx) = state.registry.register();
    tokio::spawn(run_writer(
        outbound_rx,
        WsFrameSink { sink },
        state.config.coalescing,
    ));
    tracing::debug!(connection = connection.id, "client connected");

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Binary(bytes)) => {
                let _guard = state.lifecycle.in_flight_guard();
                match protocol::decode::<ClientMessage>(&bytes) {
                    Ok(message) => {
                        if !dispatch(&state, &connection, message).await {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(connection = connection.id, error = %err, "undecodable frame");
                        connection.push(Outbound::Message(ServerMessage::Error {
                            code: codes::BAD_REQUEST,
                            message: "malformed message".to_string(),
                        }));
                    }
                }
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {} // text/ping/pong frames are not part of the protocol
        }
    }

    cleanup(&state, &connection);
    tracing::debug!(connection = connection.id, "client disconnected");
}

/// Handles one decoded message; `false` ends the connection.
async fn dispatch(state: &WsState, connection: &Arc<ClientConnection>, message: ClientMessage) -> bool {
    // Authentication gate: AUTH is the only message an unauthenticated
    // socket may send.
    let message = match message {
        ClientMessage::Auth(payload) => {
            return handle_auth(state, connection, &payload.token);
        }
        other => other,
    };
    let principal = {
        let meta = connection.meta.read();
        if !meta.authenticated {
            None
        } else {
            meta.principal.clone()
        }
    };
    let Some(principal) = principal else {
        connection.push(Outbound::Urgent(ServerMessage::Error {
            code: codes::UNAUTHORIZED,
            message: "authenticate first".to_string(),
        }));
        connection.push(Outbound::Close {
            code: codes::CONNECTION_REJECTED,
            reason: "unauthenticated".to_string(),
        });
        return false;
    };

    match message {
        ClientMessage::Auth(_) => unreachable!("handled above"),
        ClientMessage::Ping { timestamp } => {
            connection.meta.write().last_ping = std::time::Instant::now();
            connection.push(Outbound::Urgent(ServerMessage::Pong {
                timestamp,
                server_time: state.storage.wall_millis(),
            }));
            true
        }
        ClientMessage::ClientOp(op) => {
            note_activity(state, connection, op.op.timestamp().cloned());
            let result = state
                .ops
                .handle_op(&connection.client_key(), &principal, op)
                .await;
            reply(connection, result)
        }
        ClientMessage::OpBatch { ops } => {
            if let Some(ts) = ops.iter().rev().find_map(|op| op.op.timestamp()) {
                note_activity(state, connection, Some(ts.clone()));
            }
            let result = state
                .ops
                .handle_batch(&connection.client_key(), &principal, ops)
                .await;
            reply(connection, result)
        }
        ClientMessage::QuerySub { query_id, map_name, query } => {
            if let Err(err) =
                state
                    .auth
                    .authorize(&principal, &map_name, crate::config::MapAction::Read)
            {
                return reply(connection, Err(err));
            }
            let response = state
                .subs
                .subscribe_query(connection.id, &query_id, &map_name, query, state.cluster.as_ref())
                .await;
            connection.push(Outbound::Message(response));
            true
        }
        ClientMessage::QueryUnsub { query_id } => {
            state.subs.unsubscribe(connection.id, &query_id);
            true
        }
        ClientMessage::Search { request_id, map_name, query } => {
            let response = state
                .subs
                .search_once(connection.id, &request_id, &map_name, query, state.cluster.as_ref())
                .await;
            connection.push(Outbound::Message(response));
            true
        }
        ClientMessage::SearchSub { query_id, map_name, query } => {
            let response = state
                .subs
                .subscribe_search(connection.id, &query_id, &map_name, query, state.cluster.as_ref())
                .await;
            connection.push(Outbound::Message(response));
            true
        }
        sync_message => {
            if let ClientMessage::LwwSyncInit { last_sync: Some(ts), .. }
            | ClientMessage::OrmapSyncInit { last_sync: Some(ts), .. } = &sync_message
            {
                note_activity(state, connection, Some(ts.clone()));
            }
            if let Some(response) =
                antientropy::handle_client_sync(&state.storage, sync_message).await
            {
                connection.push(Outbound::Message(response));
            }
            true
        }
    }
}

fn handle_auth(state: &WsState, connection: &Arc<ClientConnection>, token: &str) -> bool {
    match state.auth.authenticate(token) {
        Ok(principal) => {
            {
                let mut meta = connection.meta.write();
                meta.authenticated = true;
                meta.principal = Some(principal);
                meta.last_ping = std::time::Instant::now();
            }
            connection.push(Outbound::Urgent(ServerMessage::AuthAck {
                node_id: state.config.node_id.clone(),
            }));
            true
        }
        Err(err) => {
            connection.push(Outbound::Urgent(ServerMessage::AuthFail {
                reason: err.to_string(),
            }));
            connection.push(Outbound::Close {
                code: codes::CONNECTION_REJECTED,
                reason: "authentication failed".to_string(),
            });
            false
        }
    }
}

fn note_activity(state: &WsState, connection: &Arc<ClientConnection>, timestamp: Option<squall_core::Timestamp>) {
    if let Some(ts) = timestamp {
        connection.meta.write().last_active_hlc = Some(ts.clone());
        state
            .gc
            .report_activity(ActivitySource::Client, &connection.client_key(), ts);
    }
}

/// Sends the op outcome or its error projection; `false` on terminal errors.
fn reply(
    connection: &Arc<ClientConnection>,
    result: Result<ServerMessage, GridError>,
) -> bool {
    match result {
        Ok(message) => {
            connection.push(Outbound::Message(message));
            true
        }
        Err(err) => {
            let terminal = err.is_terminal();
            connection.push(Outbound::Message(ServerMessage::Error {
                code: err.code(),
                message: err.to_string(),
            }));
            if terminal {
                connection.push(Outbound::Close {
                    code: codes::CONNECTION_REJECTED,
                    reason: "terminal error".to_string(),
                });
            }
            !terminal
        }
    }
}

fn cleanup(state: &WsState, connection: &Arc<ClientConnection>) {
    state.registry.remove(connection.id);
    state.subs.on_client_disconnect(connection.id);
    state.rate_limiter.forget(&connection.client_key());
    state
        .gc
        .forget(ActivitySource::Client, &connection.client_key());
}

/// One pass of the heartbeat/auth-deadline sweep.
///
/// Returns `(evicted_for_heartbeat, evicted_for_auth_deadline)`.
pub fn sweep_connections(state: &WsState) -> (usize, usize) {
    let client_timeout = Duration::from_millis(state.config.client_timeout_ms);
    let auth_deadline = Duration::from_millis(state.config.auth.deadline_ms);
    let mut heartbeat_evictions = 0;
    let mut auth_evictions = 0;

    for connection in state.registry.snapshot() {
        let (authenticated, last_ping) = {
            let meta = connection.meta.read();
            (meta.authenticated, meta.last_ping)
        };
        if authenticated && last_ping.elapsed() > client_timeout {
            tracing::info!(connection = connection.id, "evicting client: heartbeat timeout");
            connection.push(Outbound::Close {
                code: codes::HEARTBEAT_TIMEOUT,
                reason: "heartbeat timeout".to_string(),
            });
            cleanup(state, &connection);
            heartbeat_evictions += 1;
        } else if !authenticated && connection.connected_at.elapsed() > auth_deadline {
            tracing::info!(connection = connection.id, "evicting client: auth deadline");
            connection.push(Outbound::Close {
                code: codes::CONNECTION_REJECTED,
                reason: "authentication deadline".to_string(),
            });
            cleanup(state, &connection);
            auth_evictions += 1;
        }
    }
    (heartbeat_evictions, auth_evictions)
}

/// Runs the periodic sweep until shutdown.
pub async fn run_sweeper(state: WsState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_millis(
        state.config.heartbeat_interval_ms.max(1),
    ));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                sweep_connections(&state);
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Announces shutdown to every client and closes their sockets.
pub fn broadcast_shutdown(state: &WsState, retry_after_ms: u64) {
    for connection in state.registry.snapshot() {
        connection.push(Outbound::Urgent(ServerMessage::ShutdownPending { retry_after_ms }));
        connection.push(Outbound::Close {
            code: codes::CONNECTION_REJECTED,
            reason: "shutting down".to_string(),
        });
    }
}
