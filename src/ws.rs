//! Real-time channel: one WebSocket endpoint carrying two kinds of
//! server-sent events.
//!
//! `analysis` snapshots fan out to every connection through a global
//! `tokio::sync::broadcast` channel. `notification` events are targeted: a
//! client sends an `identify` event naming its user id, which registers the
//! connection in the [`UserRegistry`]; subsequent notifications for that
//! user reach only its registered connections. Delivery is best-effort with
//! no acknowledgment or offline queue.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::warn;

use crate::analytics::AnalyticsPush;
use crate::api::SharedState;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Event envelopes ──────────────────────────────────────────────────

/// Server-to-client events. Serialized as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Targeted at one user's connections; tells the client to refetch its
    /// notification list.
    Notification { message: String },
    /// Unscoped broadcast of a fresh analytics snapshot.
    Analysis(AnalyticsPush),
}

/// Client-to-server events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join the per-user delivery group for `user_id`.
    Identify { user_id: i64 },
}

// ── Per-user connection registry ─────────────────────────────────────

type ConnId = u64;

/// Maps user ids to the send halves of their identified connections.
/// Replaces ambient room state with an explicit object: connections join on
/// identify, leave on disconnect, and dead senders are pruned on delivery.
#[derive(Default)]
pub struct UserRegistry {
    next_id: AtomicU64,
    rooms: Mutex<HashMap<i64, Vec<(ConnId, mpsc::UnboundedSender<String>)>>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under a user id. Returns a handle used to leave
    /// on disconnect.
    pub fn join(&self, user_id: i64, sender: mpsc::UnboundedSender<String>) -> ConnId {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut rooms = self.rooms.lock().expect("registry lock poisoned");
        rooms.entry(user_id).or_default().push((conn_id, sender));
        conn_id
    }

    pub fn leave(&self, user_id: i64, conn_id: ConnId) {
        let mut rooms = self.rooms.lock().expect("registry lock poisoned");
        if let Some(members) = rooms.get_mut(&user_id) {
            members.retain(|(id, _)| *id != conn_id);
            if members.is_empty() {
                rooms.remove(&user_id);
            }
        }
    }

    /// Deliver an event to every connection identified as `user_id`,
    /// pruning connections whose receive half is gone. Returns how many
    /// connections accepted the event.
    pub fn notify_user(&self, user_id: i64, event: &ServerEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize ws event: {}", e);
                return 0;
            }
        };
        let mut rooms = self.rooms.lock().expect("registry lock poisoned");
        let Some(members) = rooms.get_mut(&user_id) else {
            return 0;
        };
        members.retain(|(_, sender)| sender.send(payload.clone()).is_ok());
        let delivered = members.len();
        if members.is_empty() {
            rooms.remove(&user_id);
        }
        delivered
    }

    pub fn connection_count(&self, user_id: i64) -> usize {
        let rooms = self.rooms.lock().expect("registry lock poisoned");
        rooms.get(&user_id).map(|m| m.len()).unwrap_or(0)
    }
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a ServerEvent to all connected WebSocket clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_event(tx: &broadcast::Sender<String>, event: &ServerEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(json); // Ignore error if no receivers
        }
        Err(e) => {
            warn!("Failed to serialize ws event: {}", e);
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Core socket loop: forwards global broadcasts and targeted deliveries to
/// the client, handles the identify handshake, and runs ping/pong
/// keepalive. If no Pong is received within [`PONG_TIMEOUT`] after a Ping is
/// sent, the connection is considered dead and the loop exits.
async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let mut global_rx = state.ws_tx.subscribe();
    let (personal_tx, mut personal_rx) = mpsc::unbounded_channel::<String>();

    // Delivery groups this connection joined; each identify adds one.
    let mut memberships: Vec<(i64, ConnId)> = Vec::new();

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    // Connection is dead — no pong received in time
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Unscoped broadcasts ─────────────────────────────────
            result = global_rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed some messages; continue receiving
                        continue;
                    }
                }
            }

            // ── Targeted deliveries ─────────────────────────────────
            msg = personal_rx.recv() => {
                match msg {
                    Some(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // ── Client messages (identify, pong, close) ─────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientEvent::Identify { user_id }) =
                            serde_json::from_str::<ClientEvent>(text.as_str())
                        {
                            let conn_id = state.registry.join(user_id, personal_tx.clone());
                            memberships.push((user_id, conn_id));
                        }
                        // Unrecognized text is ignored
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore other messages from client (Binary, Ping)
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    for (user_id, conn_id) in memberships {
        state.registry.leave(user_id, conn_id);
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Tests ────────────────────────────────────────────────────────────
