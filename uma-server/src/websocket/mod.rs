//! WebSocket streaming sessions for `/api/v2/stream`.
//!
//! A client subscribes to topic names; the server pushes every matching bus
//! event as `{type, payload, timestamp}`. Subscriptions ride the core event
//! bus: each session owns one bounded-queue stream, so a slow client drops
//! its own oldest events and never stalls publishers. Repeated malformed
//! frames close the connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use uma_core::events::bus::TopicFilter;

use crate::state::AppState;

/// Malformed frames tolerated before the connection is closed.
const PROTOCOL_STRIKE_LIMIT: u32 = 3;

/// Registry of live streaming sessions, for health reporting.
#[derive(Default)]
pub struct StreamSessions {
    sessions: DashMap<Uuid, SessionInfo>,
    dropped_total: AtomicU64,
}

#[derive(Debug)]
struct SessionInfo {
    connected_at: i64,
    topics: usize,
}

impl std::fmt::Debug for StreamSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSessions")
            .field("connected", &self.sessions.len())
            .field(
                "dropped_total",
                &self.dropped_total.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl StreamSessions {
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Events dropped across all sessions since startup.
    pub fn total_dropped(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    fn register(&self, id: Uuid) {
        self.sessions.insert(
            id,
            SessionInfo {
                connected_at: chrono::Utc::now().timestamp(),
                topics: 0,
            },
        );
    }

    fn set_topic_count(&self, id: Uuid, topics: usize) {
        if let Some(mut info) = self.sessions.get_mut(&id) {
            info.topics = topics;
        }
    }

    fn record_drops(&self, count: u64) {
        if count > 0 {
            self.dropped_total.fetch_add(count, Ordering::Relaxed);
        }
    }

    fn remove(&self, id: Uuid) {
        self.sessions.remove(&id);
    }
}

/// Client → server control messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Ping,
}

/// Handle the WebSocket upgrade for `/api/v2/stream`.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4();
    state.sessions.register(session_id);
    debug!(session = %session_id, "stream session connected");

    // Start with no topics: the client opts in explicitly.
    let mut stream = state
        .core
        .bus()
        .subscribe(TopicFilter::Topics(HashSet::new()));
    let filter = stream.filter_handle();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<serde_json::Value>(64);

    // Writer task: single owner of the socket's send half.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_sender
                .send(Message::Text(message.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Event pump: bus stream → socket, tracking queue drops.
    let sessions = state.sessions.clone();
    let event_tx = tx.clone();
    let pump = tokio::spawn(async move {
        let mut reported_drops = 0u64;
        while let Some(event) = stream.recv().await {
            let drops = stream.dropped();
            sessions.record_drops(drops - reported_drops);
            reported_drops = drops;
            if event_tx.send(event.to_wire()).await.is_err() {
                break;
            }
        }
    });

    let mut topics: HashSet<String> = HashSet::new();
    let mut strikes = 0u32;

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(control) => {
                        handle_control(
                            control,
                            &mut topics,
                            &filter,
                            &tx,
                            &state,
                            session_id,
                        )
                        .await;
                    }
                    Err(err) => {
                        strikes += 1;
                        warn!(
                            session = %session_id,
                            %err,
                            strikes,
                            "malformed stream control frame"
                        );
                        let _ = tx
                            .send(json!({
                                "type": "error",
                                "payload": { "kind": "protocol_error", "message": err.to_string() },
                                "timestamp": chrono::Utc::now().timestamp(),
                            }))
                            .await;
                        if strikes >= PROTOCOL_STRIKE_LIMIT {
                            warn!(session = %session_id, "closing session after repeated protocol errors");
                            break;
                        }
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
            Err(err) => {
                debug!(session = %session_id, %err, "stream socket error");
                break;
            }
        }
    }

    pump.abort();
    writer.abort();
    state.sessions.remove(session_id);
    debug!(session = %session_id, "stream session disconnected");
}

async fn handle_control(
    message: ClientMessage,
    topics: &mut HashSet<String>,
    filter: &uma_core::events::bus::FilterHandle,
    tx: &mpsc::Sender<serde_json::Value>,
    state: &AppState,
    session_id: Uuid,
) {
    match message {
        ClientMessage::Subscribe { topics: added } => {
            topics.extend(added);
            filter.set(TopicFilter::Topics(topics.clone()));
            state.sessions.set_topic_count(session_id, topics.len());
            let mut list: Vec<&String> = topics.iter().collect();
            list.sort();
            let _ = tx
                .send(json!({
                    "type": "subscribed",
                    "payload": { "topics": list },
                    "timestamp": chrono::Utc::now().timestamp(),
                }))
                .await;
        }
        ClientMessage::Unsubscribe { topics: removed } => {
            for topic in &removed {
                topics.remove(topic);
            }
            filter.set(TopicFilter::Topics(topics.clone()));
            state.sessions.set_topic_count(session_id, topics.len());
            let mut list: Vec<&String> = topics.iter().collect();
            list.sort();
            let _ = tx
                .send(json!({
                    "type": "subscribed",
                    "payload": { "topics": list },
                    "timestamp": chrono::Utc::now().timestamp(),
                }))
                .await;
        }
        ClientMessage::Ping => {
            let _ = tx
                .send(json!({
                    "type": "pong",
                    "payload": {},
                    "timestamp": chrono::Utc::now().timestamp(),
                }))
                .await;
        }
    }
}
