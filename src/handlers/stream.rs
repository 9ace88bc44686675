use axum::Json;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::AppState;
use crate::error::Result;
use crate::hub::{
    BackpressureStrategy, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, Subscriber, WRITE_DEADLINE,
};
use crate::models::stream::{ClientMessage, ServerMessage};

/// Maximum accepted inbound frame (64 KiB).
const MAX_INBOUND_MESSAGE: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub service: Option<String>,
    pub level: Option<String>,
    pub token: Option<String>,
}

/// GET /ws/logs — upgrade to the bidirectional stream. Query params seed
/// the initial filters; auth comes from the Authorization header first,
/// then the `token` query param. The connection starts active either way.
pub async fn ws_logs(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let mut filters = HashMap::new();
    if let Some(service) = params.service {
        filters.insert("service".to_string(), service);
    }
    if let Some(level) = params.level {
        filters.insert("level".to_string(), level);
    }
    let token = super::bearer_token(&headers).or(params.token);

    ws.max_message_size(MAX_INBOUND_MESSAGE)
        .on_upgrade(move |socket| handle_socket(state, socket, filters, token))
}

async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    filters: HashMap<String, String>,
    token: Option<String>,
) {
    let id = state.hub.next_subscriber_id();
    let (sub, rx, cancelled) = Subscriber::new(id, filters);
    state.hub.register(sub.clone());

    if let Some(token) = token {
        attempt_auth(&state, &sub, &token).await;
    }

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(ws_tx, rx, sub.clone(), cancelled));

    // Read loop: any error or close terminates the subscriber.
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_client_message(&state, &sub, text.as_str()).await,
            Ok(Message::Pong(_)) => sub.record_pong(),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("subscriber {id}: read error: {e}");
                break;
            }
        }
    }

    state.hub.unregister(id);
    writer.await.ok();
    tracing::debug!("subscriber {id}: closed");
}

/// Write loop: drain the outbound queue with a per-write deadline, emit
/// heartbeats, and enforce pong expiry.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
    sub: Arc<Subscriber>,
    mut cancelled: watch::Receiver<bool>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // First tick fires immediately; skip it so the cadence starts one
    // interval in.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = cancelled.changed() => break,
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if send_json(&mut ws_tx, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if sub.heartbeat_expired(HEARTBEAT_TIMEOUT) {
                    tracing::info!("subscriber {}: heartbeat timeout", sub.id);
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "heartbeat timeout".into(),
                        })))
                        .await;
                    sub.cancel();
                    break;
                }
                // Transport-level ping drives the pong clock; the JSON
                // heartbeat is for dashboard visibility.
                let ping = timeout(WRITE_DEADLINE, ws_tx.send(Message::Ping(Vec::new().into()))).await;
                if !matches!(ping, Ok(Ok(()))) {
                    break;
                }
                let msg = ServerMessage::Heartbeat { timestamp: Utc::now() };
                if send_json(&mut ws_tx, &msg).await.is_err() {
                    break;
                }
            }
        }
    }

    // No further writes: the queue drains into the void from here.
    rx.close();
}

async fn send_json(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> std::result::Result<(), ()> {
    let text = serde_json::to_string(msg).map_err(|_| ())?;
    match timeout(WRITE_DEADLINE, ws_tx.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

async fn handle_client_message(state: &AppState, sub: &Arc<Subscriber>, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Filters { filters }) => {
            if let Err(e) = sub.replace_filters(filters) {
                tracing::debug!("subscriber {}: filter update rejected: {e}", sub.id);
            }
        }
        Ok(ClientMessage::Ping) => {
            // An application-level ping proves liveness too.
            sub.record_pong();
            let _ = sub.try_enqueue(ServerMessage::Pong {
                timestamp: Utc::now(),
            });
        }
        Ok(ClientMessage::Auth { token }) => attempt_auth(state, sub, &token).await,
        Err(e) => {
            tracing::debug!("subscriber {}: unparseable message: {e}", sub.id);
        }
    }
}

async fn attempt_auth(state: &AppState, sub: &Arc<Subscriber>, token: &str) {
    match state.sessions.validate(token).await {
        Ok(session) => {
            tracing::debug!("subscriber {}: authenticated as {}", sub.id, session.user_id);
            let msg = ServerMessage::AuthSuccess {
                user_id: session.user_id.clone(),
                role: session.role.clone(),
            };
            sub.set_session(session);
            let _ = sub.try_enqueue(msg);
        }
        Err(_) => {
            let _ = sub.try_enqueue(ServerMessage::AuthFailed {
                error: "invalid token".to_string(),
            });
        }
    }
}

/// GET /ws/logs/stats
pub async fn hub_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.stats())
}

#[derive(Debug, Deserialize)]
pub struct HubConfigRequest {
    pub backpressure_strategy: BackpressureStrategy,
}

/// POST /ws/logs/config
pub async fn hub_config(
    State(state): State<AppState>,
    Json(req): Json<HubConfigRequest>,
) -> Result<impl IntoResponse> {
    state.hub.set_strategy(req.backpressure_strategy);
    Ok(Json(serde_json::json!({
        "backpressure_strategy": req.backpressure_strategy,
    })))
}
