//! WebSocket endpoint adapters
//!
//! Thin layer binding HTTP upgrades to the session registry. Each
//! endpoint verifies the JWT from the `token` query parameter, checks the
//! user's keyring, enforces the per-user cap through
//! `SessionRegistry.create`, and pumps frames between the socket and the
//! session's ordered event channel. Socket close cancels the session.

use std::collections::HashMap;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::protocol::{ClientMessage, ServerMessage, EVENT_CHANNEL_CAPACITY};
use crate::session::SessionKind;

/// Policy-violation close code (RFC 6455)
const CLOSE_POLICY: u16 = 1008;

pub async fn ws_terminal(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, SessionKind::Terminal, params, ws)
}

pub async fn ws_tunnel(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, SessionKind::Tunnel, params, ws)
}

pub async fn ws_files(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, SessionKind::Files, params, ws)
}

pub async fn ws_stats(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, SessionKind::Stats, params, ws)
}

pub async fn ws_docker(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, SessionKind::Docker, params, ws)
}

fn upgrade(
    state: AppState,
    kind: SessionKind,
    params: HashMap<String, String>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| serve_socket(state, kind, token, socket))
}

async fn serve_socket(
    state: AppState,
    kind: SessionKind,
    token: Option<String>,
    mut socket: WebSocket,
) {
    // --- authenticate the upgrade ---
    let verified = token
        .as_deref()
        .and_then(|t| state.deps.verifier.verify_jwt(t));

    let verified = match verified {
        Some(v) if !v.pending_totp => v,
        Some(_) => {
            debug!("Rejecting WS: TOTP still pending");
            close_with(&mut socket, CLOSE_POLICY, "TOTP_REQUIRED").await;
            return;
        }
        None => {
            debug!("Rejecting WS: invalid or missing token");
            close_with(&mut socket, CLOSE_POLICY, "UNAUTHORIZED").await;
            return;
        }
    };

    // --- keyring must be unlocked ---
    if state.deps.keyring.data_key(&verified.user_id).is_none() {
        info!(user_id = %verified.user_id, "Rejecting WS: data locked");
        close_with(&mut socket, CLOSE_POLICY, "DATA_LOCKED").await;
        return;
    }

    // --- create the session (cap enforced atomically inside) ---
    let (event_tx, event_rx) = mpsc::channel::<ServerMessage>(EVENT_CHANNEL_CAPACITY);
    let session = match state
        .registry
        .create(&verified.user_id, kind, event_tx.clone())
    {
        Ok(s) => s,
        Err(e) => {
            warn!(user_id = %verified.user_id, kind = kind.as_str(), "WS rejected: {}", e);
            let frame = serde_json::to_string(&ServerMessage::Error {
                message: e.user_message(),
                code: Some(e.code().to_string()),
            })
            .unwrap_or_default();
            let _ = socket.send(Message::Text(frame.into())).await;
            close_with(&mut socket, CLOSE_POLICY, e.code()).await;
            return;
        }
    };

    info!(
        session_id = %session.id,
        user_id = %verified.user_id,
        kind = kind.as_str(),
        "WebSocket attached"
    );

    let (ws_sender, mut ws_receiver) = socket.split();

    // writer: the session's ordered event stream -> socket
    let writer = tokio::spawn(write_events(ws_sender, event_rx));

    // reader: socket -> session
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => session.handle_message(msg).await,
                Err(e) => {
                    debug!(session_id = %session.id, "Unparseable message: {}", e);
                    let _ = event_tx
                        .send(ServerMessage::Error {
                            message: format!("Unrecognized message: {}", e),
                            code: Some("BAD_MESSAGE".into()),
                        })
                        .await;
                }
            },
            Ok(Message::Close(_)) => {
                debug!(session_id = %session.id, "WebSocket closed by client");
                break;
            }
            // axum answers protocol pings itself
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
            Err(e) => {
                debug!(session_id = %session.id, "WebSocket receive error: {}", e);
                break;
            }
        }
    }

    // socket gone: cancel the session and stop the writer
    state.registry.cancel(session.id).await;
    drop(event_tx);
    let _ = writer.await;

    info!(session_id = %session.id, "WebSocket detached");
}

/// Forward session events in causal order; `disconnected` is the last
/// frame, after which the socket is closed server-side.
async fn write_events(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut events: mpsc::Receiver<ServerMessage>,
) {
    while let Some(event) = events.recv().await {
        let last = matches!(event, ServerMessage::Disconnected);
        let frame = match serde_json::to_string(&event) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to serialize event: {}", e);
                continue;
            }
        };
        if sender.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
        if last {
            break;
        }
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: "".into(),
        })))
        .await;
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
