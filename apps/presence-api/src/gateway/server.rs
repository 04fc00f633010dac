//! WebSocket upgrade handler and per-connection read/write loops.
//!
//! Each connection gets a read loop (this module) and a writer task that
//! drains the connection's outbound channel. Everything the server sends,
//! including closes, flows through that channel, which is what preserves
//! per-connection delivery order.

use std::ops::ControlFlow;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use crate::collab::{AudienceDescriptor, Identity};
use crate::error::{ApiError, GatewayError};
use crate::AppState;

use super::events::{
    ClientFrame, EventType, NotificationEvent, RequestedStatus, ServerFrame, CLOSE_AUTH_FAILED,
    CLOSE_CAPACITY, CLOSE_INVALID_FRAME, CLOSE_NOT_AUTHENTICATED, CLOSE_UNKNOWN_TYPE,
};
use super::presence::{effective_status, StateChange};
use super::registry::{Outbound, OUTBOUND_BUFFER};

/// Timeout for receiving IDENTIFY after the socket opens (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

/// Break length applied when a client starts a break without a duration.
const DEFAULT_BREAK_SECS: u64 = 15 * 60;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    // Reject before upgrading when the registry is full, so the client sees
    // a retryable HTTP status instead of an accepted-then-dropped socket.
    if state.registry.is_full() {
        return ApiError::from(GatewayError::ResourceExhausted(
            state.config.max_connections,
        ))
        .into_response();
    }
    ws.on_upgrade(move |socket| handle_connection(socket, state))
        .into_response()
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: wait for IDENTIFY within the timeout.
    let identify = time::timeout(
        Duration::from_secs(IDENTIFY_TIMEOUT_SECS),
        read_identify(&mut ws_rx),
    )
    .await;

    let (token, last_event_id) = match identify {
        Ok(Ok(fields)) => fields,
        Ok(Err((code, reason))) => {
            tracing::debug!(%reason, "initial handshake failed");
            let _ = send_close(&mut ws_tx, code, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, "Handshake timeout").await;
            return;
        }
    };

    // Step 2: the identity collaborator validates the opaque token.
    let Some(identity) = state.identity.authenticate(&token).await else {
        tracing::debug!("identify failed: invalid token");
        let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, "Invalid or expired token").await;
        return;
    };

    // Step 3: register the connection.
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let connection_id = match state
        .registry
        .register(&identity.user_id, outbound_tx.clone())
    {
        Ok(id) => id,
        Err(err) => {
            tracing::warn!(%err, user_id = %identity.user_id, "registration failed");
            let _ = send_close(&mut ws_tx, CLOSE_CAPACITY, "Server at capacity").await;
            return;
        }
    };

    tracing::info!(
        %connection_id,
        user_id = %identity.user_id,
        "gateway session established"
    );

    let writer = tokio::spawn(write_loop(ws_tx, outbound_rx));

    // Step 4: READY, replay of missed notifications, then presence. READY is
    // queued first so the client always sees it before anything else.
    let missed = state
        .router
        .replay_since(&identity.user_id, last_event_id.as_deref());
    let ready = ServerFrame::Ready {
        connection_id: connection_id.clone(),
        user_id: identity.user_id.clone(),
        username: identity.username.clone(),
        heartbeat_interval_ms: state.config.heartbeat_interval_ms,
        replayed: missed.len(),
    };
    let mut queued = outbound_tx.send(Outbound::Frame(ready)).await.is_ok();
    for event in missed {
        if !queued {
            break;
        }
        queued = outbound_tx
            .send(Outbound::Frame(ServerFrame::Notification { event }))
            .await
            .is_ok();
    }

    if queued {
        if let Some(change) = state.presence.connect(&identity.user_id, Utc::now()) {
            announce(&state, change).await;
        }
        run_session(&state, &identity, &connection_id, &outbound_tx, &mut ws_rx).await;
    }

    // Step 5: teardown. If this was the user's last connection, they go
    // offline.
    state.registry.unregister(&connection_id);
    if !state.registry.has_connections(&identity.user_id) {
        if let Some(change) = state
            .presence
            .disconnect_offline(&identity.user_id, Utc::now())
        {
            announce(&state, change).await;
        }
    }

    // Let the writer flush anything still queued (including a close frame).
    drop(outbound_tx);
    let _ = writer.await;

    tracing::info!(
        %connection_id,
        user_id = %identity.user_id,
        "gateway session ended"
    );
}

/// Read frames until the client IDENTIFYs. Transport pings/pongs are
/// tolerated; anything else before IDENTIFY is a protocol error.
async fn read_identify(
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<(String, Option<String>), (u16, &'static str)> {
    while let Some(msg) = ws_rx.next().await {
        let msg = msg.map_err(|_| (CLOSE_INVALID_FRAME, "Read error"))?;
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return Err((CLOSE_NOT_AUTHENTICATED, "Closed before identify")),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => continue,
        };
        return match parse_frame(&text)? {
            ClientFrame::Identify {
                token,
                last_event_id,
            } => Ok((token, last_event_id)),
            _ => Err((CLOSE_NOT_AUTHENTICATED, "Expected identify")),
        };
    }
    Err((CLOSE_NOT_AUTHENTICATED, "Closed before identify"))
}

/// Main read loop: typed frames in, presence/chat/heartbeat effects out.
async fn run_session(
    state: &AppState,
    identity: &Identity,
    connection_id: &str,
    outbound: &mpsc::Sender<Outbound>,
    ws_rx: &mut SplitStream<WebSocket>,
) {
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%connection_id, ?err, "ws read error");
                return;
            }
        };
        match msg {
            Message::Text(text) => {
                let frame = match parse_frame(&text) {
                    Ok(frame) => frame,
                    Err((code, reason)) => {
                        tracing::debug!(%connection_id, %reason, "rejecting frame");
                        let _ = outbound.send(Outbound::Close { code, reason }).await;
                        return;
                    }
                };
                if handle_frame(state, identity, connection_id, outbound, frame)
                    .await
                    .is_break()
                {
                    return;
                }
            }
            // Transport-level pongs count as liveness too.
            Message::Pong(_) => state.registry.touch(connection_id),
            Message::Ping(_) => continue,
            Message::Close(_) => return,
            _ => continue,
        }
    }
}

async fn handle_frame(
    state: &AppState,
    identity: &Identity,
    connection_id: &str,
    outbound: &mpsc::Sender<Outbound>,
    frame: ClientFrame,
) -> ControlFlow<()> {
    match frame {
        ClientFrame::Identify { .. } => {
            let _ = outbound
                .send(Outbound::Close {
                    code: CLOSE_INVALID_FRAME,
                    reason: "Already identified",
                })
                .await;
            ControlFlow::Break(())
        }
        ClientFrame::Heartbeat => {
            state.registry.touch(connection_id);
            let _ = outbound
                .send(Outbound::Frame(ServerFrame::HeartbeatResponse))
                .await;
            ControlFlow::Continue(())
        }
        ClientFrame::Activity { ts_ms } => {
            if let Some(ts) = from_millis(ts_ms) {
                if let Some(change) = state.presence.activity(&identity.user_id, ts) {
                    announce(state, change).await;
                }
            }
            ControlFlow::Continue(())
        }
        ClientFrame::Visibility { hidden, ts_ms } => {
            if let Some(ts) = from_millis(ts_ms) {
                let change = if hidden {
                    state.presence.page_hidden(&identity.user_id, ts)
                } else {
                    state.presence.activity(&identity.user_id, ts)
                };
                if let Some(change) = change {
                    announce(state, change).await;
                }
            }
            ControlFlow::Continue(())
        }
        ClientFrame::SetStatus {
            status,
            message,
            duration_secs,
            ts_ms,
        } => {
            let Some(ts) = from_millis(ts_ms) else {
                return ControlFlow::Continue(());
            };
            let change = match status {
                RequestedStatus::Active => state.presence.set_active(&identity.user_id, ts),
                RequestedStatus::Afk => state.presence.set_afk(&identity.user_id, message, ts),
                RequestedStatus::Break => state.presence.start_break(
                    &identity.user_id,
                    Duration::from_secs(duration_secs.unwrap_or(DEFAULT_BREAK_SECS)),
                    ts,
                ),
            };
            if let Some(change) = change {
                announce(state, change).await;
            }
            ControlFlow::Continue(())
        }
        ClientFrame::Message { work_item_id, body } => {
            handle_chat_message(state, identity, &work_item_id, &body).await;
            ControlFlow::Continue(())
        }
    }
}

/// Persist first, then fan out: the content frame to every member (author
/// included), the notification event with the author filtered out.
async fn handle_chat_message(
    state: &AppState,
    identity: &Identity,
    work_item_id: &str,
    body: &str,
) {
    let stored = match state.chat.store_message(identity, work_item_id, body).await {
        Ok(stored) => stored,
        Err(err) => {
            // No optimistic success: nothing is echoed for a failed store.
            tracing::warn!(
                user_id = %identity.user_id,
                %work_item_id,
                %err,
                "chat persistence failed; message not fanned out"
            );
            return;
        }
    };

    let audience = AudienceDescriptor::WorkItem(work_item_id.to_string());

    state
        .router
        .publish_content(
            ServerFrame::ChatMessage {
                work_item_id: stored.work_item_id.clone(),
                message_id: stored.id.clone(),
                user_id: stored.user_id.clone(),
                username: stored.username.clone(),
                body: stored.body.clone(),
                sent_at: stored.sent_at,
            },
            &audience,
        )
        .await;

    let event = NotificationEvent {
        work_item_id: Some(stored.work_item_id.clone()),
        origin_user_id: Some(stored.user_id.clone()),
        ..NotificationEvent::new(
            EventType::Message,
            format!(
                "New message from {} in '{}'",
                stored.username, stored.work_item_id
            ),
        )
    };
    state.router.publish(event, &audience).await;
}

/// Writer task: the sole owner of the sink half.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = outbound_rx.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let json = serde_json::to_string(&frame).unwrap();
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = send_close(&mut ws_tx, code, reason).await;
                break;
            }
        }
    }
}

/// Broadcast a presence change with the working-hours overlay applied.
async fn announce(state: &AppState, change: StateChange) {
    let status = match state.preferences.preferences(&change.user_id).await {
        Ok(prefs) => effective_status(change.status, &prefs, chrono::Local::now().naive_local()),
        Err(_) => change.status,
    };
    state
        .router
        .presence_changed(&change.user_id, status, change.message);
}

fn parse_frame(text: &str) -> Result<ClientFrame, (u16, &'static str)> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| (CLOSE_INVALID_FRAME, "Invalid JSON"))?;
    serde_json::from_value(value).map_err(|_| (CLOSE_UNKNOWN_TYPE, "Unrecognized frame"))
}

fn from_millis(ts_ms: i64) -> Option<DateTime<Utc>> {
    let ts = DateTime::from_timestamp_millis(ts_ms);
    if ts.is_none() {
        tracing::debug!(ts_ms, "signal with unrepresentable timestamp ignored");
    }
    ts
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close).await
}
