use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tracing::{debug, info, warn};

use mesa_proto::{close_codes, ClientMessage, EndpointKind, ServerMessage};

use crate::auth::Claims;
use crate::error::ForbiddenError;
use crate::lifecycle::close_message;
use crate::limiter::{RateDecision, SlidingWindow};
use crate::registry::ConnectionHandle;
use crate::AppState;

/// `refresh_assignment` hits the broker, so it gets its own, much tighter
/// per-connection window than ordinary messages.
const REFRESH_LIMIT: usize = 2;
const REFRESH_WINDOW: Duration = Duration::from_secs(10);

pub async fn waiter_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, EndpointKind::StaffWaiter, headers, params, ws)
}

pub async fn kitchen_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, EndpointKind::StaffKitchen, headers, params, ws)
}

pub async fn admin_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, EndpointKind::StaffAdmin, headers, params, ws)
}

pub async fn diner_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, EndpointKind::Diner, headers, params, ws)
}

/// All refusals happen after the upgrade so the client sees the precise
/// close code; an HTTP-level rejection would collapse them all into a
/// failed handshake.
fn upgrade(
    state: AppState,
    kind: EndpointKind,
    headers: HeaderMap,
    params: HashMap<String, String>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let credential = extract_credential(&headers, &params);
    let origin = header_str(&headers, "origin");
    ws.on_upgrade(move |socket| serve_socket(state, kind, credential, origin, socket))
}

/// Bearer header wins over the `token` query parameter.
fn extract_credential(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = header_str(headers, "authorization") {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    params.get("token").cloned()
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match origin {
        Some(origin) => allowed.iter().any(|a| a == origin),
        None => false,
    }
}

async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    counter!("mesa_gateway_connections_rejected_total", 1, "reason" => reason);
    let _ = socket.send(close_message(code, reason)).await;
    let _ = socket.close().await;
}

async fn serve_socket(
    state: AppState,
    kind: EndpointKind,
    credential: Option<String>,
    origin: Option<String>,
    socket: WebSocket,
) {
    if kind.is_staff() && !origin_allowed(&state.config.allowed_origins, origin.as_deref()) {
        let err = ForbiddenError::BadOrigin {
            origin: origin.unwrap_or_default(),
        };
        warn!(%err, endpoint = kind.as_str(), "refusing connection");
        reject(socket, err.close_code(), "origin not allowed").await;
        return;
    }

    let Some(credential) = credential else {
        reject(socket, close_codes::AUTH_FAILED, "missing credential").await;
        return;
    };

    let strategy = if kind.is_staff() {
        &state.staff_auth
    } else {
        &state.diner_auth
    };
    let claims = match strategy.authenticate(&credential).await {
        Ok(claims) => claims,
        Err(err) => {
            counter!("mesa_gateway_auth_failures_total", 1, "reason" => err.metric_label());
            debug!(error = %err, endpoint = kind.as_str(), "authentication failed");
            reject(socket, err.close_code(), "authentication failed").await;
            return;
        }
    };

    if let Some(required) = kind.required_role() {
        if !claims.has_role(required) {
            let err = ForbiddenError::MissingRole {
                required: required.as_str(),
            };
            counter!("mesa_gateway_auth_failures_total", 1, "reason" => err.metric_label());
            reject(socket, err.close_code(), "role not permitted here").await;
            return;
        }
    }
    if kind == EndpointKind::Diner && claims.session_id.is_none() {
        reject(socket, close_codes::AUTH_FAILED, "credential has no session").await;
        return;
    }

    let (outbound_tx, outbound_rx) =
        tokio::sync::mpsc::channel::<Message>(state.config.outbound_buffer);
    let handle = match state.lifecycle.accept(&claims, kind, outbound_tx).await {
        Ok(handle) => handle,
        Err(err) => {
            info!(%err, endpoint = kind.as_str(), "admission refused");
            let reason = match err.close_code() {
                close_codes::TRY_AGAIN_LATER => "at capacity, retry later",
                _ => "connection limit reached",
            };
            reject(socket, err.close_code(), reason).await;
            return;
        }
    };

    counter!("mesa_gateway_connections_opened_total", 1, "kind" => kind.as_str());
    info!(
        connection_id = %handle.id,
        tenant_id = handle.tenant_id,
        endpoint = kind.as_str(),
        "connection established"
    );

    let (ws_tx, ws_rx) = socket.split();
    let writer = spawn_writer(ws_tx, outbound_rx);
    read_loop(&state, &claims, &handle, ws_rx).await;

    let connection_id = handle.id;
    state.lifecycle.release(connection_id).await;
    // Dropping the last sender lets the writer flush anything queued
    // (a close frame included) and exit on its own.
    drop(handle);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    counter!("mesa_gateway_connections_closed_total", 1, "kind" => kind.as_str());
    debug!(%connection_id, "connection torn down");
}

/// Writer task owns the sink half. Everything outbound, fan-out included,
/// goes through the connection's channel; a forwarded close frame ends the
/// task after it is flushed.
fn spawn_writer(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: tokio::sync::mpsc::Receiver<Message>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_tx.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
    })
}

async fn read_loop(
    state: &AppState,
    claims: &Claims,
    handle: &Arc<ConnectionHandle>,
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
) {
    let mut refresh_window = SlidingWindow::new(REFRESH_LIMIT, REFRESH_WINDOW);

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(connection_id = %handle.id, error = %err, "socket read error");
                break;
            }
        };
        match handle_frame(state, claims, handle, frame, &mut refresh_window).await {
            LoopAction::Continue => {}
            LoopAction::Stop => break,
        }
    }
}

#[derive(Debug, PartialEq)]
enum LoopAction {
    Continue,
    Stop,
}

async fn handle_frame(
    state: &AppState,
    claims: &Claims,
    handle: &Arc<ConnectionHandle>,
    frame: Message,
    refresh_window: &mut SlidingWindow,
) -> LoopAction {
    handle.touch_heartbeat();

    match frame {
        Message::Text(text) => {
            if text.len() > state.config.max_message_bytes {
                enqueue_close(handle, close_codes::TOO_LARGE, "message too large").await;
                return LoopAction::Stop;
            }
            match check_rate(state, handle).await {
                RateDecision::Allow => {}
                RateDecision::Reject => return LoopAction::Continue,
                RateDecision::Disconnect => return LoopAction::Stop,
            }
            if handle_text(state, claims, handle, &text, refresh_window).await {
                LoopAction::Continue
            } else {
                LoopAction::Stop
            }
        }
        // Protocol pings draw on the same budget as text messages.
        Message::Ping(payload) => match check_rate(state, handle).await {
            RateDecision::Allow => {
                let _ = handle.sender().send(Message::Pong(payload)).await;
                LoopAction::Continue
            }
            RateDecision::Reject => LoopAction::Continue,
            RateDecision::Disconnect => LoopAction::Stop,
        },
        Message::Pong(_) => LoopAction::Continue,
        Message::Binary(_) => {
            enqueue_close(handle, close_codes::POLICY, "binary frames not supported").await;
            LoopAction::Stop
        }
        Message::Close(_) => LoopAction::Stop,
    }
}

async fn check_rate(state: &AppState, handle: &Arc<ConnectionHandle>) -> RateDecision {
    let decision = state.limiter.check(handle.id);
    match decision {
        RateDecision::Allow => {}
        RateDecision::Reject => {
            counter!("mesa_gateway_messages_rejected_total", 1, "reason" => "rate");
            send_server(handle, &ServerMessage::Error {
                message: "rate limit exceeded, slow down".to_string(),
            })
            .await;
        }
        RateDecision::Disconnect => {
            warn!(connection_id = %handle.id, "repeat rate violations, disconnecting");
            enqueue_close(handle, close_codes::RATE_LIMITED, "rate limit exceeded").await;
        }
    }
    decision
}

/// Returns false when the connection should end.
async fn handle_text(
    state: &AppState,
    claims: &Claims,
    handle: &Arc<ConnectionHandle>,
    text: &str,
    refresh_window: &mut SlidingWindow,
) -> bool {
    match ClientMessage::parse(text) {
        Some(ClientMessage::Ping) => {
            send_server(handle, &ServerMessage::Pong).await;
            true
        }
        Some(ClientMessage::RefreshAssignment { branch_id }) => {
            if !refresh_window.try_hit() {
                send_server(handle, &ServerMessage::Error {
                    message: "assignment refresh limit reached".to_string(),
                })
                .await;
                return true;
            }
            refresh_assignment(state, claims, handle, branch_id).await;
            true
        }
        None => {
            counter!("mesa_gateway_messages_rejected_total", 1, "reason" => "unrecognized");
            send_server(handle, &ServerMessage::Error {
                message: "unrecognized message".to_string(),
            })
            .await;
            true
        }
    }
}

async fn refresh_assignment(
    state: &AppState,
    claims: &Claims,
    handle: &Arc<ConnectionHandle>,
    branch_id: i64,
) {
    let Some(user_id) = claims.user_id else {
        send_server(handle, &ServerMessage::Error {
            message: "assignments apply to staff connections".to_string(),
        })
        .await;
        return;
    };
    if !handle.branch_ids.contains(&branch_id) {
        send_server(handle, &ServerMessage::Error {
            message: format!("not assigned to branch {branch_id}"),
        })
        .await;
        return;
    }

    match state
        .assignments
        .sectors_for(handle.tenant_id, branch_id, user_id)
        .await
    {
        Ok(sector_ids) => {
            send_server(handle, &ServerMessage::Assignment {
                branch_id,
                sector_ids,
            })
            .await;
        }
        Err(err) => {
            warn!(connection_id = %handle.id, error = %err, "assignment lookup failed");
            send_server(handle, &ServerMessage::Error {
                message: "assignment lookup unavailable".to_string(),
            })
            .await;
        }
    }
}

async fn send_server(handle: &Arc<ConnectionHandle>, message: &ServerMessage) {
    if let Ok(json) = serde_json::to_string(message) {
        let _ = handle.sender().send(Message::Text(json)).await;
    }
}

async fn enqueue_close(handle: &Arc<ConnectionHandle>, code: u16, reason: &'static str) {
    counter!("mesa_gateway_closes_sent_total", 1, "close_code" => code.to_string());
    let _ = handle.sender().send(close_message(code, reason)).await;
}
