//! Control-channel endpoints (spec §6.2): `/__connect__`, `/__ping__`,
//! `/__ws__`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{info, warn};
use tunnel_protocol::{ResponseFrame, LIVENESS_PING, LIVENESS_PONG};

use crate::request_state::RequestOutcome;
use crate::AppState;

// ---------------------------------------------------------------------------
// GET /__connect__?clientId=...&token=...
// ---------------------------------------------------------------------------

pub async fn connect(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let Some(client_id) = params.get("clientId").filter(|s| !s.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing clientId").into_response();
    };
    if let Some(expected) = &state.config.conn_token {
        let provided = params.get("token").map(String::as_str).unwrap_or("");
        if provided != expected {
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    }
    let client_id = client_id.clone();
    ws.on_upgrade(move |socket| handle_control_socket(socket, state, client_id))
}

async fn handle_control_socket(socket: WebSocket, state: Arc<AppState>, client_id: String) {
    let (mut sink, mut stream) = socket.split();
    let (outbox_tx, mut outbox_rx) = tokio::sync::mpsc::unbounded_channel::<WsMessage>();
    let record = state.registry.connect(client_id.clone(), outbox_tx).await;
    info!(client_id = %client_id, "client connected");

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(WsMessage::Binary(bytes)) => {
                if let Some(frame) = ResponseFrame::decode(&bytes) {
                    crate::assembler::handle_response_frame(&state.request_state, &record, frame)
                        .await;
                } else {
                    warn!(client_id = %client_id, "malformed frame dropped");
                }
            }
            Ok(WsMessage::Text(text)) => {
                if text == LIVENESS_PING {
                    let _ = record.outbox.send(WsMessage::Text(LIVENESS_PONG.into()));
                }
                // Unknown text messages are ignored (spec §4.7).
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "control channel error");
                break;
            }
        }
    }

    on_client_disconnect(&state, &client_id, &record).await;
    writer_task.abort();
}

/// Spec §4.5 step close sequence: resolve pending requests with a
/// synthetic 500, close active response writers, then tombstone the slot.
async fn on_client_disconnect(
    state: &Arc<AppState>,
    client_id: &str,
    record: &Arc<crate::registry::ClientRecord>,
) {
    info!(client_id = %client_id, "client disconnected");

    let pending: Vec<String> = record.pending_requests.lock().await.drain().collect();
    for request_id in pending {
        state
            .request_state
            .resolve_task(
                &request_id,
                RequestOutcome::Http(crate::request_state::HttpOutcome {
                    status: 500,
                    status_text: "Internal Server Error".into(),
                    headers: vec![],
                    body: None,
                }),
            )
            .await;
    }

    let active: Vec<String> = record.active_responses.lock().await.drain().collect();
    for request_id in active {
        state.request_state.close_writer(&request_id).await;
    }

    state.registry.disconnect(client_id).await;
}

// ---------------------------------------------------------------------------
// GET /__ping__?clientId=...
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PingResponse {
    ok: bool,
    code: u16,
    message: String,
}

pub async fn ping(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(client_id) = params.get("clientId") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(PingResponse {
                ok: false,
                code: 400,
                message: "missing clientId".into(),
            }),
        );
    };
    match state.registry.get(client_id).await {
        Some(_) => (
            StatusCode::OK,
            Json(PingResponse {
                ok: true,
                code: 200,
                message: "ok".into(),
            }),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(PingResponse {
                ok: false,
                code: 404,
                message: "no such client".into(),
            }),
        ),
    }
}

// ---------------------------------------------------------------------------
// GET /__ws__?clientId=...&requestId=...&token=...  (spec §4.8)
// ---------------------------------------------------------------------------

pub async fn ws_tunnel_inbound(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    if let Some(expected) = &state.config.conn_token {
        let provided = params.get("token").map(String::as_str).unwrap_or("");
        if provided != expected {
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    }
    let Some(request_id) = params.get("requestId").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing requestId").into_response();
    };
    if !state.request_state.has_task(&request_id).await {
        return (StatusCode::NOT_FOUND, "no matching request").into_response();
    }
    ws.on_upgrade(move |socket| async move {
        let resolved = state
            .request_state
            .resolve_task(&request_id, RequestOutcome::WsTunnel(socket))
            .await;
        if !resolved {
            warn!(request_id = %request_id, "ws tunnel inbound leg arrived for unknown request");
        }
    })
}
