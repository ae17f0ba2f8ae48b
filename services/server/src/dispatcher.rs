//! Server-side dispatcher (spec §4.3): turns one public HTTP request into a
//! request frame sequence on the chosen client's control channel, and waits
//! for the response assembler to resolve the matching [`RequestTask`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use tunnel_protocol::RequestFrame;

use crate::errors::DispatchError;
use crate::request_state::RequestOutcome;
use crate::ws_tunnel;
use crate::AppState;

/// Timeout racing a resolving [`RequestTask`] (spec §4.3 step 7).
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// What [`dispatch_inner`] produced: either a response ready to return
/// as-is, or a resolved [`RequestOutcome::WsTunnel`] that still needs the
/// original public connection upgraded and piped (spec §4.8). The upgrade
/// itself happens in [`dispatch`], which is the only place holding the
/// `WebSocketUpgrade` extractor.
enum DispatchOutcome {
    Response(Response),
    Upgrade(axum::extract::ws::WebSocket),
}

pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Response {
    let method = req.method().clone();
    match dispatch_inner(&state, remote, req).await {
        Ok(DispatchOutcome::Response(resp)) => resp,
        Ok(DispatchOutcome::Upgrade(inner)) => match ws {
            Some(ws) => ws.on_upgrade(move |outer| ws_tunnel::pipe_bidirectional(outer, inner)),
            None => StatusCode::BAD_REQUEST.into_response(),
        },
        Err(e) => e.into_response_for(&method),
    }
}

async fn dispatch_inner(
    state: &Arc<AppState>,
    remote: SocketAddr,
    req: Request<Body>,
) -> Result<DispatchOutcome, DispatchError> {
    let (parts, body) = req.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let headers = parts.headers;

    // --- 1. Admission -------------------------------------------------
    check_admission(state, &headers, &uri)?;

    // --- 2. Selection ---------------------------------------------------
    let client_ip = resolve_client_ip(&headers, remote);
    let client = state
        .registry
        .select(&client_ip)
        .await
        .ok_or(DispatchError::NoClientAvailable)?;

    // --- 3. Header assembly --------------------------------------------
    let mut out_headers: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| (k.as_str().to_owned(), v.to_str().unwrap_or("").to_owned()))
        .collect();
    let scheme = if uri.scheme_str() == Some("https") {
        "https"
    } else {
        "http"
    };
    if !has_header(&out_headers, "x-forwarded-for") {
        out_headers.push(("x-forwarded-for".into(), client_ip.clone()));
    }
    if !has_header(&out_headers, "x-forwarded-proto") {
        out_headers.push(("x-forwarded-proto".into(), scheme.into()));
    }
    if state.config.forward_host {
        // Leave the original `host` header as-is for the client to reuse.
    } else if !has_header(&out_headers, "x-forwarded-host") {
        if let Some(host) = header_value(&headers, "host") {
            out_headers.push(("x-forwarded-host".into(), host));
        }
    }

    // --- 4. Allocation ---------------------------------------------------
    let request_id = state.request_ids.next();
    let rx = state.request_state.create_task(request_id.clone()).await;
    client
        .pending_requests
        .lock()
        .await
        .insert(request_id.clone());

    info!(request_id = %request_id, client_id = %client.client_id, %method, path = %uri.path(), "dispatching request");

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| uri.path().to_owned());

    let completed = Arc::new(AtomicBool::new(false));
    let abort_guard = AbortGuard {
        client: Arc::clone(&client),
        request_id: request_id.clone(),
        completed: Arc::clone(&completed),
    };

    // --- 5. Transmission --------------------------------------------------
    if state.config.buffer_request {
        let buffered = buffer_body(body).await;
        let frame = RequestFrame::Buffered {
            request_id: request_id.clone(),
            method: method.to_string(),
            path: path_and_query,
            headers: out_headers,
            body: buffered,
        };
        send_frame(&client, &frame);
    } else {
        let has_body = !matches!(method, Method::GET | Method::HEAD)
            || headers.get(axum::http::header::CONTENT_LENGTH).is_some();
        let header_frame = RequestFrame::Header {
            request_id: request_id.clone(),
            method: method.to_string(),
            path: path_and_query,
            headers: out_headers,
            eof: !has_body,
        };
        send_frame(&client, &header_frame);
        if has_body {
            pump_request_body(Arc::clone(&client), request_id.clone(), body);
        }
    }

    // --- 7. Await -----------------------------------------------------
    let result = tokio::time::timeout(RESPONSE_TIMEOUT, rx).await;
    completed.store(true, Ordering::SeqCst);
    drop(abort_guard);

    // --- 8. Cleanup -----------------------------------------------------
    state.request_state.remove_task(&request_id).await;
    client.pending_requests.lock().await.remove(&request_id);

    match result {
        Err(_) => {
            warn!(request_id = %request_id, "response timed out");
            Err(DispatchError::Timeout)
        }
        Ok(Err(_)) => {
            // Oneshot dropped without a value: client disconnected mid-flight.
            Err(DispatchError::Timeout)
        }
        Ok(Ok(RequestOutcome::Http(outcome))) => {
            let mut builder = Response::builder().status(
                StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            );
            for (k, v) in &outcome.headers {
                builder = builder.header(k, v);
            }
            let body = match outcome.body {
                Some(rx) => Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, std::io::Error>)),
                None => Body::empty(),
            };
            Ok(DispatchOutcome::Response(builder.body(body).unwrap()))
        }
        Ok(Ok(RequestOutcome::WsTunnel(inner))) => Ok(DispatchOutcome::Upgrade(inner)),
    }
}

fn check_admission(
    state: &AppState,
    headers: &HeaderMap,
    uri: &axum::http::Uri,
) -> Result<(), DispatchError> {
    let Some(expected) = &state.config.auth_token else {
        return Ok(());
    };
    let provided = header_value(headers, "x-auth-token").or_else(|| {
        header_value(headers, "authorization")
            .and_then(|v| v.strip_prefix("Bearer ").map(str::to_owned))
    });
    if provided.as_deref() == Some(expected.as_str()) {
        return Ok(());
    }
    if let Some(rule) = &state.config.auth_rule {
        if rule.is_match(uri.path()) {
            return Ok(());
        }
    }
    Err(DispatchError::Unauthorized)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

fn resolve_client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    header_value(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_owned()))
        .unwrap_or_else(|| remote.ip().to_string())
}

fn send_frame(client: &crate::registry::ClientRecord, frame: &RequestFrame) {
    let bytes = frame.encode();
    let _ = client.outbox.send(WsMessage::Binary(bytes));
}

async fn buffer_body(body: Body) -> Option<Vec<u8>> {
    let collected = http_body_util::BodyExt::collect(body).await.ok()?;
    let bytes = collected.to_bytes();
    if bytes.is_empty() {
        None
    } else {
        Some(bytes.to_vec())
    }
}

/// Stream the request body as `RequestFrame::Body` chunks, concurrently
/// with the caller awaiting the response (spec §4.3 step 5, §5 duplex
/// streaming). Runs detached; its only side effect is sending frames.
fn pump_request_body(client: Arc<crate::registry::ClientRecord>, request_id: String, body: Body) {
    tokio::spawn(async move {
        let mut stream = http_body_util::BodyDataStream::new(body);
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    let frame = RequestFrame::Body {
                        request_id: request_id.clone(),
                        data: Some(chunk_to_vec(chunk)),
                        eof: false,
                    };
                    send_frame(&client, &frame);
                }
                Some(Err(e)) => {
                    debug!(request_id = %request_id, error = %e, "request body read error");
                    break;
                }
                None => break,
            }
        }
        let terminal = RequestFrame::Body {
            request_id: request_id.clone(),
            data: None,
            eof: true,
        };
        send_frame(&client, &terminal);
    });
}

fn chunk_to_vec(b: Bytes) -> Vec<u8> {
    b.to_vec()
}

/// Sends a `request-abort` frame if the dispatcher's await is torn down
/// (cancelled inbound request) before a response arrives (spec §4.3 step 6).
struct AbortGuard {
    client: Arc<crate::registry::ClientRecord>,
    request_id: String,
    completed: Arc<AtomicBool>,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.completed.load(Ordering::SeqCst) {
            let frame = RequestFrame::Abort {
                request_id: self.request_id.clone(),
            };
            send_frame(&self.client, &frame);
        }
    }
}
