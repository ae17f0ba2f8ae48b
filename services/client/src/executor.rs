//! Client-side request executor (spec §4.6): turns an incoming
//! `RequestFrame` into a call against the local origin and streams the
//! result back as `ResponseFrame`s.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use tunnel_protocol::{HeaderList, ResponseFrame};

use crate::body_state::BodyState;

/// Bounds how far a request body can run ahead of the local origin
/// consuming it (spec §9 open question 3's mitigation, mirrored from the
/// server side).
pub const BODY_CHANNEL_CAPACITY: usize = 64;

pub struct ExecutorState {
    pub http: reqwest::Client,
    pub local_base: url::Url,
    pub body_state: Arc<BodyState>,
    pub outbox: mpsc::UnboundedSender<Message>,
}

fn send_frame(outbox: &mpsc::UnboundedSender<Message>, frame: &ResponseFrame) {
    let _ = outbox.send(Message::Binary(frame.encode()));
}

/// Whether a request header frame describes a WebSocket upgrade (spec
/// §4.6, §4.8): `GET` plus an `Upgrade: websocket` header.
pub fn is_websocket_upgrade(method: &str, headers: &HeaderList) -> bool {
    method.eq_ignore_ascii_case("GET")
        && headers.iter().any(|(k, v)| {
            k.eq_ignore_ascii_case("upgrade") && v.eq_ignore_ascii_case("websocket")
        })
}

fn header_value<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Handle a `request-header` (or fully buffered `request`) frame: issue the
/// local HTTP call and stream the response back. Runs detached; its only
/// side effect is sending frames and (for streaming requests) registering a
/// body writer/abort handle under `request_id`.
pub fn dispatch_request(
    state: Arc<ExecutorState>,
    request_id: String,
    method: String,
    path: String,
    headers: HeaderList,
    body: RequestBody,
) {
    tokio::spawn(async move {
        let (abort_tx, abort_rx) = oneshot::channel();
        let is_streaming = matches!(body, RequestBody::Streaming(_));
        if is_streaming {
            state
                .body_state
                .register_abort(request_id.clone(), abort_tx)
                .await;
        }

        let outcome = tokio::select! {
            biased;
            _ = abort_rx, if is_streaming => None,
            result = run_request(&state, &request_id, &method, &path, &headers, body) => Some(result),
        };
        state.body_state.remove_abort(&request_id).await;

        match outcome {
            None => debug!(request_id = %request_id, "local request aborted"),
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!(request_id = %request_id, error = %e, "local origin unreachable");
                send_frame(
                    &state.outbox,
                    &ResponseFrame::Header {
                        request_id,
                        status: 502,
                        status_text: "Bad Gateway".into(),
                        headers: vec![],
                        eof: true,
                    },
                );
            }
        }
    });
}

/// What kind of body (if any) accompanies this request.
pub enum RequestBody {
    /// `eof=true` on the header frame: no body.
    None,
    /// Buffered request: the whole body arrived inline.
    Buffered(Option<Vec<u8>>),
    /// Streaming request: body chunks arrive as later `request-body` frames.
    /// The caller has already registered the paired writer half under
    /// `request_id` in `BodyState` (synchronously, before spawning this
    /// request) so no `request-body` frame can race ahead of it.
    Streaming(mpsc::Receiver<Bytes>),
}

async fn run_request(
    state: &ExecutorState,
    request_id: &str,
    method: &str,
    path: &str,
    headers: &HeaderList,
    body: RequestBody,
) -> Result<(), reqwest::Error> {
    let url = state
        .local_base
        .join(path)
        .unwrap_or_else(|_| state.local_base.clone());
    let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);

    let mut builder = state.http.request(method, url);
    for (k, v) in headers {
        if k.eq_ignore_ascii_case("host") && header_value(headers, "x-forwarded-host").is_some() {
            // The local origin must see its own authority, not the public one.
            continue;
        }
        builder = builder.header(k, v);
    }

    builder = match body {
        RequestBody::None => builder,
        RequestBody::Buffered(Some(data)) => builder.body(data),
        RequestBody::Buffered(None) => builder,
        RequestBody::Streaming(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, std::io::Error>);
            builder.body(reqwest::Body::wrap_stream(stream))
        }
    };

    let response = builder.send().await?;
    let status = response.status();
    let mut out_headers: HeaderList = response
        .headers()
        .iter()
        .filter(|(k, _)| !k.as_str().eq_ignore_ascii_case("content-encoding"))
        .map(|(k, v)| (k.as_str().to_owned(), v.to_str().unwrap_or("").to_owned()))
        .collect();

    let mut body_stream = response.bytes_stream();
    let first_chunk = body_stream.next().await;
    let eof = first_chunk.is_none();

    send_frame(
        &state.outbox,
        &ResponseFrame::Header {
            request_id: request_id.to_owned(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_owned(),
            headers: std::mem::take(&mut out_headers),
            eof,
        },
    );

    if eof {
        return Ok(());
    }

    let mut chunk = first_chunk;
    loop {
        match chunk {
            Some(Ok(bytes)) => {
                send_frame(
                    &state.outbox,
                    &ResponseFrame::Body {
                        request_id: request_id.to_owned(),
                        data: Some(bytes.to_vec()),
                        eof: false,
                    },
                );
            }
            Some(Err(e)) => {
                debug!(request_id = %request_id, error = %e, "response body read error");
                break;
            }
            None => break,
        }
        chunk = body_stream.next().await;
    }

    send_frame(
        &state.outbox,
        &ResponseFrame::Body {
            request_id: request_id.to_owned(),
            data: None,
            eof: true,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_upgrade_requires_get_and_upgrade_header() {
        let headers = vec![("upgrade".to_owned(), "websocket".to_owned())];
        assert!(is_websocket_upgrade("GET", &headers));
        assert!(!is_websocket_upgrade("POST", &headers));
        assert!(!is_websocket_upgrade("GET", &[]));
    }

    #[test]
    fn websocket_upgrade_header_match_is_case_insensitive() {
        let headers = vec![("Upgrade".to_owned(), "WebSocket".to_owned())];
        assert!(is_websocket_upgrade("get", &headers));
    }
}
