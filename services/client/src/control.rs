//! Client-side control channel: connects to the server's `/__connect__`,
//! dispatches incoming `RequestFrame`s to the executor or the WS tunnel,
//! and runs the liveness health check (spec §4.6, §4.7).

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use tunnel_protocol::{RequestFrame, LIVENESS_PING, LIVENESS_PONG};

use crate::body_state::BodyState;
use crate::config::Config;
use crate::executor::{self, ExecutorState, RequestBody};
use crate::liveness::{self, SessionEnd};
use crate::ws_tunnel;

fn connect_url(cfg: &Config) -> String {
    let mut url = format!(
        "{}/__connect__?clientId={}",
        cfg.remote_url.trim_end_matches('/'),
        urlencoding_encode(&cfg.client_id)
    );
    if let Some(token) = &cfg.conn_token {
        url.push_str("&token=");
        url.push_str(&urlencoding_encode(token));
    }
    url
}

/// Minimal query-string escaping; the values we encode (client id, bearer
/// token) are caller-controlled and never contain structural characters in
/// practice, but this keeps `&`/`=`/space from corrupting the query.
fn urlencoding_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Run one control-channel session to completion: connect, handshake, pump
/// frames until the socket closes or errors. Returns the reason the session
/// ended, driving the caller's reconnect decision.
pub async fn run_session(cfg: &Config, http: reqwest::Client) -> SessionEnd {
    let request = match connect_url(cfg).into_client_request() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "invalid REMOTE_URL");
            return SessionEnd::ErrorBeforeOpen;
        }
    };

    let ws = match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _response)) => ws,
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) if resp.status().as_u16() == 401 => {
            return SessionEnd::Unauthorized;
        }
        Err(e) => {
            warn!(error = %e, "failed to connect control channel");
            return SessionEnd::ErrorBeforeOpen;
        }
    };
    info!(client_id = %cfg.client_id, "control channel open");

    let (mut sink, mut stream) = ws.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let body_state = BodyState::new();
    let executor_state = Arc::new(ExecutorState {
        http,
        local_base: cfg.local_url.clone(),
        body_state: Arc::clone(&body_state),
        outbox: outbox_tx.clone(),
    });

    let mut last_activity = tokio::time::Instant::now();
    let mut health_tick = tokio::time::interval(Duration::from_secs(1));
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "control channel read error");
                        break;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        last_activity = tokio::time::Instant::now();
                        if let Some(frame) = RequestFrame::decode(&bytes) {
                            handle_request_frame(
                                Arc::clone(&executor_state),
                                cfg,
                                frame,
                            ).await;
                        } else {
                            warn!("malformed frame dropped");
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_activity = tokio::time::Instant::now();
                        if text == LIVENESS_PING {
                            let _ = outbox_tx.send(Message::Text(LIVENESS_PONG.into()));
                        } else if text == LIVENESS_PONG {
                            let _ = pong_tx.send(());
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = health_tick.tick() => {
                let idle = last_activity.elapsed();
                if liveness::should_ping(idle, cfg.ping_interval) {
                    if outbox_tx.send(Message::Text(LIVENESS_PING.into())).is_err() {
                        break;
                    }
                    if !await_pong(&mut pong_rx).await {
                        warn!("pong timeout, closing control channel");
                        break;
                    }
                    last_activity = tokio::time::Instant::now();
                    if probe_reports_forgotten(cfg, &executor_state.http).await {
                        warn!("server has forgotten this client, reconnecting");
                        break;
                    }
                }
            }
        }
    }

    writer_task.abort();
    SessionEnd::ClosedAfterOpen
}

async fn await_pong(pong_rx: &mut mpsc::UnboundedReceiver<()>) -> bool {
    tokio::time::timeout(liveness::PONG_TIMEOUT, pong_rx.recv())
        .await
        .map(|v| v.is_some())
        .unwrap_or(false)
}

/// Secondary HTTP probe (spec §4.7): if the server reports `ok:false,
/// code:404` it has forgotten this client (typically after a redeploy).
async fn probe_reports_forgotten(cfg: &Config, http: &reqwest::Client) -> bool {
    let base = cfg.remote_url.trim_end_matches('/');
    let scheme_fixed = base.replacen("ws://", "http://", 1).replacen("wss://", "https://", 1);
    let url = format!(
        "{scheme_fixed}/__ping__?clientId={}",
        urlencoding_encode(&cfg.client_id)
    );
    match http.get(&url).send().await {
        Ok(resp) if resp.status() == 404 => true,
        Ok(_) | Err(_) => false,
    }
}

async fn handle_request_frame(state: Arc<ExecutorState>, cfg: &Config, frame: RequestFrame) {
    match frame {
        RequestFrame::Header {
            request_id,
            method,
            path,
            headers,
            eof,
        } => {
            if executor::is_websocket_upgrade(&method, &headers) {
                let remote_ws_url = ws_tunnel_url(cfg, &request_id);
                let local_base = state.local_base.clone();
                tokio::spawn(async move {
                    ws_tunnel::handle_ws_upgrade(&local_base, &path, &headers, remote_ws_url).await;
                });
                return;
            }
            let body = if eof {
                RequestBody::None
            } else {
                // Register the writer synchronously, before this frame's
                // handling returns control to the recv loop, so the next
                // `request-body` frame can never arrive ahead of it.
                let (tx, rx) = mpsc::channel::<bytes::Bytes>(executor::BODY_CHANNEL_CAPACITY);
                state.body_state.create_writer(request_id.clone(), tx).await;
                RequestBody::Streaming(rx)
            };
            executor::dispatch_request(state, request_id, method, path, headers, body);
        }
        RequestFrame::Buffered {
            request_id,
            method,
            path,
            headers,
            body,
        } => {
            executor::dispatch_request(
                state,
                request_id,
                method,
                path,
                headers,
                RequestBody::Buffered(body),
            );
        }
        RequestFrame::Body {
            request_id,
            data,
            eof,
        } => {
            if eof {
                state.body_state.close_writer(&request_id).await;
            } else if let Some(data) = data {
                state
                    .body_state
                    .write_chunk(&request_id, bytes::Bytes::from(data))
                    .await;
            }
        }
        RequestFrame::Abort { request_id } => {
            state.body_state.trigger_abort(&request_id).await;
        }
    }
}

fn ws_tunnel_url(cfg: &Config, request_id: &str) -> String {
    let mut url = format!(
        "{}/__ws__?clientId={}&requestId={}",
        cfg.remote_url.trim_end_matches('/'),
        urlencoding_encode(&cfg.client_id),
        urlencoding_encode(request_id)
    );
    if let Some(token) = &cfg.conn_token {
        url.push_str("&token=");
        url.push_str(&urlencoding_encode(token));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_url_includes_client_id_and_token() {
        let cfg = Config {
            client_id: "c 1".into(),
            remote_url: "wss://tunnel.example.com".into(),
            local_url: url::Url::parse("http://127.0.0.1:3000").unwrap(),
            conn_token: Some("s3cret".into()),
            ping_interval: Duration::from_secs(30),
        };
        let url = connect_url(&cfg);
        assert!(url.starts_with("wss://tunnel.example.com/__connect__?clientId=c%201"));
        assert!(url.contains("&token=s3cret"));
    }

    #[test]
    fn ws_tunnel_url_carries_request_id() {
        let cfg = Config {
            client_id: "c1".into(),
            remote_url: "wss://tunnel.example.com".into(),
            local_url: url::Url::parse("http://127.0.0.1:3000").unwrap(),
            conn_token: None,
            ping_interval: Duration::from_secs(30),
        };
        let url = ws_tunnel_url(&cfg, "r1");
        assert_eq!(
            url,
            "wss://tunnel.example.com/__ws__?clientId=c1&requestId=r1"
        );
    }
}
