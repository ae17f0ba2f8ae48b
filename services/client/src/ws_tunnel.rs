//! Client-side WebSocket tunnelling (spec §4.8). On detecting a WS upgrade
//! request, opens a WebSocket to the local origin and a second WebSocket
//! back to the server's `/__ws__`, then pipes the two bidirectionally.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use tunnel_protocol::HeaderList;

/// Headers that are part of the WS handshake itself and must not be
/// forwarded verbatim to either leg's own handshake.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-accept",
];

fn build_request(
    url: &str,
    headers: &HeaderList,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, String> {
    let mut request = url
        .into_client_request()
        .map_err(|e| format!("invalid url '{url}': {e}"))?;
    for (k, v) in headers {
        if HOP_BY_HOP.iter().any(|h| k.eq_ignore_ascii_case(h)) {
            continue;
        }
        let Ok(name) = k.parse::<tokio_tungstenite::tungstenite::http::HeaderName>() else {
            continue;
        };
        let Ok(value) = v.parse() else { continue };
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

/// Open both legs and pipe them together. `local_base` is the client's
/// configured local origin; `remote_ws_url` is the server's `/__ws__`
/// endpoint, already carrying `clientId`, `requestId`, and an optional
/// token query string.
pub async fn handle_ws_upgrade(
    local_base: &url::Url,
    path: &str,
    headers: &HeaderList,
    remote_ws_url: String,
) {
    let Ok(local_url) = local_base.join(path) else {
        warn!(path, "cannot join ws path against local origin");
        return;
    };
    let local_ws_url = to_ws_scheme(local_url);

    let local_request = match build_request(local_ws_url.as_str(), headers) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "failed to build local ws request");
            return;
        }
    };
    let (local_ws, _) = match tokio_tungstenite::connect_async(local_request).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "failed to connect to local origin ws");
            return;
        }
    };

    let (server_ws, _) = match tokio_tungstenite::connect_async(remote_ws_url).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "failed to connect back to server /__ws__");
            return;
        }
    };

    pipe_bidirectional(local_ws, server_ws).await;
}

fn to_ws_scheme(mut url: url::Url) -> url::Url {
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    let _ = url.set_scheme(scheme);
    url
}

async fn pipe_bidirectional<A, B>(a: A, b: B)
where
    A: futures_util::Sink<Message> + futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    B: futures_util::Sink<Message> + futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let (mut a_tx, mut a_rx) = a.split();
    let (mut b_tx, mut b_rx) = b.split();

    let a_to_b = async {
        while let Some(msg) = a_rx.next().await {
            match msg {
                Ok(msg) => {
                    if b_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "local origin ws read error");
                    break;
                }
            }
        }
        let _ = b_tx.send(Message::Close(None)).await;
    };
    let b_to_a = async {
        while let Some(msg) = b_rx.next().await {
            match msg {
                Ok(msg) => {
                    if a_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "server ws leg read error");
                    break;
                }
            }
        }
        let _ = a_tx.send(Message::Close(None)).await;
    };

    tokio::join!(a_to_b, b_to_a);
}
