//! Bidirectional WebSocket piping for tunnelled upgrade requests (spec
//! §4.8): the server upgrades the original public connection and forwards
//! frames between it and the inner leg opened by the client against its
//! local origin. Either side closing (or erroring) tears the other down;
//! pipe errors are swallowed, matching the liveness/control channel's
//! best-effort forwarding style.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

/// Pipe `outer` (the public caller) and `inner` (the client's local-origin
/// leg) until either side closes or errors.
pub async fn pipe_bidirectional(outer: WebSocket, inner: WebSocket) {
    let (mut outer_tx, mut outer_rx) = outer.split();
    let (mut inner_tx, mut inner_rx) = inner.split();

    let outer_to_inner = async {
        while let Some(msg) = outer_rx.next().await {
            match msg {
                Ok(msg) => {
                    if inner_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "public ws leg read error");
                    break;
                }
            }
        }
        let _ = inner_tx.send(Message::Close(None)).await;
    };

    let inner_to_outer = async {
        while let Some(msg) = inner_rx.next().await {
            match msg {
                Ok(msg) => {
                    if outer_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "inner ws leg read error");
                    break;
                }
            }
        }
        let _ = outer_tx.send(Message::Close(None)).await;
    };

    tokio::join!(outer_to_inner, inner_to_outer);
}
