//! Server-side response assembler (spec §4.4): turns `ResponseFrame`s
//! arriving on a client's control channel into `RequestTask` resolutions
//! and `ResponseBodyWriter` writes.
//!
//! Frame arrival order per `request_id` is assumed FIFO (the transport
//! guarantees it); this module never reorders.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tunnel_protocol::ResponseFrame;

use crate::registry::ClientRecord;
use crate::request_state::{HttpOutcome, RequestOutcome, RequestState};

/// Body channel capacity: bounds how far a response body can run ahead of
/// its consumer before the client-side pump blocks on `send`. Spec §9 open
/// question 3 calls out the lack of end-to-end backpressure; a bounded
/// queue here is the mitigation on the server's inbound side.
const BODY_CHANNEL_CAPACITY: usize = 64;

/// Handle one `ResponseFrame` from `client`. Unknown/unmatched frames are
/// dropped silently -- never fatal to the control channel.
pub async fn handle_response_frame(
    request_state: &Arc<RequestState>,
    client: &Arc<ClientRecord>,
    frame: ResponseFrame,
) {
    match frame {
        ResponseFrame::Header {
            request_id,
            status,
            status_text,
            headers,
            eof,
        } => {
            if eof {
                let resolved = request_state
                    .resolve_task(
                        &request_id,
                        RequestOutcome::Http(HttpOutcome {
                            status,
                            status_text,
                            headers,
                            body: None,
                        }),
                    )
                    .await;
                if !resolved {
                    debug!(request_id = %request_id, "response-header for unknown/resolved task dropped");
                }
            } else {
                let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
                request_state
                    .create_writer(request_id.clone(), tx)
                    .await;
                client
                    .active_responses
                    .lock()
                    .await
                    .insert(request_id.clone());
                let resolved = request_state
                    .resolve_task(
                        &request_id,
                        RequestOutcome::Http(HttpOutcome {
                            status,
                            status_text,
                            headers,
                            body: Some(rx),
                        }),
                    )
                    .await;
                if !resolved {
                    // Task already gone (timed out): tear the writer back down.
                    request_state.close_writer(&request_id).await;
                    client.active_responses.lock().await.remove(&request_id);
                }
            }
        }
        ResponseFrame::Body {
            request_id,
            data,
            eof,
        } => {
            if eof {
                request_state.close_writer(&request_id).await;
                client.active_responses.lock().await.remove(&request_id);
            } else if let Some(data) = data {
                if !request_state
                    .write_chunk(&request_id, bytes::Bytes::from(data))
                    .await
                {
                    warn!(request_id = %request_id, "response-body for unknown writer dropped");
                }
            }
        }
    }
}
