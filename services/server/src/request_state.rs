//! The two process-wide maps shared by the dispatcher, the response
//! assembler, and the client-disconnect handler (spec §3, §5, §9 --
//! `RegistryOfPerRequestState`).
//!
//! Creation, lookup and removal are the only operations exposed; the lock
//! is held only for a map mutation, never across I/O.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tunnel_protocol::HeaderList;

/// What a [`RequestTask`] resolves to: either a complete (or streaming)
/// HTTP response, or an upstream WebSocket handle for §4.8 tunnelling.
pub enum RequestOutcome {
    Http(HttpOutcome),
    WsTunnel(WebSocket),
}

pub struct HttpOutcome {
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderList,
    /// `None` for a bodyless (`eof = true` on the header frame) response.
    pub body: Option<mpsc::Receiver<Bytes>>,
}

/// One-shot rendezvous per in-flight request (spec §3 `RequestTask`).
type TaskMap = HashMap<String, oneshot::Sender<RequestOutcome>>;
/// Writable side of a streaming response body (spec §3 `ResponseBodyWriter`).
type WriterMap = HashMap<String, mpsc::Sender<Bytes>>;

#[derive(Default)]
pub struct RequestState {
    tasks: Mutex<TaskMap>,
    writers: Mutex<WriterMap>,
}

impl RequestState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a task for `request_id`; returns the receiving half the
    /// dispatcher awaits.
    pub async fn create_task(&self, request_id: String) -> oneshot::Receiver<RequestOutcome> {
        let (tx, rx) = oneshot::channel();
        self.tasks.lock().await.insert(request_id, tx);
        rx
    }

    /// Resolve a pending task. Returns `false` if no task was pending
    /// (already resolved, timed out, or never existed) -- the frame is
    /// simply dropped in that case per spec §4.4.
    pub async fn resolve_task(&self, request_id: &str, outcome: RequestOutcome) -> bool {
        if let Some(tx) = self.tasks.lock().await.remove(request_id) {
            tx.send(outcome).is_ok()
        } else {
            false
        }
    }

    /// Remove a task without resolving it (timeout / abort / cleanup path).
    pub async fn remove_task(&self, request_id: &str) {
        self.tasks.lock().await.remove(request_id);
    }

    /// Whether a task is still pending -- used to reject the `/__ws__`
    /// inbound leg with `404` *before* upgrading (spec §6.2).
    pub async fn has_task(&self, request_id: &str) -> bool {
        self.tasks.lock().await.contains_key(request_id)
    }

    pub async fn create_writer(&self, request_id: String, tx: mpsc::Sender<Bytes>) {
        self.writers.lock().await.insert(request_id, tx);
    }

    /// Append a body chunk. Returns `false` if there is no writer (dropped
    /// per spec §4.4).
    pub async fn write_chunk(&self, request_id: &str, data: Bytes) -> bool {
        let tx = self.writers.lock().await.get(request_id).cloned();
        match tx {
            Some(tx) => tx.send(data).await.is_ok(),
            None => false,
        }
    }

    /// Close (drop) the writer, signalling EOF to the response body stream.
    pub async fn close_writer(&self, request_id: &str) {
        self.writers.lock().await.remove(request_id);
    }

    pub async fn writer_request_ids(&self) -> Vec<String> {
        self.writers.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_missing_task_returns_false() {
        let state = RequestState::new();
        let resolved = state
            .resolve_task(
                "missing",
                RequestOutcome::Http(HttpOutcome {
                    status: 200,
                    status_text: "OK".into(),
                    headers: vec![],
                    body: None,
                }),
            )
            .await;
        assert!(!resolved);
    }

    #[tokio::test]
    async fn create_then_resolve_delivers_to_receiver() {
        let state = RequestState::new();
        let rx = state.create_task("r1".into()).await;
        let resolved = state
            .resolve_task(
                "r1",
                RequestOutcome::Http(HttpOutcome {
                    status: 204,
                    status_text: "No Content".into(),
                    headers: vec![],
                    body: None,
                }),
            )
            .await;
        assert!(resolved);
        match rx.await.unwrap() {
            RequestOutcome::Http(h) => assert_eq!(h.status, 204),
            RequestOutcome::WsTunnel(_) => panic!("expected http"),
        }
    }

    #[tokio::test]
    async fn write_chunk_without_writer_is_dropped() {
        let state = RequestState::new();
        assert!(!state.write_chunk("nope", Bytes::from_static(b"x")).await);
    }
}
