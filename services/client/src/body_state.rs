//! Client-side bookkeeping for in-flight requests (spec §4.6): the writable
//! side of a streaming request body, keyed by `requestId`, and an abort
//! signal the dispatcher's `request-abort` frame can trigger.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};

type WriterMap = HashMap<String, mpsc::Sender<Bytes>>;
type AbortMap = HashMap<String, oneshot::Sender<()>>;

#[derive(Default)]
pub struct BodyState {
    writers: Mutex<WriterMap>,
    aborts: Mutex<AbortMap>,
}

impl BodyState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn create_writer(&self, request_id: String, tx: mpsc::Sender<Bytes>) {
        self.writers.lock().await.insert(request_id, tx);
    }

    /// Append a body chunk. Returns `false` if there is no writer for this
    /// id (dropped per spec §4.1 protocol-skew tolerance).
    pub async fn write_chunk(&self, request_id: &str, data: Bytes) -> bool {
        let tx = self.writers.lock().await.get(request_id).cloned();
        match tx {
            Some(tx) => tx.send(data).await.is_ok(),
            None => false,
        }
    }

    pub async fn close_writer(&self, request_id: &str) {
        self.writers.lock().await.remove(request_id);
    }

    /// Register the abort signal for an in-flight local request (spec §4.6
    /// "optional cancel" note under §9 open question 1).
    pub async fn register_abort(&self, request_id: String, tx: oneshot::Sender<()>) {
        self.aborts.lock().await.insert(request_id, tx);
    }

    /// Fire the abort signal for `request_id`, if one is registered.
    pub async fn trigger_abort(&self, request_id: &str) {
        if let Some(tx) = self.aborts.lock().await.remove(request_id) {
            let _ = tx.send(());
        }
    }

    pub async fn remove_abort(&self, request_id: &str) {
        self.aborts.lock().await.remove(request_id);
    }
}
