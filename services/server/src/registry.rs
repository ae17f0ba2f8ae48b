//! Server-side client registry (spec §4.5, §9 "tombstones").
//!
//! An ordered mapping from `ClientId` to a live record or a tombstone. A
//! naive `HashMap::remove` on disconnect would re-key the live set and move
//! sticky traffic around the load-balancing ring; instead a disconnected
//! client's slot is replaced with a tombstone, preserving its position so a
//! reconnect reoccupies the same index.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use axum::extract::ws::Message as WsMessage;
use tokio::sync::mpsc;

/// Per-connected-client state (spec §3 `ClientRecord`).
pub struct ClientRecord {
    pub client_id: String,
    /// Outbound sink to this client's control-channel WebSocket. A channel
    /// rather than the socket itself, so many dispatcher tasks can enqueue
    /// frames concurrently without fighting over a single writer.
    pub outbox: mpsc::UnboundedSender<WsMessage>,
    /// Request ids whose response has not yet begun.
    pub pending_requests: tokio::sync::Mutex<std::collections::HashSet<String>>,
    /// Request ids whose response body is still streaming.
    pub active_responses: tokio::sync::Mutex<std::collections::HashSet<String>>,
}

impl ClientRecord {
    fn new(client_id: String, outbox: mpsc::UnboundedSender<WsMessage>) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            outbox,
            pending_requests: tokio::sync::Mutex::new(std::collections::HashSet::new()),
            active_responses: tokio::sync::Mutex::new(std::collections::HashSet::new()),
        })
    }
}

enum Slot {
    Live(Arc<ClientRecord>),
    Tombstone,
}

#[derive(Default)]
struct Inner {
    /// Slots in insertion order; index is the ring position.
    slots: Vec<Slot>,
    /// `client_id` -> index into `slots`.
    index: HashMap<String, usize>,
}

/// The live/tombstoned client set, guarded by a single lock held only for
/// bookkeeping (no I/O while held).
pub struct ClientRegistry {
    inner: RwLock<Inner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Bind a fresh [`ClientRecord`] for `client_id`, reusing its prior slot
    /// (and thus ring position) if it reconnected after a disconnect.
    pub async fn connect(
        &self,
        client_id: String,
        outbox: mpsc::UnboundedSender<WsMessage>,
    ) -> Arc<ClientRecord> {
        let record = ClientRecord::new(client_id.clone(), outbox);
        let mut inner = self.inner.write().await;
        match inner.index.get(&client_id).copied() {
            Some(idx) => inner.slots[idx] = Slot::Live(Arc::clone(&record)),
            None => {
                let idx = inner.slots.len();
                inner.slots.push(Slot::Live(Arc::clone(&record)));
                inner.index.insert(client_id, idx);
            }
        }
        record
    }

    /// Replace `client_id`'s slot with a tombstone, preserving its position.
    /// A no-op if the client isn't currently registered.
    pub async fn disconnect(&self, client_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(&idx) = inner.index.get(client_id) {
            inner.slots[idx] = Slot::Tombstone;
        }
    }

    /// Look up a currently-live client by id (`None` if absent or
    /// tombstoned) -- used by `/__ping__`.
    pub async fn get(&self, client_id: &str) -> Option<Arc<ClientRecord>> {
        let inner = self.inner.read().await;
        match inner.index.get(client_id).map(|&idx| &inner.slots[idx]) {
            Some(Slot::Live(r)) => Some(Arc::clone(r)),
            _ => None,
        }
    }

    /// Sticky selection: `CRC32(ip) mod N` over the live clients in
    /// insertion order (spec §4.3 step 2). `None` if no client is live.
    pub async fn select(&self, ip: &str) -> Option<Arc<ClientRecord>> {
        let inner = self.inner.read().await;
        let live: Vec<&Arc<ClientRecord>> = inner
            .slots
            .iter()
            .filter_map(|s| match s {
                Slot::Live(r) => Some(r),
                Slot::Tombstone => None,
            })
            .collect();
        if live.is_empty() {
            return None;
        }
        let idx = (crc32fast::hash(ip.as_bytes()) as usize) % live.len();
        Some(Arc::clone(live[idx]))
    }

    pub async fn live_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner
            .slots
            .iter()
            .filter(|s| matches!(s, Slot::Live(_)))
            .count()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::UnboundedSender<WsMessage> {
        let (tx, _rx) = mpsc::unbounded_channel();
        tx
    }

    #[tokio::test]
    async fn reconnect_preserves_ring_position() {
        let reg = ClientRegistry::new();
        reg.connect("A".into(), sender()).await;
        reg.connect("B".into(), sender()).await;
        reg.connect("C".into(), sender()).await;

        // Find an IP that currently maps to B (index 1 of 3).
        let ip = (0u32..10_000)
            .map(|n| format!("10.0.0.{n}"))
            .find(|ip| (crc32fast::hash(ip.as_bytes()) as usize) % 3 == 1)
            .unwrap();

        let before = reg.select(&ip).await.unwrap();
        assert_eq!(before.client_id, "B");

        reg.disconnect("B").await;
        assert_eq!(reg.live_count().await, 2);
        reg.connect("B".into(), sender()).await;

        let after = reg.select(&ip).await.unwrap();
        assert_eq!(after.client_id, "B");
    }

    #[tokio::test]
    async fn tombstoned_client_is_not_selected() {
        let reg = ClientRegistry::new();
        reg.connect("only".into(), sender()).await;
        reg.disconnect("only").await;
        assert_eq!(reg.live_count().await, 0);
        assert!(reg.select("1.2.3.4").await.is_none());
        assert!(reg.get("only").await.is_none());
    }

    #[tokio::test]
    async fn no_clients_selects_none() {
        let reg = ClientRegistry::new();
        assert!(reg.select("1.2.3.4").await.is_none());
    }
}
