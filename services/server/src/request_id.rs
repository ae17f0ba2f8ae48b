//! `RequestId` allocation (spec §3): a base-32 encoding of a monotonically
//! increasing, process-lifetime counter. Opaque to clients; uniqueness for
//! the life of the process is all the protocol requires.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct RequestIdAllocator {
    counter: AtomicU64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id. Never repeats within one process's lifetime.
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        data_encoding::BASE32_NOPAD.encode(&n.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic_in_issue_order() {
        let alloc = RequestIdAllocator::new();
        let ids: Vec<String> = (0..1000).map(|_| alloc.next()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len(), "all ids must be unique");
    }
}
