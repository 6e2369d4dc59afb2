use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of JSON-RPC request ids. Clones share the same counter, so one
/// counter can be handed to several sessions and ids never repeat across
/// them.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    next: Arc<AtomicU64>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter whose first id is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(first)),
        }
    }

    /// Take the next id.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}
