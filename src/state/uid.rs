//! Connection id generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier assigned to each accepted network connection.
pub type ConnectionId = u64;

/// Generates unique connection ids.
///
/// Ids start at 1 so that 0 can never be mistaken for a live connection.
pub struct ConnectionIdGenerator {
    counter: AtomicU64,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Generate the next unique id.
    pub fn next(&self) -> ConnectionId {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
