// Statistics sink for the message plane
//
// Side-effect-only counters; the plane never reads them back for control
// decisions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics callbacks invoked along the message path.
pub trait StatsCollector: Send + Sync {
    /// A frame was written to a peer.
    fn message_sent(&self);
    /// A message found no destination, or was dropped before the wire.
    fn message_not_sent(&self);
    /// A frame arrived from a peer.
    fn message_received(&self);
    /// An inbound message was dropped before reaching a container.
    fn message_discarded(&self);
    /// A container accepted a message.
    fn message_dispatched(&self);
    /// All container work for an inbound message finished.
    fn message_processed(&self);
}

/// Counter-backed collector; the default, and what tests assert against.
#[derive(Debug, Default)]
pub struct AtomicStatsCollector {
    sent: AtomicU64,
    not_sent: AtomicU64,
    received: AtomicU64,
    discarded: AtomicU64,
    dispatched: AtomicU64,
    processed: AtomicU64,
}

impl AtomicStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn not_sent(&self) -> u64 {
        self.not_sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl StatsCollector for AtomicStatsCollector {
    fn message_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn message_not_sent(&self) {
        self.not_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn message_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn message_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn message_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn message_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullStatsCollector;

impl StatsCollector for NullStatsCollector {
    fn message_sent(&self) {}
    fn message_not_sent(&self) {}
    fn message_received(&self) {}
    fn message_discarded(&self) {}
    fn message_dispatched(&self) {}
    fn message_processed(&self) {}
}
