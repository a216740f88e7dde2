//! Write-only statistics sink.
//!
//! The engine fires events at a sink injected at construction and never
//! reads anything back. The default sink drops everything; tests use the
//! counting sink to observe engine activity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An engine activity event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatEvent {
    Read,
    Write,
    Replicate,
    Repair,
    /// Objects shipped in reply to a sync pull.
    SyncShipped(usize),
    /// Objects applied from a sync reply.
    SyncApplied(usize),
    /// Keys dropped from the keylog after every peer acknowledged them.
    KeylogTruncated(usize),
    /// Durable state flushed.
    Flush,
}

/// Fire-and-forget sink for engine events.
pub trait StatsSink: Send + Sync {
    fn record(&self, event: StatEvent);
}

/// A sink that drops every event.
#[derive(Debug, Default)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn record(&self, _event: StatEvent) {}
}

/// An in-memory counting sink.
#[derive(Debug, Default)]
pub struct CountingStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub replicates: AtomicU64,
    pub repairs: AtomicU64,
    pub sync_shipped: AtomicU64,
    pub sync_applied: AtomicU64,
    pub keys_truncated: AtomicU64,
    pub flushes: AtomicU64,
}

impl CountingStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl StatsSink for CountingStats {
    fn record(&self, event: StatEvent) {
        match event {
            StatEvent::Read => self.reads.fetch_add(1, Ordering::Relaxed),
            StatEvent::Write => self.writes.fetch_add(1, Ordering::Relaxed),
            StatEvent::Replicate => self.replicates.fetch_add(1, Ordering::Relaxed),
            StatEvent::Repair => self.repairs.fetch_add(1, Ordering::Relaxed),
            StatEvent::SyncShipped(n) => self.sync_shipped.fetch_add(n as u64, Ordering::Relaxed),
            StatEvent::SyncApplied(n) => self.sync_applied.fetch_add(n as u64, Ordering::Relaxed),
            StatEvent::KeylogTruncated(n) => {
                self.keys_truncated.fetch_add(n as u64, Ordering::Relaxed)
            }
            StatEvent::Flush => self.flushes.fetch_add(1, Ordering::Relaxed),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_stats() {
        let stats = CountingStats::new();
        stats.record(StatEvent::Write);
        stats.record(StatEvent::Write);
        stats.record(StatEvent::SyncShipped(3));

        assert_eq!(stats.writes.load(Ordering::Relaxed), 2);
        assert_eq!(stats.sync_shipped.load(Ordering::Relaxed), 3);
        assert_eq!(stats.reads.load(Ordering::Relaxed), 0);
    }
}
