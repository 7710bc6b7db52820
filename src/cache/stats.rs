//! Cache operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Internal counters, bumped from wherever the event happens without taking
/// the cache mutex.
#[derive(Default)]
pub(crate) struct StatsCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) blocks_flushed: AtomicU64,
    pub(crate) blocks_deleted: AtomicU64,
    pub(crate) snapshots_created: AtomicU64,
    pub(crate) snapshots_freed: AtomicU64,
    pub(crate) snapshots_unloaded: AtomicU64,
    pub(crate) read_ahead_admitted: AtomicU64,
    pub(crate) read_ahead_rejected: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of cache statistics.
#[derive(Default, Clone, Debug)]
pub struct CacheStats {
    /// Acquisitions served from a resident block.
    pub hits: u64,
    /// Acquisitions that loaded from the serializer.
    pub misses: u64,
    /// Clean blocks evicted by the page replacer.
    pub evictions: u64,
    /// Completed flush cycles.
    pub flushes: u64,
    /// Blocks written back across all flushes.
    pub blocks_flushed: u64,
    /// Blocks deleted on the serializer.
    pub blocks_deleted: u64,
    /// Buf snapshots created for older readers.
    pub snapshots_created: u64,
    /// Buf snapshots released and freed.
    pub snapshots_freed: u64,
    /// Snapshot payloads dropped under pressure, reloadable by token.
    pub snapshots_unloaded: u64,
    /// Read-ahead offers admitted into the page map.
    pub read_ahead_admitted: u64,
    /// Read-ahead offers rejected by the admission check.
    pub read_ahead_rejected: u64,
    /// Currently resident blocks.
    pub resident_blocks: u64,
    /// Currently resident bytes.
    pub resident_bytes: u64,
    /// Bytes dirtied and not yet flushed.
    pub dirty_bytes: u64,
    /// Live user transactions.
    pub live_transactions: u64,
}

impl CacheStats {
    pub(crate) fn from_counters(counters: &StatsCounters) -> Self {
        Self {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            flushes: counters.flushes.load(Ordering::Relaxed),
            blocks_flushed: counters.blocks_flushed.load(Ordering::Relaxed),
            blocks_deleted: counters.blocks_deleted.load(Ordering::Relaxed),
            snapshots_created: counters.snapshots_created.load(Ordering::Relaxed),
            snapshots_freed: counters.snapshots_freed.load(Ordering::Relaxed),
            snapshots_unloaded: counters.snapshots_unloaded.load(Ordering::Relaxed),
            read_ahead_admitted: counters.read_ahead_admitted.load(Ordering::Relaxed),
            read_ahead_rejected: counters.read_ahead_rejected.load(Ordering::Relaxed),
            ..Self::default()
        }
    }
}
