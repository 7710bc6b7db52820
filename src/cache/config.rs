//! Cache tuning knobs.

/// Configuration options for the buffer cache.
///
/// These options control resident memory, writeback pacing, and the default
/// I/O account priorities.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Soft limit on resident block bytes; the page replacer evicts clean
    /// blocks until the resident count is at or below this target.
    pub max_size: u64,
    /// Hard cap on dirty bytes. Writers stall once this is reached until a
    /// flush drains the backlog.
    pub max_dirty_size: u64,
    /// Dirty-byte threshold that starts a flush.
    pub flush_threshold: u64,
    /// Periodic flush interval in milliseconds. Zero disables the timer.
    pub flush_timer_ms: u64,
    /// Number of hard-durability waiters that forces an immediate flush.
    pub flush_waiting_threshold: usize,
    /// Maximum blocks written per flush batch.
    pub max_concurrent_flushes: usize,
    /// Priority for the default read I/O account.
    pub io_priority_reads: i32,
    /// Priority for the default write I/O account.
    pub io_priority_writes: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 64 * 1024 * 1024,
            max_dirty_size: 16 * 1024 * 1024,
            flush_threshold: 4 * 1024 * 1024,
            flush_timer_ms: 1000,
            flush_waiting_threshold: 8,
            max_concurrent_flushes: 64,
            io_priority_reads: 5,
            io_priority_writes: 1,
        }
    }
}

impl CacheConfig {
    /// Maximum number of resident blocks for a given block size.
    pub(crate) fn max_blocks(&self, block_size: u32) -> u64 {
        (self.max_size / u64::from(block_size.max(1))).max(1)
    }
}
