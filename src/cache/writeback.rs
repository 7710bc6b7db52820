//! Writeback coordinator.
//!
//! Dirty bufs accumulate in an insertion-ordered list; a worker thread owned
//! by the cache batches the committed ones into strictly sequential flushes.
//! Flushes are triggered by the dirty-byte threshold, the flush timer, an
//! explicit hard-durability commit, or shutdown. Mutations proceed while a
//! flush is in flight: each captured buffer is pinned the way an
//! as-if-snapshot reader would pin it, so a concurrent writer's
//! `snapshot_if_needed` migrates the in-flight allocation into a snapshot
//! instead of overwriting it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::cache::buf::{InnerBuf, PinKind, PinnedData};
use crate::cache::cache::CacheShared;
use crate::cache::stats::StatsCounters;
use crate::types::{EspejoError, Recency, Result, VersionId};

pub(crate) struct WbState {
    dirty: Vec<Arc<InnerBuf>>,
    dirty_bytes: u64,
    flush_requested: bool,
    hard_waiters: usize,
    shutdown: bool,
    error: Option<EspejoError>,
}

pub(crate) struct Writeback {
    state: Mutex<WbState>,
    /// Wakes the worker.
    wake: Condvar,
    /// Signals flush completion to durability waiters and throttled writers.
    done: Condvar,
}

impl Writeback {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WbState {
                dirty: Vec::new(),
                dirty_bytes: 0,
                flush_requested: false,
                hard_waiters: 0,
                shutdown: false,
                error: None,
            }),
            wake: Condvar::new(),
            done: Condvar::new(),
        }
    }

    pub(crate) fn dirty_bytes(&self) -> u64 {
        self.state.lock().dirty_bytes
    }

    /// Idempotently appends a mutated buf to the dirty list. Never called
    /// with the cache mutex or any buf state held.
    pub(crate) fn add_dirty(&self, buf: &Arc<InnerBuf>, block_bytes: u64, flush_threshold: u64) {
        let mut state = self.state.lock();
        {
            let mut buf_state = buf.state();
            if buf_state.in_dirty_list {
                return;
            }
            buf_state.in_dirty_list = true;
        }
        state.dirty.push(Arc::clone(buf));
        state.dirty_bytes += block_bytes;
        if state.dirty_bytes >= flush_threshold {
            self.wake.notify_one();
        }
    }

    /// A writer transaction committed: its blocks became flush-eligible.
    pub(crate) fn on_transaction_commit(&self) {
        self.wake.notify_one();
        self.done.notify_all();
    }

    /// A write-mode BufLock was released; gives the worker a chance to
    /// re-evaluate its triggers.
    pub(crate) fn writer_released(&self) {
        self.wake.notify_one();
    }

    /// Wakes the worker early when a writer announces a large change set.
    pub(crate) fn note_expected_changes(&self, expected_bytes: u64, flush_threshold: u64) {
        let state = self.state.lock();
        if state.dirty_bytes + expected_bytes >= flush_threshold {
            self.wake.notify_one();
        }
    }

    /// Backpressure for new writers: stall while the dirty backlog exceeds
    /// the cap. Only called from transaction begin, where the caller holds
    /// no locks, so a flush can always drain the backlog.
    pub(crate) fn throttle(&self, max_dirty_size: u64) {
        let mut state = self.state.lock();
        while state.dirty_bytes > max_dirty_size
            && state.error.is_none()
            && !state.shutdown
        {
            self.wake.notify_one();
            self.done.wait_for(&mut state, Duration::from_millis(50));
        }
    }

    /// Blocks until every buf in `dirty` has been persisted (or superseded
    /// by a later writer, in which case this transaction's bytes are gone
    /// and its durability is moot).
    pub(crate) fn wait_durable(
        &self,
        dirty: &[Arc<InnerBuf>],
        version: VersionId,
        waiting_threshold: usize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.hard_waiters += 1;
        state.flush_requested = true;
        if state.hard_waiters >= waiting_threshold.max(1) {
            self.wake.notify_one();
        }
        self.wake.notify_one();
        let result = loop {
            if let Some(err) = &state.error {
                break Err(err.duplicate());
            }
            let all_durable = dirty.iter().all(|buf| {
                let buf_state = buf.state();
                !buf_state.dirty || buf_state.version > version
            });
            if all_durable {
                break Ok(());
            }
            self.done.wait(&mut state);
        };
        state.hard_waiters -= 1;
        result
    }

    pub(crate) fn request_flush(&self) {
        let mut state = self.state.lock();
        state.flush_requested = true;
        self.wake.notify_one();
    }

    pub(crate) fn begin_shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.wake.notify_one();
        self.done.notify_all();
    }

    fn record_error(&self, err: &EspejoError) {
        let mut state = self.state.lock();
        state.error = Some(err.duplicate());
        self.done.notify_all();
    }
}

struct FlushWrite {
    buf: Arc<InnerBuf>,
    data: crate::cache::buf::BlockBuf,
    block_size: u32,
    recency: Recency,
}

/// The worker thread body. Runs until shutdown drains the dirty list, or
/// until a serializer failure poisons the cache.
pub(crate) fn worker_loop(shared: Arc<CacheShared>) {
    let wb = shared.writeback();
    let flush_threshold = shared.config().flush_threshold;
    let timer = shared.config().flush_timer_ms;
    loop {
        {
            let mut state = wb.state.lock();
            loop {
                if state.shutdown && state.dirty.is_empty() {
                    return;
                }
                if state.shutdown
                    || state.flush_requested
                    || state.dirty_bytes >= flush_threshold
                {
                    break;
                }
                if timer > 0 {
                    let timed_out = wb
                        .wake
                        .wait_for(&mut state, Duration::from_millis(timer))
                        .timed_out();
                    if timed_out && !state.dirty.is_empty() {
                        break;
                    }
                } else {
                    wb.wake.wait(&mut state);
                }
            }
            state.flush_requested = false;
        }

        if let Err(err) = flush_once(&shared) {
            warn!(%err, "cache.writeback.flush_failed");
            shared.poison(&err);
            wb.record_error(&err);
            return;
        }
        wb.done.notify_all();
    }
}

/// One flush cycle: partition, write, install tokens, flush deletes.
fn flush_once(shared: &CacheShared) -> Result<()> {
    let wb = shared.writeback();
    let counters = shared.counters();
    let block_bytes = u64::from(shared.block_size());
    let batch_cap = shared.config().max_concurrent_flushes.max(1);

    // Bracket the cycle with a writeback-internal transaction so the live
    // counters distinguish writeback work from user transactions.
    let _txn = shared.begin_writeback_transaction();

    let (writes, deletes) = {
        let mut state = wb.state.lock();
        let mut writes: Vec<FlushWrite> = Vec::new();
        let mut deletes: Vec<Arc<InnerBuf>> = Vec::new();
        let mut keep: Vec<Arc<InnerBuf>> = Vec::new();
        let drained: Vec<_> = state.dirty.drain(..).collect();
        for buf in drained {
            if writes.len() + deletes.len() >= batch_cap {
                keep.push(buf);
                continue;
            }
            let mut buf_state = buf.state();
            if buf_state.active_writers > 0 {
                // Not committed yet; stays pending.
                drop(buf_state);
                keep.push(buf);
                continue;
            }
            if buf_state.do_delete {
                let referenced = buf_state.refcount > 0
                    || buf_state.cow_refcount > 0
                    || buf_state.snap_refcount > 0
                    || !buf_state.snapshots.is_empty();
                if referenced {
                    drop(buf_state);
                    keep.push(buf);
                    continue;
                }
                buf_state.in_dirty_list = false;
                state.dirty_bytes = state.dirty_bytes.saturating_sub(block_bytes);
                drop(buf_state);
                deletes.push(buf);
            } else if buf_state.dirty {
                let data = buf_state
                    .data
                    .clone()
                    .expect("dirty buf with no data resident");
                // Pin the captured allocation so concurrent writers snapshot
                // instead of overwriting it in place.
                buf_state.snap_refcount += 1;
                buf_state.in_dirty_list = false;
                state.dirty_bytes = state.dirty_bytes.saturating_sub(block_bytes);
                let item = FlushWrite {
                    buf: Arc::clone(&buf),
                    data,
                    block_size: buf_state.block_size,
                    recency: buf_state.subtree_recency,
                };
                drop(buf_state);
                writes.push(item);
            } else {
                // Already clean (e.g. delete unmarked or duplicate listing).
                buf_state.in_dirty_list = false;
                state.dirty_bytes = state.dirty_bytes.saturating_sub(block_bytes);
            }
        }
        state.dirty = keep;
        (writes, deletes)
    };

    if writes.is_empty() && deletes.is_empty() {
        return Ok(());
    }
    debug!(
        writes = writes.len(),
        deletes = deletes.len(),
        "cache.writeback.flush"
    );

    let account = shared.writes_account();
    let mut error: Option<EspejoError> = None;
    for item in writes.iter() {
        if error.is_none() {
            let write_result = {
                let payload = item.data.read();
                shared.serializer().write(
                    item.buf.block_id,
                    &payload[..item.block_size as usize],
                    item.recency,
                    &account,
                )
            };
            match write_result {
                Ok(token) => {
                    item.buf.update_data_token(&item.data, token);
                    StatsCounters::bump(&counters.blocks_flushed);
                }
                Err(err) => error = Some(err),
            }
        }
        // Release the flush pin whether or not the write happened; on error
        // the cache is about to be poisoned but refcounts stay coherent.
        let pin = PinnedData {
            data: item.data.clone(),
            block_size: item.block_size,
            recency: item.recency,
            kind: PinKind::Snap,
        };
        item.buf.release_pinned(&pin, counters);
    }
    if let Some(err) = error {
        return Err(err);
    }

    for buf in deletes {
        shared.serializer().delete(buf.block_id, &account)?;
        shared.retire_deleted(&buf);
        StatsCounters::bump(&counters.blocks_deleted);
    }

    StatsCounters::bump(&counters.flushes);
    Ok(())
}
