//! The cache itself: owns the page map, free list, snapshot registry,
//! writeback worker and page replacer, brokers read-ahead admission, and
//! coordinates shutdown.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, error, info};

use crate::cache::buf::{new_block_buf_from, InnerBuf};
use crate::cache::config::CacheConfig;
use crate::cache::fifo_check::FifoChecker;
use crate::cache::free_list::FreeList;
use crate::cache::page_map::PageMap;
use crate::cache::page_repl;
use crate::cache::stats::{CacheStats, StatsCounters};
use crate::cache::transaction::{Access, Durability, Transaction, TxnCore};
use crate::cache::writeback::{self, Writeback};
use crate::serializer::{BlockToken, IoAccount, ReadAheadSink, Serializer};
use crate::types::{BlockId, EspejoError, Recency, Result, VersionId};

/// A per-consumer I/O priority handle, forwarded to the serializer for every
/// operation of a transaction that adopts it.
pub struct CacheAccount {
    account: Arc<IoAccount>,
}

impl CacheAccount {
    pub(crate) fn io_account(&self) -> Arc<IoAccount> {
        Arc::clone(&self.account)
    }

    /// Operations charged to this account so far.
    pub fn ops(&self) -> u64 {
        self.account.ops()
    }
}

/// Bookkeeping guarded by the cache mutex. Whenever this mutex is free, all
/// structural invariants hold; blocking waits happen strictly outside it.
pub(crate) struct CacheInner {
    pub(crate) page_map: PageMap,
    pub(crate) free_list: FreeList,
    pub(crate) next_snapshot_version: VersionId,
    /// Registered snapshotted transactions by version. Several read
    /// transactions may share a version, hence the bucket.
    pub(crate) active_snapshots: BTreeMap<VersionId, Vec<Arc<TxnCore>>>,
    pub(crate) num_live_transactions: usize,
    pub(crate) num_live_writeback_transactions: usize,
    pub(crate) shutting_down: bool,
    pub(crate) poisoned: bool,
    pub(crate) read_ahead_registered: bool,
    tick: u64,
    rng: SmallRng,
}

impl CacheInner {
    pub(crate) fn bump_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Registered snapshotted transactions with version in `(from, to]`:
    /// the ones that still need the pre-image of a write at version `to`.
    pub(crate) fn snapshots_affected(
        &self,
        from: VersionId,
        to: VersionId,
    ) -> Vec<Arc<TxnCore>> {
        self.active_snapshots
            .range((Bound::Excluded(from), Bound::Included(to)))
            .flat_map(|(_, bucket)| bucket.iter().cloned())
            .collect()
    }

    /// Evicts clean bufs down to the configured target and keeps the
    /// read-ahead registration in step with residency.
    pub(crate) fn evict_pressure(&mut self, shared: &CacheShared) {
        page_repl::evict_to_target(
            &mut self.page_map,
            &mut self.rng,
            shared.config.max_size,
            u64::from(shared.block_size),
            &shared.counters,
        );
        self.update_read_ahead_registration(shared);
    }

    fn update_read_ahead_registration(&mut self, shared: &CacheShared) {
        let max_blocks = shared.config.max_blocks(shared.block_size);
        let resident = self.page_map.num_entries() as u64;
        if self.read_ahead_registered && resident >= max_blocks {
            shared.serializer.unregister_read_ahead();
            self.read_ahead_registered = false;
            debug!(resident, max_blocks, "cache.read_ahead.deregistered");
        } else if !self.read_ahead_registered && !self.shutting_down && resident * 2 < max_blocks
        {
            shared.serializer.register_read_ahead(Arc::new(ReadAheadAdapter {
                shared: shared.weak_self.clone(),
            }));
            self.read_ahead_registered = true;
            debug!(resident, max_blocks, "cache.read_ahead.reregistered");
        }
    }
}

/// Everything the cache's components share. `Cache` is the owning façade;
/// the writeback worker holds its own `Arc` until shutdown.
pub(crate) struct CacheShared {
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) config: CacheConfig,
    pub(crate) block_size: u32,
    pub(crate) counters: StatsCounters,
    inner: Mutex<CacheInner>,
    txn_drain: Condvar,
    writeback: Writeback,
    fifo: FifoChecker,
    reads_account: Arc<IoAccount>,
    writes_account: Arc<IoAccount>,
    weak_self: Weak<CacheShared>,
}

impl CacheShared {
    pub(crate) fn inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock()
    }

    pub(crate) fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn block_size(&self) -> u32 {
        self.block_size
    }

    pub(crate) fn counters(&self) -> &StatsCounters {
        &self.counters
    }

    pub(crate) fn fifo(&self) -> &FifoChecker {
        &self.fifo
    }

    pub(crate) fn writeback(&self) -> &Writeback {
        &self.writeback
    }

    pub(crate) fn reads_account(&self) -> Arc<IoAccount> {
        Arc::clone(&self.reads_account)
    }

    pub(crate) fn writes_account(&self) -> Arc<IoAccount> {
        Arc::clone(&self.writes_account)
    }

    pub(crate) fn note_hit(&self) {
        StatsCounters::bump(&self.counters.hits);
    }

    pub(crate) fn note_miss(&self) {
        StatsCounters::bump(&self.counters.misses);
    }

    /// A serializer failure is fatal: the cache rejects new transactions
    /// from here on.
    pub(crate) fn poison(&self, err: &EspejoError) {
        error!(%err, "cache.poisoned");
        self.inner().poisoned = true;
    }

    /// Fills a loading buf from the serializer. The caller holds the buf's
    /// write lock; no cache locks are held across the read.
    pub(crate) fn load_buf(&self, buf: &Arc<InnerBuf>, account: &IoAccount) -> Result<()> {
        match self.serializer.read(buf.block_id, account) {
            Ok(read) => {
                let mut state = buf.state();
                state.block_size = read.data.len() as u32;
                state.data = Some(new_block_buf_from(&read.data, self.block_size));
                state.data_token = Some(read.token);
                state.subtree_recency = read.recency;
                state.loading = false;
                Ok(())
            }
            Err(err) => {
                if matches!(err, EspejoError::Io(_) | EspejoError::Corruption(_)) {
                    self.poison(&err);
                }
                Err(err)
            }
        }
    }

    /// Removes a buf whose load failed so later acquirers retry (or observe
    /// the poisoned cache).
    pub(crate) fn remove_failed(&self, buf: &Arc<InnerBuf>) {
        let mut inner = self.inner();
        let matches_entry = inner
            .page_map
            .find(buf.block_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, buf));
        if matches_entry {
            inner.page_map.remove(buf.block_id);
        }
    }

    /// Completes a flushed delete: the buf leaves the map and the id is
    /// recycled.
    pub(crate) fn retire_deleted(&self, buf: &Arc<InnerBuf>) {
        let mut inner = self.inner();
        let matches_entry = inner
            .page_map
            .find(buf.block_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, buf));
        if matches_entry {
            inner.page_map.remove(buf.block_id);
            inner.free_list.recycle(buf.block_id);
        }
        buf.state().dirty = false;
        drop(inner);
        debug!(block_id = buf.block_id.0, "cache.block.deleted");
    }

    pub(crate) fn unregister_snapshot(&self, version: VersionId, core: &Arc<TxnCore>) {
        let mut inner = self.inner();
        if let Some(bucket) = inner.active_snapshots.get_mut(&version) {
            bucket.retain(|other| !Arc::ptr_eq(other, core));
            if bucket.is_empty() {
                inner.active_snapshots.remove(&version);
            }
        }
    }

    fn begin_transaction(
        &self,
        access: Access,
        expected_change_count: usize,
        recency: Recency,
        durability: Durability,
    ) -> Result<Transaction<'_>> {
        {
            let mut inner = self.inner();
            if inner.shutting_down {
                return Err(EspejoError::ShuttingDown);
            }
            if inner.poisoned {
                return Err(EspejoError::Poisoned);
            }
            inner.num_live_transactions += 1;
        }
        Ok(Transaction::new(
            self,
            access,
            expected_change_count,
            recency,
            durability,
            false,
        ))
    }

    /// Internal transaction bracketing one writeback flush cycle.
    pub(crate) fn begin_writeback_transaction(&self) -> Transaction<'_> {
        self.inner().num_live_writeback_transactions += 1;
        Transaction::new(
            self,
            Access::Write,
            0,
            Recency::default(),
            Durability::Soft,
            true,
        )
    }

    pub(crate) fn note_transaction_end(&self, is_writeback: bool) {
        {
            let mut inner = self.inner();
            if is_writeback {
                debug_assert!(inner.num_live_writeback_transactions > 0);
                inner.num_live_writeback_transactions -= 1;
            } else {
                debug_assert!(inner.num_live_transactions > 0);
                inner.num_live_transactions -= 1;
            }
        }
        self.txn_drain.notify_all();
    }

    pub(crate) fn collect_subtree_recencies(&self, block_ids: &[BlockId]) -> Result<Vec<Recency>> {
        let mut out = Vec::with_capacity(block_ids.len());
        for &block_id in block_ids {
            let resident = self.inner().page_map.find(block_id).cloned();
            let recency = match resident {
                Some(buf) => buf.state().subtree_recency,
                None => match self.serializer.recency(block_id) {
                    Ok(recency) => recency,
                    Err(EspejoError::NotFound) => Recency::default(),
                    Err(err) => return Err(err),
                },
            };
            out.push(recency);
        }
        Ok(out)
    }

    /// Read-ahead admission: the serializer pushes, the cache decides.
    fn offer_read_ahead(
        &self,
        block_id: BlockId,
        data: Vec<u8>,
        token: BlockToken,
        recency: Recency,
    ) {
        let mut inner = self.inner();
        // A recycled or never-allocated id has no valid on-serializer image
        // from this cache's point of view; a resident id may be mid-load or
        // marked for deletion. All of those lose the race.
        let accept = !inner.shutting_down
            && !inner.poisoned
            && !inner.page_map.contains(block_id)
            && (inner.page_map.num_entries() as u64) < self.config.max_blocks(self.block_size)
            && !inner.free_list.is_free(block_id)
            && block_id < inner.free_list.next_unused();
        if !accept {
            StatsCounters::bump(&self.counters.read_ahead_rejected);
            debug!(block_id = block_id.0, "cache.read_ahead.rejected");
            inner.update_read_ahead_registration(self);
            return;
        }
        let buf =
            InnerBuf::new_from_read_ahead(block_id, &data, self.block_size, token, recency);
        inner.page_map.insert(buf);
        StatsCounters::bump(&self.counters.read_ahead_admitted);
        inner.update_read_ahead_registration(self);
    }
}

struct ReadAheadAdapter {
    shared: Weak<CacheShared>,
}

impl ReadAheadSink for ReadAheadAdapter {
    fn offer_read_ahead_buf(
        &self,
        block_id: BlockId,
        data: Vec<u8>,
        token: BlockToken,
        recency: Recency,
    ) {
        if let Some(shared) = self.shared.upgrade() {
            shared.offer_read_ahead(block_id, data, token, recency);
        }
    }
}

/// Mirrored buffer cache over a block serializer. Dropping the cache waits
/// for live transactions, drains writeback, then destroys every buf.
pub struct Cache {
    shared: Arc<CacheShared>,
    worker: Option<JoinHandle<()>>,
}

impl Cache {
    /// One-time on-disk initialization. The cache persists nothing of its
    /// own, so this only verifies the serializer is fresh.
    pub fn create(serializer: &dyn Serializer) -> Result<()> {
        if serializer.max_block_id().0 != 0 {
            return Err(EspejoError::Invalid("serializer is not empty"));
        }
        Ok(())
    }

    pub fn new(serializer: Arc<dyn Serializer>, config: CacheConfig) -> Cache {
        let block_size = serializer.block_size();
        let next_unused = serializer.max_block_id();
        let reads_account = Arc::new(IoAccount::new(config.io_priority_reads));
        let writes_account = Arc::new(IoAccount::new(config.io_priority_writes));
        let shared = Arc::new_cyclic(|weak_self| CacheShared {
            serializer,
            config,
            block_size,
            counters: StatsCounters::default(),
            inner: Mutex::new(CacheInner {
                page_map: PageMap::default(),
                free_list: FreeList::new(next_unused),
                next_snapshot_version: VersionId(1),
                active_snapshots: BTreeMap::new(),
                num_live_transactions: 0,
                num_live_writeback_transactions: 0,
                shutting_down: false,
                poisoned: false,
                read_ahead_registered: false,
                tick: 0,
                rng: SmallRng::from_entropy(),
            }),
            txn_drain: Condvar::new(),
            writeback: Writeback::new(),
            fifo: FifoChecker::default(),
            reads_account,
            writes_account,
            weak_self: weak_self.clone(),
        });
        shared.serializer.register_read_ahead(Arc::new(ReadAheadAdapter {
            shared: Arc::downgrade(&shared),
        }));
        shared.inner().read_ahead_registered = true;
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("espejo-writeback".into())
            .spawn(move || writeback::worker_loop(worker_shared))
            .expect("spawn writeback worker");
        info!(block_size, "cache.started");
        Cache {
            shared,
            worker: Some(worker),
        }
    }

    pub fn get_block_size(&self) -> u32 {
        self.shared.block_size
    }

    /// Number of resident blocks.
    pub fn num_blocks(&self) -> usize {
        self.shared.inner().page_map.num_entries()
    }

    pub fn contains_block(&self, block_id: BlockId) -> bool {
        self.shared.inner().page_map.contains(block_id)
    }

    /// The version the next finalizing transaction would observe.
    pub fn get_current_version_id(&self) -> VersionId {
        self.shared.inner().next_snapshot_version
    }

    /// Smallest registered snapshot version, or `default` when none. O(1).
    pub fn get_min_snapshot_version(&self, default: VersionId) -> VersionId {
        self.shared
            .inner()
            .active_snapshots
            .keys()
            .next()
            .copied()
            .unwrap_or(default)
    }

    /// Largest registered snapshot version, or `default` when none. O(1).
    pub fn get_max_snapshot_version(&self, default: VersionId) -> VersionId {
        self.shared
            .inner()
            .active_snapshots
            .keys()
            .next_back()
            .copied()
            .unwrap_or(default)
    }

    /// A caller-owned I/O account; see [`Transaction::set_account`].
    pub fn create_cache_account(&self, priority: i32) -> CacheAccount {
        CacheAccount {
            account: Arc::new(IoAccount::new(priority)),
        }
    }

    pub fn begin_read(&self) -> Result<Transaction<'_>> {
        self.shared.begin_transaction(
            Access::Read,
            0,
            Recency::default(),
            Durability::Soft,
        )
    }

    pub fn begin_write(
        &self,
        expected_change_count: usize,
        recency: Recency,
        durability: Durability,
    ) -> Result<Transaction<'_>> {
        // Backpressure before any bookkeeping: the caller holds no locks yet.
        self.shared.writeback.throttle(self.shared.config.max_dirty_size);
        let txn = self
            .shared
            .begin_transaction(Access::Write, expected_change_count, recency, durability)?;
        self.shared.writeback.note_expected_changes(
            txn.expected_change_count as u64 * u64::from(self.shared.block_size),
            self.shared.config.flush_threshold,
        );
        Ok(txn)
    }

    /// Asks writeback to start a flush cycle now.
    pub fn flush(&self) {
        self.shared.writeback.request_flush();
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::from_counters(&self.shared.counters);
        {
            let inner = self.shared.inner();
            stats.resident_blocks = inner.page_map.num_entries() as u64;
            stats.resident_bytes =
                stats.resident_blocks * u64::from(self.shared.block_size);
            stats.live_transactions = inner.num_live_transactions as u64;
        }
        stats.dirty_bytes = self.shared.writeback.dirty_bytes();
        stats
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        // No new transactions from here on.
        self.shared.inner().shutting_down = true;

        // Wait for the last user transaction to commit.
        {
            let mut inner = self.shared.inner();
            while inner.num_live_transactions > 0 {
                self.shared.txn_drain.wait(&mut inner);
            }
        }

        // Drain writeback and stop the worker.
        self.shared.writeback.begin_shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.shared.serializer.unregister_read_ahead();

        let mut inner = self.shared.inner();
        debug_assert_eq!(inner.num_live_transactions, 0);
        debug_assert_eq!(inner.num_live_writeback_transactions, 0);
        let bufs = inner.page_map.drain();
        drop(inner);
        drop(bufs);
        info!("cache.stopped");
    }
}
