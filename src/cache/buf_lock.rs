//! RAII acquisition of an InnerBuf in an access mode on behalf of a
//! transaction.
//!
//! A BufLock borrows its transaction, so locks cannot outlive it. The data
//! views are guard-backed: `get_data_read` works off whichever allocation
//! the lock pinned (current image, copy-on-write pre-image, or snapshot),
//! `get_data_write` runs the snapshot protocol and dirties the block for
//! writeback.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::cache::buf::{EvictionPriority, InnerBuf, PinKind, PinnedData};
use crate::cache::fifo_check::{OrderMode, OrderToken};
use crate::cache::rwi_lock::LockMode;
use crate::cache::transaction::{Access, Transaction};
use crate::types::{BlockId, EspejoError, Recency, Result};

/// Concurrency mode of one acquisition.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AccessMode {
    Read,
    /// Reads without taking the block lock; pins the current bytes instead,
    /// which may become outdated while held.
    ReadOutdatedOk,
    /// Declares an intent to write: compatible with readers, exclusive with
    /// other intents and writers, upgradable in place.
    Intent,
    Write,
}

/// Read-only view into a lock's data; valid for the lifetime of the borrow.
pub struct BufRead<'a> {
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    len: usize,
    _lock: PhantomData<&'a ()>,
}

impl Deref for BufRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..self.len]
    }
}

/// Write view into a lock's data.
pub struct BufWrite<'a> {
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    len: usize,
    _lock: PhantomData<&'a mut ()>,
}

impl Deref for BufWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..self.len]
    }
}

impl DerefMut for BufWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..self.len]
    }
}

/// Holds one InnerBuf for one transaction. Release is idempotent and implied
/// by drop.
pub struct BufLock<'t, 'c> {
    txn: &'t Transaction<'c>,
    buf: Option<Arc<InnerBuf>>,
    mode: AccessMode,
    /// The RWI mode currently held; `None` for non-locking access
    /// (read-outdated and snapshotted reads drop the lock after pinning).
    lock_mode: Option<LockMode>,
    pinned: Option<PinnedData>,
    block_size: u32,
    recency: Recency,
}

fn lock_mode_of(mode: AccessMode) -> LockMode {
    match mode {
        AccessMode::Read | AccessMode::ReadOutdatedOk => LockMode::Read,
        AccessMode::Intent => LockMode::Intent,
        AccessMode::Write => LockMode::Write,
    }
}

impl<'t, 'c> BufLock<'t, 'c> {
    /// Acquires `block_id` in `mode`. Loads the block from the serializer if
    /// it is not resident.
    pub fn acquire(
        txn: &'t Transaction<'c>,
        block_id: BlockId,
        mode: AccessMode,
    ) -> Result<Self> {
        Self::acquire_with(txn, block_id, mode, None, OrderMode::Check, None)
    }

    /// Full-form acquisition: an optional order token verified against the
    /// cache's ordering checker, and an in-line callback fired the moment
    /// this acquirer is enqueued on the block's lock (before it blocks), so
    /// pipelined traversals can start their next acquisition in parallel.
    pub fn acquire_with(
        txn: &'t Transaction<'c>,
        block_id: BlockId,
        mode: AccessMode,
        order_token: Option<OrderToken>,
        order_mode: OrderMode,
        mut in_line: Option<&mut dyn FnMut()>,
    ) -> Result<Self> {
        if matches!(mode, AccessMode::Intent | AccessMode::Write)
            && txn.core.access != Access::Write
        {
            return Err(EspejoError::Invalid(
                "write-mode acquisition in a read transaction",
            ));
        }
        let shared = txn.shared;
        shared.fifo().check(order_token, order_mode);
        let snapshotted = {
            let state = txn.core.state.lock();
            state.snapshotted
        };
        if snapshotted && mode != AccessMode::Read {
            return Err(EspejoError::Invalid(
                "snapshotted transactions only acquire in read mode",
            ));
        }

        enum Plan {
            /// Resident; take the lock normally.
            Hit,
            /// We created the buf and hold its write lock; load it.
            Load,
            /// Read-outdated fast path: pinned without the lock.
            Pinned(PinnedData),
        }

        let version;
        let (buf, plan) = {
            let mut inner = shared.inner();
            if inner.poisoned {
                return Err(EspejoError::Poisoned);
            }
            version = txn.core.maybe_finalize_version(&mut inner);
            let tick = inner.bump_tick();
            match inner.page_map.find(block_id) {
                Some(found) => {
                    let buf = Arc::clone(found);
                    let mut state = buf.state();
                    if state.do_delete {
                        return Err(EspejoError::Invalid("block is marked deleted"));
                    }
                    state.refcount += 1;
                    state.last_access = tick;
                    shared.note_hit();
                    if mode == AccessMode::ReadOutdatedOk && state.data.is_some() {
                        state.cow_refcount += 1;
                        let pinned = PinnedData {
                            data: state.data.clone().expect("checked present"),
                            block_size: state.block_size,
                            recency: state.subtree_recency,
                            kind: PinKind::Cow,
                        };
                        drop(state);
                        (buf, Plan::Pinned(pinned))
                    } else {
                        drop(state);
                        (buf, Plan::Hit)
                    }
                }
                None => {
                    shared.note_miss();
                    let buf = InnerBuf::new_loading(block_id);
                    {
                        let mut state = buf.state();
                        state.refcount = 1;
                        state.last_access = tick;
                    }
                    // Fresh lock: cannot block, and the buf must hold it
                    // before it becomes discoverable through the map.
                    buf.lock.acquire(LockMode::Write, None);
                    inner.page_map.insert(Arc::clone(&buf));
                    inner.evict_pressure(shared);
                    (buf, Plan::Load)
                }
            }
        };
        {
            let mut state = txn.core.state.lock();
            state.live_locks += 1;
            state.num_locks_acquired += 1;
        }

        let mut lock = Self {
            txn,
            buf: Some(Arc::clone(&buf)),
            mode,
            lock_mode: None,
            pinned: None,
            block_size: 0,
            recency: Recency::default(),
        };

        match plan {
            Plan::Pinned(pinned) => {
                if let Some(callback) = in_line.as_deref_mut() {
                    callback();
                }
                lock.block_size = pinned.block_size;
                lock.recency = pinned.recency;
                lock.pinned = Some(pinned);
            }
            Plan::Load => {
                if let Some(callback) = in_line.as_deref_mut() {
                    callback();
                }
                lock.lock_mode = Some(LockMode::Write);
                let account = txn.io_account();
                if let Err(err) = shared.load_buf(&buf, &account) {
                    lock.abandon_failed_load();
                    return Err(err);
                }
                lock.settle_after_load(snapshotted, version)?;
            }
            Plan::Hit => {
                buf.lock.acquire(lock_mode_of(mode), in_line);
                lock.lock_mode = Some(lock_mode_of(mode));
                if buf.state().load_failed {
                    lock.release();
                    return Err(EspejoError::Poisoned);
                }
                if snapshotted {
                    let account = txn.io_account();
                    let pinned = buf.acquire_snapshot_data(
                        version,
                        shared.serializer(),
                        &account,
                        shared.block_size(),
                    )?;
                    buf.lock.release(LockMode::Read);
                    lock.lock_mode = None;
                    lock.block_size = pinned.block_size;
                    lock.recency = pinned.recency;
                    lock.pinned = Some(pinned);
                } else if mode == AccessMode::ReadOutdatedOk {
                    // The block was still loading at lookup; pin now and
                    // drop the lock.
                    let mut state = buf.state();
                    state.cow_refcount += 1;
                    let pinned = PinnedData {
                        data: state.data.clone().expect("loaded under the lock"),
                        block_size: state.block_size,
                        recency: state.subtree_recency,
                        kind: PinKind::Cow,
                    };
                    lock.block_size = state.block_size;
                    lock.recency = state.subtree_recency;
                    drop(state);
                    buf.lock.release(LockMode::Read);
                    lock.lock_mode = None;
                    lock.pinned = Some(pinned);
                } else {
                    let state = buf.state();
                    lock.block_size = state.block_size;
                    lock.recency = state.subtree_recency;
                }
            }
        }
        Ok(lock)
    }

    /// Allocates a fresh block: a new id from the free list and a zeroed,
    /// faux-versioned buf held in write mode.
    pub fn allocate(txn: &'t Transaction<'c>) -> Result<Self> {
        if txn.core.access != Access::Write {
            return Err(EspejoError::Invalid("allocation in a read transaction"));
        }
        let shared = txn.shared;
        let buf = {
            let mut inner = shared.inner();
            if inner.poisoned {
                return Err(EspejoError::Poisoned);
            }
            txn.core.maybe_finalize_version(&mut inner);
            let tick = inner.bump_tick();
            let block_id = inner.free_list.allocate();
            let buf = InnerBuf::new_allocated(block_id, shared.block_size());
            {
                let mut state = buf.state();
                state.refcount = 1;
                state.last_access = tick;
            }
            buf.lock.acquire(LockMode::Write, None);
            inner.page_map.insert(Arc::clone(&buf));
            inner.evict_pressure(shared);
            buf
        };
        {
            let mut state = txn.core.state.lock();
            state.live_locks += 1;
            state.num_locks_acquired += 1;
        }
        let block_size = shared.block_size();
        Ok(Self {
            txn,
            buf: Some(buf),
            mode: AccessMode::Write,
            lock_mode: Some(LockMode::Write),
            pinned: None,
            block_size,
            recency: Recency::default(),
        })
    }

    fn settle_after_load(&mut self, snapshotted: bool, version: crate::types::VersionId) -> Result<()> {
        let buf = Arc::clone(self.buf.as_ref().expect("settling an acquired lock"));
        let shared = self.txn.shared;
        {
            let state = buf.state();
            self.block_size = state.block_size;
            self.recency = state.subtree_recency;
        }
        match self.mode {
            AccessMode::Write => {}
            AccessMode::Intent => {
                buf.lock.downgrade_write_to_intent();
                self.lock_mode = Some(LockMode::Intent);
            }
            AccessMode::Read => {
                if snapshotted {
                    let account = self.txn.io_account();
                    let pinned = buf.acquire_snapshot_data(
                        version,
                        shared.serializer(),
                        &account,
                        shared.block_size(),
                    )?;
                    buf.lock.release(LockMode::Write);
                    self.lock_mode = None;
                    self.block_size = pinned.block_size;
                    self.recency = pinned.recency;
                    self.pinned = Some(pinned);
                } else {
                    buf.lock.release(LockMode::Write);
                    self.lock_mode = None;
                    buf.lock.acquire(LockMode::Read, None);
                    self.lock_mode = Some(LockMode::Read);
                }
            }
            AccessMode::ReadOutdatedOk => {
                let mut state = buf.state();
                state.cow_refcount += 1;
                let pinned = PinnedData {
                    data: state.data.clone().expect("just loaded"),
                    block_size: state.block_size,
                    recency: state.subtree_recency,
                    kind: PinKind::Cow,
                };
                drop(state);
                buf.lock.release(LockMode::Write);
                self.lock_mode = None;
                self.pinned = Some(pinned);
            }
        }
        Ok(())
    }

    /// Tears down a lock whose serializer load failed: the buf leaves the
    /// map and waiters see the failure flag.
    fn abandon_failed_load(&mut self) {
        let buf = self.buf.take().expect("abandoning an acquired lock");
        {
            let mut state = buf.state();
            state.loading = false;
            state.load_failed = true;
            state.refcount -= 1;
        }
        buf.lock.release(LockMode::Write);
        self.txn.shared.remove_failed(&buf);
        let mut state = self.txn.core.state.lock();
        state.live_locks -= 1;
    }

    pub fn is_acquired(&self) -> bool {
        self.buf.is_some()
    }

    pub fn block_id(&self) -> BlockId {
        self.buf
            .as_ref()
            .map(|buf| buf.block_id)
            .expect("block_id on a released lock")
    }

    /// Logical size of the data this lock observes.
    pub fn cache_block_size(&self) -> u32 {
        self.block_size
    }

    /// Read-only view of the block bytes this lock observes. For snapshotted
    /// and read-outdated access these may differ from the block's current
    /// bytes.
    pub fn get_data_read(&self) -> BufRead<'_> {
        if let Some(pinned) = &self.pinned {
            return BufRead {
                guard: pinned.data.read_arc(),
                len: self.block_size as usize,
                _lock: PhantomData,
            };
        }
        let buf = self.buf.as_ref().expect("read on a released lock");
        let data = buf
            .state()
            .data
            .clone()
            .expect("resident buf has data under an acquired lock");
        BufRead {
            guard: data.read_arc(),
            len: self.block_size as usize,
            _lock: PhantomData,
        }
    }

    /// Write view at the serializer's full block size.
    pub fn get_data_write(&mut self) -> Result<BufWrite<'_>> {
        self.data_write(None)
    }

    /// Write view with an explicit block size for this write only; a later
    /// unsized `get_data_write` resets to the full block size.
    pub fn get_data_write_sized(&mut self, block_size: u32) -> Result<BufWrite<'_>> {
        self.data_write(Some(block_size))
    }

    fn data_write(&mut self, size: Option<u32>) -> Result<BufWrite<'_>> {
        let buf = Arc::clone(self.buf.as_ref().ok_or(EspejoError::Invalid(
            "write on a released lock",
        ))?);
        match self.lock_mode {
            Some(LockMode::Write) => {}
            Some(LockMode::Intent) => {
                buf.lock.upgrade_intent_to_write();
                self.lock_mode = Some(LockMode::Write);
            }
            _ => {
                return Err(EspejoError::Invalid(
                    "write access requires write or intent mode",
                ))
            }
        }
        let shared = self.txn.shared;
        let full = shared.block_size();
        let new_size = size.unwrap_or(full);
        if new_size > full {
            return Err(EspejoError::Invalid("block size exceeds serializer block"));
        }
        let version = self
            .txn
            .core
            .snapshot_version()
            .expect("writer transactions have a finalized version");

        let data = {
            let mut inner = shared.inner();
            if inner.poisoned {
                return Err(EspejoError::Poisoned);
            }
            let mut state = buf.state();
            debug_assert!(state.version <= version, "buf version ran ahead of writer");
            let affected = if state.version < version {
                inner.snapshots_affected(state.version, version)
            } else {
                Vec::new()
            };
            buf.snapshot_if_needed(
                &mut state,
                affected,
                version,
                true,
                full,
                shared.counters(),
            );
            state.version = version;
            state.block_size = new_size;
            state.data_token = None;
            state.dirty = true;
            // A write carries the transaction's recency into the block.
            state.subtree_recency = state.subtree_recency.max(self.txn.recency);
            self.recency = self.recency.max(state.subtree_recency);
            state.data.clone().expect("writable buf has data")
        };
        self.block_size = new_size;
        self.note_dirtied(&buf);
        Ok(BufWrite {
            guard: data.write_arc(),
            len: new_size as usize,
            _lock: PhantomData,
        })
    }

    /// First-dirty bookkeeping per (transaction, block), then the writeback
    /// listing. Never called with the cache mutex or buf state held.
    fn note_dirtied(&self, buf: &Arc<InnerBuf>) {
        let first_time = {
            let mut state = self.txn.core.state.lock();
            if state.dirty.iter().any(|other| Arc::ptr_eq(other, buf)) {
                false
            } else {
                state.dirty.push(Arc::clone(buf));
                true
            }
        };
        if first_time {
            buf.state().active_writers += 1;
        }
        let shared = self.txn.shared;
        shared.writeback().add_dirty(
            buf,
            u64::from(shared.block_size()),
            shared.config().flush_threshold,
        );
    }

    /// Marks the block for deletion; on commit, writeback deletes it on the
    /// serializer and recycles the id.
    pub fn mark_deleted(&mut self) -> Result<()> {
        let buf = Arc::clone(self.buf.as_ref().ok_or(EspejoError::Invalid(
            "delete on a released lock",
        ))?);
        match self.lock_mode {
            Some(LockMode::Write) => {}
            Some(LockMode::Intent) => {
                buf.lock.upgrade_intent_to_write();
                self.lock_mode = Some(LockMode::Write);
            }
            _ => return Err(EspejoError::Invalid("delete requires write mode")),
        }
        let shared = self.txn.shared;
        let version = self
            .txn
            .core
            .snapshot_version()
            .expect("writer transactions have a finalized version");
        {
            let mut inner = shared.inner();
            if inner.poisoned {
                return Err(EspejoError::Poisoned);
            }
            let mut state = buf.state();
            let affected = if state.version < version {
                inner.snapshots_affected(state.version, version)
            } else {
                Vec::new()
            };
            // The contents are being discarded, so no clone is left behind.
            buf.snapshot_if_needed(
                &mut state,
                affected,
                version,
                false,
                shared.block_size(),
                shared.counters(),
            );
            state.version = version;
            state.do_delete = true;
            state.dirty = true;
            state.data_token = None;
        }
        self.note_dirtied(&buf);
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.buf
            .as_ref()
            .map(|buf| buf.state().do_delete)
            .unwrap_or(false)
    }

    /// The recency this lock observes (snapshot recency for snapshotted
    /// access).
    pub fn get_recency(&self) -> Recency {
        self.recency
    }

    /// Advances the block's recency; monotone non-decreasing per block.
    pub fn touch_recency(&mut self, timestamp: Recency) -> Result<()> {
        if !matches!(self.lock_mode, Some(LockMode::Write)) {
            return Err(EspejoError::Invalid("touch_recency requires write mode"));
        }
        let buf = self.buf.as_ref().expect("recency on a released lock");
        let mut state = buf.state();
        state.subtree_recency = state.subtree_recency.max(timestamp);
        self.recency = self.recency.max(timestamp);
        Ok(())
    }

    pub fn get_eviction_priority(&self) -> EvictionPriority {
        self.buf
            .as_ref()
            .map(|buf| buf.state().eviction_priority)
            .unwrap_or_default()
    }

    pub fn set_eviction_priority(&self, priority: EvictionPriority) {
        if let Some(buf) = self.buf.as_ref() {
            buf.state().eviction_priority = priority;
        }
    }

    /// Releases the buf: drops the pin, the block lock, and the reference.
    /// Idempotent; implied by drop.
    pub fn release(&mut self) {
        let Some(buf) = self.buf.take() else {
            return;
        };
        let shared = self.txn.shared;
        if let Some(pinned) = self.pinned.take() {
            buf.release_pinned(&pinned, shared.counters());
        }
        if let Some(mode) = self.lock_mode.take() {
            buf.lock.release(mode);
        }
        buf.state().refcount -= 1;
        {
            let mut state = self.txn.core.state.lock();
            debug_assert!(state.live_locks > 0);
            state.live_locks -= 1;
        }
        if matches!(self.mode, AccessMode::Write | AccessMode::Intent) {
            shared.writeback().writer_released();
        }
    }
}

impl std::fmt::Debug for BufLock<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufLock").finish_non_exhaustive()
    }
}

impl Drop for BufLock<'_, '_> {
    fn drop(&mut self) {
        self.release();
    }
}
