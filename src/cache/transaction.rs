//! Transactions: grouped lock acquisitions with a lazily finalized snapshot
//! version, writeback handoff on commit, and durability waits.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::buf::{InnerBuf, SnapId};
use crate::cache::cache::{CacheAccount, CacheShared};
use crate::serializer::IoAccount;
use crate::types::{BlockId, EspejoError, Recency, Result, VersionId};

/// Transaction access mode.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Access {
    Read,
    Write,
}

/// How long a writer's commit blocks.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum Durability {
    /// Return once writeback has accepted the changes.
    #[default]
    Soft,
    /// Block until the serializer has confirmed persistence.
    Hard,
}

pub(crate) struct TxnState {
    pub(crate) snapshot_version: Option<VersionId>,
    pub(crate) snapshotted: bool,
    pub(crate) registered: bool,
    /// Snapshot claims registered on behalf of this transaction: the pair is
    /// the buf and the preserved snapshot's id.
    pub(crate) owned_snapshots: Vec<(Arc<InnerBuf>, SnapId)>,
    /// Bufs this transaction dirtied (once each).
    pub(crate) dirty: Vec<Arc<InnerBuf>>,
    pub(crate) live_locks: u32,
    pub(crate) num_locks_acquired: u64,
}

/// The part of a transaction shared with the cache registry and with bufs
/// that register snapshot claims against it.
pub(crate) struct TxnCore {
    pub(crate) access: Access,
    pub(crate) is_writeback: bool,
    pub(crate) state: Mutex<TxnState>,
}

impl TxnCore {
    pub(crate) fn new(access: Access, is_writeback: bool) -> Arc<Self> {
        Arc::new(Self {
            access,
            is_writeback,
            state: Mutex::new(TxnState {
                snapshot_version: None,
                snapshotted: false,
                registered: false,
                owned_snapshots: Vec::new(),
                dirty: Vec::new(),
                live_locks: 0,
                num_locks_acquired: 0,
            }),
        })
    }

    /// Called by `snapshot_if_needed` while the cache mutex and the buf's
    /// state are held; must therefore only touch this transaction's state.
    pub(crate) fn add_owned_snapshot(&self, buf: Arc<InnerBuf>, snap_id: SnapId) {
        self.state.lock().owned_snapshots.push((buf, snap_id));
    }

    /// Assigns the snapshot version on the first acquisition. Runs under the
    /// cache mutex, which is what makes version assignment monotone across
    /// concurrently beginning transactions: assignment order is registration
    /// order. Readers share the current version; a writer reserves its own
    /// by advancing it.
    pub(crate) fn maybe_finalize_version(
        self: &Arc<Self>,
        inner: &mut crate::cache::cache::CacheInner,
    ) -> VersionId {
        let mut state = self.state.lock();
        if let Some(version) = state.snapshot_version {
            return version;
        }
        let version = inner.next_snapshot_version;
        if self.access == Access::Write {
            inner.next_snapshot_version = version.next();
        }
        state.snapshot_version = Some(version);
        if state.snapshotted {
            inner
                .active_snapshots
                .entry(version)
                .or_default()
                .push(Arc::clone(self));
            state.registered = true;
        }
        version
    }

    pub(crate) fn snapshot_version(&self) -> Option<VersionId> {
        self.state.lock().snapshot_version
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(version: VersionId) -> Arc<Self> {
        let core = Self::new(Access::Read, false);
        core.state.lock().snapshot_version = Some(version);
        core
    }
}

/// A transaction against the cache. Lock acquisitions borrow the
/// transaction, so every `BufLock` is gone before the transaction ends;
/// destruction hands a writer's dirty set to writeback and, for hard
/// durability, blocks until the flush confirms.
pub struct Transaction<'a> {
    pub(crate) shared: &'a CacheShared,
    pub(crate) core: Arc<TxnCore>,
    pub(crate) recency: Recency,
    pub(crate) expected_change_count: usize,
    pub(crate) durability: Durability,
    pub(crate) account: Option<Arc<IoAccount>>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(
        shared: &'a CacheShared,
        access: Access,
        expected_change_count: usize,
        recency: Recency,
        durability: Durability,
        is_writeback: bool,
    ) -> Self {
        Self {
            shared,
            core: TxnCore::new(access, is_writeback),
            recency,
            expected_change_count,
            durability,
            account: None,
            finished: false,
        }
    }

    pub fn access(&self) -> Access {
        self.core.access
    }

    /// Total BufLocks this transaction has acquired.
    pub fn num_locks_acquired(&self) -> u64 {
        self.core.state.lock().num_locks_acquired
    }

    /// The version this transaction reads at; `None` until the first
    /// acquisition finalizes it.
    pub fn snapshot_version(&self) -> Option<VersionId> {
        self.core.snapshot_version()
    }

    /// Marks the transaction snapshotted: reads observe the state as of the
    /// version assigned at the first acquisition, regardless of later
    /// writers. Only valid for read transactions, before any acquisition.
    pub fn snapshot(&self) -> Result<()> {
        if self.core.access != Access::Read {
            return Err(EspejoError::Invalid("only read transactions snapshot"));
        }
        let mut state = self.core.state.lock();
        if state.snapshot_version.is_some() {
            return Err(EspejoError::Invalid(
                "snapshot() must precede the first acquisition",
            ));
        }
        state.snapshotted = true;
        Ok(())
    }

    /// Substitutes a caller-owned I/O account for this transaction's
    /// serializer operations.
    pub fn set_account(&mut self, account: &CacheAccount) {
        self.account = Some(account.io_account());
    }

    pub(crate) fn io_account(&self) -> Arc<IoAccount> {
        if let Some(account) = &self.account {
            return Arc::clone(account);
        }
        match self.core.access {
            Access::Read => self.shared.reads_account(),
            Access::Write => self.shared.writes_account(),
        }
    }

    /// Batch read of `subtree_recency` for `block_ids`, without acquiring
    /// any buf locks. Resident blocks answer from memory, the rest from the
    /// serializer's index; results arrive through `callback` in input order.
    pub fn get_subtree_recencies(
        &self,
        block_ids: &[BlockId],
        callback: impl FnOnce(Vec<Recency>),
    ) -> Result<()> {
        let recencies = self.shared.collect_subtree_recencies(block_ids)?;
        callback(recencies);
        Ok(())
    }

    /// Completes the transaction. For writers this hands the dirty set to
    /// writeback and, under hard durability, blocks until the flush has
    /// persisted it. Dropping without calling this does the same but
    /// swallows errors.
    pub fn commit(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let (version, registered) = {
            let state = self.core.state.lock();
            debug_assert_eq!(
                state.live_locks, 0,
                "transaction finished with live buf locks"
            );
            (state.snapshot_version, state.registered)
        };

        // Unregister before draining the claims: writers register claims
        // against this transaction under the cache mutex, so once the
        // unregistration (also under the cache mutex) completes, no further
        // claim can arrive.
        if registered {
            let version = version.expect("registered transaction has a version");
            self.shared.unregister_snapshot(version, &self.core);
        }
        let (owned, dirty) = {
            let mut state = self.core.state.lock();
            (
                std::mem::take(&mut state.owned_snapshots),
                std::mem::take(&mut state.dirty),
            )
        };
        for (buf, snap_id) in owned {
            buf.release_snapshot_claim(snap_id, self.shared.counters());
        }

        let result = if self.core.access == Access::Write && !dirty.is_empty() {
            let version = version.expect("writer with dirty blocks has a version");
            for buf in &dirty {
                let mut state = buf.state();
                debug_assert!(state.active_writers > 0);
                state.active_writers -= 1;
            }
            debug!(
                blocks = dirty.len(),
                version = version.0,
                durability = ?self.durability,
                "cache.txn.commit"
            );
            self.shared.writeback().on_transaction_commit();
            match self.durability {
                Durability::Soft => Ok(()),
                Durability::Hard => self.shared.writeback().wait_durable(
                    &dirty,
                    version,
                    self.shared.config().flush_waiting_threshold,
                ),
            }
        } else {
            Ok(())
        };

        self.shared.note_transaction_end(self.core.is_writeback);
        result
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            tracing::warn!(%err, "cache.txn.drop_commit_failed");
        }
    }
}
