//! The canonical in-memory image of one block, and the frozen prior images
//! preserved for older transactions.
//!
//! Refcount discipline for a [`BufSnapshot`]:
//! `total_refcount == active_refcount + outstanding registered claims`.
//! Creation seeds `active` with the holders pinning the old allocation
//! (cow + as-if-snapshot readers) and adds one claim per affected snapshotted
//! transaction. Acquires bump both counts, releases drop both, a transaction
//! ending drops its claim. The snapshot is freed when `total` hits zero.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use smallvec::SmallVec;
use tracing::debug;

use crate::cache::stats::StatsCounters;
use crate::cache::rwi_lock::RwiLock;
use crate::cache::transaction::TxnCore;
use crate::serializer::{BlockToken, IoAccount, Serializer};
use crate::types::{BlockId, Recency, Result, VersionId};

/// A block-sized allocation shared between the buf, its snapshots, in-flight
/// flushes and read-outdated holders. The rwlock arbitrates byte access; the
/// snapshot protocol guarantees a frozen allocation is never written again.
pub(crate) type BlockBuf = Arc<RwLock<Box<[u8]>>>;

/// Per-buf snapshot identity.
pub(crate) type SnapId = u64;

pub(crate) fn new_block_buf(size: u32) -> BlockBuf {
    Arc::new(RwLock::new(vec![0u8; size as usize].into_boxed_slice()))
}

pub(crate) fn new_block_buf_from(bytes: &[u8], size: u32) -> BlockBuf {
    let mut buf = vec![0u8; size as usize];
    let len = bytes.len().min(buf.len());
    buf[..len].copy_from_slice(&bytes[..len]);
    Arc::new(RwLock::new(buf.into_boxed_slice()))
}

/// Replacement priority class. Lower values are evicted earlier; the default
/// sits in the middle so callers can protect hot structures (e.g. tree roots)
/// by raising it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct EvictionPriority(pub u16);

impl EvictionPriority {
    pub const DEFAULT: EvictionPriority = EvictionPriority(100);
}

impl Default for EvictionPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How a holder pinned a buffer that was the current image at pin time.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum PinKind {
    /// Read-outdated-ok holder (`cow_refcount`).
    Cow,
    /// Holder treating the current image as a snapshot (`snap_refcount`);
    /// also used by in-flight flush stabilization.
    Snap,
}

/// A frozen prior image, preserved while older transactions may observe it.
///
/// A transaction at version `t` must observe this image iff
/// `version < t <= superseded_by`: the image existed when the transaction
/// finalized and the write that replaced it came later.
pub(crate) struct BufSnapshot {
    /// Identity within its buf; unique even when versions repeat (a flush
    /// stabilization snapshot shares its version with the current image).
    pub(crate) id: SnapId,
    /// `None` while unloaded; reloadable through `token`.
    pub(crate) data: Option<BlockBuf>,
    pub(crate) block_size: u32,
    /// The version this image carried when it was superseded.
    pub(crate) version: VersionId,
    /// The version of the write that replaced this image.
    pub(crate) superseded_by: VersionId,
    pub(crate) recency: Recency,
    pub(crate) token: Option<BlockToken>,
    pub(crate) active_refcount: u32,
    pub(crate) total_refcount: u32,
}

/// Mutable per-block state, guarded by [`InnerBuf::state`]. Lock ordering:
/// the cache inner mutex may be held when taking this, never the reverse,
/// and neither is held across serializer I/O or blocking lock acquisition.
pub(crate) struct BufState {
    /// `None` while loading (the loader holds the write lock meanwhile).
    pub(crate) data: Option<BlockBuf>,
    /// Logical size of the current image; at most the serializer block size.
    pub(crate) block_size: u32,
    pub(crate) version: VersionId,
    /// Present iff `data` is byte-identical to the on-serializer image.
    pub(crate) data_token: Option<BlockToken>,
    pub(crate) subtree_recency: Recency,
    /// Live BufLocks referencing this buf.
    pub(crate) refcount: u32,
    pub(crate) cow_refcount: u32,
    pub(crate) snap_refcount: u32,
    pub(crate) do_delete: bool,
    pub(crate) loading: bool,
    pub(crate) load_failed: bool,
    pub(crate) dirty: bool,
    pub(crate) in_dirty_list: bool,
    /// Writer transactions that dirtied this block and have not committed.
    pub(crate) active_writers: u32,
    pub(crate) eviction_priority: EvictionPriority,
    /// Cache tick of the most recent acquisition, for the replacement score.
    pub(crate) last_access: u64,
    pub(crate) next_snap_id: SnapId,
    /// Newest first.
    pub(crate) snapshots: SmallVec<[BufSnapshot; 2]>,
}

impl BufState {
    fn empty() -> Self {
        Self {
            data: None,
            block_size: 0,
            version: VersionId::FAUX,
            data_token: None,
            subtree_recency: Recency::default(),
            refcount: 0,
            cow_refcount: 0,
            snap_refcount: 0,
            do_delete: false,
            loading: false,
            load_failed: false,
            dirty: false,
            in_dirty_list: false,
            active_writers: 0,
            eviction_priority: EvictionPriority::DEFAULT,
            last_access: 0,
            next_snap_id: 0,
            snapshots: SmallVec::new(),
        }
    }

    /// Whether the page replacer may discard this buf right now.
    pub(crate) fn safe_to_unload(&self) -> bool {
        self.refcount == 0
            && self.cow_refcount == 0
            && self.snap_refcount == 0
            && self.snapshots.is_empty()
            && !self.dirty
            && !self.in_dirty_list
            && !self.do_delete
            && !self.loading
    }
}

/// What an acquisition of (possibly historical) block data pinned.
pub(crate) struct PinnedData {
    pub(crate) data: BlockBuf,
    pub(crate) block_size: u32,
    pub(crate) recency: Recency,
    pub(crate) kind: PinKind,
}

pub(crate) struct InnerBuf {
    pub(crate) block_id: BlockId,
    pub(crate) lock: RwiLock,
    pub(crate) state: Mutex<BufState>,
}

impl InnerBuf {
    /// A buf about to be filled from the serializer. The creator must hold
    /// the write lock until the load completes.
    pub(crate) fn new_loading(block_id: BlockId) -> Arc<Self> {
        let mut state = BufState::empty();
        state.loading = true;
        Arc::new(Self {
            block_id,
            lock: RwiLock::new(),
            state: Mutex::new(state),
        })
    }

    /// A buf admitted directly from a serializer read-ahead offer.
    pub(crate) fn new_from_read_ahead(
        block_id: BlockId,
        bytes: &[u8],
        full_block_size: u32,
        token: BlockToken,
        recency: Recency,
    ) -> Arc<Self> {
        let mut state = BufState::empty();
        state.data = Some(new_block_buf_from(bytes, full_block_size));
        state.block_size = bytes.len() as u32;
        state.data_token = Some(token);
        state.subtree_recency = recency;
        Arc::new(Self {
            block_id,
            lock: RwiLock::new(),
            state: Mutex::new(state),
        })
    }

    /// A freshly allocated block: faux prior version, zeroed data, no token.
    pub(crate) fn new_allocated(block_id: BlockId, full_block_size: u32) -> Arc<Self> {
        let mut state = BufState::empty();
        state.data = Some(new_block_buf(full_block_size));
        state.block_size = full_block_size;
        Arc::new(Self {
            block_id,
            lock: RwiLock::new(),
            state: Mutex::new(state),
        })
    }

    /// Preserves the current image before a writer replaces it, if any older
    /// transaction or holder still needs it. Returns whether a snapshot was
    /// created.
    ///
    /// `affected` are the registered snapshotted transactions whose version
    /// lies in `(current_version, new_version]`; the caller gathers them
    /// under the cache mutex. When a snapshot is created the current
    /// allocation moves into it (holder pointers stay valid) and the buf is
    /// re-seeded: a copy of the old bytes when `leave_clone` (the writer
    /// keeps mutating the same contents), zeroed when not (deletion discards
    /// them).
    pub(crate) fn snapshot_if_needed(
        self: &Arc<Self>,
        state: &mut BufState,
        affected: Vec<Arc<TxnCore>>,
        new_version: VersionId,
        leave_clone: bool,
        full_block_size: u32,
        counters: &StatsCounters,
    ) -> bool {
        let holders = state.cow_refcount + state.snap_refcount;
        if holders == 0 && affected.is_empty() {
            return false;
        }
        let old = state
            .data
            .take()
            .expect("snapshotting a buf with no data resident");
        let snap_version = state.version;
        debug_assert!(snap_version <= new_version);
        let reseeded = if leave_clone {
            new_block_buf_from(&old.read()[..], full_block_size)
        } else {
            new_block_buf(full_block_size)
        };
        let snap_id = state.next_snap_id;
        state.next_snap_id += 1;
        let snapshot = BufSnapshot {
            id: snap_id,
            data: Some(old),
            block_size: state.block_size,
            version: snap_version,
            superseded_by: new_version,
            recency: state.subtree_recency,
            token: state.data_token.take(),
            active_refcount: holders,
            total_refcount: holders + affected.len() as u32,
        };
        debug!(
            block_id = self.block_id.0,
            version = snap_version.0,
            holders,
            affected = affected.len(),
            "cache.buf.snapshot"
        );
        state.data = Some(reseeded);
        state.cow_refcount = 0;
        state.snap_refcount = 0;
        state.snapshots.insert(0, snapshot);
        for txn in affected {
            txn.add_owned_snapshot(Arc::clone(self), snap_id);
        }
        StatsCounters::bump(&counters.snapshots_created);
        true
    }

    /// Pins the image a transaction at `version_to_access` must observe:
    /// the current data when its version predates the transaction, otherwise
    /// the snapshot whose `(version, superseded_by]` interval covers it.
    /// Reloads unloaded snapshot bytes through their token.
    pub(crate) fn acquire_snapshot_data(
        self: &Arc<Self>,
        version_to_access: VersionId,
        serializer: &dyn Serializer,
        account: &IoAccount,
        full_block_size: u32,
    ) -> Result<PinnedData> {
        debug_assert!(!version_to_access.is_faux());
        let mut state = self.state.lock();
        if state.version < version_to_access {
            let data = state
                .data
                .as_ref()
                .expect("acquiring snapshot data on an unloaded buf")
                .clone();
            state.snap_refcount += 1;
            return Ok(PinnedData {
                data,
                block_size: state.block_size,
                recency: state.subtree_recency,
                kind: PinKind::Snap,
            });
        }
        // Covering intervals are disjoint, so the match is unique; an
        // empty-interval snapshot (version == superseded_by, created only to
        // stabilize an in-flight flush) never matches.
        let snap_id = state
            .snapshots
            .iter()
            .find(|snap| {
                snap.version < version_to_access && version_to_access <= snap.superseded_by
            })
            .map(|snap| snap.id)
            .expect("snapshot buffer no longer available");

        let snap = Self::snapshot_by_id(&mut state, snap_id);
        if let Some(data) = snap.data.as_ref() {
            let pinned = PinnedData {
                data: data.clone(),
                block_size: snap.block_size,
                recency: snap.recency,
                kind: PinKind::Snap,
            };
            snap.active_refcount += 1;
            snap.total_refcount += 1;
            return Ok(pinned);
        }

        // Unloaded: hold a claim across the reload so the snapshot cannot be
        // freed while the state lock is released for I/O.
        let token = snap
            .token
            .expect("snapshot unloaded without a block token");
        snap.total_refcount += 1;
        drop(state);
        let bytes = serializer.read_token(token, account);
        let mut state = self.state.lock();
        match bytes {
            Err(err) => {
                let snap = Self::snapshot_by_id(&mut state, snap_id);
                snap.total_refcount -= 1;
                let freed = snap.total_refcount == 0;
                if freed {
                    let idx = state
                        .snapshots
                        .iter()
                        .position(|snap| snap.id == snap_id)
                        .expect("snapshot just touched");
                    state.snapshots.remove(idx);
                }
                Err(err)
            }
            Ok(bytes) => {
                let snap = Self::snapshot_by_id(&mut state, snap_id);
                if snap.data.is_none() {
                    snap.data = Some(new_block_buf_from(&bytes, full_block_size));
                }
                let data = snap.data.as_ref().expect("just installed").clone();
                snap.active_refcount += 1;
                Ok(PinnedData {
                    data,
                    block_size: snap.block_size,
                    recency: snap.recency,
                    kind: PinKind::Snap,
                })
            }
        }
    }

    fn snapshot_by_id(state: &mut BufState, id: SnapId) -> &mut BufSnapshot {
        state
            .snapshots
            .iter_mut()
            .find(|snap| snap.id == id)
            .expect("snapshot buffer no longer available")
    }

    /// Releases a pin taken on what was the current image or a snapshot.
    /// Resolution is by allocation identity: the image may have migrated into
    /// a snapshot since the pin was taken.
    pub(crate) fn release_pinned(&self, pinned: &PinnedData, counters: &StatsCounters) {
        let mut state = self.state.lock();
        if let Some(current) = state.data.as_ref() {
            if Arc::ptr_eq(current, &pinned.data) {
                match pinned.kind {
                    PinKind::Cow => {
                        debug_assert!(state.cow_refcount > 0);
                        state.cow_refcount -= 1;
                    }
                    PinKind::Snap => {
                        debug_assert!(state.snap_refcount > 0);
                        state.snap_refcount -= 1;
                    }
                }
                return;
            }
        }
        let idx = state
            .snapshots
            .iter()
            .position(|snap| {
                snap.data
                    .as_ref()
                    .is_some_and(|data| Arc::ptr_eq(data, &pinned.data))
            })
            .expect("snapshot buffer no longer available");
        let snap = &mut state.snapshots[idx];
        debug_assert!(snap.active_refcount > 0 && snap.total_refcount > 0);
        snap.active_refcount -= 1;
        snap.total_refcount -= 1;
        let freed = snap.total_refcount == 0;
        if freed {
            state.snapshots.remove(idx);
            StatsCounters::bump(&counters.snapshots_freed);
        }
    }

    /// Releases a registered transaction's claim on the snapshot `id`
    /// (taken when the snapshot was created for it).
    pub(crate) fn release_snapshot_claim(&self, id: SnapId, counters: &StatsCounters) {
        let mut state = self.state.lock();
        let idx = state
            .snapshots
            .iter()
            .position(|snap| snap.id == id)
            .expect("snapshot buffer no longer available");
        let snap = &mut state.snapshots[idx];
        debug_assert!(snap.total_refcount > 0);
        snap.total_refcount -= 1;
        let freed = snap.total_refcount == 0;
        if freed {
            state.snapshots.remove(idx);
            StatsCounters::bump(&counters.snapshots_freed);
        }
    }

    /// Installs the token writeback received for `written`. If the current
    /// data is still the written allocation the buf becomes clean-mirrored
    /// (token installed, dirty flag cleared, atomically with the identity
    /// check); otherwise the image has migrated into a snapshot and the
    /// token attaches there. Returns whether the current data was the one
    /// written.
    pub(crate) fn update_data_token(&self, written: &BlockBuf, token: BlockToken) -> bool {
        let mut state = self.state.lock();
        if let Some(current) = state.data.as_ref() {
            if Arc::ptr_eq(current, written) {
                state.data_token = Some(token);
                state.dirty = false;
                return true;
            }
        }
        if let Some(snap) = state.snapshots.iter_mut().find(|snap| {
            snap.data
                .as_ref()
                .is_some_and(|data| Arc::ptr_eq(data, written))
        }) {
            snap.token = Some(token);
        } else {
            debug_assert!(false, "flushed buffer vanished before token update");
        }
        false
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, BufState> {
        self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::transaction::TxnCore;
    use crate::types::EspejoError;
    use proptest::prelude::*;

    const BS: u32 = 32;

    fn counters() -> StatsCounters {
        StatsCounters::default()
    }

    fn write_bytes(buf: &Arc<InnerBuf>, bytes: &[u8], version: VersionId) {
        let mut state = buf.state();
        let data = state.data.as_ref().unwrap().clone();
        data.write()[..bytes.len()].copy_from_slice(bytes);
        state.version = version;
    }

    #[test]
    fn no_snapshot_without_holders_or_affected() {
        let buf = InnerBuf::new_allocated(BlockId(1), BS);
        write_bytes(&buf, b"aaaa", VersionId(1));
        let stats = counters();
        let mut state = buf.state.lock();
        let created =
            buf.snapshot_if_needed(&mut state, Vec::new(), VersionId(2), true, BS, &stats);
        assert!(!created);
        assert!(state.snapshots.is_empty());
    }

    #[test]
    fn cow_holder_forces_snapshot_and_keeps_old_allocation() {
        let buf = InnerBuf::new_allocated(BlockId(1), BS);
        write_bytes(&buf, b"old!", VersionId(1));
        let stats = counters();

        // Pin as a read-outdated holder.
        let pinned = {
            let mut state = buf.state.lock();
            state.cow_refcount += 1;
            PinnedData {
                data: state.data.as_ref().unwrap().clone(),
                block_size: state.block_size,
                recency: state.subtree_recency,
                kind: PinKind::Cow,
            }
        };

        {
            let mut state = buf.state.lock();
            let created =
                buf.snapshot_if_needed(&mut state, Vec::new(), VersionId(2), true, BS, &stats);
            assert!(created);
            assert_eq!(state.cow_refcount, 0);
            let snap = &state.snapshots[0];
            assert_eq!(snap.active_refcount, 1);
            assert_eq!(snap.total_refcount, 1);
            // The holder's allocation is now the snapshot's.
            assert!(Arc::ptr_eq(snap.data.as_ref().unwrap(), &pinned.data));
            // The writer got a private copy of the old bytes.
            let current = state.data.as_ref().unwrap();
            assert!(!Arc::ptr_eq(current, &pinned.data));
            assert_eq!(&current.read()[..4], b"old!");
        }

        // The holder's release lands on the snapshot and frees it.
        buf.release_pinned(&pinned, &stats);
        assert!(buf.state.lock().snapshots.is_empty());
    }

    #[test]
    fn affected_transactions_take_claims() {
        let buf = InnerBuf::new_allocated(BlockId(2), BS);
        write_bytes(&buf, b"pre-", VersionId(3));
        let stats = counters();
        let txn = TxnCore::new_for_test(VersionId(4));

        {
            let mut state = buf.state.lock();
            let created = buf.snapshot_if_needed(
                &mut state,
                vec![Arc::clone(&txn)],
                VersionId(5),
                true,
                BS,
                &stats,
            );
            assert!(created);
            let snap = &state.snapshots[0];
            assert_eq!(snap.active_refcount, 0);
            assert_eq!(snap.total_refcount, 1);
        }

        // The registered claim keeps the snapshot alive; releasing it frees.
        let snap_id = buf.state.lock().snapshots[0].id;
        buf.release_snapshot_claim(snap_id, &stats);
        assert!(buf.state.lock().snapshots.is_empty());
    }

    #[test]
    fn acquire_snapshot_data_selects_covering_interval() {
        let buf = InnerBuf::new_allocated(BlockId(3), BS);
        let stats = counters();
        let txn_a = TxnCore::new_for_test(VersionId(2));
        let txn_b = TxnCore::new_for_test(VersionId(4));

        // Image history: v1 superseded by a version-3 write, v3 superseded
        // by a version-5 write, v5 current.
        write_bytes(&buf, b"v1..", VersionId(1));
        {
            let mut state = buf.state.lock();
            buf.snapshot_if_needed(
                &mut state,
                vec![Arc::clone(&txn_a)],
                VersionId(3),
                true,
                BS,
                &stats,
            );
        }
        write_bytes(&buf, b"v3..", VersionId(3));
        {
            let mut state = buf.state.lock();
            buf.snapshot_if_needed(
                &mut state,
                vec![Arc::clone(&txn_b)],
                VersionId(5),
                true,
                BS,
                &stats,
            );
        }
        write_bytes(&buf, b"v5..", VersionId(5));

        let serializer = no_serializer();
        let account = IoAccount::new(0);
        // A transaction at version 2 predates the version-3 write.
        let pinned = buf
            .acquire_snapshot_data(VersionId(2), serializer.as_ref(), &account, BS)
            .unwrap();
        assert_eq!(&pinned.data.read()[..4], b"v1..");
        buf.release_pinned(&pinned, &stats);

        // A transaction at version 4 sees the version-3 image.
        let pinned = buf
            .acquire_snapshot_data(VersionId(4), serializer.as_ref(), &account, BS)
            .unwrap();
        assert_eq!(&pinned.data.read()[..4], b"v3..");
        buf.release_pinned(&pinned, &stats);

        // A transaction at version 6 sees the current image.
        let pinned = buf
            .acquire_snapshot_data(VersionId(6), serializer.as_ref(), &account, BS)
            .unwrap();
        assert_eq!(&pinned.data.read()[..4], b"v5..");
        buf.release_pinned(&pinned, &stats);
    }

    #[test]
    fn update_data_token_attaches_to_migrated_snapshot() {
        let buf = InnerBuf::new_allocated(BlockId(4), BS);
        write_bytes(&buf, b"disk", VersionId(1));
        let stats = counters();

        // Flush pins the current image.
        let flushed = {
            let mut state = buf.state.lock();
            state.snap_refcount += 1;
            state.data.as_ref().unwrap().clone()
        };

        // Writer overwrites concurrently: the flushed image migrates.
        {
            let mut state = buf.state.lock();
            buf.snapshot_if_needed(&mut state, Vec::new(), VersionId(2), true, BS, &stats);
        }

        let installed_on_current = buf.update_data_token(&flushed, BlockToken(77));
        assert!(!installed_on_current);
        let state = buf.state.lock();
        assert_eq!(state.snapshots[0].token, Some(BlockToken(77)));
        assert_eq!(state.data_token, None);
    }

    #[test]
    fn unloaded_snapshot_reloads_through_its_token() {
        let buf = InnerBuf::new_allocated(BlockId(5), BS);
        write_bytes(&buf, b"cold", VersionId(1));
        let stats = counters();
        let txn = TxnCore::new_for_test(VersionId(2));
        {
            let mut state = buf.state.lock();
            // Clean image: the token is carried into the snapshot.
            state.data_token = Some(BlockToken(9));
            buf.snapshot_if_needed(
                &mut state,
                vec![Arc::clone(&txn)],
                VersionId(3),
                true,
                BS,
                &stats,
            );
            // Shed the payload the way the page replacer does.
            let snap = &mut state.snapshots[0];
            assert_eq!(snap.token, Some(BlockToken(9)));
            snap.data = None;
        }
        write_bytes(&buf, b"new!", VersionId(3));

        struct TokenServer;
        impl Serializer for TokenServer {
            fn block_size(&self) -> u32 {
                BS
            }
            fn max_block_id(&self) -> BlockId {
                BlockId(0)
            }
            fn read(
                &self,
                _: BlockId,
                _: &IoAccount,
            ) -> Result<crate::serializer::SerializerRead> {
                Err(EspejoError::Invalid("unexpected read"))
            }
            fn read_token(&self, token: BlockToken, _: &IoAccount) -> Result<Vec<u8>> {
                assert_eq!(token, BlockToken(9));
                Ok(b"cold".to_vec())
            }
            fn write(
                &self,
                _: BlockId,
                _: &[u8],
                _: Recency,
                _: &IoAccount,
            ) -> Result<BlockToken> {
                Err(EspejoError::Invalid("unexpected write"))
            }
            fn delete(&self, _: BlockId, _: &IoAccount) -> Result<()> {
                Err(EspejoError::Invalid("unexpected delete"))
            }
            fn recency(&self, _: BlockId) -> Result<Recency> {
                Err(EspejoError::Invalid("unexpected recency"))
            }
            fn contains(&self, _: BlockId) -> bool {
                false
            }
            fn register_read_ahead(&self, _: Arc<dyn crate::serializer::ReadAheadSink>) {}
            fn unregister_read_ahead(&self) {}
        }

        let account = IoAccount::new(0);
        let pinned = buf
            .acquire_snapshot_data(VersionId(2), &TokenServer, &account, BS)
            .unwrap();
        assert_eq!(&pinned.data.read()[..4], b"cold");
        buf.release_pinned(&pinned, &stats);
    }

    proptest! {
        /// Every probe version must observe the newest image older than it,
        /// across an arbitrary snapshot chain.
        #[test]
        fn snapshot_selection_matches_newest_older_image(
            steps in proptest::collection::vec(1u64..4, 1..6),
            probe in 1u64..30,
        ) {
            let buf = InnerBuf::new_allocated(BlockId(9), BS);
            let stats = counters();
            let mut images = vec![(0u64, 0u8)];
            let mut current = 0u64;
            for step in steps {
                let new_version = current + step;
                let mut state = buf.state.lock();
                let txn = TxnCore::new_for_test(VersionId(new_version));
                buf.snapshot_if_needed(
                    &mut state,
                    vec![txn],
                    VersionId(new_version),
                    true,
                    BS,
                    &stats,
                );
                let data = state.data.as_ref().unwrap().clone();
                data.write().fill(new_version as u8);
                state.version = VersionId(new_version);
                drop(state);
                images.push((new_version, new_version as u8));
                current = new_version;
            }

            let expected = images
                .iter()
                .rev()
                .find(|(version, _)| *version < probe)
                .map(|(_, fill)| *fill)
                .expect("the initial image predates every probe");
            let serializer = no_serializer();
            let account = IoAccount::new(0);
            let pinned = buf
                .acquire_snapshot_data(VersionId(probe), serializer.as_ref(), &account, BS)
                .unwrap();
            prop_assert_eq!(pinned.data.read()[0], expected);
            buf.release_pinned(&pinned, &stats);
        }
    }

    /// A serializer stub for paths that must not touch I/O.
    fn no_serializer() -> Arc<dyn Serializer> {
        struct Never;
        impl Serializer for Never {
            fn block_size(&self) -> u32 {
                BS
            }
            fn max_block_id(&self) -> BlockId {
                BlockId(0)
            }
            fn read(
                &self,
                _: BlockId,
                _: &IoAccount,
            ) -> Result<crate::serializer::SerializerRead> {
                Err(EspejoError::Invalid("unexpected read"))
            }
            fn read_token(&self, _: BlockToken, _: &IoAccount) -> Result<Vec<u8>> {
                Err(EspejoError::Invalid("unexpected token read"))
            }
            fn write(
                &self,
                _: BlockId,
                _: &[u8],
                _: Recency,
                _: &IoAccount,
            ) -> Result<BlockToken> {
                Err(EspejoError::Invalid("unexpected write"))
            }
            fn delete(&self, _: BlockId, _: &IoAccount) -> Result<()> {
                Err(EspejoError::Invalid("unexpected delete"))
            }
            fn recency(&self, _: BlockId) -> Result<Recency> {
                Err(EspejoError::Invalid("unexpected recency"))
            }
            fn contains(&self, _: BlockId) -> bool {
                false
            }
            fn register_read_ahead(&self, _: Arc<dyn crate::serializer::ReadAheadSink>) {}
            fn unregister_read_ahead(&self) {}
        }
        Arc::new(Never)
    }
}
