#![forbid(unsafe_code)]
//! The contract the cache consumes from the block serializer, plus the
//! concrete log-structured implementation in [`log`].

mod log;

pub use log::{LogSerializer, LogSerializerOptions};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::{BlockId, Recency, Result};

/// Opaque handle to a block image persisted by the serializer. While a token
/// is held, the serializer keeps the referenced image readable, so the cache
/// can drop in-memory bytes and re-read them later.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct BlockToken(pub(crate) u64);

/// A read returned by the serializer: the block image, a token proving the
/// bytes match the on-disk state, and the block's recency.
pub struct SerializerRead {
    pub data: Vec<u8>,
    pub token: BlockToken,
    pub recency: Recency,
}

/// I/O priority and accounting handle forwarded to the serializer with every
/// operation. The cache keeps one for reads and one for writes so writeback
/// cannot starve user reads; transactions may substitute their own.
pub struct IoAccount {
    priority: i32,
    ops: AtomicU64,
    bytes: AtomicU64,
}

impl IoAccount {
    pub fn new(priority: i32) -> Self {
        Self {
            priority,
            ops: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Operations charged to this account so far.
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    /// Bytes moved under this account so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn charge(&self, bytes: usize) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Receiver for proactively supplied block images. The serializer pushes
/// `(block_id, bytes, token, recency)` and the sink decides admission; a
/// rejected buffer is simply dropped back to the serializer's pool.
pub trait ReadAheadSink: Send + Sync + 'static {
    fn offer_read_ahead_buf(
        &self,
        block_id: BlockId,
        data: Vec<u8>,
        token: BlockToken,
        recency: Recency,
    );
}

/// Block-addressed persistent store mirrored by the cache.
///
/// All operations are synchronous from the caller's perspective; internally
/// the serializer may retry or reorder by account priority. Errors from this
/// trait are fatal to the cache (it poisons itself), so implementations
/// should only fail on genuinely unrecoverable conditions.
pub trait Serializer: Send + Sync + 'static {
    /// Fixed maximum size of one block, in bytes.
    fn block_size(&self) -> u32;

    /// One past the highest block id ever written. Fresh stores return 0.
    fn max_block_id(&self) -> BlockId;

    /// Reads the latest image of `block_id`.
    fn read(&self, block_id: BlockId, account: &IoAccount) -> Result<SerializerRead>;

    /// Reads a historical image by token. Used to reload snapshot data that
    /// the cache dropped under memory pressure.
    fn read_token(&self, token: BlockToken, account: &IoAccount) -> Result<Vec<u8>>;

    /// Persists `data` as the new image of `block_id`, returning its token.
    fn write(
        &self,
        block_id: BlockId,
        data: &[u8],
        recency: Recency,
        account: &IoAccount,
    ) -> Result<BlockToken>;

    /// Removes `block_id` from the store.
    fn delete(&self, block_id: BlockId, account: &IoAccount) -> Result<()>;

    /// Latest recency of `block_id` without reading its payload.
    fn recency(&self, block_id: BlockId) -> Result<Recency>;

    /// Whether the store currently holds an image for `block_id`.
    fn contains(&self, block_id: BlockId) -> bool;

    fn register_read_ahead(&self, sink: Arc<dyn ReadAheadSink>);

    fn unregister_read_ahead(&self);
}
