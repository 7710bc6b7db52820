//! espejo: a mirrored buffer cache.
//!
//! An in-memory cache that mirrors a block-addressed serializer, providing
//! transactional, snapshotted access to fixed-size blocks. Transactions
//! acquire per-block locks ([`BufLock`]) in read / intent / write /
//! read-outdated modes; older readers keep observing pre-images through
//! copy-on-write snapshots; a writeback worker batches dirty blocks into
//! flushes; clean blocks are evicted under memory pressure; and serializer
//! read-ahead offers are admitted when they cannot race an active load.
//!
//! ```no_run
//! use std::sync::Arc;
//! use espejo::{
//!     AccessMode, BufLock, Cache, CacheConfig, Durability, LogSerializer,
//!     LogSerializerOptions, Recency, Serializer,
//! };
//!
//! # fn main() -> espejo::Result<()> {
//! let serializer: Arc<dyn Serializer> = Arc::new(LogSerializer::open(
//!     "blocks.log",
//!     LogSerializerOptions::default(),
//! )?);
//! let cache = Cache::new(serializer, CacheConfig::default());
//!
//! let txn = cache.begin_write(1, Recency(1), Durability::Hard)?;
//! let mut lock = BufLock::allocate(&txn)?;
//! let block_id = lock.block_id();
//! lock.get_data_write()?[..4].copy_from_slice(&[1, 2, 3, 4]);
//! lock.release();
//! drop(lock);
//! txn.commit()?;
//!
//! let txn = cache.begin_read()?;
//! let lock = BufLock::acquire(&txn, block_id, AccessMode::Read)?;
//! assert_eq!(&lock.get_data_read()[..4], &[1, 2, 3, 4]);
//! # Ok(())
//! # }
//! ```

mod cache;
pub mod serializer;
mod types;

pub use cache::{
    Access, AccessMode, BufLock, BufRead, BufWrite, Cache, CacheAccount, CacheConfig,
    CacheStats, Durability, EvictionPriority, OrderMode, OrderToken, Transaction,
};
pub use serializer::{
    BlockToken, IoAccount, LogSerializer, LogSerializerOptions, ReadAheadSink, Serializer,
    SerializerRead,
};
pub use types::{BlockId, EspejoError, Recency, Result, VersionId};
