//! The mirrored buffer cache. One coupled module: the types in here share
//! state freely through crate-private fields; `Cache`, `Transaction`,
//! `BufLock` and the config/stats types are the public façade.

mod buf;
mod buf_lock;
pub(crate) mod cache;
mod config;
mod fifo_check;
mod free_list;
mod page_map;
mod page_repl;
mod rwi_lock;
mod stats;
mod transaction;
mod writeback;

pub use buf::EvictionPriority;
pub use buf_lock::{AccessMode, BufLock, BufRead, BufWrite};
pub use cache::{Cache, CacheAccount};
pub use config::CacheConfig;
pub use fifo_check::{OrderMode, OrderToken};
pub use stats::CacheStats;
pub use transaction::{Access, Durability, Transaction};
