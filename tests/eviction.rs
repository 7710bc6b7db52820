use std::sync::Arc;

use espejo::{
    AccessMode, BlockId, BufLock, Cache, CacheConfig, Durability, EvictionPriority,
    LogSerializer, LogSerializerOptions, Recency, Serializer,
};
use tempfile::TempDir;

const BLOCK_SIZE: u32 = 1024;

fn open_serializer(dir: &TempDir) -> Arc<dyn Serializer> {
    Arc::new(
        LogSerializer::open(
            dir.path().join("blocks.log"),
            LogSerializerOptions {
                block_size: BLOCK_SIZE,
                sync_writes: false,
                read_ahead_window: 0,
            },
        )
        .unwrap(),
    )
}

fn small_cache(dir: &TempDir, max_blocks: u64) -> Cache {
    Cache::new(
        open_serializer(dir),
        CacheConfig {
            max_size: max_blocks * u64::from(BLOCK_SIZE),
            flush_timer_ms: 10,
            ..CacheConfig::default()
        },
    )
}

fn write_block(cache: &Cache, fill: u8) -> BlockId {
    let txn = cache.begin_write(1, Recency(1), Durability::Hard).unwrap();
    let mut lock = BufLock::allocate(&txn).unwrap();
    let block_id = lock.block_id();
    lock.get_data_write().unwrap().fill(fill);
    lock.release();
    drop(lock);
    txn.commit().unwrap();
    block_id
}

#[test]
fn eviction_is_transparent_to_readers() {
    let dir = TempDir::new().unwrap();
    let cache = small_cache(&dir, 4);

    let blocks: Vec<(BlockId, u8)> = (1..=16u8)
        .map(|fill| (write_block(&cache, fill), fill))
        .collect();

    // The working set exceeds the target; some blocks must have left memory.
    assert!(cache.num_blocks() <= 8);
    assert!(cache.stats().evictions > 0);

    for (block_id, fill) in blocks {
        let txn = cache.begin_read().unwrap();
        let lock = BufLock::acquire(&txn, block_id, AccessMode::Read).unwrap();
        assert!(
            lock.get_data_read().iter().all(|&byte| byte == fill),
            "block {block_id} changed across eviction"
        );
    }
}

#[test]
fn referenced_blocks_are_never_evicted() {
    let dir = TempDir::new().unwrap();
    let cache = small_cache(&dir, 4);
    let pinned_id = write_block(&cache, 0xEE);

    let txn = cache.begin_read().unwrap();
    let lock = BufLock::acquire(&txn, pinned_id, AccessMode::Read).unwrap();

    for fill in 1..=16u8 {
        write_block(&cache, fill);
    }
    assert!(cache.contains_block(pinned_id));
    assert!(lock.get_data_read().iter().all(|&byte| byte == 0xEE));
}

#[test]
fn eviction_priority_is_carried_on_the_block() {
    let dir = TempDir::new().unwrap();
    let cache = small_cache(&dir, 16);
    let block_id = write_block(&cache, 1);

    let txn = cache.begin_read().unwrap();
    let lock = BufLock::acquire(&txn, block_id, AccessMode::Read).unwrap();
    assert_eq!(lock.get_eviction_priority(), EvictionPriority::DEFAULT);
    lock.set_eviction_priority(EvictionPriority(200));
    drop(lock);

    let lock = BufLock::acquire(&txn, block_id, AccessMode::Read).unwrap();
    assert_eq!(lock.get_eviction_priority(), EvictionPriority(200));
}

#[test]
fn snapshotted_block_outlives_eviction_pressure() {
    let dir = TempDir::new().unwrap();
    let cache = small_cache(&dir, 4);
    let block_id = write_block(&cache, 0xAB);

    let snap_txn = cache.begin_read().unwrap();
    snap_txn.snapshot().unwrap();
    let snap_lock = BufLock::acquire(&snap_txn, block_id, AccessMode::Read).unwrap();

    {
        let txn = cache.begin_write(1, Recency(2), Durability::Hard).unwrap();
        let mut lock = BufLock::acquire(&txn, block_id, AccessMode::Write).unwrap();
        lock.get_data_write().unwrap().fill(0xCD);
        lock.release();
        drop(lock);
        txn.commit().unwrap();
    }
    for fill in 1..=16u8 {
        write_block(&cache, fill);
    }

    assert!(snap_lock.get_data_read().iter().all(|&byte| byte == 0xAB));
}
