//! Page replacement: random sampling with priority classes.
//!
//! Each pass probes a small random sample of resident bufs and evicts the
//! one with the lowest (priority, last-access) score among those safe to
//! unload, repeating until resident bytes are at or below the target. Runs
//! under the cache mutex, so nothing can make a sampled buf unsafe between
//! scoring and removal: every safe-to-unsafe transition (new acquisition,
//! dirtying) also takes the cache mutex.

use rand::rngs::SmallRng;
use rand::Rng;
use tracing::warn;

use crate::cache::page_map::PageMap;
use crate::cache::stats::StatsCounters;
use crate::types::BlockId;

const SAMPLE_SIZE: usize = 8;
const MAX_BARREN_PASSES: usize = 3;

pub(crate) fn evict_to_target(
    map: &mut PageMap,
    rng: &mut SmallRng,
    target_bytes: u64,
    block_bytes: u64,
    counters: &StatsCounters,
) {
    let mut barren_passes = 0;
    while (map.num_entries() as u64) * block_bytes > target_bytes {
        let slots = map.slot_count();
        if slots == 0 || map.num_entries() == 0 {
            break;
        }
        let mut best: Option<(BlockId, (u16, u64))> = None;
        let mut sampled = 0;
        // Probe more than the sample size to tolerate empty slots.
        for _ in 0..SAMPLE_SIZE * 4 {
            if sampled >= SAMPLE_SIZE {
                break;
            }
            let idx = rng.gen_range(0..slots);
            let Some(buf) = map.slot(idx) else { continue };
            sampled += 1;
            let mut state = buf.state();
            if !state.safe_to_unload() {
                // The buf itself is pinned, but idle snapshot payloads with a
                // token can still be shed and reloaded on demand.
                for snap in state.snapshots.iter_mut() {
                    if snap.active_refcount == 0 && snap.token.is_some() && snap.data.is_some()
                    {
                        snap.data = None;
                        StatsCounters::bump(&counters.snapshots_unloaded);
                    }
                }
                continue;
            }
            let score = (state.eviction_priority.0, state.last_access);
            if best.map_or(true, |(_, best_score)| score < best_score) {
                best = Some((buf.block_id, score));
            }
        }
        match best {
            Some((block_id, _)) => {
                let buf = map.remove(block_id).expect("sampled buf is resident");
                debug_assert!(buf.state().safe_to_unload());
                StatsCounters::bump(&counters.evictions);
                barren_passes = 0;
            }
            None => {
                barren_passes += 1;
                if barren_passes >= MAX_BARREN_PASSES {
                    warn!(
                        resident = map.num_entries(),
                        "cache.page_repl.no_eviction_candidate"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::buf::{EvictionPriority, InnerBuf};
    use crate::types::BlockId;
    use rand::SeedableRng;

    const BS: u64 = 64;

    fn resident_clean(map: &mut PageMap, id: u64) -> std::sync::Arc<InnerBuf> {
        let buf = InnerBuf::new_allocated(BlockId(id), BS as u32);
        // A freshly allocated buf is clean and unreferenced.
        map.insert(std::sync::Arc::clone(&buf));
        buf
    }

    #[test]
    fn evicts_down_to_target() {
        let mut map = PageMap::default();
        let counters = StatsCounters::default();
        let mut rng = SmallRng::seed_from_u64(7);
        for id in 0..10 {
            resident_clean(&mut map, id);
        }
        evict_to_target(&mut map, &mut rng, 4 * BS, BS, &counters);
        assert!(map.num_entries() <= 4);
    }

    #[test]
    fn skips_referenced_and_dirty_bufs() {
        let mut map = PageMap::default();
        let counters = StatsCounters::default();
        let mut rng = SmallRng::seed_from_u64(7);
        let pinned = resident_clean(&mut map, 0);
        pinned.state().refcount = 1;
        let dirty = resident_clean(&mut map, 1);
        dirty.state().dirty = true;
        evict_to_target(&mut map, &mut rng, 0, BS, &counters);
        assert!(map.contains(BlockId(0)));
        assert!(map.contains(BlockId(1)));
    }

    #[test]
    fn prefers_lower_priority_class() {
        let mut map = PageMap::default();
        let counters = StatsCounters::default();
        let mut rng = SmallRng::seed_from_u64(7);
        let cheap = resident_clean(&mut map, 0);
        cheap.state().eviction_priority = EvictionPriority(1);
        let precious = resident_clean(&mut map, 1);
        precious.state().eviction_priority = EvictionPriority(200);
        evict_to_target(&mut map, &mut rng, BS, BS, &counters);
        assert!(!map.contains(BlockId(0)));
        assert!(map.contains(BlockId(1)));
    }
}
