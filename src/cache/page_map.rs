//! Resident-block index.
//!
//! Block ids are allocated densely (free list) and serializer ids are dense
//! by construction, so the map is a growable array indexed by id. Callers
//! serialize access through the cache's inner mutex.

use std::sync::Arc;

use crate::cache::buf::InnerBuf;
use crate::types::BlockId;

#[derive(Default)]
pub(crate) struct PageMap {
    slots: Vec<Option<Arc<InnerBuf>>>,
    len: usize,
}

impl PageMap {
    pub(crate) fn insert(&mut self, buf: Arc<InnerBuf>) {
        let idx = buf.block_id.0 as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        debug_assert!(self.slots[idx].is_none(), "block already resident");
        self.slots[idx] = Some(buf);
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, block_id: BlockId) -> Option<Arc<InnerBuf>> {
        let removed = self
            .slots
            .get_mut(block_id.0 as usize)
            .and_then(Option::take);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub(crate) fn find(&self, block_id: BlockId) -> Option<&Arc<InnerBuf>> {
        self.slots.get(block_id.0 as usize).and_then(Option::as_ref)
    }

    pub(crate) fn contains(&self, block_id: BlockId) -> bool {
        self.find(block_id).is_some()
    }

    pub(crate) fn num_entries(&self) -> usize {
        self.len
    }

    /// Slot access for the page replacer's random probing.
    pub(crate) fn slot(&self, idx: usize) -> Option<&Arc<InnerBuf>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Drains every resident buf; used at cache teardown.
    pub(crate) fn drain(&mut self) -> Vec<Arc<InnerBuf>> {
        self.len = 0;
        self.slots.drain(..).flatten().collect()
    }
}
