//! Offline LFD ("longest forward distance") eviction.
//!
//! Replays a prediction sequence recorded by the simulation algorithm and
//! evicts the evictable block whose next recorded use lies farthest in the
//! future. When the sequence is exhausted the algorithm downgrades
//! transparently to online LRU.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};

use tracing::warn;

use crate::error::{ExtError, Result};
use crate::scheduler::lru::EvictableFifo;
use crate::scheduler::{Algorithm, Core, PredictionSequence, SbId};
use crate::storage::{Bid, Block, Pod};

struct LfdEntry {
    next_use: u64,
    clean: bool,
    has_external: bool,
    id: SbId,
    stamp: u64,
}

impl PartialEq for LfdEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for LfdEntry {}

impl PartialOrd for LfdEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for LfdEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: the best victim is the largest entry. Farther next use
        // wins; ties prefer clean blocks (no write-back), then blocks that
        // already have an external copy.
        self.next_use
            .cmp(&other.next_use)
            .then(self.clean.cmp(&other.clean))
            .then(self.has_external.cmp(&other.has_external))
    }
}

pub struct OfflineLfd {
    /// Remaining recorded use times per block id.
    next_use: Vec<VecDeque<u64>>,
    heap: BinaryHeap<LfdEntry>,
    /// Stamps invalidate stale heap entries lazily.
    stamps: Vec<u64>,
    /// Mirrors the evictable set in FIFO order for the LRU fallback.
    fifo: EvictableFifo,
    downgraded: bool,
}

impl OfflineLfd {
    pub fn new(sequence: PredictionSequence) -> Self {
        let mut next_use: Vec<VecDeque<u64>> = Vec::new();
        for elem in &sequence {
            if next_use.len() <= elem.id {
                next_use.resize_with(elem.id + 1, VecDeque::new);
            }
            next_use[elem.id].push_back(elem.time);
        }
        let stamps = vec![0; next_use.len()];
        Self {
            next_use,
            heap: BinaryHeap::new(),
            stamps,
            fifo: EvictableFifo::default(),
            downgraded: false,
        }
    }

    /// Consume one recorded op for `id`; downgrade when the record is dry.
    fn consume(&mut self, id: SbId) {
        if self.downgraded {
            return;
        }
        let dry = match self.next_use.get_mut(id) {
            Some(d) => d.pop_front().is_none(),
            None => true,
        };
        if dry {
            warn!(id, "prediction sequence exhausted, downgrading to online LRU");
            self.downgraded = true;
        }
    }

    fn peek_next_use(&self, id: SbId) -> u64 {
        self.next_use
            .get(id)
            .and_then(|d| d.front().copied())
            .unwrap_or(u64::MAX)
    }

    fn stamp(&mut self, id: SbId) -> u64 {
        if self.stamps.len() <= id {
            self.stamps.resize(id + 1, 0);
        }
        self.stamps[id] += 1;
        self.stamps[id]
    }

    fn mark_evictable<V: Pod>(&mut self, core: &Core<V>, id: SbId) {
        self.fifo.push(id);
        let stamp = self.stamp(id);
        let next_use = self.peek_next_use(id);
        let clean = !core.blocks[id].is_dirty();
        let has_external = core.blocks[id].has_external();
        self.heap.push(LfdEntry {
            next_use,
            clean,
            has_external,
            id,
            stamp,
        });
    }

    fn unmark_evictable(&mut self, id: SbId) {
        self.fifo.remove(id);
        self.stamp(id);
    }

    fn pop_victim(&mut self) -> Option<SbId> {
        if self.downgraded {
            return self.fifo.pop();
        }
        while let Some(entry) = self.heap.pop() {
            if self.fifo.contains(entry.id) && self.stamps[entry.id] == entry.stamp {
                self.fifo.remove(entry.id);
                return Some(entry.id);
            }
        }
        None
    }

    fn obtain_buffer<V: Pod>(&mut self, core: &mut Core<V>) -> Result<Block<V>> {
        if let Some(block) = core.get_free_buffer() {
            return Ok(block);
        }
        let victim = self.pop_victim().ok_or_else(|| {
            ExtError::OutOfMemory("scheduler: every resident block is acquired".into())
        })?;
        core.evict(victim)?;
        core.get_free_buffer().ok_or_else(|| {
            ExtError::OutOfMemory("scheduler: eviction yielded no buffer".into())
        })
    }
}

impl<V: Pod> Algorithm<V> for OfflineLfd {
    fn acquire(&mut self, core: &mut Core<V>, id: SbId) -> Result<()> {
        self.consume(id);
        if core.blocks[id].is_internal() {
            self.unmark_evictable(id);
            core.blocks[id].acquired += 1;
            return Ok(());
        }
        let block = self.obtain_buffer(core)?;
        core.attach_and_read(id, block)?;
        core.blocks[id].acquired = 1;
        Ok(())
    }

    fn release(&mut self, core: &mut Core<V>, id: SbId, dirty: bool) -> Result<()> {
        self.consume(id);
        let b = &mut core.blocks[id];
        if b.acquired == 0 {
            return Err(ExtError::PreconditionViolation(
                "release of a non-acquired block".into(),
            ));
        }
        b.dirty |= dirty;
        b.acquired -= 1;
        if b.acquired == 0 {
            if b.dirty || b.external.is_some() {
                self.mark_evictable(core, id);
            } else {
                let block = core.blocks[id].internal.take().expect("released block was internal");
                core.return_buffer(block);
            }
        }
        Ok(())
    }

    fn deinitialize(&mut self, core: &mut Core<V>, id: SbId) -> Result<()> {
        self.consume(id);
        if core.blocks[id].is_acquired() {
            return Err(ExtError::PreconditionViolation(
                "deinitialize of an acquired block".into(),
            ));
        }
        self.unmark_evictable(id);
        if let Some(block) = core.blocks[id].internal.take() {
            core.return_buffer(block);
        }
        core.blocks[id].dirty = false;
        core.free_external(id);
        Ok(())
    }

    fn initialize(&mut self, core: &mut Core<V>, id: SbId, bid: Bid) -> Result<()> {
        self.consume(id);
        if core.blocks[id].is_initialized() {
            return Err(ExtError::PreconditionViolation(
                "initialize of an initialized block".into(),
            ));
        }
        core.blocks[id].external = Some(bid);
        Ok(())
    }

    fn extract_external(&mut self, core: &mut Core<V>, id: SbId) -> Result<Bid> {
        self.consume(id);
        if core.blocks[id].is_acquired() {
            return Err(ExtError::PreconditionViolation(
                "extract_external_block of an acquired block".into(),
            ));
        }
        if !core.blocks[id].is_initialized() {
            return Ok(Bid::INVALID);
        }
        self.unmark_evictable(id);
        if core.blocks[id].is_internal() {
            if core.blocks[id].external.is_none() || core.blocks[id].dirty {
                core.blocks[id].dirty = true;
                core.clean(id)?;
            }
            let block = core.blocks[id].internal.take().expect("internal");
            core.return_buffer(block);
        }
        Ok(core.blocks[id].external.take().expect("initialized without buffer"))
    }

    fn evictable(&self) -> Vec<SbId> {
        self.fifo.ids()
    }

    fn adopt_evictable(&mut self, ids: Vec<SbId>) {
        for id in ids {
            self.fifo.push(id);
            let stamp = self.stamp(id);
            let next_use = self.peek_next_use(id);
            self.heap.push(LfdEntry {
                next_use,
                clean: true,
                has_external: true,
                id,
                stamp,
            });
        }
    }
}
