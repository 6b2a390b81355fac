//! Online LRU eviction: the least-recently-released evictable block is the
//! victim.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::error::{ExtError, Result};
use crate::scheduler::{Algorithm, Core, SbId};
use crate::storage::{Bid, Pod};

/// Addressable FIFO of evictable ids: pushes at the back, pops at the
/// front, supports removal by id via lazy invalidation.
#[derive(Default)]
pub(crate) struct EvictableFifo {
    queue: VecDeque<SbId>,
    members: HashSet<SbId>,
}

impl EvictableFifo {
    pub(crate) fn push(&mut self, id: SbId) {
        if self.members.insert(id) {
            self.queue.push_back(id);
        }
    }

    pub(crate) fn remove(&mut self, id: SbId) -> bool {
        self.members.remove(&id)
    }

    pub(crate) fn contains(&self, id: SbId) -> bool {
        self.members.contains(&id)
    }

    pub(crate) fn pop(&mut self) -> Option<SbId> {
        while let Some(id) = self.queue.pop_front() {
            if self.members.remove(&id) {
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn ids(&self) -> Vec<SbId> {
        // The queue may hold stale duplicates from remove/re-push cycles;
        // report each member once, in queue order.
        let mut seen = HashSet::new();
        self.queue
            .iter()
            .copied()
            .filter(|id| self.members.contains(id) && seen.insert(*id))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }
}

pub struct OnlineLru {
    evictable: EvictableFifo,
}

impl OnlineLru {
    pub fn new() -> Self {
        Self {
            evictable: EvictableFifo::default(),
        }
    }
}

impl Default for OnlineLru {
    fn default() -> Self {
        Self::new()
    }
}

impl OnlineLru {
    /// A free buffer, by eviction if necessary.
    fn obtain_buffer<V: Pod>(
        &mut self,
        core: &mut Core<V>,
    ) -> Result<crate::storage::Block<V>> {
        if let Some(block) = core.get_free_buffer() {
            return Ok(block);
        }
        let victim = self.evictable.pop().ok_or_else(|| {
            ExtError::OutOfMemory("scheduler: every resident block is acquired".into())
        })?;
        debug!(victim, "evicting block");
        core.evict(victim)?;
        core.get_free_buffer().ok_or_else(|| {
            ExtError::OutOfMemory("scheduler: eviction yielded no buffer".into())
        })
    }
}

impl<V: Pod> Algorithm<V> for OnlineLru {
    fn acquire(&mut self, core: &mut Core<V>, id: SbId) -> Result<()> {
        if core.blocks[id].is_internal() {
            self.evictable.remove(id);
            core.blocks[id].acquired += 1;
            return Ok(());
        }
        let block = self.obtain_buffer(core)?;
        core.attach_and_read(id, block)?;
        core.blocks[id].acquired = 1;
        Ok(())
    }

    fn release(&mut self, core: &mut Core<V>, id: SbId, dirty: bool) -> Result<()> {
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
                self.evictable.push(id);
            } else {
                // Never written and not backed externally: the buffer holds
                // nothing worth keeping.
                let block = b.internal.take().expect("released block was internal");
                core.return_buffer(block);
            }
        }
        Ok(())
    }

    fn deinitialize(&mut self, core: &mut Core<V>, id: SbId) -> Result<()> {
        if core.blocks[id].is_acquired() {
            return Err(ExtError::PreconditionViolation(
                "deinitialize of an acquired block".into(),
            ));
        }
        self.evictable.remove(id);
        if let Some(block) = core.blocks[id].internal.take() {
            core.return_buffer(block);
        }
        core.blocks[id].dirty = false;
        core.free_external(id);
        Ok(())
    }

    fn initialize(&mut self, core: &mut Core<V>, id: SbId, bid: Bid) -> Result<()> {
        if core.blocks[id].is_initialized() {
            return Err(ExtError::PreconditionViolation(
                "initialize of an initialized block".into(),
            ));
        }
        core.blocks[id].external = Some(bid);
        Ok(())
    }

    fn extract_external(&mut self, core: &mut Core<V>, id: SbId) -> Result<Bid> {
        if core.blocks[id].is_acquired() {
            return Err(ExtError::PreconditionViolation(
                "extract_external_block of an acquired block".into(),
            ));
        }
        if !core.blocks[id].is_initialized() {
            return Ok(Bid::INVALID);
        }
        self.evictable.remove(id);
        if core.blocks[id].is_internal() {
            if core.blocks[id].external.is_none() || core.blocks[id].dirty {
                // Materialize on disk before handing the extent away.
                core.blocks[id].dirty = true;
                core.clean(id)?;
            }
            let block = core.blocks[id].internal.take().expect("internal");
            core.return_buffer(block);
        }
        Ok(core.blocks[id].external.take().expect("initialized without buffer"))
    }

    fn evictable(&self) -> Vec<SbId> {
        self.evictable.ids()
    }

    fn adopt_evictable(&mut self, ids: Vec<SbId>) {
        for id in ids {
            self.evictable.push(id);
        }
    }
}
