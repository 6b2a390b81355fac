//! Swappable-block scheduler.
//!
//! Virtualizes a logical block space larger than RAM: each swappable block
//! is resident, on-disk, or uninitialized, and unused buffers are evicted
//! according to a pluggable algorithm. The online-LRU algorithm does real
//! work; the simulation algorithm records a prediction sequence instead of
//! doing I/O; the offline-LFD algorithm replays such a sequence with
//! clairvoyant eviction and transparently falls back to LRU when the
//! sequence runs out.

mod lru;
mod offline_lfd;
mod simulation;

use std::sync::Arc;

pub use lru::OnlineLru;
pub use offline_lfd::OfflineLfd;
pub use simulation::Simulation;

use crate::error::{ExtError, Result};
use crate::storage::{AllocStrategy, Bid, Block, Pod, RawBuf};
use crate::Runtime;

pub type SbId = usize;

// ============================================================================
// Swappable block
// ============================================================================

/// One logical block. Four orthogonal state bits: internal buffer attached,
/// external BID assigned, dirty, acquired (reference count > 0).
pub struct SwappableBlock<V: Pod> {
    internal: Option<Block<V>>,
    external: Option<Bid>,
    dirty: bool,
    acquired: u32,
}

impl<V: Pod> SwappableBlock<V> {
    fn new() -> Self {
        Self {
            internal: None,
            external: None,
            dirty: false,
            acquired: 0,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.internal.is_some()
    }

    pub fn has_external(&self) -> bool {
        self.external.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired > 0
    }

    pub fn is_initialized(&self) -> bool {
        self.internal.is_some() || self.external.is_some()
    }

    pub fn is_evictable(&self) -> bool {
        self.internal.is_some() && self.acquired == 0
    }
}

// ============================================================================
// Operations and prediction sequences
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerOp {
    Acquire,
    Release,
    ReleaseDirty,
    Deinitialize,
    Initialize,
    ExtractExternal,
}

/// One recorded scheduler operation: `(op, block, logical time)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictionElement {
    pub op: SchedulerOp,
    pub id: SbId,
    pub time: u64,
}

pub type PredictionSequence = Vec<PredictionElement>;

// ============================================================================
// Core: blocks, buffers, I/O plumbing shared by all algorithms
// ============================================================================

pub(crate) struct Core<V: Pod> {
    rt: Arc<Runtime>,
    strategy: Arc<dyn AllocStrategy>,
    raw_size: usize,
    max_internal: usize,
    allocated_buffers: usize,
    free_bufs: Vec<RawBuf>,
    blocks: Vec<SwappableBlock<V>>,
    free_ids: Vec<SbId>,
    /// Shared dummy buffer handed out by the simulation algorithm.
    scratch: Option<Block<V>>,
}

impl<V: Pod> Core<V> {
    fn block(&self, id: SbId) -> &SwappableBlock<V> {
        &self.blocks[id]
    }

    fn block_mut(&mut self, id: SbId) -> &mut SwappableBlock<V> {
        &mut self.blocks[id]
    }

    /// A detached buffer, newly allocated while under the RAM cap.
    pub(crate) fn get_free_buffer(&mut self) -> Option<Block<V>> {
        if let Some(raw) = self.free_bufs.pop() {
            return Some(Block::from_raw(raw));
        }
        if self.allocated_buffers < self.max_internal {
            self.allocated_buffers += 1;
            return Some(Block::new(self.raw_size));
        }
        None
    }

    pub(crate) fn return_buffer(&mut self, block: Block<V>) {
        self.free_bufs.push(block.into_raw());
    }

    /// Ensure `id` has an external BID and its buffer contents are on disk;
    /// clears the dirty bit. The buffer stays attached.
    pub(crate) fn clean(&mut self, id: SbId) -> Result<()> {
        if !self.blocks[id].dirty {
            return Ok(());
        }
        let bid = match self.blocks[id].external {
            Some(bid) => bid,
            None => {
                let bid = self
                    .rt
                    .block_manager()
                    .new_block(self.strategy.as_ref(), self.raw_size)?;
                self.blocks[id].external = Some(bid);
                bid
            }
        };
        let block = self.blocks[id].internal.take().expect("dirty implies internal");
        let raw = self.rt.disks().write_sync(bid, block.into_raw())?;
        self.blocks[id].internal = Some(Block::from_raw(raw));
        self.blocks[id].dirty = false;
        Ok(())
    }

    /// Detach `id`'s buffer after cleaning it, returning it to the free
    /// list. The block ends up external or uninitialized.
    pub(crate) fn evict(&mut self, id: SbId) -> Result<()> {
        debug_assert!(self.blocks[id].is_evictable());
        self.clean(id)?;
        let block = self.blocks[id].internal.take().expect("evictable implies internal");
        self.free_bufs.push(block.into_raw());
        Ok(())
    }

    /// Attach a buffer to `id` and fill it from its external BID if any.
    pub(crate) fn attach_and_read(&mut self, id: SbId, block: Block<V>) -> Result<()> {
        match self.blocks[id].external {
            Some(bid) => {
                let raw = self.rt.disks().read_sync(bid, block.into_raw())?;
                self.blocks[id].internal = Some(Block::from_raw(raw));
            }
            None => {
                // Fresh logical block: default contents.
                let mut raw = block.into_raw();
                raw.as_mut_slice().fill(0);
                self.blocks[id].internal = Some(Block::from_raw(raw));
            }
        }
        Ok(())
    }

    /// Drop `id`'s external BID, returning the extent to the block manager.
    pub(crate) fn free_external(&mut self, id: SbId) {
        if let Some(bid) = self.blocks[id].external.take() {
            self.rt.block_manager().delete_block(bid, self.raw_size);
        }
    }
}

// ============================================================================
// Algorithm trait
// ============================================================================

pub(crate) trait Algorithm<V: Pod>: Send {
    fn acquire(&mut self, core: &mut Core<V>, id: SbId) -> Result<()>;

    fn release(&mut self, core: &mut Core<V>, id: SbId, dirty: bool) -> Result<()>;

    fn deinitialize(&mut self, core: &mut Core<V>, id: SbId) -> Result<()>;

    fn initialize(&mut self, core: &mut Core<V>, id: SbId, bid: Bid) -> Result<()>;

    fn extract_external(&mut self, core: &mut Core<V>, id: SbId) -> Result<Bid>;

    fn explicit_timestep(&mut self) {}

    /// Currently evictable ids, handed over on algorithm switch.
    fn evictable(&self) -> Vec<SbId>;

    /// Seed the evictable set (used on algorithm switch).
    fn adopt_evictable(&mut self, ids: Vec<SbId>);

    fn is_simulating(&self) -> bool {
        false
    }

    fn prediction_sequence(&self) -> Option<&PredictionSequence> {
        None
    }
}

/// Which eviction algorithm a [`BlockScheduler`] runs.
pub enum AlgorithmKind {
    OnlineLru,
    Simulation,
    OfflineLfd(PredictionSequence),
}

fn make_algorithm<V: Pod>(kind: AlgorithmKind) -> Box<dyn Algorithm<V>> {
    match kind {
        AlgorithmKind::OnlineLru => Box::new(OnlineLru::new()),
        AlgorithmKind::Simulation => Box::new(Simulation::new()),
        AlgorithmKind::OfflineLfd(seq) => Box::new(OfflineLfd::new(seq)),
    }
}

// ============================================================================
// BlockScheduler
// ============================================================================

/// Holds a population of logical blocks and bounds their resident buffers.
pub struct BlockScheduler<V: Pod> {
    core: Core<V>,
    algo: Box<dyn Algorithm<V>>,
}

impl<V: Pod> BlockScheduler<V> {
    /// `max_internal_memory` bounds the resident buffers in bytes.
    pub fn new(
        rt: Arc<Runtime>,
        raw_size: usize,
        max_internal_memory: usize,
        strategy: Arc<dyn AllocStrategy>,
        kind: AlgorithmKind,
    ) -> Result<Self> {
        let max_internal = max_internal_memory / raw_size;
        if max_internal == 0 {
            return Err(ExtError::Config(
                "scheduler memory budget smaller than one block".into(),
            ));
        }
        Ok(Self {
            core: Core {
                rt,
                strategy,
                raw_size,
                max_internal,
                allocated_buffers: 0,
                free_bufs: Vec::new(),
                blocks: Vec::new(),
                free_ids: Vec::new(),
                scratch: None,
            },
            algo: make_algorithm(kind),
        })
    }

    pub fn allocate_swappable_block(&mut self) -> SbId {
        match self.core.free_ids.pop() {
            Some(id) => id,
            None => {
                self.core.blocks.push(SwappableBlock::new());
                self.core.blocks.len() - 1
            }
        }
    }

    /// Deinitializes the block and recycles its id.
    pub fn free_swappable_block(&mut self, id: SbId) -> Result<()> {
        self.deinitialize(id)?;
        self.core.free_ids.push(id);
        Ok(())
    }

    /// Pin `id` and return its buffer, evicting another block if needed.
    /// Fails with `OutOfMemory` when every resident block is pinned.
    pub fn acquire(&mut self, id: SbId) -> Result<&mut Block<V>> {
        self.algo.acquire(&mut self.core, id)?;
        if self.algo.is_simulating() {
            if self.core.scratch.is_none() {
                self.core.scratch = Some(Block::new(self.core.raw_size));
            }
            return Ok(self.core.scratch.as_mut().expect("just set"));
        }
        Ok(self
            .core
            .blocks[id]
            .internal
            .as_mut()
            .expect("acquire attached a buffer"))
    }

    pub fn release(&mut self, id: SbId, dirty: bool) -> Result<()> {
        self.algo.release(&mut self.core, id, dirty)
    }

    /// Frees both the buffer and the external BID; the block becomes
    /// uninitialized. Fails on an acquired block.
    pub fn deinitialize(&mut self, id: SbId) -> Result<()> {
        self.algo.deinitialize(&mut self.core, id)
    }

    /// Bind an uninitialized block to existing external data.
    pub fn initialize(&mut self, id: SbId, bid: Bid) -> Result<()> {
        self.algo.initialize(&mut self.core, id, bid)
    }

    /// Take the block's external BID, writing back first if dirty. Returns
    /// an invalid BID for an uninitialized block; ownership of the extent
    /// passes to the caller.
    pub fn extract_external_block(&mut self, id: SbId) -> Result<Bid> {
        self.algo.extract_external(&mut self.core, id)
    }

    pub fn is_initialized(&self, id: SbId) -> bool {
        self.core.block(id).is_initialized()
    }

    /// In simulation mode, marks a boundary between a release and the next
    /// acquire.
    pub fn explicit_timestep(&mut self) {
        self.algo.explicit_timestep();
    }

    pub fn is_simulating(&self) -> bool {
        self.algo.is_simulating()
    }

    pub fn prediction_sequence(&self) -> Option<&PredictionSequence> {
        self.algo.prediction_sequence()
    }

    /// Swap the eviction algorithm at runtime, preserving the currently
    /// evictable set.
    pub fn switch_algorithm_to(&mut self, kind: AlgorithmKind) {
        let evictable = self.algo.evictable();
        let mut next = make_algorithm(kind);
        next.adopt_evictable(evictable);
        self.algo = next;
    }

    pub fn evictable_len(&self) -> usize {
        self.algo.evictable().len()
    }

    pub fn resident_len(&self) -> usize {
        self.core.blocks.iter().filter(|b| b.is_internal()).count()
    }

    pub fn num_swappable_blocks(&self) -> usize {
        self.core.blocks.len() - self.core.free_ids.len()
    }
}

impl<V: Pod> Drop for BlockScheduler<V> {
    fn drop(&mut self) {
        // Residual external extents go back to the block manager.
        for id in 0..self.core.blocks.len() {
            if self.core.blocks[id].is_acquired() {
                tracing::warn!(id, "dropping scheduler with an acquired block");
            }
            self.core.free_external(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Striping;
    use crate::test_util::runtime;

    fn scheduler(rt: Arc<Runtime>, buffers: usize) -> BlockScheduler<u64> {
        BlockScheduler::new(
            rt,
            4096,
            buffers * 4096,
            Arc::new(Striping),
            AlgorithmKind::OnlineLru,
        )
        .unwrap()
    }

    #[test]
    fn data_survives_eviction() {
        let (_dir, rt) = runtime(1, 1 << 22);
        let mut sched = scheduler(rt, 2);
        let ids: Vec<SbId> = (0..4).map(|_| sched.allocate_swappable_block()).collect();

        for (i, &id) in ids.iter().enumerate() {
            let block = sched.acquire(id).unwrap();
            block.as_mut_slice()[0] = i as u64 + 100;
            sched.release(id, true).unwrap();
        }
        // Only 2 buffers exist, so at least 2 of the 4 blocks went to disk.
        for (i, &id) in ids.iter().enumerate() {
            let block = sched.acquire(id).unwrap();
            assert_eq!(block.as_slice()[0], i as u64 + 100);
            sched.release(id, false).unwrap();
        }
    }

    #[test]
    fn acquire_fails_when_all_pinned() {
        let (_dir, rt) = runtime(1, 1 << 22);
        let mut sched = scheduler(rt, 2);
        let a = sched.allocate_swappable_block();
        let b = sched.allocate_swappable_block();
        let c = sched.allocate_swappable_block();
        sched.acquire(a).unwrap();
        sched.acquire(b).unwrap();
        assert!(matches!(
            sched.acquire(c),
            Err(ExtError::OutOfMemory(_))
        ));
        sched.release(a, false).unwrap();
        sched.acquire(c).unwrap();
    }

    #[test]
    fn extract_external_round_trip() {
        let (_dir, rt) = runtime(1, 1 << 22);
        let mut sched = scheduler(Arc::clone(&rt), 2);
        let a = sched.allocate_swappable_block();
        let block = sched.acquire(a).unwrap();
        block.as_mut_slice()[5] = 777;
        sched.release(a, true).unwrap();

        let bid = sched.extract_external_block(a).unwrap();
        assert!(bid.valid());
        assert!(!sched.is_initialized(a));

        let b = sched.allocate_swappable_block();
        sched.initialize(b, bid).unwrap();
        let block = sched.acquire(b).unwrap();
        assert_eq!(block.as_slice()[5], 777);
        sched.release(b, false).unwrap();
    }

    #[test]
    fn extract_uninitialized_yields_invalid_bid() {
        let (_dir, rt) = runtime(1, 1 << 22);
        let mut sched = scheduler(rt, 2);
        let a = sched.allocate_swappable_block();
        let bid = sched.extract_external_block(a).unwrap();
        assert!(!bid.valid());
    }

    #[test]
    fn simulation_then_lfd_replay() {
        let (_dir, rt) = runtime(1, 1 << 22);
        let mut sim = BlockScheduler::<u64>::new(
            Arc::clone(&rt),
            4096,
            2 * 4096,
            Arc::new(Striping),
            AlgorithmKind::Simulation,
        )
        .unwrap();
        let ids: Vec<SbId> = (0..3).map(|_| sim.allocate_swappable_block()).collect();
        for &id in &ids {
            sim.acquire(id).unwrap();
            sim.release(id, true).unwrap();
        }
        for &id in &ids {
            sim.acquire(id).unwrap();
            sim.release(id, false).unwrap();
        }
        let seq = sim.prediction_sequence().unwrap().clone();
        assert_eq!(seq.len(), 12);

        // Replay the same access pattern under clairvoyant eviction.
        let mut lfd = BlockScheduler::<u64>::new(
            rt,
            4096,
            2 * 4096,
            Arc::new(Striping),
            AlgorithmKind::OfflineLfd(seq),
        )
        .unwrap();
        let ids: Vec<SbId> = (0..3).map(|_| lfd.allocate_swappable_block()).collect();
        for (i, &id) in ids.iter().enumerate() {
            let b = lfd.acquire(id).unwrap();
            b.as_mut_slice()[0] = i as u64;
            lfd.release(id, true).unwrap();
        }
        for (i, &id) in ids.iter().enumerate() {
            let b = lfd.acquire(id).unwrap();
            assert_eq!(b.as_slice()[0], i as u64);
            lfd.release(id, false).unwrap();
        }
    }

    #[test]
    fn switch_algorithm_preserves_evictable_set() {
        let (_dir, rt) = runtime(1, 1 << 22);
        let mut sched = scheduler(rt, 2);
        let a = sched.allocate_swappable_block();
        let block = sched.acquire(a).unwrap();
        block.as_mut_slice()[1] = 9;
        sched.release(a, true).unwrap();
        assert_eq!(sched.evictable_len(), 1);

        sched.switch_algorithm_to(AlgorithmKind::OnlineLru);
        assert_eq!(sched.evictable_len(), 1);
        let block = sched.acquire(a).unwrap();
        assert_eq!(block.as_slice()[1], 9);
        sched.release(a, false).unwrap();
    }
}
