//! External stacks.
//!
//! Four variants with observably different prefetch timing:
//! [`NormalStack`] keeps two pages resident and writes a full page
//! asynchronously on overflow; [`GrowShrinkStack`] keeps one page and
//! hints the predecessor page when it reloads; [`GrowShrinkStack2`] is the
//! single-page variant over an externally supplied pool with a runtime
//! prefetch-aggressiveness knob; [`MigratingStack`] starts in memory and
//! migrates to an external variant past a threshold.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::pool::ReadWritePool;
use crate::storage::{Bid, Block, Pod, Striping};
use crate::Runtime;

#[derive(Debug, Clone)]
pub struct StackConfig {
    pub raw_block_size: usize,
    pub blocks_per_page: usize,
    pub prefetch_buffers: usize,
    pub write_buffers: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            raw_block_size: 64 * 1024,
            blocks_per_page: 4,
            prefetch_buffers: 4,
            write_buffers: 8,
        }
    }
}

// ============================================================================
// Shared page machinery
// ============================================================================

enum PoolRef {
    Owned(ReadWritePool),
    Shared(Arc<Mutex<ReadWritePool>>),
}

impl PoolRef {
    fn with<R>(&mut self, f: impl FnOnce(&mut ReadWritePool) -> R) -> R {
        match self {
            PoolRef::Owned(pool) => f(pool),
            PoolRef::Shared(pool) => f(&mut pool.lock()),
        }
    }
}

/// Writes and reads whole pages (groups of blocks) for the stack variants.
struct PageStore<V: Pod> {
    rt: Arc<Runtime>,
    raw_size: usize,
    block_cap: usize,
    blocks_per_page: usize,
    pool: PoolRef,
    /// One entry per written block; grows and shrinks like a stack of
    /// pages.
    bids: Vec<Bid>,
    _values: std::marker::PhantomData<V>,
}

impl<V: Pod> PageStore<V> {
    fn new(rt: Arc<Runtime>, cfg: &StackConfig, pool: PoolRef) -> Self {
        let block_cap = Block::<V>::capacity_for(cfg.raw_block_size);
        assert!(block_cap > 0);
        Self {
            rt,
            raw_size: cfg.raw_block_size,
            block_cap,
            blocks_per_page: cfg.blocks_per_page,
            pool,
            bids: Vec::new(),
            _values: std::marker::PhantomData,
        }
    }

    fn page_elems(&self) -> usize {
        self.block_cap * self.blocks_per_page
    }

    /// Queue an asynchronous write of one full page.
    fn write_page(&mut self, page: &[V]) -> Result<()> {
        debug_assert_eq!(page.len(), self.page_elems());
        let new_bids =
            self.rt
                .block_manager()
                .new_blocks(&Striping, self.raw_size, self.blocks_per_page)?;
        for (chunk, &bid) in page.chunks(self.block_cap).zip(&new_bids) {
            let raw = self.pool.with(|p| p.steal())?;
            let mut block = Block::<V>::from_raw(raw);
            block.as_mut_slice()[..chunk.len()].copy_from_slice(chunk);
            self.pool.with(|p| p.write(block.into_raw(), bid))?;
        }
        self.bids.extend(new_bids);
        Ok(())
    }

    /// Read back the most recently written page and release its extents.
    fn read_last_page(&mut self, out: &mut Vec<V>) -> Result<()> {
        debug_assert!(self.bids.len() >= self.blocks_per_page);
        let start = self.bids.len() - self.blocks_per_page;
        for &bid in &self.bids[start..] {
            let raw = self
                .pool
                .with(|p| p.read(bid, Block::<V>::new(self.raw_size).into_raw()))?;
            let block = Block::<V>::from_raw(raw);
            out.extend_from_slice(&block.as_slice()[..self.block_cap]);
        }
        let consumed: Vec<Bid> = self.bids.drain(start..).collect();
        self.rt.block_manager().delete_blocks(&consumed, self.raw_size);
        Ok(())
    }

    /// Hint the blocks of up to `pages` pages below the resident one.
    fn hint_predecessor_pages(&mut self, pages: usize) {
        let per_page = self.blocks_per_page;
        let total_pages = self.bids.len() / per_page;
        for p in 0..pages.min(total_pages) {
            let end = self.bids.len() - p * per_page;
            let hints: Vec<Bid> = self.bids[end - per_page..end].to_vec();
            for bid in hints {
                self.pool.with(|pool| pool.hint(bid));
            }
        }
    }

    fn pages_on_disk(&self) -> usize {
        self.bids.len() / self.blocks_per_page
    }
}

impl<V: Pod> Drop for PageStore<V> {
    fn drop(&mut self) {
        let _ = self.pool.with(|p| p.flush());
        self.rt.block_manager().delete_blocks(&self.bids, self.raw_size);
    }
}

// ============================================================================
// NormalStack
// ============================================================================

/// Two resident pages; a full front page is written out asynchronously on
/// overflow and the last page is read back synchronously on underflow.
pub struct NormalStack<V: Pod> {
    store: PageStore<V>,
    cache: Vec<V>,
    size: usize,
}

impl<V: Pod> NormalStack<V> {
    pub fn new(rt: Arc<Runtime>, cfg: StackConfig) -> Self {
        let pool = ReadWritePool::new(
            Arc::clone(&rt),
            cfg.raw_block_size,
            cfg.prefetch_buffers,
            cfg.write_buffers,
        );
        Self {
            store: PageStore::new(rt, &cfg, PoolRef::Owned(pool)),
            cache: Vec::new(),
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn top(&self) -> Option<&V> {
        self.cache.last()
    }

    pub fn push(&mut self, v: V) -> Result<()> {
        let page = self.store.page_elems();
        if self.cache.len() == 2 * page {
            let front: Vec<V> = self.cache.drain(..page).collect();
            self.store.write_page(&front)?;
        }
        self.cache.push(v);
        self.size += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Option<V>> {
        if self.cache.is_empty() {
            if self.size == 0 {
                return Ok(None);
            }
            self.store.read_last_page(&mut self.cache)?;
        }
        self.size -= 1;
        Ok(self.cache.pop())
    }
}

// ============================================================================
// GrowShrinkStack
// ============================================================================

/// Single resident page with asynchronous prefetching of the predecessor
/// page whenever a page is reloaded.
pub struct GrowShrinkStack<V: Pod> {
    store: PageStore<V>,
    cache: Vec<V>,
    size: usize,
}

impl<V: Pod> GrowShrinkStack<V> {
    pub fn new(rt: Arc<Runtime>, cfg: StackConfig) -> Self {
        let pool = ReadWritePool::new(
            Arc::clone(&rt),
            cfg.raw_block_size,
            cfg.prefetch_buffers,
            cfg.write_buffers,
        );
        Self {
            store: PageStore::new(rt, &cfg, PoolRef::Owned(pool)),
            cache: Vec::new(),
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn top(&self) -> Option<&V> {
        self.cache.last()
    }

    pub fn push(&mut self, v: V) -> Result<()> {
        let page = self.store.page_elems();
        if self.cache.len() == page {
            let full: Vec<V> = self.cache.drain(..).collect();
            self.store.write_page(&full)?;
        }
        self.cache.push(v);
        self.size += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Option<V>> {
        if self.cache.is_empty() {
            if self.size == 0 {
                return Ok(None);
            }
            self.store.read_last_page(&mut self.cache)?;
            // The page below the one just loaded will be needed next.
            self.store.hint_predecessor_pages(1);
        }
        self.size -= 1;
        Ok(self.cache.pop())
    }
}

// ============================================================================
// GrowShrinkStack2
// ============================================================================

/// Single-page stack over an externally supplied read-write pool, with a
/// runtime knob for how many predecessor pages to hint.
pub struct GrowShrinkStack2<V: Pod> {
    store: PageStore<V>,
    cache: Vec<V>,
    size: usize,
    aggressiveness: usize,
}

impl<V: Pod> GrowShrinkStack2<V> {
    pub fn new(rt: Arc<Runtime>, cfg: StackConfig, pool: Arc<Mutex<ReadWritePool>>) -> Self {
        Self {
            store: PageStore::new(rt, &cfg, PoolRef::Shared(pool)),
            cache: Vec::new(),
            size: 0,
            aggressiveness: 1,
        }
    }

    /// How many predecessor pages get prefetch hints on each page reload.
    pub fn set_prefetch_aggressiveness(&mut self, pages: usize) {
        self.aggressiveness = pages;
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn top(&self) -> Option<&V> {
        self.cache.last()
    }

    pub fn push(&mut self, v: V) -> Result<()> {
        let page = self.store.page_elems();
        if self.cache.len() == page {
            let full: Vec<V> = self.cache.drain(..).collect();
            self.store.write_page(&full)?;
        }
        self.cache.push(v);
        self.size += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Option<V>> {
        if self.cache.is_empty() {
            if self.size == 0 {
                return Ok(None);
            }
            self.store.read_last_page(&mut self.cache)?;
            self.store.hint_predecessor_pages(self.aggressiveness);
        }
        self.size -= 1;
        Ok(self.cache.pop())
    }
}

// ============================================================================
// MigratingStack
// ============================================================================

enum MigratingInner<V: Pod> {
    Internal(Vec<V>),
    External(GrowShrinkStack<V>),
}

/// Starts as a plain in-memory stack; once `threshold` elements are
/// reached, the contents move into an external stack and all further calls
/// are forwarded.
pub struct MigratingStack<V: Pod> {
    rt: Arc<Runtime>,
    cfg: StackConfig,
    threshold: usize,
    inner: MigratingInner<V>,
}

impl<V: Pod> MigratingStack<V> {
    pub fn new(rt: Arc<Runtime>, cfg: StackConfig, threshold: usize) -> Self {
        Self {
            rt,
            cfg,
            threshold,
            inner: MigratingInner::Internal(Vec::new()),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.inner, MigratingInner::External(_))
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            MigratingInner::Internal(v) => v.len(),
            MigratingInner::External(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, v: V) -> Result<()> {
        if let MigratingInner::Internal(vec) = &mut self.inner {
            if vec.len() < self.threshold {
                vec.push(v);
                return Ok(());
            }
            debug!(threshold = self.threshold, "stack migrating to external storage");
            let mut ext = GrowShrinkStack::new(Arc::clone(&self.rt), self.cfg.clone());
            for value in vec.drain(..) {
                ext.push(value)?;
            }
            self.inner = MigratingInner::External(ext);
        }
        match &mut self.inner {
            MigratingInner::External(s) => s.push(v),
            MigratingInner::Internal(_) => unreachable!("migrated above"),
        }
    }

    pub fn pop(&mut self) -> Result<Option<V>> {
        match &mut self.inner {
            MigratingInner::Internal(v) => Ok(v.pop()),
            MigratingInner::External(s) => s.pop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::runtime;

    fn cfg() -> StackConfig {
        StackConfig {
            raw_block_size: 4096,
            blocks_per_page: 2,
            prefetch_buffers: 2,
            write_buffers: 4,
        }
    }

    #[test]
    fn normal_stack_lifo_across_pages() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let mut s = NormalStack::new(rt, cfg());
        let n = 10_000u64;
        for v in 0..n {
            s.push(v).unwrap();
        }
        assert_eq!(s.len(), n as usize);
        for v in (0..n).rev() {
            assert_eq!(s.pop().unwrap(), Some(v));
        }
        assert_eq!(s.pop().unwrap(), None);
    }

    #[test]
    fn grow_shrink_stack_round_trip() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let mut s = GrowShrinkStack::new(rt, cfg());
        for v in 0..5000u64 {
            s.push(v).unwrap();
        }
        for v in (0..5000u64).rev() {
            assert_eq!(s.pop().unwrap(), Some(v), "at {v}");
        }
    }

    #[test]
    fn grow_shrink2_shares_a_pool() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let pool = Arc::new(Mutex::new(ReadWritePool::new(
            Arc::clone(&rt),
            4096,
            4,
            4,
        )));
        let mut a = GrowShrinkStack2::new(Arc::clone(&rt), cfg(), Arc::clone(&pool));
        let mut b = GrowShrinkStack2::new(Arc::clone(&rt), cfg(), pool);
        a.set_prefetch_aggressiveness(2);
        for v in 0..3000u64 {
            a.push(v).unwrap();
            b.push(v * 2).unwrap();
        }
        for v in (0..3000u64).rev() {
            assert_eq!(a.pop().unwrap(), Some(v));
            assert_eq!(b.pop().unwrap(), Some(v * 2));
        }
    }

    #[test]
    fn migrating_stack_spills_past_threshold() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let mut s = MigratingStack::new(rt, cfg(), 1000);
        for v in 0..999u64 {
            s.push(v).unwrap();
        }
        assert!(!s.is_external());
        for v in 999..5000u64 {
            s.push(v).unwrap();
        }
        assert!(s.is_external());
        for v in (0..5000u64).rev() {
            assert_eq!(s.pop().unwrap(), Some(v));
        }
    }

    #[test]
    fn dropping_a_stack_with_pending_lookahead_reclaims_everything() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let before = rt.block_manager().current_allocation();
        {
            let mut s = GrowShrinkStack::new(Arc::clone(&rt), cfg());
            // Three pages on disk, then one pop-underflow reload, which
            // hints the predecessor page.
            for v in 0..3 * 2 * 512 + 1u64 {
                s.push(v).unwrap();
            }
            for _ in 0..2 {
                s.pop().unwrap().unwrap();
            }
            // Dropped with the hint still outstanding.
        }
        assert_eq!(rt.block_manager().current_allocation(), before);
    }

    #[test]
    fn interleaved_push_pop_crossing_page_boundary() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let mut s = GrowShrinkStack::new(rt, cfg());
        let page = 2 * 512; // blocks_per_page * values per 4 KiB block
        for v in 0..page as u64 + 1 {
            s.push(v).unwrap();
        }
        // Oscillate across the page boundary.
        for _ in 0..10 {
            assert_eq!(s.pop().unwrap(), Some(page as u64));
            s.push(page as u64).unwrap();
        }
        for v in (0..=page as u64).rev() {
            assert_eq!(s.pop().unwrap(), Some(v));
        }
    }
}
