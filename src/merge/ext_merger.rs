//! External k-way merger.
//!
//! Each source is a sorted sequence stored as a list of blocks on disk with
//! a single resident head block. Crossing a block boundary pops the next
//! BID, prefetches the one after it, reads the popped block through the
//! pool and immediately returns the consumed extent to the block manager.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::common::ValueOrder;
use crate::error::Result;
use crate::merge::LoserTree;
use crate::pool::ReadWritePool;
use crate::storage::{AllocStrategy, Bid, Block, Pod};
use crate::Runtime;

struct Entry<V> {
    index: usize,
    key: V,
}

struct ExtSeq<V: Pod> {
    /// Resident head block; `None` marks a free slot.
    block: Option<Block<V>>,
    pos: usize,
    /// Valid elements in the head block.
    cur_valid: usize,
    bids: VecDeque<Bid>,
    /// Elements still on disk (excluding the head block).
    rest: usize,
}

impl<V: Pod> ExtSeq<V> {
    fn free() -> Self {
        Self {
            block: None,
            pos: 0,
            cur_valid: 0,
            bids: VecDeque::new(),
            rest: 0,
        }
    }

    fn exhausted(&self) -> bool {
        self.block.is_none()
    }
}

pub struct ExtMerger<V: Pod, C: ValueOrder<V>> {
    rt: Arc<Runtime>,
    cmp: C,
    sentinel: V,
    raw_size: usize,
    block_cap: usize,
    k: usize,
    max_arity: usize,
    entries: Vec<Entry<V>>,
    seqs: Vec<ExtSeq<V>>,
    free_slots: Vec<usize>,
    size: usize,
    pool: Arc<Mutex<ReadWritePool>>,
    strategy: Arc<dyn AllocStrategy>,
}

impl<V: Pod, C: ValueOrder<V>> ExtMerger<V, C> {
    pub fn new(
        rt: Arc<Runtime>,
        cmp: C,
        raw_size: usize,
        max_arity: usize,
        pool: Arc<Mutex<ReadWritePool>>,
        strategy: Arc<dyn AllocStrategy>,
    ) -> Self {
        assert!(max_arity >= 2 && max_arity.is_power_of_two());
        let sentinel = cmp.max_value();
        let block_cap = Block::<V>::capacity_for(raw_size);
        assert!(block_cap > 0);
        Self {
            rt,
            sentinel,
            cmp,
            raw_size,
            block_cap,
            k: 1,
            max_arity,
            entries: vec![Entry {
                index: 0,
                key: sentinel,
            }],
            seqs: vec![ExtSeq::free()],
            free_slots: vec![0],
            size: 0,
            pool,
            strategy,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn space_available(&self) -> bool {
        !self.free_slots.is_empty() || self.k < self.max_arity
    }

    #[inline]
    fn current(&self, i: usize) -> V {
        match &self.seqs[i].block {
            Some(block) => block.as_slice()[self.seqs[i].pos],
            None => self.sentinel,
        }
    }

    #[inline]
    fn wins(&self, a_key: &V, a_idx: usize, b_key: &V, b_idx: usize) -> bool {
        if self.cmp.less(a_key, b_key) {
            return true;
        }
        if self.cmp.less(b_key, a_key) {
            return false;
        }
        a_idx < b_idx
    }

    fn init_winner(&mut self, root: usize) -> usize {
        if root >= self.k {
            return root - self.k;
        }
        let left = self.init_winner(2 * root);
        let right = self.init_winner(2 * root + 1);
        let lk = self.current(left);
        let rk = self.current(right);
        if self.wins(&lk, left, &rk, right) {
            self.entries[root] = Entry {
                index: right,
                key: rk,
            };
            left
        } else {
            self.entries[root] = Entry {
                index: left,
                key: lk,
            };
            right
        }
    }

    fn rebuild(&mut self) {
        let winner = self.init_winner(1);
        self.entries[0] = Entry {
            index: winner,
            key: self.current(winner),
        };
    }

    fn grow(&mut self) {
        if self.k >= self.max_arity {
            // Only the deepest level runs past its configured arity; the
            // level above it has nowhere left to cascade.
            tracing::warn!(
                arity = self.k,
                max = self.max_arity,
                "external merger growing beyond configured arity"
            );
        }
        let new_k = self.k * 2;
        for slot in self.k..new_k {
            self.seqs.push(ExtSeq::free());
            self.free_slots.push(slot);
        }
        let sentinel = self.sentinel;
        self.entries.resize_with(new_k, || Entry {
            index: 0,
            key: sentinel,
        });
        self.k = new_k;
        self.rebuild();
    }

    fn replay(&mut self, leaf: usize) {
        let mut winner_idx = leaf;
        let mut winner_key = self.current(leaf);
        let mut node = (leaf + self.k) / 2;
        while node > 0 {
            if self.wins(&self.entries[node].key, self.entries[node].index, &winner_key, winner_idx)
            {
                std::mem::swap(&mut self.entries[node].index, &mut winner_idx);
                std::mem::swap(&mut self.entries[node].key, &mut winner_key);
            }
            node /= 2;
        }
        self.entries[0] = Entry {
            index: winner_idx,
            key: winner_key,
        };
    }

    /// Advance source `i` past its current element, crossing block
    /// boundaries as needed.
    fn advance(&mut self, i: usize) -> Result<()> {
        let seq = &mut self.seqs[i];
        seq.pos += 1;
        if seq.pos < seq.cur_valid {
            return Ok(());
        }
        match seq.bids.pop_front() {
            None => {
                // Source exhausted: drop the head buffer, free the slot.
                seq.block = None;
                self.free_slots.push(i);
                trace!(slot = i, "external merge source exhausted");
            }
            Some(next_bid) => {
                let follow = seq.bids.front().copied();
                let block = seq.block.take().expect("advancing a live source");
                let mut pool = self.pool.lock();
                if let Some(follow) = follow {
                    pool.hint(follow);
                }
                let raw = pool.read(next_bid, block.into_raw())?;
                drop(pool);
                let seq = &mut self.seqs[i];
                seq.block = Some(Block::from_raw(raw));
                seq.pos = 0;
                seq.cur_valid = seq.rest.min(self.block_cap);
                seq.rest -= seq.cur_valid;
                // The extent is consumed the moment its data is resident.
                self.rt.block_manager().delete_block(next_bid, self.raw_size);
            }
        }
        Ok(())
    }

    /// Merge the `out.len()` smallest elements into `out`.
    pub fn multi_merge(&mut self, out: &mut [V]) -> Result<()> {
        debug_assert!(out.len() <= self.size);
        for slot in out.iter_mut() {
            let winner = self.entries[0].index;
            *slot = self.entries[0].key;
            self.advance(winner)?;
            self.replay(winner);
        }
        self.size -= out.len();
        Ok(())
    }

    /// Drain an internal merger into a newly written block sequence and
    /// attach it as one source.
    pub fn append_merger(&mut self, src: &mut LoserTree<V, C>, segment_size: usize) -> Result<()> {
        debug_assert!(segment_size <= src.len());
        self.append_with(segment_size, |out| {
            src.multi_merge(out);
            Ok(())
        })
    }

    /// Drain another external merger into this one (used when cascading a
    /// full level into the next).
    pub fn append_ext_merger(
        &mut self,
        src: &mut ExtMerger<V, C>,
        segment_size: usize,
    ) -> Result<()> {
        debug_assert!(segment_size <= src.len());
        self.append_with(segment_size, |out| src.multi_merge(out))
    }

    fn append_with(
        &mut self,
        segment_size: usize,
        mut fill: impl FnMut(&mut [V]) -> Result<()>,
    ) -> Result<()> {
        if segment_size == 0 {
            return Ok(());
        }
        let num_blocks = segment_size.div_ceil(self.block_cap);

        // Head block stays resident and never receives a BID.
        let head_valid = segment_size.min(self.block_cap);
        let mut head: Block<V> = Block::from_raw(self.pool.lock().steal()?);
        fill(&mut head.as_mut_slice()[..head_valid])?;

        let bids = if num_blocks > 1 {
            self.rt
                .block_manager()
                .new_blocks(self.strategy.as_ref(), self.raw_size, num_blocks - 1)?
        } else {
            Vec::new()
        };
        let mut written = head_valid;
        for &bid in &bids {
            let mut block = Block::<V>::from_raw(self.pool.lock().steal()?);
            let n = (segment_size - written).min(self.block_cap);
            fill(&mut block.as_mut_slice()[..n])?;
            written += n;
            self.pool.lock().write(block.into_raw(), bid)?;
        }
        debug_assert_eq!(written, segment_size);
        if let Some(&first) = bids.first() {
            self.pool.lock().hint(first);
        }

        while self.free_slots.is_empty() {
            self.grow();
        }
        let slot = self.free_slots.pop().expect("slot available");
        self.seqs[slot] = ExtSeq {
            block: Some(head),
            pos: 0,
            cur_valid: head_valid,
            bids: VecDeque::from(bids),
            rest: segment_size - head_valid,
        };
        self.size += segment_size;
        self.rebuild();
        Ok(())
    }
}

impl<V: Pod, C: ValueOrder<V>> Drop for ExtMerger<V, C> {
    fn drop(&mut self) {
        // Residual extents of unconsumed sources go back to the manager.
        // Hinted read-ahead for them must be joined first: the pool is
        // shared with other mergers and outlives this one.
        let mut pool = self.pool.lock();
        for seq in &self.seqs {
            for &bid in &seq.bids {
                let _ = pool.invalidate(bid);
                self.rt.block_manager().delete_block(bid, self.raw_size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DefaultOrder;
    use crate::storage::Striping;
    use crate::test_util::runtime;

    fn merger(rt: Arc<Runtime>) -> ExtMerger<u64, DefaultOrder<u64>> {
        let pool = Arc::new(Mutex::new(ReadWritePool::new(
            Arc::clone(&rt),
            4096,
            2,
            4,
        )));
        ExtMerger::new(
            rt,
            DefaultOrder::new(),
            4096,
            16,
            pool,
            Arc::new(Striping),
        )
    }

    #[test]
    fn multi_block_segments_merge_sorted() {
        let (_dir, rt) = runtime(2, 1 << 24);
        let mut ext = merger(Arc::clone(&rt));
        let mut int = LoserTree::new(DefaultOrder::<u64>::new(), 16);

        // Each segment spans several 512-element blocks.
        for lane in 0..3u64 {
            int.insert_array((0..2000).map(|i| lane + 3 * i).collect());
            let n = int.len();
            ext.append_merger(&mut int, n).unwrap();
        }
        assert_eq!(ext.len(), 6000);

        let mut out = vec![0u64; 6000];
        ext.multi_merge(&mut out).unwrap();
        assert_eq!(out, (0..6000).collect::<Vec<u64>>());
        assert!(ext.is_empty());
    }

    #[test]
    fn consumed_extents_are_reclaimed() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let before = rt.block_manager().current_allocation();
        {
            let mut ext = merger(Arc::clone(&rt));
            let mut int = LoserTree::new(DefaultOrder::<u64>::new(), 16);
            int.insert_array((0..5000).collect());
            ext.append_merger(&mut int, 5000).unwrap();
            let mut out = vec![0u64; 5000];
            ext.multi_merge(&mut out).unwrap();
        }
        assert_eq!(rt.block_manager().current_allocation(), before);
    }

    #[test]
    fn cascading_between_external_mergers() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let mut lower = merger(Arc::clone(&rt));
        let mut upper = merger(Arc::clone(&rt));
        let mut int = LoserTree::new(DefaultOrder::<u64>::new(), 16);

        int.insert_array((0..1500).map(|i| 2 * i).collect());
        lower.append_merger(&mut int, 1500).unwrap();
        int.insert_array((0..1500).map(|i| 2 * i + 1).collect());
        lower.append_merger(&mut int, 1500).unwrap();

        let n = lower.len();
        upper.append_ext_merger(&mut lower, n).unwrap();
        assert_eq!(upper.len(), 3000);

        let mut out = vec![0u64; 3000];
        upper.multi_merge(&mut out).unwrap();
        assert_eq!(out, (0..3000).collect::<Vec<u64>>());
    }
}
