//! Immutable sorted runs on disk with a prefetched resident prefix.
//!
//! Lifecycle: a write phase streaming ascending values through a write
//! pool, a transition (`finish_write_phase`) that sizes the prefetch window
//! and hints the first blocks, and a consumption phase where `remove`
//! advances the read cursor, deletes exhausted extents and keeps the
//! resident prefix topped up one block per crossed boundary.

use std::sync::Arc;

use tracing::debug;

use crate::error::{ExtError, Result};
use crate::io::Request;
use crate::pool::WritePool;
use crate::storage::{Bid, Block, Pod, RandomCyclic};
use crate::Runtime;

pub(crate) struct ExternalArray<V: Pod> {
    rt: Arc<Runtime>,
    raw_size: usize,
    block_cap: usize,
    /// Maximum elements; fixed at construction.
    capacity: usize,
    num_blocks: usize,
    num_prefetch: usize,

    /// `bids[0]` stays invalid: the head block is born resident and never
    /// written.
    bids: Vec<Bid>,
    blocks: Vec<Option<Block<V>>>,
    requests: Vec<Option<Request>>,
    /// Last element of each block, finalized by `finish_write_phase`.
    maxima: Vec<V>,

    write_phase: bool,
    write_pool: Option<WritePool>,
    /// Elements written so far (write phase) / total elements (read phase).
    total: usize,

    /// Read cursor, in elements from the start of the run.
    index: usize,
    /// First element index beyond the requested prefix.
    end_index: usize,
    /// Next block to request; the hint cursor.
    hint_block: usize,
}

impl<V: Pod> ExternalArray<V> {
    pub fn new(
        rt: Arc<Runtime>,
        raw_size: usize,
        capacity: usize,
        num_prefetch: usize,
        num_write_buffers: usize,
    ) -> Result<Self> {
        assert!(capacity > 0);
        let block_cap = Block::<V>::capacity_for(raw_size);
        assert!(block_cap > 0);
        let num_blocks = capacity.div_ceil(block_cap);
        let mut bids = vec![Bid::INVALID; num_blocks];
        if num_blocks > 1 {
            rt.block_manager().new_blocks_into(
                &RandomCyclic::new(),
                raw_size,
                &mut bids[1..],
            )?;
        }
        let mut blocks: Vec<Option<Block<V>>> = (0..num_blocks).map(|_| None).collect();
        blocks[0] = Some(Block::new(raw_size));
        let write_pool = WritePool::new(Arc::clone(&rt), raw_size, num_write_buffers.max(1));
        Ok(Self {
            rt,
            raw_size,
            block_cap,
            capacity,
            num_blocks,
            num_prefetch: num_prefetch.clamp(1, num_blocks),
            bids,
            blocks,
            requests: (0..num_blocks).map(|_| None).collect(),
            maxima: Vec::new(),
            write_phase: true,
            write_pool: Some(write_pool),
            total: 0,
            index: 0,
            end_index: 0,
            hint_block: 1,
        })
    }

    pub fn len(&self) -> usize {
        self.total - self.index
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Write phase
    // ------------------------------------------------------------------

    /// Append the next (ascending) value.
    pub fn push_back(&mut self, value: V) -> Result<()> {
        debug_assert!(self.write_phase);
        debug_assert!(self.total < self.capacity);
        let b = self.total / self.block_cap;
        let pos = self.total % self.block_cap;
        if self.blocks[b].is_none() {
            let raw = self
                .write_pool
                .as_mut()
                .expect("write phase")
                .steal()?;
            self.blocks[b] = Some(Block::from_raw(raw));
        }
        self.blocks[b].as_mut().expect("just attached").as_mut_slice()[pos] = value;
        self.total += 1;
        if pos + 1 == self.block_cap {
            self.seal_block(b)?;
        }
        Ok(())
    }

    /// Finish block `b`: record its maximum and queue its write (the head
    /// block stays resident).
    fn seal_block(&mut self, b: usize) -> Result<()> {
        let block = self.blocks[b].as_ref().expect("sealing a resident block");
        let valid = self.valid_in_block(b);
        debug_assert!(valid > 0);
        let max = block.as_slice()[valid - 1];
        if self.maxima.len() <= b {
            self.maxima.resize(b + 1, max);
        }
        self.maxima[b] = max;
        if b > 0 {
            let block = self.blocks[b].take().expect("resident");
            self.write_pool
                .as_mut()
                .expect("write phase")
                .write(block.into_raw(), self.bids[b])?;
        }
        Ok(())
    }

    fn valid_in_block(&self, b: usize) -> usize {
        let start = b * self.block_cap;
        debug_assert!(start < self.total);
        (self.total - start).min(self.block_cap)
    }

    /// Transition to the read phase: flush pending writes, finalize the
    /// maxima table, release unused extents and hint the first prefetch
    /// blocks.
    pub fn finish_write_phase(&mut self) -> Result<()> {
        debug_assert!(self.write_phase);
        let last = if self.total == 0 {
            0
        } else {
            (self.total - 1) / self.block_cap
        };
        if self.total > 0 && self.total % self.block_cap != 0 {
            self.seal_block(last)?;
        }
        if let Some(mut pool) = self.write_pool.take() {
            pool.flush()?;
        }
        // A shorter-than-capacity run frees the tail extents right away.
        for b in last + 1..self.num_blocks {
            self.rt.block_manager().delete_block(self.bids[b], self.raw_size);
            self.bids[b] = Bid::INVALID;
        }
        self.num_blocks = if self.total == 0 { 0 } else { last + 1 };
        self.write_phase = false;
        self.end_index = self.total.min(self.block_cap);
        self.hint_block = 1;
        for _ in 0..self.num_prefetch {
            self.request_further_block();
        }
        debug!(
            total = self.total,
            blocks = self.num_blocks,
            prefetch = self.num_prefetch,
            "external array entered read phase"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read phase
    // ------------------------------------------------------------------

    /// Issue the asynchronous read of the next unrequested block and extend
    /// the requested prefix.
    pub fn request_further_block(&mut self) {
        let b = self.hint_block;
        if b >= self.num_blocks {
            return;
        }
        let buf = Block::<V>::new(self.raw_size).into_raw();
        self.requests[b] = Some(self.rt.disks().read(self.bids[b], buf));
        self.hint_block = b + 1;
        self.end_index = self.total.min((b + 1) * self.block_cap);
    }

    /// Join all outstanding reads of the requested prefix.
    pub fn wait(&mut self) -> Result<()> {
        let first = self.index / self.block_cap;
        for b in first..self.hint_block.min(self.num_blocks) {
            if let Some(req) = self.requests[b].take() {
                match req.wait() {
                    Ok(raw) => self.blocks[b] = Some(Block::from_raw(raw)),
                    Err(e) => {
                        // Leave the slot empty; the array is unusable past
                        // this point and the caller decides whether to
                        // discard it.
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// First unconsumed element. Requires a completed [`wait`](Self::wait).
    pub fn first(&self) -> V {
        debug_assert!(!self.is_empty());
        let b = self.index / self.block_cap;
        self.blocks[b].as_ref().expect("head block resident").as_slice()
            [self.index % self.block_cap]
    }

    /// Number of elements in the requested prefix.
    pub fn prefix_len(&self) -> usize {
        self.end_index - self.index
    }

    /// Whether the whole remainder of the run is requested.
    pub fn fully_requested(&self) -> bool {
        self.end_index == self.total
    }

    /// Largest element of the requested prefix.
    pub fn prefix_max(&self) -> V {
        debug_assert!(self.end_index > self.index);
        self.maxima[(self.end_index - 1) / self.block_cap]
    }

    /// The resident prefix as consecutive slices (one per block).
    pub fn prefix_slices(&self) -> Vec<&[V]> {
        let mut out = Vec::new();
        if self.is_empty() || self.end_index == self.index {
            return out;
        }
        let first = self.index / self.block_cap;
        let last = (self.end_index - 1) / self.block_cap;
        for b in first..=last {
            let block = match &self.blocks[b] {
                Some(block) => block,
                None => break,
            };
            let lo = if b == first {
                self.index % self.block_cap
            } else {
                0
            };
            let hi = ((self.end_index - b * self.block_cap).min(self.block_cap))
                .min(self.valid_in_block(b));
            if lo < hi {
                out.push(&block.as_slice()[lo..hi]);
            }
        }
        out
    }

    /// Advance the read cursor by `n` elements of the requested prefix,
    /// deleting exhausted extents and requesting one further block per
    /// crossed boundary.
    pub fn remove(&mut self, n: usize) -> Result<()> {
        debug_assert!(n <= self.prefix_len());
        let old_block = self.index / self.block_cap;
        self.index += n;
        let new_block = if self.index == self.total {
            self.num_blocks
        } else {
            self.index / self.block_cap
        };
        for b in old_block..new_block.min(self.num_blocks) {
            self.blocks[b] = None;
            if let Some(req) = self.requests[b].take() {
                // An unread block being skipped entirely: drain the request.
                let _ = req.wait();
            }
            if b > 0 {
                self.rt.block_manager().delete_block(self.bids[b], self.raw_size);
                self.bids[b] = Bid::INVALID;
            }
            self.request_further_block();
        }
        if self.index < self.total {
            // The new head block must be resident before the next access;
            // deeper prefetch reads stay in flight.
            self.wait_head()?;
        }
        Ok(())
    }

    /// Join only the read of the current head block.
    fn wait_head(&mut self) -> Result<()> {
        let b = self.index / self.block_cap;
        if let Some(req) = self.requests[b].take() {
            let raw = req.wait()?;
            self.blocks[b] = Some(Block::from_raw(raw));
        }
        Ok(())
    }

    /// BID of the first still-allocated extent, for error reporting.
    pub fn first_bid(&self) -> Bid {
        self.bids.iter().copied().find(|b| b.valid()).unwrap_or(Bid::INVALID)
    }
}

impl<V: Pod> Drop for ExternalArray<V> {
    fn drop(&mut self) {
        // An array abandoned mid-write still has queued writes; they must
        // land before the extents are handed back.
        if let Some(mut pool) = self.write_pool.take() {
            let _ = pool.flush();
        }
        for b in 0..self.num_blocks {
            if let Some(req) = self.requests[b].take() {
                let _ = req.wait();
            }
            self.rt.block_manager().delete_block(self.bids[b], self.raw_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::runtime;

    #[test]
    fn write_then_stream_out() {
        let (_dir, rt) = runtime(2, 1 << 24);
        // 512 u64 per 4 KiB block; 5000 elements span 10 blocks.
        let mut ea = ExternalArray::<u64>::new(Arc::clone(&rt), 4096, 5000, 2, 2).unwrap();
        for v in 0..5000u64 {
            ea.push_back(v).unwrap();
        }
        ea.finish_write_phase().unwrap();
        ea.wait().unwrap();

        let mut got = Vec::new();
        while !ea.is_empty() {
            got.push(ea.first());
            ea.remove(1).unwrap();
        }
        assert_eq!(got, (0..5000).collect::<Vec<u64>>());
    }

    #[test]
    fn prefix_is_contiguous_after_wait() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let mut ea = ExternalArray::<u64>::new(Arc::clone(&rt), 4096, 3000, 3, 2).unwrap();
        for v in 0..3000u64 {
            ea.push_back(v * 2).unwrap();
        }
        ea.finish_write_phase().unwrap();
        ea.wait().unwrap();

        let slices = ea.prefix_slices();
        let flat: Vec<u64> = slices.iter().flat_map(|s| s.iter().copied()).collect();
        assert_eq!(flat.len(), ea.prefix_len());
        assert!(flat.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ea.prefix_max(), *flat.last().unwrap());

        ea.remove(1500).unwrap();
        assert_eq!(ea.first(), 3000);
        assert_eq!(ea.len(), 1500);
    }

    #[test]
    fn short_run_releases_tail_extents() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let before = rt.block_manager().current_allocation();
        let mut ea = ExternalArray::<u64>::new(Arc::clone(&rt), 4096, 10_000, 2, 2).unwrap();
        for v in 0..700u64 {
            ea.push_back(v).unwrap();
        }
        ea.finish_write_phase().unwrap();
        // 700 elements fit in 2 blocks; the other 18 extents went back.
        assert_eq!(
            rt.block_manager().current_allocation(),
            before + 4096 // one written block; the head block has no extent
        );
        drop(ea);
        assert_eq!(rt.block_manager().current_allocation(), before);
    }
}
