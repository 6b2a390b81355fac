//! Prefetch pool: hint-based asynchronous reads.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::io::Request;
use crate::storage::{Bid, RawBuf};
use crate::Runtime;

/// A bounded pool of buffers absorbing asynchronous read hints.
///
/// A `read` following a `hint` for the same BID is guaranteed to reuse the
/// hinted buffer; without a hint the read happens synchronously into the
/// caller's buffer.
pub struct PrefetchPool {
    rt: Arc<Runtime>,
    raw_size: usize,
    free: Vec<RawBuf>,
    hinted: HashMap<Bid, Request>,
}

impl PrefetchPool {
    pub fn new(rt: Arc<Runtime>, raw_size: usize, num_buffers: usize) -> Self {
        Self {
            rt,
            raw_size,
            free: (0..num_buffers).map(|_| RawBuf::zeroed(raw_size)).collect(),
            hinted: HashMap::new(),
        }
    }

    pub fn raw_size(&self) -> usize {
        self.raw_size
    }

    pub fn size(&self) -> usize {
        self.free.len() + self.hinted.len()
    }

    /// Issue an asynchronous read of `bid` into a pool slot. Returns false
    /// when every slot is occupied or `bid` is already hinted.
    pub fn hint(&mut self, bid: Bid) -> bool {
        if self.hinted.contains_key(&bid) {
            return false;
        }
        let Some(buf) = self.free.pop() else {
            trace!(%bid, "prefetch pool full, hint dropped");
            return false;
        };
        let req = self.rt.disks().read(bid, buf);
        self.hinted.insert(bid, req);
        true
    }

    pub fn in_prefetching(&self, bid: Bid) -> bool {
        self.hinted.contains_key(&bid)
    }

    /// Obtain the block at `bid`. The fast path hands back the hinted
    /// buffer (waiting for its read to finish) and recycles `dest`; the
    /// slow path reads synchronously into `dest`.
    pub fn read(&mut self, bid: Bid, dest: RawBuf) -> Result<RawBuf> {
        debug_assert_eq!(dest.len(), self.raw_size);
        match self.hinted.remove(&bid) {
            Some(req) => {
                let buf = req.wait()?;
                self.free.push(dest);
                Ok(buf)
            }
            None => self.rt.disks().read_sync(bid, dest),
        }
    }

    /// Drop any pending or completed hint for `bid`; its slot becomes free.
    pub fn invalidate(&mut self, bid: Bid) -> Result<bool> {
        match self.hinted.remove(&bid) {
            Some(req) => {
                req.cancel();
                let (buf, _) = req.wait_detailed()?;
                self.free.push(buf);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel and join every outstanding hint; all slots become free.
    /// Containers call this before reclaiming the extents their hints
    /// point at.
    pub fn drain(&mut self) -> Result<()> {
        let bids: Vec<Bid> = self.hinted.keys().copied().collect();
        for bid in bids {
            self.invalidate(bid)?;
        }
        Ok(())
    }

    /// Change the pool size. Shrinking may wait for outstanding hints.
    pub fn resize(&mut self, num_buffers: usize) -> Result<()> {
        while self.size() < num_buffers {
            self.free.push(RawBuf::zeroed(self.raw_size));
        }
        while self.size() > num_buffers {
            if self.free.pop().is_none() {
                let bid = *self.hinted.keys().next().expect("size() > 0 implies hints");
                self.invalidate(bid)?;
                // invalidate pushed the buffer back to free; the next loop
                // iteration pops it.
            }
        }
        Ok(())
    }
}

impl Drop for PrefetchPool {
    fn drop(&mut self) {
        // In-flight hint reads must complete before their buffers go away.
        for (_, req) in self.hinted.drain() {
            req.cancel();
            let _ = req.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Striping;
    use crate::test_util::runtime;

    #[test]
    fn hinted_read_reuses_buffer() {
        let (_dir, rt) = runtime(1, 1 << 20);
        let bid = rt.block_manager().new_block(&Striping, 4096).unwrap();
        let mut buf = RawBuf::zeroed(4096);
        buf.as_mut_slice()[7] = 99;
        rt.disks().write_sync(bid, buf).unwrap();

        let mut pool = PrefetchPool::new(Arc::clone(&rt), 4096, 2);
        assert!(pool.hint(bid));
        assert!(pool.in_prefetching(bid));
        let got = pool.read(bid, RawBuf::zeroed(4096)).unwrap();
        assert_eq!(got.as_slice()[7], 99);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn unhinted_read_is_synchronous() {
        let (_dir, rt) = runtime(1, 1 << 20);
        let bid = rt.block_manager().new_block(&Striping, 4096).unwrap();
        rt.disks().write_sync(bid, RawBuf::zeroed(4096)).unwrap();
        let mut pool = PrefetchPool::new(Arc::clone(&rt), 4096, 1);
        let got = pool.read(bid, RawBuf::zeroed(4096)).unwrap();
        assert_eq!(got.len(), 4096);
    }

    #[test]
    fn drain_joins_all_outstanding_hints() {
        let (_dir, rt) = runtime(1, 1 << 20);
        let bids = rt.block_manager().new_blocks(&Striping, 4096, 3).unwrap();
        for &bid in &bids {
            rt.disks().write_sync(bid, RawBuf::zeroed(4096)).unwrap();
        }
        let mut pool = PrefetchPool::new(Arc::clone(&rt), 4096, 3);
        for &bid in &bids {
            assert!(pool.hint(bid));
        }
        pool.drain().unwrap();
        for &bid in &bids {
            assert!(!pool.in_prefetching(bid));
        }
        assert_eq!(pool.size(), 3);
        // All slots are free again.
        assert!(pool.hint(bids[0]));
    }

    #[test]
    fn dropping_a_pool_with_hints_joins_them() {
        let (_dir, rt) = runtime(1, 1 << 20);
        let bid = rt.block_manager().new_block(&Striping, 4096).unwrap();
        rt.disks().write_sync(bid, RawBuf::zeroed(4096)).unwrap();
        let mut pool = PrefetchPool::new(Arc::clone(&rt), 4096, 1);
        assert!(pool.hint(bid));
        drop(pool);
        // The extent is quiescent again and safe to reclaim.
        rt.block_manager().delete_block(bid, 4096);
        assert_eq!(rt.block_manager().current_allocation(), 0);
    }

    #[test]
    fn invalidate_frees_the_slot() {
        let (_dir, rt) = runtime(1, 1 << 20);
        let bid = rt.block_manager().new_block(&Striping, 4096).unwrap();
        rt.disks().write_sync(bid, RawBuf::zeroed(4096)).unwrap();
        let mut pool = PrefetchPool::new(Arc::clone(&rt), 4096, 1);
        assert!(pool.hint(bid));
        assert!(!pool.hint(bid));
        assert!(pool.invalidate(bid).unwrap());
        assert!(!pool.in_prefetching(bid));
        assert!(pool.hint(bid));
    }
}
