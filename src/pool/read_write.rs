//! Read-write pool: a prefetch pool and a write pool behind one steal
//! pathway.

use std::sync::Arc;

use crate::error::Result;
use crate::pool::{PrefetchPool, WritePool};
use crate::storage::{Bid, RawBuf};
use crate::Runtime;

pub struct ReadWritePool {
    prefetch: PrefetchPool,
    write: WritePool,
}

impl ReadWritePool {
    pub fn new(rt: Arc<Runtime>, raw_size: usize, prefetch_buffers: usize, write_buffers: usize) -> Self {
        Self {
            prefetch: PrefetchPool::new(Arc::clone(&rt), raw_size, prefetch_buffers),
            write: WritePool::new(rt, raw_size, write_buffers),
        }
    }

    pub fn raw_size(&self) -> usize {
        self.write.raw_size()
    }

    pub fn hint(&mut self, bid: Bid) -> bool {
        self.prefetch.hint(bid)
    }

    pub fn in_prefetching(&self, bid: Bid) -> bool {
        self.prefetch.in_prefetching(bid)
    }

    pub fn invalidate(&mut self, bid: Bid) -> Result<bool> {
        self.prefetch.invalidate(bid)
    }

    /// Read `bid`, consulting the write pool first: a block still queued for
    /// writing is served from its resident buffer without touching disk.
    pub fn read(&mut self, bid: Bid, dest: RawBuf) -> Result<RawBuf> {
        if self.write.has_request(bid) {
            if let Some(stolen) = self.write.steal_bid(bid) {
                let buf = stolen?;
                // Re-issue the write so the on-disk copy still materializes;
                // the caller gets a private copy.
                let mut copy = dest;
                copy.as_mut_slice().copy_from_slice(buf.as_slice());
                self.write.write(buf, bid)?;
                return Ok(copy);
            }
        }
        self.prefetch.read(bid, dest)
    }

    pub fn write(&mut self, buf: RawBuf, bid: Bid) -> Result<()> {
        self.write.write(buf, bid)
    }

    /// Recover the buffer queued for `bid`, cancelling its write.
    pub fn steal_bid(&mut self, bid: Bid) -> Option<Result<RawBuf>> {
        self.write.steal_bid(bid)
    }

    /// An anonymous free buffer from the shared inventory.
    pub fn steal(&mut self) -> Result<RawBuf> {
        self.write.steal()
    }

    /// Join all outstanding work on both sides: pending hints are
    /// invalidated and pending writes land; every buffer returns to the
    /// pool.
    pub fn flush(&mut self) -> Result<()> {
        self.prefetch.drain()?;
        self.write.flush()
    }

    pub fn resize_prefetch(&mut self, n: usize) -> Result<()> {
        self.prefetch.resize(n)
    }

    pub fn resize_write(&mut self, n: usize) -> Result<()> {
        self.write.resize(n)
    }

    pub fn size_prefetch(&self) -> usize {
        self.prefetch.size()
    }

    pub fn size_write(&self) -> usize {
        self.write.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Striping;
    use crate::test_util::runtime;

    #[test]
    fn read_sees_pending_write() {
        let (_dir, rt) = runtime(1, 1 << 20);
        let bid = rt.block_manager().new_block(&Striping, 4096).unwrap();
        let mut pool = ReadWritePool::new(Arc::clone(&rt), 4096, 1, 1);

        let mut buf = pool.steal().unwrap();
        buf.as_mut_slice()[100] = 5;
        pool.write(buf, bid).unwrap();

        let got = pool.read(bid, RawBuf::zeroed(4096)).unwrap();
        assert_eq!(got.as_slice()[100], 5);
        pool.flush().unwrap();

        // And the on-disk copy materialized despite the interleaved read.
        let disk = rt.disks().read_sync(bid, RawBuf::zeroed(4096)).unwrap();
        assert_eq!(disk.as_slice()[100], 5);
    }

    #[test]
    fn flush_drains_hints_as_well_as_writes() {
        let (_dir, rt) = runtime(1, 1 << 20);
        let bids = rt.block_manager().new_blocks(&Striping, 4096, 2).unwrap();
        let mut pool = ReadWritePool::new(Arc::clone(&rt), 4096, 2, 2);

        let buf = pool.steal().unwrap();
        pool.write(buf, bids[0]).unwrap();
        rt.disks().write_sync(bids[1], RawBuf::zeroed(4096)).unwrap();
        assert!(pool.hint(bids[1]));

        pool.flush().unwrap();
        assert!(!pool.in_prefetching(bids[1]));
        assert_eq!(pool.size_write(), 2);
        assert_eq!(pool.size_prefetch(), 2);
    }
}
