//! Write pool: buffered asynchronous writes with steal-back.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::io::Request;
use crate::storage::{Bid, RawBuf};
use crate::Runtime;

/// A bounded pool of reusable buffers absorbing asynchronous writes.
///
/// A written block stays tracked by its BID until the transfer completes, so
/// [`steal_bid`](WritePool::steal_bid) can recover the still-resident buffer
/// and cancel the write.
pub struct WritePool {
    rt: Arc<Runtime>,
    raw_size: usize,
    free: Vec<RawBuf>,
    busy: VecDeque<(Bid, Request)>,
}

impl WritePool {
    pub fn new(rt: Arc<Runtime>, raw_size: usize, num_buffers: usize) -> Self {
        Self {
            rt,
            raw_size,
            free: (0..num_buffers).map(|_| RawBuf::zeroed(raw_size)).collect(),
            busy: VecDeque::new(),
        }
    }

    pub fn raw_size(&self) -> usize {
        self.raw_size
    }

    pub fn size(&self) -> usize {
        self.free.len() + self.busy.len()
    }

    /// Enqueue an asynchronous write of `buf` to `bid`.
    pub fn write(&mut self, buf: RawBuf, bid: Bid) -> Result<()> {
        debug_assert_eq!(buf.len(), self.raw_size);
        self.reclaim_completed()?;
        let req = self.rt.disks().write(bid, buf);
        self.busy.push_back((bid, req));
        Ok(())
    }

    /// Hand out a free buffer, waiting for the least-recently-submitted
    /// write if none is ready. An empty pool grows by one buffer.
    pub fn steal(&mut self) -> Result<RawBuf> {
        self.reclaim_completed()?;
        if let Some(buf) = self.free.pop() {
            return Ok(buf);
        }
        if let Some((_, req)) = self.busy.pop_front() {
            return req.wait();
        }
        debug!(raw_size = self.raw_size, "write pool empty, growing by one buffer");
        Ok(RawBuf::zeroed(self.raw_size))
    }

    /// Recover the buffer written to `bid`, cancelling the write if it has
    /// not started. Returns `None` when no write for `bid` is tracked.
    pub fn steal_bid(&mut self, bid: Bid) -> Option<Result<RawBuf>> {
        let pos = self.busy.iter().position(|(b, _)| *b == bid)?;
        let (_, req) = self.busy.remove(pos).unwrap();
        req.cancel();
        match req.wait_detailed() {
            Ok((buf, skipped)) => {
                if skipped {
                    warn!(%bid, "steal cancelled an in-flight write");
                }
                Some(Ok(buf))
            }
            Err(e) => Some(Err(e)),
        }
    }

    /// Whether a write to `bid` is still tracked by the pool.
    pub fn has_request(&self, bid: Bid) -> bool {
        self.busy.iter().any(|(b, _)| *b == bid)
    }

    /// Wait for all outstanding writes; their buffers return to the pool.
    pub fn flush(&mut self) -> Result<()> {
        while let Some((_, req)) = self.busy.pop_front() {
            self.free.push(req.wait()?);
        }
        Ok(())
    }

    /// Change the pool size. Shrinking may wait for outstanding writes.
    pub fn resize(&mut self, num_buffers: usize) -> Result<()> {
        while self.size() < num_buffers {
            self.free.push(RawBuf::zeroed(self.raw_size));
        }
        while self.size() > num_buffers {
            if self.free.pop().is_none() {
                let (_, req) = self.busy.pop_front().expect("size() > 0 implies busy");
                req.wait()?;
            }
        }
        Ok(())
    }

    fn reclaim_completed(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.busy.len() {
            if self.busy[i].1.is_done() {
                let (_, req) = self.busy.remove(i).unwrap();
                self.free.push(req.wait()?);
            } else {
                i += 1;
            }
        }
        Ok(())
    }
}

impl Drop for WritePool {
    fn drop(&mut self) {
        // Queued writes must land before their target extents can be
        // reclaimed by whoever owns them next.
        while let Some((_, req)) = self.busy.pop_front() {
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
    fn steal_after_write_returns_equivalent_buffer() {
        let (_dir, rt) = runtime(1, 1 << 20);
        let bid = rt.block_manager().new_block(&Striping, 4096).unwrap();
        let mut pool = WritePool::new(Arc::clone(&rt), 4096, 2);

        let mut buf = pool.steal().unwrap();
        buf.as_mut_slice()[0] = 0xAB;
        pool.write(buf, bid).unwrap();

        let got = pool.steal_bid(bid).unwrap().unwrap();
        assert_eq!(got.as_slice()[0], 0xAB);
        assert!(!pool.has_request(bid));
    }

    #[test]
    fn flush_returns_buffers_to_pool() {
        let (_dir, rt) = runtime(1, 1 << 20);
        let bids = rt.block_manager().new_blocks(&Striping, 4096, 3).unwrap();
        let mut pool = WritePool::new(Arc::clone(&rt), 4096, 3);
        for bid in &bids {
            let buf = pool.steal().unwrap();
            pool.write(buf, *bid).unwrap();
        }
        pool.flush().unwrap();
        assert_eq!(pool.size(), 3);
    }
}
