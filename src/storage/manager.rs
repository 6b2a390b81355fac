//! Block manager: the single authority for allocating and reclaiming block
//! identifiers across the configured devices.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ExtError, Result};
use crate::storage::{AllocStrategy, Bid};

// ============================================================================
// Per-device extent allocator
// ============================================================================

/// First-fit free-extent allocator over one device's byte range.
/// Free extents are keyed by offset and coalesced on release.
struct ExtentAllocator {
    capacity: u64,
    /// offset -> length of free extent
    free: BTreeMap<u64, u64>,
    allocated: u64,
}

impl ExtentAllocator {
    fn new(capacity: u64) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            free,
            allocated: 0,
        }
    }

    fn allocate(&mut self, len: u64) -> Option<u64> {
        let (&offset, &extent_len) = self.free.iter().find(|(_, l)| **l >= len)?;
        self.free.remove(&offset);
        if extent_len > len {
            self.free.insert(offset + len, extent_len - len);
        }
        self.allocated += len;
        Some(offset)
    }

    fn release(&mut self, offset: u64, len: u64) {
        debug_assert!(offset + len <= self.capacity);
        let mut offset = offset;
        let mut len = len;

        // Coalesce with predecessor.
        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            debug_assert!(prev_off + prev_len <= offset, "double free");
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                offset = prev_off;
                len += prev_len;
            }
        }
        // Coalesce with successor.
        if let Some((&next_off, &next_len)) = self.free.range(offset + len..).next() {
            if offset + len == next_off {
                self.free.remove(&next_off);
                len += next_len;
            }
        }
        self.free.insert(offset, len);
    }
}

// ============================================================================
// Block manager
// ============================================================================

/// Hands out unique BIDs and reclaims them. An [`AllocStrategy`] selects the
/// device for each block of a batch; a device that cannot hold the block is
/// skipped in favor of the next one, and only when every device refuses does
/// allocation fail with `OutOfSpace`.
pub struct BlockManager {
    devices: Vec<Mutex<ExtentAllocator>>,
    /// Monotone counter giving batch allocations a stable base index.
    counter: AtomicU64,
    total_allocated: AtomicU64,
}

impl BlockManager {
    /// `device_bytes[d]` is the usable capacity of device `d`.
    pub fn new(device_bytes: &[u64]) -> Result<Self> {
        if device_bytes.is_empty() {
            return Err(ExtError::Config("no devices configured".into()));
        }
        Ok(Self {
            devices: device_bytes
                .iter()
                .map(|&c| Mutex::new(ExtentAllocator::new(c)))
                .collect(),
            counter: AtomicU64::new(0),
            total_allocated: AtomicU64::new(0),
        })
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Allocate a single block of `raw_size` bytes.
    pub fn new_block(&self, strategy: &dyn AllocStrategy, raw_size: usize) -> Result<Bid> {
        let mut out = [Bid::INVALID];
        self.new_blocks_into(strategy, raw_size, &mut out)?;
        Ok(out[0])
    }

    /// Allocate `n` blocks; the `i`-th output device is
    /// `strategy(i + base)` where `base` is an internal monotone counter.
    pub fn new_blocks(
        &self,
        strategy: &dyn AllocStrategy,
        raw_size: usize,
        n: usize,
    ) -> Result<Vec<Bid>> {
        let mut out = vec![Bid::INVALID; n];
        self.new_blocks_into(strategy, raw_size, &mut out)?;
        Ok(out)
    }

    pub fn new_blocks_into(
        &self,
        strategy: &dyn AllocStrategy,
        raw_size: usize,
        out: &mut [Bid],
    ) -> Result<()> {
        let base = self.counter.fetch_add(out.len() as u64, Ordering::Relaxed);
        let ndev = self.devices.len();
        for (i, slot) in out.iter_mut().enumerate() {
            let preferred = strategy.device(base + i as u64, ndev);
            match self.allocate_on(preferred, raw_size as u64) {
                Some(bid) => *slot = bid,
                None => {
                    // Roll back what this call handed out so a failed batch
                    // leaves no leaked extents.
                    for done in out[..i].iter() {
                        self.delete_block(*done, raw_size);
                    }
                    return Err(ExtError::OutOfSpace {
                        requested: raw_size as u64,
                    });
                }
            }
        }
        self.total_allocated
            .fetch_add(out.len() as u64 * raw_size as u64, Ordering::Relaxed);
        Ok(())
    }

    fn allocate_on(&self, preferred: usize, len: u64) -> Option<Bid> {
        let ndev = self.devices.len();
        for probe in 0..ndev {
            let d = (preferred + probe) % ndev;
            if let Some(offset) = self.devices[d].lock().allocate(len) {
                if probe > 0 {
                    debug!(preferred, chosen = d, "preferred device full, spilled");
                }
                return Some(Bid::new(d as u16, offset));
            }
        }
        None
    }

    /// Return an extent to its device's free list. Deleting an invalid BID
    /// is a no-op.
    pub fn delete_block(&self, bid: Bid, raw_size: usize) {
        if !bid.valid() {
            return;
        }
        let mut dev = self.devices[bid.device as usize].lock();
        dev.release(bid.offset, raw_size as u64);
        dev.allocated -= raw_size as u64;
    }

    pub fn delete_blocks(&self, bids: &[Bid], raw_size: usize) {
        for &bid in bids {
            self.delete_block(bid, raw_size);
        }
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    /// Total bytes over all devices.
    pub fn total_bytes(&self) -> u64 {
        self.devices.iter().map(|d| d.lock().capacity).sum()
    }

    /// Bytes currently allocated, over all devices.
    pub fn current_allocation(&self) -> u64 {
        self.devices.iter().map(|d| d.lock().allocated).sum()
    }

    /// Cumulative bytes ever allocated (never decreases).
    pub fn total_allocated_bytes(&self) -> u64 {
        self.total_allocated.load(Ordering::Relaxed)
    }

    /// Per-device `(capacity, allocated)` breakdown.
    pub fn device_usage(&self) -> Vec<(u64, u64)> {
        self.devices
            .iter()
            .map(|d| {
                let d = d.lock();
                (d.capacity, d.allocated)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Striping;

    #[test]
    fn stripes_across_devices() {
        let bm = BlockManager::new(&[1 << 20, 1 << 20, 1 << 20]).unwrap();
        let bids = bm.new_blocks(&Striping, 4096, 6).unwrap();
        let devs: Vec<u16> = bids.iter().map(|b| b.device).collect();
        assert_eq!(devs, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(bm.current_allocation(), 6 * 4096);
    }

    #[test]
    fn free_coalescing_allows_reuse() {
        let bm = BlockManager::new(&[8192]).unwrap();
        let bids = bm.new_blocks(&Striping, 4096, 2).unwrap();
        bm.delete_blocks(&bids, 4096);
        // After coalescing the full 8 KiB extent is available again.
        let big = bm.new_block(&Striping, 8192).unwrap();
        assert_eq!(big.offset, 0);
    }

    #[test]
    fn exhaustion_reports_out_of_space() {
        let bm = BlockManager::new(&[4096]).unwrap();
        bm.new_block(&Striping, 4096).unwrap();
        let err = bm.new_block(&Striping, 4096).unwrap_err();
        assert!(matches!(err, ExtError::OutOfSpace { .. }));
    }

    #[test]
    fn deleting_invalid_bid_is_noop() {
        let bm = BlockManager::new(&[4096]).unwrap();
        bm.delete_block(Bid::INVALID, 4096);
        assert_eq!(bm.current_allocation(), 0);
    }

    #[test]
    fn batch_failure_rolls_back() {
        let bm = BlockManager::new(&[8192]).unwrap();
        assert!(bm.new_blocks(&Striping, 4096, 3).is_err());
        assert_eq!(bm.current_allocation(), 0);
        assert!(bm.new_blocks(&Striping, 4096, 2).is_ok());
    }
}
