//! Node cache: a bounded table of resident B-tree nodes with pinning,
//! clock eviction, asynchronous prefetch reads and dirty write-back.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{ExtError, Result};
use crate::io::Request;
use crate::storage::{AllocStrategy, Bid, RawBuf};
use crate::Runtime;

/// A node type that can materialize from a raw block image and back.
pub(crate) trait CacheableNode: Send + Sync + Sized + 'static {
    fn new_empty(bid: Bid) -> Self;

    fn decode(raw: &RawBuf) -> Self;

    fn encode(&self, raw: &mut RawBuf);

    fn bid(&self) -> Bid;
}

struct Slot<N> {
    node: Option<Arc<RwLock<N>>>,
    bid: Bid,
    fixed: u32,
    dirty: bool,
    /// Clock reference bit.
    referenced: bool,
    /// In-flight prefetch read, resolved on first access.
    request: Option<Request>,
}

impl<N> Slot<N> {
    fn empty() -> Self {
        Self {
            node: None,
            bid: Bid::INVALID,
            fixed: 0,
            dirty: false,
            referenced: false,
            request: None,
        }
    }
}

pub(crate) struct NodeCache<N: CacheableNode> {
    rt: Arc<Runtime>,
    raw_size: usize,
    slots: Vec<Slot<N>>,
    map: HashMap<Bid, usize>,
    free: Vec<usize>,
    clock_hand: usize,
    strategy: Arc<dyn AllocStrategy>,
}

impl<N: CacheableNode> NodeCache<N> {
    pub fn new(
        rt: Arc<Runtime>,
        raw_size: usize,
        memory_budget: usize,
        strategy: Arc<dyn AllocStrategy>,
    ) -> Result<Self> {
        let n = (memory_budget / raw_size).max(2);
        Ok(Self {
            rt,
            raw_size,
            slots: (0..n).map(|_| Slot::empty()).collect(),
            map: HashMap::with_capacity(n),
            free: (0..n).rev().collect(),
            clock_hand: 0,
            strategy,
        })
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn num_fixed(&self) -> usize {
        self.slots.iter().filter(|s| s.fixed > 0).count()
    }

    /// Allocate a fresh node: a new BID from the block manager, a free slot
    /// (evicting if necessary), a blank node marked dirty.
    pub fn get_new_node(&mut self) -> Result<(Bid, Arc<RwLock<N>>)> {
        let bid = self
            .rt
            .block_manager()
            .new_block(self.strategy.as_ref(), self.raw_size)?;
        let slot = self.obtain_slot()?;
        let node = Arc::new(RwLock::new(N::new_empty(bid)));
        let s = &mut self.slots[slot];
        s.node = Some(Arc::clone(&node));
        s.bid = bid;
        s.dirty = true;
        s.referenced = true;
        self.map.insert(bid, slot);
        Ok((bid, node))
    }

    /// Fetch for mutation: the slot is marked dirty.
    pub fn get_node(&mut self, bid: Bid, fix: bool) -> Result<Arc<RwLock<N>>> {
        let node = self.fetch(bid, fix)?;
        let slot = self.map[&bid];
        self.slots[slot].dirty = true;
        Ok(node)
    }

    /// Fetch for reading only.
    pub fn get_const_node(&mut self, bid: Bid, fix: bool) -> Result<Arc<RwLock<N>>> {
        self.fetch(bid, fix)
    }

    fn fetch(&mut self, bid: Bid, fix: bool) -> Result<Arc<RwLock<N>>> {
        debug_assert!(bid.valid());
        if let Some(&slot) = self.map.get(&bid) {
            self.resolve_pending(slot)?;
            let s = &mut self.slots[slot];
            s.referenced = true;
            if fix {
                s.fixed += 1;
            }
            return Ok(Arc::clone(s.node.as_ref().expect("resolved slot has a node")));
        }
        let slot = self.obtain_slot()?;
        let raw = self.rt.disks().read_sync(bid, RawBuf::zeroed(self.raw_size))?;
        let node = Arc::new(RwLock::new(N::decode(&raw)));
        let s = &mut self.slots[slot];
        s.node = Some(Arc::clone(&node));
        s.bid = bid;
        s.referenced = true;
        if fix {
            s.fixed += 1;
        }
        self.map.insert(bid, slot);
        Ok(node)
    }

    /// Issue an asynchronous read for `bid` without pinning or dirtying;
    /// used for sibling look-ahead.
    pub fn prefetch_node(&mut self, bid: Bid) -> Result<()> {
        if self.map.contains_key(&bid) {
            return Ok(());
        }
        let Ok(slot) = self.obtain_slot() else {
            // Look-ahead never fails the caller over cache pressure.
            return Ok(());
        };
        let req = self.rt.disks().read(bid, RawBuf::zeroed(self.raw_size));
        let s = &mut self.slots[slot];
        s.bid = bid;
        s.request = Some(req);
        self.map.insert(bid, slot);
        trace!(%bid, "prefetching node");
        Ok(())
    }

    pub fn unfix_node(&mut self, bid: Bid) {
        if let Some(&slot) = self.map.get(&bid) {
            let s = &mut self.slots[slot];
            debug_assert!(s.fixed > 0, "unfix of an unfixed node");
            s.fixed = s.fixed.saturating_sub(1);
        }
    }

    /// Drop the node and return its extent to the block manager.
    pub fn delete_node(&mut self, bid: Bid) -> Result<()> {
        if let Some(slot) = self.map.remove(&bid) {
            if let Some(req) = self.slots[slot].request.take() {
                let _ = req.wait();
            }
            self.slots[slot] = Slot::empty();
            self.free.push(slot);
        }
        self.rt.block_manager().delete_block(bid, self.raw_size);
        Ok(())
    }

    /// Write back one node if its slot is dirty.
    pub fn write_back(&mut self, bid: Bid) -> Result<()> {
        if let Some(&slot) = self.map.get(&bid) {
            self.flush_slot(slot)?;
        }
        Ok(())
    }

    fn resolve_pending(&mut self, slot: usize) -> Result<()> {
        if let Some(req) = self.slots[slot].request.take() {
            let raw = req.wait()?;
            self.slots[slot].node = Some(Arc::new(RwLock::new(N::decode(&raw))));
        }
        Ok(())
    }

    fn flush_slot(&mut self, slot: usize) -> Result<()> {
        if !self.slots[slot].dirty {
            return Ok(());
        }
        let bid = self.slots[slot].bid;
        let mut raw = RawBuf::zeroed(self.raw_size);
        {
            let node = self.slots[slot]
                .node
                .as_ref()
                .expect("dirty slot has a node")
                .read();
            node.encode(&mut raw);
        }
        debug!(%bid, "writing back dirty node");
        self.rt.disks().write_sync(bid, raw)?;
        self.slots[slot].dirty = false;
        Ok(())
    }

    /// A free slot, evicting the clock victim if none is free. Fails with
    /// `CacheExhausted` when every slot is pinned.
    fn obtain_slot(&mut self) -> Result<usize> {
        if let Some(slot) = self.free.pop() {
            return Ok(slot);
        }
        let n = self.slots.len();
        for _ in 0..2 * n {
            let i = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % n;
            let s = &mut self.slots[i];
            if s.fixed > 0 {
                continue;
            }
            if s.referenced {
                s.referenced = false;
                continue;
            }
            // Victim found.
            self.resolve_pending(i)?;
            self.flush_slot(i)?;
            let bid = self.slots[i].bid;
            self.map.remove(&bid);
            self.slots[i] = Slot::empty();
            return Ok(i);
        }
        Err(ExtError::CacheExhausted {
            slots: self.slots.len(),
        })
    }
}
