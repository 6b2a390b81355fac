//! B-tree leaf: a sorted key/data block with doubly-linked siblings.
//!
//! Persisted layout: `Entry<K, D> × capacity` followed by a trailing
//! `LeafInfo { self, pred, succ, cur_size }`. The in-memory representation
//! is decoded on fetch and encoded on write-back by the leaf cache.

use crate::common::ValueOrder;
use crate::storage::{
    read_tail, value_slice, value_slice_mut, write_tail, Bid, BidRepr, Block, Pod, RawBuf,
};

use crate::btree::node_cache::CacheableNode;
use crate::btree::Entry;

#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct LeafInfo {
    pub self_bid: BidRepr,
    pub pred: BidRepr,
    pub succ: BidRepr,
    pub cur_size: u64,
}

unsafe impl Pod for LeafInfo {}

pub(crate) struct LeafNode<K: Pod, D: Pod> {
    pub entries: Vec<Entry<K, D>>,
    pub bid: Bid,
    pub pred: Bid,
    pub succ: Bid,
}

impl<K: Pod, D: Pod> LeafNode<K, D> {
    /// Entries fitting into one block; one slot is reserved so a full leaf
    /// can accept the overflowing entry before splitting.
    pub fn max_size(raw_size: usize) -> usize {
        Block::<Entry<K, D>>::capacity_with_tail::<LeafInfo>(raw_size) - 1
    }

    pub fn min_size(raw_size: usize) -> usize {
        Self::max_size(raw_size) / 2
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// First position whose key is not less than `k`.
    pub fn lower_bound<C: ValueOrder<K>>(&self, cmp: &C, k: &K) -> usize {
        self.entries.partition_point(|e| cmp.less(&e.key, k))
    }

    /// First position whose key is greater than `k`.
    pub fn upper_bound<C: ValueOrder<K>>(&self, cmp: &C, k: &K) -> usize {
        self.entries.partition_point(|e| cmp.le(&e.key, k))
    }

    pub fn front_key(&self) -> &K {
        &self.entries[0].key
    }

    pub fn back_key(&self) -> &K {
        &self.entries[self.entries.len() - 1].key
    }
}

impl<K: Pod, D: Pod> CacheableNode for LeafNode<K, D> {
    fn new_empty(bid: Bid) -> Self {
        Self {
            entries: Vec::new(),
            bid,
            pred: Bid::INVALID,
            succ: Bid::INVALID,
        }
    }

    fn decode(raw: &RawBuf) -> Self {
        let info: LeafInfo = read_tail(raw);
        let n = info.cur_size as usize;
        Self {
            entries: value_slice::<Entry<K, D>>(raw, n).to_vec(),
            bid: info.self_bid.into(),
            pred: info.pred.into(),
            succ: info.succ.into(),
        }
    }

    fn encode(&self, raw: &mut RawBuf) {
        debug_assert!(self.entries.len() <= Self::max_size(raw.len()) + 1);
        value_slice_mut::<Entry<K, D>>(raw, self.entries.len())
            .copy_from_slice(&self.entries);
        write_tail(
            raw,
            LeafInfo {
                self_bid: self.bid.into(),
                pred: self.pred.into(),
                succ: self.succ.into(),
                cur_size: self.entries.len() as u64,
            },
        );
    }

    fn bid(&self) -> Bid {
        self.bid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DefaultOrder;

    #[test]
    fn codec_round_trip() {
        let mut leaf: LeafNode<u64, u64> = LeafNode::new_empty(Bid::new(1, 4096));
        leaf.pred = Bid::new(0, 0);
        leaf.succ = Bid::new(1, 8192);
        for i in 0..10u64 {
            leaf.entries.push(Entry {
                key: i * 2,
                data: i,
            });
        }
        let mut raw = RawBuf::zeroed(4096);
        leaf.encode(&mut raw);
        let back: LeafNode<u64, u64> = LeafNode::decode(&raw);
        assert_eq!(back.len(), 10);
        assert_eq!(back.bid, leaf.bid);
        assert_eq!(back.pred, leaf.pred);
        assert_eq!(back.succ, leaf.succ);
        assert_eq!(back.entries[9].key, 18);
        assert_eq!(back.entries[9].data, 9);
    }

    #[test]
    fn bounds_and_sizes() {
        let cmp = DefaultOrder::<u64>::new();
        let mut leaf: LeafNode<u64, u64> = LeafNode::new_empty(Bid::new(0, 0));
        for k in [10u64, 20, 20, 30] {
            leaf.entries.push(Entry { key: k, data: 0 });
        }
        assert_eq!(leaf.lower_bound(&cmp, &20), 1);
        assert_eq!(leaf.upper_bound(&cmp, &20), 3);
        assert_eq!(leaf.lower_bound(&cmp, &5), 0);
        assert_eq!(leaf.lower_bound(&cmp, &35), 4);
        assert!(LeafNode::<u64, u64>::max_size(4096) > 100);
        assert_eq!(
            LeafNode::<u64, u64>::min_size(4096),
            LeafNode::<u64, u64>::max_size(4096) / 2
        );
    }
}
