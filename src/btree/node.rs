//! B-tree internal node: a routing block mapping separator keys to child
//! BIDs. The `i`-th separator is an upper bound for the subtree at child
//! `i`; the rightmost separator of the rightmost node on each level is the
//! comparator's `max_value()`.

use crate::common::ValueOrder;
use crate::storage::{
    read_tail, value_slice, value_slice_mut, write_tail, Bid, BidRepr, Block, Pod, RawBuf,
};

use crate::btree::node_cache::CacheableNode;
use crate::btree::Entry;

#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct NodeInfo {
    pub self_bid: BidRepr,
    pub cur_size: u64,
}

unsafe impl Pod for NodeInfo {}

/// One routing entry: separator key plus the child it bounds.
#[derive(Clone, Copy)]
pub(crate) struct Router<K> {
    pub sep: K,
    pub child: Bid,
}

pub(crate) struct InnerNode<K: Pod> {
    pub entries: Vec<Router<K>>,
    pub bid: Bid,
}

impl<K: Pod> InnerNode<K> {
    pub fn max_size(raw_size: usize) -> usize {
        Block::<Entry<K, BidRepr>>::capacity_with_tail::<NodeInfo>(raw_size) - 1
    }

    pub fn min_size(raw_size: usize) -> usize {
        Self::max_size(raw_size) / 2
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Index of the child to descend into for key `k`: the first entry
    /// whose separator is not less than `k`. The rightmost separator is a
    /// `max_value()` sentinel, so the search always lands.
    pub fn child_index<C: ValueOrder<K>>(&self, cmp: &C, k: &K) -> usize {
        let i = self.entries.partition_point(|e| cmp.less(&e.sep, k));
        debug_assert!(i < self.entries.len(), "rightmost separator must catch all keys");
        i
    }
}

impl<K: Pod> CacheableNode for InnerNode<K> {
    fn new_empty(bid: Bid) -> Self {
        Self {
            entries: Vec::new(),
            bid,
        }
    }

    fn decode(raw: &RawBuf) -> Self {
        let info: NodeInfo = read_tail(raw);
        let n = info.cur_size as usize;
        let entries = value_slice::<Entry<K, BidRepr>>(raw, n)
            .iter()
            .map(|e| Router {
                sep: e.key,
                child: e.data.into(),
            })
            .collect();
        Self {
            entries,
            bid: info.self_bid.into(),
        }
    }

    fn encode(&self, raw: &mut RawBuf) {
        debug_assert!(self.entries.len() <= Self::max_size(raw.len()) + 1);
        let out = value_slice_mut::<Entry<K, BidRepr>>(raw, self.entries.len());
        for (slot, e) in out.iter_mut().zip(&self.entries) {
            *slot = Entry {
                key: e.sep,
                data: e.child.into(),
            };
        }
        write_tail(
            raw,
            NodeInfo {
                self_bid: self.bid.into(),
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
        let mut node: InnerNode<u64> = InnerNode::new_empty(Bid::new(2, 12288));
        for i in 0..5u64 {
            node.entries.push(Router {
                sep: (i + 1) * 100,
                child: Bid::new(0, i * 4096),
            });
        }
        let mut raw = RawBuf::zeroed(4096);
        node.encode(&mut raw);
        let back: InnerNode<u64> = InnerNode::decode(&raw);
        assert_eq!(back.len(), 5);
        assert_eq!(back.bid, node.bid);
        assert_eq!(back.entries[3].sep, 400);
        assert_eq!(back.entries[3].child, Bid::new(0, 3 * 4096));
    }

    #[test]
    fn routing_picks_bounding_child() {
        let cmp = DefaultOrder::<u64>::new();
        let mut node: InnerNode<u64> = InnerNode::new_empty(Bid::new(0, 0));
        for (sep, off) in [(100u64, 0u64), (200, 1), (u64::MAX, 2)] {
            node.entries.push(Router {
                sep,
                child: Bid::new(0, off),
            });
        }
        assert_eq!(node.child_index(&cmp, &50), 0);
        assert_eq!(node.child_index(&cmp, &100), 0);
        assert_eq!(node.child_index(&cmp, &101), 1);
        assert_eq!(node.child_index(&cmp, &5000), 2);
    }
}
