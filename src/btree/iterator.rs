//! Live-cursor tracking.
//!
//! The tree keeps a map `leaf BID -> live cursors` so that every mutation
//! that relocates entries can walk the affected cursors and patch their
//! `(bid, pos)` in place. Cursors hold weak references; dead ones are
//! pruned lazily. A cursor whose recorded BID no longer matches its bucket
//! (it advanced on its own) is re-homed without applying the patch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use crate::storage::Bid;

/// Position of one live cursor: a leaf plus an entry index. An invalid BID
/// marks the end cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CursorState {
    pub bid: Bid,
    pub pos: usize,
}

impl CursorState {
    pub fn end() -> Self {
        Self {
            bid: Bid::INVALID,
            pos: 0,
        }
    }

    pub fn is_end(&self) -> bool {
        !self.bid.valid()
    }
}

pub(crate) type CursorRef = Arc<StdMutex<CursorState>>;

#[derive(Default)]
pub(crate) struct IterMap {
    buckets: HashMap<Bid, Vec<Weak<StdMutex<CursorState>>>>,
}

impl IterMap {
    pub fn register(&mut self, state: &CursorRef) {
        let bid = state.lock().expect("cursor lock").bid;
        if bid.valid() {
            self.buckets.entry(bid).or_default().push(Arc::downgrade(state));
        }
    }

    /// Record that a cursor moved itself from `old` to its current leaf.
    pub fn rehome(&mut self, _old: Bid, state: &CursorRef) {
        // The stale weak entry under `old` is pruned on the next apply().
        self.register(state);
    }

    /// Patch every live cursor currently on `bid`. The patch may change
    /// `bid` (cursor moves to another leaf or to end); such cursors are
    /// re-bucketed afterwards.
    pub fn apply(&mut self, bid: Bid, mut patch: impl FnMut(&mut CursorState)) {
        let Some(list) = self.buckets.remove(&bid) else {
            return;
        };
        let mut stay = Vec::new();
        let mut moved = Vec::new();
        for weak in list {
            let Some(arc) = weak.upgrade() else {
                continue;
            };
            let mut st = arc.lock().expect("cursor lock");
            if st.bid != bid {
                // Advanced on its own since registration; just re-home.
                let new_bid = st.bid;
                drop(st);
                if new_bid.valid() {
                    moved.push((new_bid, weak));
                }
                continue;
            }
            patch(&mut st);
            let new_bid = st.bid;
            drop(st);
            if new_bid == bid {
                stay.push(weak);
            } else if new_bid.valid() {
                moved.push((new_bid, weak));
            }
        }
        if !stay.is_empty() {
            self.buckets.insert(bid, stay);
        }
        for (new_bid, weak) in moved {
            self.buckets.entry(new_bid).or_default().push(weak);
        }
    }

    /// Move every cursor everywhere to the end position (used by `clear`).
    pub fn invalidate_all(&mut self) {
        for (_, list) in self.buckets.drain() {
            for weak in list {
                if let Some(arc) = weak.upgrade() {
                    *arc.lock().expect("cursor lock") = CursorState::end();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(bid: Bid, pos: usize) -> CursorRef {
        Arc::new(StdMutex::new(CursorState { bid, pos }))
    }

    #[test]
    fn patches_only_matching_cursors() {
        let a = Bid::new(0, 0);
        let b = Bid::new(0, 4096);
        let mut map = IterMap::default();
        let c1 = cursor(a, 3);
        let c2 = cursor(a, 7);
        map.register(&c1);
        map.register(&c2);

        // c2 wanders off on its own.
        c2.lock().unwrap().bid = b;
        map.rehome(a, &c2);

        map.apply(a, |st| st.pos += 10);
        assert_eq!(c1.lock().unwrap().pos, 13);
        assert_eq!(c2.lock().unwrap().pos, 7);

        map.apply(b, |st| st.pos += 1);
        assert_eq!(c2.lock().unwrap().pos, 8);
    }

    #[test]
    fn dead_cursors_are_pruned() {
        let a = Bid::new(0, 0);
        let mut map = IterMap::default();
        let c = cursor(a, 0);
        map.register(&c);
        drop(c);
        map.apply(a, |_| panic!("dead cursor must not be patched"));
        assert!(map.buckets.get(&a).is_none());
    }

    #[test]
    fn rebuckets_on_bid_change() {
        let a = Bid::new(0, 0);
        let b = Bid::new(0, 4096);
        let mut map = IterMap::default();
        let c = cursor(a, 2);
        map.register(&c);
        map.apply(a, |st| {
            st.bid = b;
            st.pos += 5;
        });
        map.apply(b, |st| st.pos += 1);
        let st = *c.lock().unwrap();
        assert_eq!(st, CursorState { bid: b, pos: 8 });
    }
}
