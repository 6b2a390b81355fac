//! Winner tree over the current minima of a group of sources.
//!
//! Leaves hold cached keys (or nothing, for inactive players); internal
//! nodes hold the winning player of their subtree. Updating one leaf costs
//! O(log k). The parallel PQ keeps one tree per source group (insertion
//! heaps, internal arrays, external arrays) and compares the group winners
//! directly.

use crate::common::ValueOrder;
use crate::storage::Pod;

const NONE: usize = usize::MAX;

pub(crate) struct MinimaTree<V: Pod, C: ValueOrder<V>> {
    cmp: C,
    keys: Vec<Option<V>>,
    /// `tree[1]` is the root; leaves live at `tree[k..k + players]`.
    tree: Vec<usize>,
    k: usize,
}

impl<V: Pod, C: ValueOrder<V>> MinimaTree<V, C> {
    pub fn new(cmp: C) -> Self {
        Self {
            cmp,
            keys: Vec::new(),
            tree: Vec::new(),
            k: 0,
        }
    }

    pub fn num_players(&self) -> usize {
        self.keys.len()
    }

    /// Grow or shrink the player set; existing keys are preserved where the
    /// index survives.
    pub fn resize(&mut self, players: usize) {
        self.keys.resize(players, None);
        self.k = players.next_power_of_two().max(1);
        self.rebuild();
    }

    fn rebuild(&mut self) {
        self.tree = vec![NONE; 2 * self.k];
        for (i, key) in self.keys.iter().enumerate() {
            if key.is_some() {
                self.tree[self.k + i] = i;
            }
        }
        for j in (1..self.k).rev() {
            self.tree[j] = self.better(self.tree[2 * j], self.tree[2 * j + 1]);
        }
    }

    fn better(&self, a: usize, b: usize) -> usize {
        match (a, b) {
            (NONE, _) => b,
            (_, NONE) => a,
            _ => {
                let (ka, kb) = (
                    self.keys[a].as_ref().expect("active player"),
                    self.keys[b].as_ref().expect("active player"),
                );
                if self.cmp.less(kb, ka) {
                    b
                } else {
                    a
                }
            }
        }
    }

    /// Publish player `i`'s current minimum (`None` deactivates it).
    pub fn update(&mut self, i: usize, key: Option<V>) {
        debug_assert!(i < self.keys.len());
        self.keys[i] = key;
        let mut j = self.k + i;
        self.tree[j] = if key.is_some() { i } else { NONE };
        j /= 2;
        while j >= 1 {
            self.tree[j] = self.better(self.tree[2 * j], self.tree[2 * j + 1]);
            if j == 1 {
                break;
            }
            j /= 2;
        }
    }

    /// The globally smallest `(player, key)`, if any player is active.
    pub fn winner(&self) -> Option<(usize, V)> {
        if self.tree.is_empty() {
            return None;
        }
        let w = self.tree[1];
        if w == NONE {
            None
        } else {
            Some((w, self.keys[w].expect("winner is active")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DefaultOrder;

    #[test]
    fn tracks_winner_across_updates() {
        let mut t = MinimaTree::new(DefaultOrder::<u64>::new());
        t.resize(5);
        assert_eq!(t.winner(), None);
        t.update(0, Some(30));
        t.update(3, Some(10));
        t.update(4, Some(20));
        assert_eq!(t.winner(), Some((3, 10)));
        t.update(3, Some(50));
        assert_eq!(t.winner(), Some((4, 20)));
        t.update(4, None);
        assert_eq!(t.winner(), Some((0, 30)));
        t.update(0, None);
        t.update(3, None);
        assert_eq!(t.winner(), None);
    }

    #[test]
    fn resize_preserves_survivors() {
        let mut t = MinimaTree::new(DefaultOrder::<u64>::new());
        t.resize(2);
        t.update(0, Some(7));
        t.update(1, Some(3));
        t.resize(8);
        assert_eq!(t.winner(), Some((1, 3)));
        t.resize(1);
        assert_eq!(t.winner(), Some((0, 7)));
    }
}
