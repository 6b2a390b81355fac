//! Internal k-way loser-tree merger.
//!
//! Merges up to `max_arity` sorted in-memory runs. Every run is terminated
//! by the comparator's `max_value()` sentinel so the merge loop needs no
//! per-step boundary tests; exhausted slots park on the sentinel and lose
//! every tournament. Ties are broken by source index, making the merge
//! stable.

use crate::common::ValueOrder;
use crate::storage::Pod;

struct Entry<V> {
    index: usize,
    key: V,
}

struct Seq<V> {
    data: Vec<V>,
    pos: usize,
}

impl<V: Pod> Seq<V> {
    fn empty(sentinel: V) -> Self {
        Self {
            data: vec![sentinel],
            pos: 0,
        }
    }

    #[inline]
    fn current(&self) -> &V {
        &self.data[self.pos]
    }

    /// Exhausted means the cursor sits on the trailing sentinel.
    #[inline]
    fn exhausted(&self) -> bool {
        self.pos + 1 == self.data.len()
    }
}

pub struct LoserTree<V: Pod, C: ValueOrder<V>> {
    cmp: C,
    k: usize,
    max_arity: usize,
    /// `entries[0]` holds the current winner; `entries[1..k]` the losers.
    entries: Vec<Entry<V>>,
    seqs: Vec<Seq<V>>,
    free_slots: Vec<usize>,
    size: usize,
}

impl<V: Pod, C: ValueOrder<V>> LoserTree<V, C> {
    pub fn new(cmp: C, max_arity: usize) -> Self {
        assert!(max_arity >= 2 && max_arity.is_power_of_two());
        let sentinel = cmp.max_value();
        Self {
            entries: vec![Entry {
                index: 0,
                key: sentinel,
            }],
            seqs: vec![Seq::empty(sentinel)],
            free_slots: vec![0],
            cmp,
            k: 1,
            max_arity,
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn arity(&self) -> usize {
        self.k
    }

    /// Whether another run can be attached.
    pub fn space_available(&self) -> bool {
        !self.free_slots.is_empty() || self.k < self.max_arity
    }

    /// `a` (key, slot) beats `b` in the tournament.
    #[inline]
    fn wins(&self, a_key: &V, a_idx: usize, b_key: &V, b_idx: usize) -> bool {
        if self.cmp.less(a_key, b_key) {
            return true;
        }
        if self.cmp.less(b_key, a_key) {
            return false;
        }
        a_idx < b_idx
    }

    fn init_winner(&mut self, root: usize) -> usize {
        if root >= self.k {
            return root - self.k;
        }
        let left = self.init_winner(2 * root);
        let right = self.init_winner(2 * root + 1);
        let lk = *self.seqs[left].current();
        let rk = *self.seqs[right].current();
        if self.wins(&lk, left, &rk, right) {
            self.entries[root] = Entry {
                index: right,
                key: rk,
            };
            left
        } else {
            self.entries[root] = Entry {
                index: left,
                key: lk,
            };
            right
        }
    }

    fn rebuild(&mut self) {
        let winner = self.init_winner(1);
        self.entries[0] = Entry {
            index: winner,
            key: *self.seqs[winner].current(),
        };
    }

    fn grow(&mut self) {
        debug_assert!(self.k < self.max_arity);
        let new_k = self.k * 2;
        let sentinel = self.cmp.max_value();
        for slot in self.k..new_k {
            self.seqs.push(Seq::empty(sentinel));
            self.free_slots.push(slot);
        }
        self.entries.resize_with(new_k, || Entry {
            index: 0,
            key: sentinel,
        });
        self.k = new_k;
        self.rebuild();
    }

    /// Rebuild with halved arity once occupancy drops below 2/5.
    fn maybe_compact(&mut self) {
        let used = self.k - self.free_slots.len();
        if self.k <= 2 || used * 5 >= self.k * 2 {
            return;
        }
        let new_k = (self.k / 2).max(used.next_power_of_two()).max(1);
        if new_k >= self.k {
            return;
        }
        let sentinel = self.cmp.max_value();
        let mut old = std::mem::take(&mut self.seqs);
        self.seqs = Vec::with_capacity(new_k);
        self.free_slots.clear();
        for seq in old.drain(..) {
            if !seq.exhausted() {
                self.seqs.push(seq);
            }
        }
        debug_assert!(self.seqs.len() <= new_k);
        while self.seqs.len() < new_k {
            self.free_slots.push(self.seqs.len());
            self.seqs.push(Seq::empty(sentinel));
        }
        self.entries.clear();
        self.entries.resize_with(new_k, || Entry {
            index: 0,
            key: sentinel,
        });
        self.k = new_k;
        self.rebuild();
    }

    /// Attach a sorted run. Panics when no slot is available; callers gate
    /// on [`space_available`](LoserTree::space_available).
    pub fn insert_array(&mut self, mut run: Vec<V>) {
        if run.is_empty() {
            return;
        }
        debug_assert!(run.windows(2).all(|w| !self.cmp.less(&w[1], &w[0])));
        while self.free_slots.is_empty() {
            assert!(self.k < self.max_arity, "merger arity exhausted");
            self.grow();
        }
        let slot = self.free_slots.pop().expect("slot available");
        self.size += run.len();
        run.push(self.cmp.max_value());
        self.seqs[slot] = Seq { data: run, pos: 0 };
        self.rebuild();
    }

    /// Merge the `out.len()` smallest elements into `out` in ascending
    /// order. Requires `out.len() <= len()`.
    pub fn multi_merge(&mut self, out: &mut [V]) {
        debug_assert!(out.len() <= self.size);
        let mut freed = false;
        for slot in out.iter_mut() {
            let winner = self.entries[0].index;
            *slot = self.entries[0].key;
            let seq = &mut self.seqs[winner];
            seq.pos += 1;
            if seq.exhausted() {
                // Drop the run's storage; the slot keeps a lone sentinel.
                self.seqs[winner] = Seq::empty(self.cmp.max_value());
                self.free_slots.push(winner);
                freed = true;
            }
            self.replay(winner);
        }
        self.size -= out.len();
        if freed {
            self.maybe_compact();
        }
    }

    fn replay(&mut self, leaf: usize) {
        let mut winner_idx = leaf;
        let mut winner_key = *self.seqs[leaf].current();
        let mut node = (leaf + self.k) / 2;
        while node > 0 {
            if self.wins(&self.entries[node].key, self.entries[node].index, &winner_key, winner_idx)
            {
                std::mem::swap(&mut self.entries[node].index, &mut winner_idx);
                std::mem::swap(&mut self.entries[node].key, &mut winner_key);
            }
            node /= 2;
        }
        self.entries[0] = Entry {
            index: winner_idx,
            key: winner_key,
        };
    }

    /// Drain everything into a vector.
    pub fn drain_all(&mut self) -> Vec<V> {
        let mut out = vec![self.cmp.max_value(); self.size];
        self.multi_merge(&mut out);
        out
    }
}

// ============================================================================
// Borrowed-slice variant
// ============================================================================

/// Loser tree over borrowed slices: the pointer-only sibling of
/// [`LoserTree`]. No elements are copied; every winner is attributed to its
/// source so callers can account consumption per slice. Used by the
/// parallel queue to merge directly over source blocks.
pub struct SliceMerger<'a, V: Pod, C: ValueOrder<V>> {
    cmp: &'a C,
    sentinel: V,
    k: usize,
    entries: Vec<Entry<V>>,
    seqs: Vec<(&'a [V], usize)>,
    remaining: usize,
}

impl<'a, V: Pod, C: ValueOrder<V>> SliceMerger<'a, V, C> {
    pub fn new(cmp: &'a C, sources: Vec<&'a [V]>) -> Self {
        let sentinel = cmp.max_value();
        let k = sources.len().next_power_of_two().max(1);
        let remaining = sources.iter().map(|s| s.len()).sum();
        let mut seqs: Vec<(&'a [V], usize)> = sources.into_iter().map(|s| (s, 0)).collect();
        seqs.resize(k, (&[], 0));
        let mut merger = Self {
            cmp,
            sentinel,
            k,
            entries: Vec::new(),
            seqs,
            remaining,
        };
        merger.entries.resize_with(k, || Entry {
            index: 0,
            key: sentinel,
        });
        let winner = merger.init_winner(1);
        merger.entries[0] = Entry {
            index: winner,
            key: merger.current(winner),
        };
        merger
    }

    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Elements already taken from source `i`.
    pub fn consumed(&self, i: usize) -> usize {
        self.seqs[i].1
    }

    #[inline]
    fn current(&self, i: usize) -> V {
        let (data, pos) = self.seqs[i];
        if pos < data.len() {
            data[pos]
        } else {
            self.sentinel
        }
    }

    #[inline]
    fn wins(&self, a_key: &V, a_idx: usize, b_key: &V, b_idx: usize) -> bool {
        if self.cmp.less(a_key, b_key) {
            return true;
        }
        if self.cmp.less(b_key, a_key) {
            return false;
        }
        a_idx < b_idx
    }

    fn init_winner(&mut self, root: usize) -> usize {
        if root >= self.k {
            return root - self.k;
        }
        let left = self.init_winner(2 * root);
        let right = self.init_winner(2 * root + 1);
        let lk = self.current(left);
        let rk = self.current(right);
        if self.wins(&lk, left, &rk, right) {
            self.entries[root] = Entry {
                index: right,
                key: rk,
            };
            left
        } else {
            self.entries[root] = Entry {
                index: left,
                key: lk,
            };
            right
        }
    }

    /// The next smallest element with its source index.
    pub fn pop(&mut self) -> Option<(usize, V)> {
        if self.remaining == 0 {
            return None;
        }
        let winner = self.entries[0].index;
        let value = self.entries[0].key;
        self.seqs[winner].1 += 1;
        self.remaining -= 1;

        let mut winner_idx = winner;
        let mut winner_key = self.current(winner);
        let mut node = (winner + self.k) / 2;
        while node > 0 {
            if self.wins(
                &self.entries[node].key,
                self.entries[node].index,
                &winner_key,
                winner_idx,
            ) {
                std::mem::swap(&mut self.entries[node].index, &mut winner_idx);
                std::mem::swap(&mut self.entries[node].key, &mut winner_key);
            }
            node /= 2;
        }
        self.entries[0] = Entry {
            index: winner_idx,
            key: winner_key,
        };
        Some((winner, value))
    }
}

// ============================================================================
// Fixed-arity merge routines
// ============================================================================
//
// Used by the sequence heap's delete-buffer refill, which merges the 2..4
// highest group buffers through bare cursors. Sources are sentinel-guarded:
// reading past the logical end yields `max_value()` and the caller never
// requests more elements than exist.

pub(crate) fn merge2<V: Pod, C: ValueOrder<V>>(
    cmp: &C,
    s0: &[V],
    p0: &mut usize,
    s1: &[V],
    p1: &mut usize,
    out: &mut [V],
) {
    for slot in out.iter_mut() {
        if cmp.le(&s0[*p0], &s1[*p1]) {
            *slot = s0[*p0];
            *p0 += 1;
        } else {
            *slot = s1[*p1];
            *p1 += 1;
        }
    }
}

pub(crate) fn merge3<V: Pod, C: ValueOrder<V>>(
    cmp: &C,
    s0: &[V],
    p0: &mut usize,
    s1: &[V],
    p1: &mut usize,
    s2: &[V],
    p2: &mut usize,
    out: &mut [V],
) {
    for slot in out.iter_mut() {
        let mut best_src = 0usize;
        let mut best = &s0[*p0];
        if cmp.less(&s1[*p1], best) {
            best = &s1[*p1];
            best_src = 1;
        }
        if cmp.less(&s2[*p2], best) {
            best_src = 2;
        }
        match best_src {
            0 => {
                *slot = s0[*p0];
                *p0 += 1;
            }
            1 => {
                *slot = s1[*p1];
                *p1 += 1;
            }
            _ => {
                *slot = s2[*p2];
                *p2 += 1;
            }
        }
    }
}

pub(crate) fn merge4<V: Pod, C: ValueOrder<V>>(
    cmp: &C,
    s0: &[V],
    p0: &mut usize,
    s1: &[V],
    p1: &mut usize,
    s2: &[V],
    p2: &mut usize,
    s3: &[V],
    p3: &mut usize,
    out: &mut [V],
) {
    for slot in out.iter_mut() {
        let mut best_src = 0usize;
        let mut best = &s0[*p0];
        if cmp.less(&s1[*p1], best) {
            best = &s1[*p1];
            best_src = 1;
        }
        if cmp.less(&s2[*p2], best) {
            best = &s2[*p2];
            best_src = 2;
        }
        if cmp.less(&s3[*p3], best) {
            best_src = 3;
        }
        match best_src {
            0 => {
                *slot = s0[*p0];
                *p0 += 1;
            }
            1 => {
                *slot = s1[*p1];
                *p1 += 1;
            }
            2 => {
                *slot = s2[*p2];
                *p2 += 1;
            }
            _ => {
                *slot = s3[*p3];
                *p3 += 1;
            }
        }
    }
}
