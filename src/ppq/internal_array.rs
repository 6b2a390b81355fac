//! Immutable sorted runs held in RAM.

use crate::storage::Pod;

/// A sorted run with a read cursor. Elements before the cursor count as
/// extracted; the remainder is ascending.
pub(crate) struct InternalArray<V: Pod> {
    data: Vec<V>,
    index: usize,
}

impl<V: Pod> InternalArray<V> {
    pub fn new(sorted: Vec<V>) -> Self {
        debug_assert!(!sorted.is_empty());
        Self {
            data: sorted,
            index: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.index
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index == self.data.len()
    }

    /// Total run length including extracted elements; the array's RAM share.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn first(&self) -> &V {
        &self.data[self.index]
    }

    #[inline]
    pub fn last(&self) -> &V {
        &self.data[self.data.len() - 1]
    }

    #[inline]
    pub fn remaining(&self) -> &[V] {
        &self.data[self.index..]
    }

    #[inline]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.index += n;
    }
}
