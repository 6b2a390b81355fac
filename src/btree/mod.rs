//! Ordered map over fixed-size blocks.
//!
//! Leaves hold sorted `(key, data)` entries and form a doubly-linked list;
//! internal nodes route by separator keys. Both levels live in bounded
//! node caches with pinning and write-back. Live cursors stay valid across
//! splits, fuses and balances through the tree's iterator map.

mod iterator;
mod leaf;
mod node;
mod node_cache;

use std::sync::{Arc, Mutex as StdMutex};

use parking_lot::Mutex;
use tracing::debug;

use crate::common::ValueOrder;
use crate::error::{ExtError, Result};
use crate::storage::{Bid, Pod, RandomCyclic};
use crate::Runtime;

use iterator::{CursorRef, CursorState, IterMap};
use leaf::LeafNode;
use node::{InnerNode, Router};
use node_cache::{CacheableNode, NodeCache};

/// One stored pair. `#[repr(C)]` so leaf blocks have a stable layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Entry<K, D> {
    pub key: K,
    pub data: D,
}

unsafe impl<K: Pod, D: Pod> Pod for Entry<K, D> {}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct BTreeConfig {
    pub leaf_block_size: usize,
    pub node_block_size: usize,
    pub leaf_cache_bytes: usize,
    pub node_cache_bytes: usize,
    /// Look ahead to sibling leaves on cursor traversal.
    pub prefetching: bool,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            leaf_block_size: 16 * 1024,
            node_block_size: 16 * 1024,
            leaf_cache_bytes: 64 * 16 * 1024,
            node_cache_bytes: 64 * 16 * 1024,
            prefetching: true,
        }
    }
}

// ============================================================================
// Tree core
// ============================================================================

struct TreeCore<K: Pod, D: Pod, C: ValueOrder<K>> {
    cmp: C,
    cfg: BTreeConfig,
    leaf_cache: NodeCache<LeafNode<K, D>>,
    node_cache: NodeCache<InnerNode<K>>,
    root: Bid,
    /// Levels in the tree; 1 means the root is a leaf.
    height: usize,
    size: usize,
    head_leaf: Bid,
    tail_leaf: Bid,
    iter_map: IterMap,
}

/// Ordered external-memory map.
pub struct BTree<K: Pod, D: Pod, C: ValueOrder<K>> {
    core: Arc<Mutex<TreeCore<K, D, C>>>,
}

/// A stable position in a [`BTree`], kept consistent across mutations.
pub struct Cursor<K: Pod, D: Pod, C: ValueOrder<K>> {
    core: Arc<Mutex<TreeCore<K, D, C>>>,
    state: CursorRef,
}

impl<K: Pod, D: Pod, C: ValueOrder<K>> BTree<K, D, C> {
    pub fn new(rt: Arc<Runtime>, cmp: C, cfg: BTreeConfig) -> Result<Self> {
        cmp.validate()?;
        if LeafNode::<K, D>::max_size(cfg.leaf_block_size) < 4
            || InnerNode::<K>::max_size(cfg.node_block_size) < 4
        {
            return Err(ExtError::Config("block size too small for 4 entries".into()));
        }
        let mut leaf_cache = NodeCache::new(
            Arc::clone(&rt),
            cfg.leaf_block_size,
            cfg.leaf_cache_bytes,
            Arc::new(RandomCyclic::new()),
        )?;
        let node_cache = NodeCache::new(
            Arc::clone(&rt),
            cfg.node_block_size,
            cfg.node_cache_bytes,
            Arc::new(RandomCyclic::new()),
        )?;
        let (root, _) = leaf_cache.get_new_node()?;
        Ok(Self {
            core: Arc::new(Mutex::new(TreeCore {
                cmp,
                cfg,
                leaf_cache,
                node_cache,
                root,
                height: 1,
                size: 0,
                head_leaf: root,
                tail_leaf: root,
                iter_map: IterMap::default(),
            })),
        })
    }

    pub fn len(&self) -> usize {
        self.core.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> usize {
        self.core.lock().height
    }

    /// Insert `(key, data)`. Returns true for a new key; an existing key
    /// has its data overwritten and false is returned.
    pub fn insert(&self, key: K, data: D) -> Result<bool> {
        let mut core = self.core.lock();
        core.insert(key, data)
    }

    /// Remove `key`; returns whether it was present.
    pub fn erase(&self, key: &K) -> Result<bool> {
        let mut core = self.core.lock();
        core.erase(key)
    }

    pub fn find(&self, key: &K) -> Result<Option<D>> {
        let mut core = self.core.lock();
        let (bid, pos) = core.locate_lower_bound(key)?;
        if !bid.valid() {
            return Ok(None);
        }
        let leaf_arc = core.leaf_cache.get_const_node(bid, false)?;
        let leaf = leaf_arc.read();
        if pos < leaf.len() && !core.cmp.less(key, &leaf.entries[pos].key) {
            Ok(Some(leaf.entries[pos].data))
        } else {
            Ok(None)
        }
    }

    /// Cursor at the first entry with key `>= key` (end if none).
    pub fn lower_bound(&self, key: &K) -> Result<Cursor<K, D, C>> {
        let mut core = self.core.lock();
        let (bid, pos) = core.locate_lower_bound(key)?;
        Ok(self.make_cursor(&mut core, CursorState { bid, pos }))
    }

    /// Cursor at the first entry with key `> key` (end if none).
    pub fn upper_bound(&self, key: &K) -> Result<Cursor<K, D, C>> {
        let mut core = self.core.lock();
        let (bid, pos) = core.locate_upper_bound(key)?;
        Ok(self.make_cursor(&mut core, CursorState { bid, pos }))
    }

    /// Cursor at the smallest entry (end if the tree is empty).
    pub fn begin(&self) -> Result<Cursor<K, D, C>> {
        let mut core = self.core.lock();
        let state = if core.size == 0 {
            CursorState::end()
        } else {
            CursorState {
                bid: core.head_leaf,
                pos: 0,
            }
        };
        Ok(self.make_cursor(&mut core, state))
    }

    fn make_cursor(
        &self,
        core: &mut TreeCore<K, D, C>,
        state: CursorState,
    ) -> Cursor<K, D, C> {
        let state = Arc::new(StdMutex::new(state));
        core.iter_map.register(&state);
        Cursor {
            core: Arc::clone(&self.core),
            state,
        }
    }

    /// Remove every entry, freeing all blocks except a fresh empty root
    /// leaf. Live cursors move to end.
    pub fn clear(&self) -> Result<()> {
        let mut core = self.core.lock();
        core.clear()
    }
}

// ============================================================================
// Core operations
// ============================================================================

impl<K: Pod, D: Pod, C: ValueOrder<K>> TreeCore<K, D, C> {
    fn max_leaf(&self) -> usize {
        LeafNode::<K, D>::max_size(self.cfg.leaf_block_size)
    }

    fn min_leaf(&self) -> usize {
        LeafNode::<K, D>::min_size(self.cfg.leaf_block_size)
    }

    fn max_node(&self) -> usize {
        InnerNode::<K>::max_size(self.cfg.node_block_size)
    }

    fn min_node(&self) -> usize {
        InnerNode::<K>::min_size(self.cfg.node_block_size)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Descend to the leaf that may contain `key`.
    fn locate_leaf(&mut self, key: &K) -> Result<Bid> {
        let mut bid = self.root;
        for _ in (2..=self.height).rev() {
            let node_arc = self.node_cache.get_const_node(bid, false)?;
            let node = node_arc.read();
            bid = node.entries[node.child_index(&self.cmp, key)].child;
        }
        Ok(bid)
    }

    fn locate_lower_bound(&mut self, key: &K) -> Result<(Bid, usize)> {
        let leaf_bid = self.locate_leaf(key)?;
        let leaf_arc = self.leaf_cache.get_const_node(leaf_bid, false)?;
        let leaf = leaf_arc.read();
        let pos = leaf.lower_bound(&self.cmp, key);
        if pos < leaf.len() {
            return Ok((leaf_bid, pos));
        }
        let succ = leaf.succ;
        Ok(if succ.valid() { (succ, 0) } else { (Bid::INVALID, 0) })
    }

    fn locate_upper_bound(&mut self, key: &K) -> Result<(Bid, usize)> {
        let leaf_bid = self.locate_leaf(key)?;
        let leaf_arc = self.leaf_cache.get_const_node(leaf_bid, false)?;
        let leaf = leaf_arc.read();
        let pos = leaf.upper_bound(&self.cmp, key);
        if pos < leaf.len() {
            return Ok((leaf_bid, pos));
        }
        let succ = leaf.succ;
        Ok(if succ.valid() { (succ, 0) } else { (Bid::INVALID, 0) })
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    fn insert(&mut self, key: K, data: D) -> Result<bool> {
        let root = self.root;
        let height = self.height;
        let (split, inserted) = self.insert_rec(root, height, key, data)?;
        if let Some((sep, new_child)) = split {
            let (root_bid, root_arc) = self.node_cache.get_new_node()?;
            {
                let mut r = root_arc.write();
                r.entries.push(Router {
                    sep,
                    child: new_child,
                });
                r.entries.push(Router {
                    sep: self.cmp.max_value(),
                    child: self.root,
                });
            }
            debug!(height = self.height + 1, "root split, tree grew");
            self.root = root_bid;
            self.height += 1;
        }
        if inserted {
            self.size += 1;
        }
        Ok(inserted)
    }

    /// Returns `(splitter, inserted)`; the splitter names a freshly split
    /// left sibling that the parent must route to.
    fn insert_rec(
        &mut self,
        bid: Bid,
        height: usize,
        key: K,
        data: D,
    ) -> Result<(Option<(K, Bid)>, bool)> {
        if height == 1 {
            return self.leaf_insert(bid, key, data);
        }
        let node_arc = self.node_cache.get_node(bid, true)?;
        let (child, child_idx) = {
            let node = node_arc.read();
            let i = node.child_index(&self.cmp, &key);
            (node.entries[i].child, i)
        };
        let result = self.insert_rec(child, height - 1, key, data);
        let (split, inserted) = match result {
            Ok(v) => v,
            Err(e) => {
                self.node_cache.unfix_node(bid);
                return Err(e);
            }
        };
        let mut promote = None;
        if let Some((sep, new_child)) = split {
            let mut node = node_arc.write();
            node.entries.insert(
                child_idx,
                Router {
                    sep,
                    child: new_child,
                },
            );
            if node.len() > self.max_node() {
                let h = node.len() / 2;
                let left: Vec<Router<K>> = node.entries.drain(..h).collect();
                let splitter = left[h - 1].sep;
                drop(node);
                let (new_bid, new_arc) = self.node_cache.get_new_node()?;
                new_arc.write().entries = left;
                promote = Some((splitter, new_bid));
            }
        }
        self.node_cache.unfix_node(bid);
        Ok((promote, inserted))
    }

    fn leaf_insert(&mut self, bid: Bid, key: K, data: D) -> Result<(Option<(K, Bid)>, bool)> {
        let leaf_arc = self.leaf_cache.get_node(bid, true)?;
        let mut leaf = leaf_arc.write();
        let pos = leaf.lower_bound(&self.cmp, &key);
        if pos < leaf.len() && !self.cmp.less(&key, &leaf.entries[pos].key) {
            leaf.entries[pos].data = data;
            drop(leaf);
            self.leaf_cache.unfix_node(bid);
            return Ok((None, false));
        }
        leaf.entries.insert(pos, Entry { key, data });
        self.iter_map.apply(bid, |st| {
            if st.pos >= pos {
                st.pos += 1;
            }
        });
        if leaf.len() <= self.max_leaf() {
            drop(leaf);
            self.leaf_cache.unfix_node(bid);
            return Ok((None, true));
        }

        // Split: a new left sibling takes the lower half.
        let h = leaf.len() / 2;
        let lower: Vec<Entry<K, D>> = leaf.entries.drain(..h).collect();
        let splitter = lower[h - 1].key;
        let old_pred = leaf.pred;
        drop(leaf);

        let (new_bid, new_arc) = self.leaf_cache.get_new_node()?;
        {
            let mut new_leaf = new_arc.write();
            new_leaf.entries = lower;
            new_leaf.pred = old_pred;
            new_leaf.succ = bid;
        }
        leaf_arc.write().pred = new_bid;
        if old_pred.valid() {
            let pred_arc = self.leaf_cache.get_node(old_pred, false)?;
            pred_arc.write().succ = new_bid;
        } else {
            self.head_leaf = new_bid;
        }
        self.iter_map.apply(bid, |st| {
            if st.pos < h {
                st.bid = new_bid;
            } else {
                st.pos -= h;
            }
        });
        self.leaf_cache.unfix_node(bid);
        Ok((Some((splitter, new_bid)), true))
    }

    // ------------------------------------------------------------------
    // Erase
    // ------------------------------------------------------------------

    fn erase(&mut self, key: &K) -> Result<bool> {
        let root = self.root;
        let height = self.height;
        let (removed, _) = self.erase_rec(root, height, key, true)?;
        if removed {
            self.size -= 1;
        }
        // A root node with a single child shrinks the tree.
        while self.height > 1 {
            let root_arc = self.node_cache.get_const_node(self.root, false)?;
            let (len, only_child) = {
                let r = root_arc.read();
                (r.len(), r.entries[0].child)
            };
            if len > 1 {
                break;
            }
            let old = self.root;
            self.node_cache.delete_node(old)?;
            self.root = only_child;
            self.height -= 1;
            debug!(height = self.height, "root collapsed, tree shrank");
        }
        Ok(removed)
    }

    /// Returns `(removed, this node underflowed)`.
    fn erase_rec(
        &mut self,
        bid: Bid,
        height: usize,
        key: &K,
        is_root: bool,
    ) -> Result<(bool, bool)> {
        if height == 1 {
            return self.leaf_erase(bid, key, is_root);
        }
        let node_arc = self.node_cache.get_node(bid, true)?;
        let (child, child_idx) = {
            let node = node_arc.read();
            let i = node.child_index(&self.cmp, key);
            (node.entries[i].child, i)
        };
        let result = self.erase_rec(child, height - 1, key, false);
        let (removed, child_underflow) = match result {
            Ok(v) => v,
            Err(e) => {
                self.node_cache.unfix_node(bid);
                return Err(e);
            }
        };
        if child_underflow {
            if let Err(e) = self.fuse_or_balance(&node_arc, child_idx, height) {
                self.node_cache.unfix_node(bid);
                return Err(e);
            }
        }
        let underflow = !is_root && node_arc.read().len() < self.min_node();
        self.node_cache.unfix_node(bid);
        Ok((removed, underflow))
    }

    fn leaf_erase(&mut self, bid: Bid, key: &K, is_root: bool) -> Result<(bool, bool)> {
        let leaf_arc = self.leaf_cache.get_node(bid, true)?;
        let mut leaf = leaf_arc.write();
        let pos = leaf.lower_bound(&self.cmp, key);
        if pos >= leaf.len() || self.cmp.less(key, &leaf.entries[pos].key) {
            drop(leaf);
            self.leaf_cache.unfix_node(bid);
            return Ok((false, false));
        }
        leaf.entries.remove(pos);
        let new_len = leaf.len();
        let succ = leaf.succ;
        drop(leaf);
        // A cursor on the erased entry now names its successor; one that
        // ran off the leaf end moves to the next leaf (or to end).
        self.iter_map.apply(bid, |st| {
            if st.pos > pos {
                st.pos -= 1;
            }
            if st.pos >= new_len {
                if succ.valid() {
                    st.bid = succ;
                    st.pos -= new_len;
                } else {
                    *st = CursorState::end();
                }
            }
        });
        let underflow = !is_root && new_len < self.min_leaf();
        self.leaf_cache.unfix_node(bid);
        Ok((true, underflow))
    }

    /// Re-legalize the under-full child at `child_idx` of `parent` by
    /// redistributing with a sibling, or merging when both halves fit.
    /// `height` is the parent's level.
    fn fuse_or_balance(
        &mut self,
        parent: &Arc<parking_lot::RwLock<InnerNode<K>>>,
        child_idx: usize,
        height: usize,
    ) -> Result<()> {
        let (li, ri) = {
            let p = parent.read();
            debug_assert!(p.len() >= 2, "sole child cannot be rebalanced");
            if child_idx > 0 {
                (child_idx - 1, child_idx)
            } else {
                (child_idx, child_idx + 1)
            }
        };
        let (left_bid, right_bid) = {
            let p = parent.read();
            (p.entries[li].child, p.entries[ri].child)
        };
        if height - 1 == 1 {
            self.fuse_or_balance_leaves(parent, li, ri, left_bid, right_bid)
        } else {
            self.fuse_or_balance_nodes(parent, li, ri, left_bid, right_bid)
        }
    }

    fn fuse_or_balance_leaves(
        &mut self,
        parent: &Arc<parking_lot::RwLock<InnerNode<K>>>,
        li: usize,
        _ri: usize,
        left_bid: Bid,
        right_bid: Bid,
    ) -> Result<()> {
        let left_arc = self.leaf_cache.get_node(left_bid, true)?;
        let right_arc = self.leaf_cache.get_node(right_bid, true)?;
        let result = (|| -> Result<()> {
            let mut left = left_arc.write();
            let mut right = right_arc.write();
            let (l, r) = (left.len(), right.len());
            if l + r <= self.max_leaf() {
                // Fuse: prepend left into right, drop left.
                let mut moved = std::mem::take(&mut left.entries);
                moved.extend(right.entries.drain(..));
                right.entries = moved;
                right.pred = left.pred;
                let left_pred = left.pred;
                drop(left);
                drop(right);
                self.iter_map.apply(right_bid, |st| st.pos += l);
                self.iter_map.apply(left_bid, |st| st.bid = right_bid);
                if left_pred.valid() {
                    let pred_arc = self.leaf_cache.get_node(left_pred, false)?;
                    pred_arc.write().succ = right_bid;
                } else {
                    self.head_leaf = right_bid;
                }
                parent.write().entries.remove(li);
                self.leaf_cache.unfix_node(left_bid);
                self.leaf_cache.unfix_node(right_bid);
                self.leaf_cache.delete_node(left_bid)?;
                return Ok(());
            }
            // Balance to equal halves.
            let target_left = (l + r) / 2;
            if l > target_left {
                // Move the tail of left to the front of right.
                let m = l - target_left;
                let moved: Vec<Entry<K, D>> = left.entries.drain(l - m..).collect();
                let mut new_right = moved;
                new_right.extend(right.entries.drain(..));
                right.entries = new_right;
                let left_len = left.len();
                drop(left);
                drop(right);
                self.iter_map.apply(right_bid, |st| st.pos += m);
                self.iter_map.apply(left_bid, |st| {
                    if st.pos >= left_len {
                        st.bid = right_bid;
                        st.pos -= left_len;
                    }
                });
            } else {
                // Move the front of right to the tail of left.
                let m = target_left - l;
                let moved: Vec<Entry<K, D>> = right.entries.drain(..m).collect();
                left.entries.extend(moved);
                drop(left);
                drop(right);
                self.iter_map.apply(right_bid, |st| {
                    if st.pos < m {
                        st.bid = left_bid;
                        st.pos += l;
                    } else {
                        st.pos -= m;
                    }
                });
            }
            // The left child's separator follows its new maximum.
            let new_sep = left_arc.read().entries.last().expect("balanced leaf").key;
            parent.write().entries[li].sep = new_sep;
            self.leaf_cache.unfix_node(left_bid);
            self.leaf_cache.unfix_node(right_bid);
            Ok(())
        })();
        result
    }

    fn fuse_or_balance_nodes(
        &mut self,
        parent: &Arc<parking_lot::RwLock<InnerNode<K>>>,
        li: usize,
        _ri: usize,
        left_bid: Bid,
        right_bid: Bid,
    ) -> Result<()> {
        let left_arc = self.node_cache.get_node(left_bid, true)?;
        let right_arc = self.node_cache.get_node(right_bid, true)?;
        let mut left = left_arc.write();
        let mut right = right_arc.write();
        let (l, r) = (left.len(), right.len());
        if l + r <= self.max_node() {
            let mut moved = std::mem::take(&mut left.entries);
            moved.extend(right.entries.drain(..));
            right.entries = moved;
            drop(left);
            drop(right);
            parent.write().entries.remove(li);
            self.node_cache.unfix_node(left_bid);
            self.node_cache.unfix_node(right_bid);
            self.node_cache.delete_node(left_bid)?;
            return Ok(());
        }
        let target_left = (l + r) / 2;
        if l > target_left {
            let m = l - target_left;
            let moved: Vec<Router<K>> = left.entries.drain(l - m..).collect();
            let mut new_right = moved;
            new_right.extend(right.entries.drain(..));
            right.entries = new_right;
        } else {
            let m = target_left - l;
            let moved: Vec<Router<K>> = right.entries.drain(..m).collect();
            left.entries.extend(moved);
        }
        let new_sep = left.entries.last().expect("balanced node").sep;
        drop(left);
        drop(right);
        parent.write().entries[li].sep = new_sep;
        self.node_cache.unfix_node(left_bid);
        self.node_cache.unfix_node(right_bid);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn clear(&mut self) -> Result<()> {
        let root = self.root;
        let height = self.height;
        self.free_subtree(root, height)?;
        let (new_root, _) = self.leaf_cache.get_new_node()?;
        self.root = new_root;
        self.height = 1;
        self.size = 0;
        self.head_leaf = new_root;
        self.tail_leaf = new_root;
        self.iter_map.invalidate_all();
        Ok(())
    }

    fn free_subtree(&mut self, bid: Bid, height: usize) -> Result<()> {
        if height == 1 {
            return self.leaf_cache.delete_node(bid);
        }
        let children: Vec<Bid> = {
            let node_arc = self.node_cache.get_const_node(bid, false)?;
            let node = node_arc.read();
            node.entries.iter().map(|e| e.child).collect()
        };
        self.node_cache.delete_node(bid)?;
        for child in children {
            self.free_subtree(child, height - 1)?;
        }
        Ok(())
    }
}

impl<K: Pod, D: Pod, C: ValueOrder<K>> Drop for TreeCore<K, D, C> {
    fn drop(&mut self) {
        let root = self.root;
        let height = self.height;
        if self.free_subtree(root, height).is_err() {
            tracing::warn!("leaking blocks: tree teardown hit an IO error");
        }
    }
}

// ============================================================================
// Cursor
// ============================================================================

impl<K: Pod, D: Pod, C: ValueOrder<K>> Cursor<K, D, C> {
    pub fn is_end(&self) -> bool {
        self.state.lock().expect("cursor lock").is_end()
    }

    /// The entry at the cursor, without advancing.
    pub fn entry(&self) -> Result<Option<(K, D)>> {
        let mut core = self.core.lock();
        let st = *self.state.lock().expect("cursor lock");
        if st.is_end() {
            return Ok(None);
        }
        let leaf_arc = core.leaf_cache.get_const_node(st.bid, false)?;
        let leaf = leaf_arc.read();
        debug_assert!(st.pos < leaf.len(), "cursor position out of leaf");
        let e = leaf.entries[st.pos];
        Ok(Some((e.key, e.data)))
    }

    /// Return the current entry and step forward (iterator style).
    pub fn next(&mut self) -> Result<Option<(K, D)>> {
        let mut core = self.core.lock();
        let st = *self.state.lock().expect("cursor lock");
        if st.is_end() {
            return Ok(None);
        }
        let leaf_arc = core.leaf_cache.get_const_node(st.bid, false)?;
        let (entry, next_state, prefetch) = {
            let leaf = leaf_arc.read();
            let e = leaf.entries[st.pos];
            if st.pos + 1 < leaf.len() {
                (
                    e,
                    CursorState {
                        bid: st.bid,
                        pos: st.pos + 1,
                    },
                    Bid::INVALID,
                )
            } else if leaf.succ.valid() {
                (
                    e,
                    CursorState {
                        bid: leaf.succ,
                        pos: 0,
                    },
                    leaf.succ,
                )
            } else {
                (e, CursorState::end(), Bid::INVALID)
            }
        };
        if core.cfg.prefetching && prefetch.valid() {
            // Look one leaf ahead of the one being entered.
            let succ_arc = core.leaf_cache.get_const_node(prefetch, false)?;
            let ahead = succ_arc.read().succ;
            if ahead.valid() {
                core.leaf_cache.prefetch_node(ahead)?;
            }
        }
        let old_bid = st.bid;
        *self.state.lock().expect("cursor lock") = next_state;
        if next_state.bid.valid() && next_state.bid != old_bid {
            core.iter_map.rehome(old_bid, &self.state);
        }
        Ok(Some((entry.key, entry.data)))
    }

    /// Step backward and return the entry stepped onto. From end, steps to
    /// the last entry.
    pub fn prev(&mut self) -> Result<Option<(K, D)>> {
        let mut core = self.core.lock();
        let st = *self.state.lock().expect("cursor lock");
        let new_state = if st.is_end() {
            if core.size == 0 {
                return Ok(None);
            }
            let tail = core.tail_leaf;
            let leaf_arc = core.leaf_cache.get_const_node(tail, false)?;
            let len = leaf_arc.read().len();
            if len == 0 {
                return Ok(None);
            }
            CursorState {
                bid: tail,
                pos: len - 1,
            }
        } else if st.pos > 0 {
            CursorState {
                bid: st.bid,
                pos: st.pos - 1,
            }
        } else {
            let leaf_arc = core.leaf_cache.get_const_node(st.bid, false)?;
            let pred = leaf_arc.read().pred;
            if !pred.valid() {
                return Ok(None);
            }
            let pred_arc = core.leaf_cache.get_const_node(pred, false)?;
            let len = pred_arc.read().len();
            CursorState {
                bid: pred,
                pos: len - 1,
            }
        };
        let old_bid = st.bid;
        *self.state.lock().expect("cursor lock") = new_state;
        if new_state.bid != old_bid {
            core.iter_map.rehome(old_bid, &self.state);
        }
        let leaf_arc = core.leaf_cache.get_const_node(new_state.bid, false)?;
        let e = leaf_arc.read().entries[new_state.pos];
        Ok(Some((e.key, e.data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DefaultOrder;
    use crate::test_util::runtime;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    /// Small blocks and caches so a few thousand keys build a real
    /// multi-level tree with eviction traffic.
    fn small_cfg() -> BTreeConfig {
        BTreeConfig {
            leaf_block_size: 512,
            node_block_size: 512,
            leaf_cache_bytes: 8 * 512,
            node_cache_bytes: 8 * 512,
            prefetching: true,
        }
    }

    fn tree(rt: Arc<Runtime>) -> BTree<u64, u64, DefaultOrder<u64>> {
        BTree::new(rt, DefaultOrder::new(), small_cfg()).unwrap()
    }

    #[test]
    fn insert_find_erase_round_trip() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let t = tree(rt);
        let n = 5000u64;
        let mut keys: Vec<u64> = (0..n).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(7));
        for &k in &keys {
            assert!(t.insert(k, k * 10).unwrap());
        }
        assert_eq!(t.len(), n as usize);
        assert!(t.height() > 2, "tree must have internal levels");
        for k in 0..n {
            assert_eq!(t.find(&k).unwrap(), Some(k * 10), "key {k}");
        }
        assert_eq!(t.find(&n).unwrap(), None);

        for &k in keys.iter().filter(|k| *k % 2 == 1) {
            assert!(t.erase(&k).unwrap());
        }
        assert_eq!(t.len(), (n / 2) as usize);
        for k in 0..n {
            let expect = (k % 2 == 0).then_some(k * 10);
            assert_eq!(t.find(&k).unwrap(), expect, "key {k}");
        }
    }

    #[test]
    fn iteration_is_sorted_and_complete() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let t = tree(rt);
        let mut keys: Vec<u64> = (0..3000).map(|i| i * 3).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(11));
        for &k in &keys {
            t.insert(k, k + 1).unwrap();
        }
        let mut cur = t.begin().unwrap();
        let mut seen = Vec::new();
        while let Some((k, d)) = cur.next().unwrap() {
            assert_eq!(d, k + 1);
            seen.push(k);
        }
        assert_eq!(seen, (0..3000).map(|i| i * 3).collect::<Vec<u64>>());
    }

    #[test]
    fn lower_and_upper_bound() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let t = tree(rt);
        for k in (0..2000u64).map(|i| i * 2) {
            t.insert(k, 0).unwrap();
        }
        let mut cur = t.lower_bound(&1001).unwrap();
        assert_eq!(cur.next().unwrap().unwrap().0, 1002);
        let mut cur = t.lower_bound(&1002).unwrap();
        assert_eq!(cur.next().unwrap().unwrap().0, 1002);
        let mut cur = t.upper_bound(&1002).unwrap();
        assert_eq!(cur.next().unwrap().unwrap().0, 1004);
        let cur = t.lower_bound(&1_000_000).unwrap();
        assert!(cur.is_end());

        // Everything before the bound is smaller.
        let mut cur = t.lower_bound(&777).unwrap();
        let (first, _) = cur.entry().unwrap().unwrap();
        assert!(first >= 777);
        assert_eq!(cur.prev().unwrap().map(|e| e.0), Some(first - 2));
    }

    #[test]
    fn cursors_survive_splits_and_fuses() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let t = tree(rt);
        for k in 0..200u64 {
            t.insert(k * 2, k).unwrap();
        }
        // Park a cursor on key 100, then churn around it.
        let mut cur = t.lower_bound(&100).unwrap();
        assert_eq!(cur.entry().unwrap().unwrap().0, 100);
        for k in 0..200u64 {
            t.insert(k * 2 + 1, 0).unwrap();
        }
        assert_eq!(cur.entry().unwrap().unwrap().0, 100);
        for k in 0..100u64 {
            t.erase(&(k * 4 + 1)).unwrap();
        }
        assert_eq!(cur.entry().unwrap().unwrap().0, 100);
        // Erase the entry under the cursor: it slides to the successor
        // (101 itself went away in the churn above).
        t.erase(&100).unwrap();
        assert_eq!(cur.entry().unwrap().unwrap().0, 102);
        assert_eq!(cur.next().unwrap().map(|e| e.0), Some(102));
    }

    #[test]
    fn erase_everything_collapses_the_tree() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let before = rt.block_manager().current_allocation();
        let t = tree(Arc::clone(&rt));
        for k in 0..4000u64 {
            t.insert(k, k).unwrap();
        }
        for k in 0..4000u64 {
            assert!(t.erase(&k).unwrap(), "key {k}");
        }
        assert_eq!(t.len(), 0);
        assert_eq!(t.height(), 1);
        assert!(t.begin().unwrap().is_end());
        drop(t);
        assert_eq!(rt.block_manager().current_allocation(), before);
    }

    #[test]
    fn clear_invalidates_cursors_and_frees_blocks() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let t = tree(Arc::clone(&rt));
        for k in 0..1000u64 {
            t.insert(k, k).unwrap();
        }
        let cur = t.begin().unwrap();
        t.clear().unwrap();
        assert!(cur.is_end());
        assert_eq!(t.len(), 0);
        t.insert(5, 50).unwrap();
        assert_eq!(t.find(&5).unwrap(), Some(50));
    }
}
