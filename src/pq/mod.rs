//! Classical external priority queue (sequence heap).
//!
//! Layered architecture: a bounded insert heap feeds fixed-size segments
//! into a hierarchy of internal loser trees and external mergers; a delete
//! buffer at the top serves `top`/`pop`, refilled from per-level group
//! buffers. The refill of the delete buffer merges the up-to-4 highest
//! non-empty group buffers through dedicated 2/3/4-way routines; a fifth
//! simultaneously non-empty level is a documented hard limit.

mod heap;

pub use heap::InsertHeap;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{sort_values, ValueOrder};
use crate::error::{ExtError, Result};
use crate::merge::{merge2, merge3, merge4, ExtMerger, LoserTree};
use crate::pool::ReadWritePool;
use crate::storage::{Pod, Striping};
use crate::Runtime;

/// Runtime parameters of a [`SequenceHeap`].
#[derive(Debug, Clone)]
pub struct PqConfig {
    /// Segment size `N`: insert-heap bound and group-buffer size.
    pub insert_heap_size: usize,

    /// Delete-buffer size `D` (`D <= N`).
    pub delete_buffer_size: usize,

    /// Merger arity per internal level (power of two).
    pub arity_int: usize,

    /// Merger arity per external level (power of two).
    pub arity_ext: usize,

    pub num_int_levels: usize,

    pub num_ext_levels: usize,

    /// Raw size of external-merger blocks.
    pub raw_block_size: usize,

    pub prefetch_buffers: usize,

    pub write_buffers: usize,
}

impl Default for PqConfig {
    fn default() -> Self {
        Self {
            insert_heap_size: 4096,
            delete_buffer_size: 64,
            arity_int: 64,
            arity_ext: 64,
            num_int_levels: 2,
            num_ext_levels: 3,
            raw_block_size: 128 * 1024,
            prefetch_buffers: 2,
            write_buffers: 4,
        }
    }
}

pub struct SequenceHeap<V: Pod, C: ValueOrder<V>> {
    cmp: C,
    cfg: PqConfig,
    insert_heap: InsertHeap<V, C>,
    /// Right-aligned: live elements in `[db_cur..D)`, sentinel at `D`.
    delete_buffer: Vec<V>,
    db_cur: usize,
    /// One per level, right-aligned like the delete buffer, sentinel at `N`.
    group_buffers: Vec<Vec<V>>,
    gb_cur: Vec<usize>,
    int_mergers: Vec<LoserTree<V, C>>,
    ext_mergers: Vec<ExtMerger<V, C>>,
    active_levels: usize,
    /// Elements in mergers and group buffers (excludes insert heap and
    /// delete buffer).
    size_: usize,
}

impl<V: Pod, C: ValueOrder<V>> SequenceHeap<V, C> {
    pub fn new(rt: Arc<Runtime>, cmp: C, cfg: PqConfig) -> Result<Self> {
        cmp.validate()?;
        if cfg.delete_buffer_size == 0 || cfg.delete_buffer_size > cfg.insert_heap_size {
            return Err(ExtError::Config(
                "delete buffer must be non-empty and at most the segment size".into(),
            ));
        }
        if cfg.num_int_levels == 0 || cfg.num_ext_levels == 0 {
            return Err(ExtError::Config("at least one level of each kind".into()));
        }
        // Merger 0 absorbs the drained group buffers after a deep cascade,
        // one run per level plus the fresh segment.
        if cfg.arity_int < cfg.num_int_levels + cfg.num_ext_levels + 1 {
            return Err(ExtError::Config(
                "internal merger arity must exceed the level count".into(),
            ));
        }
        let n = cfg.insert_heap_size;
        let sentinel = cmp.max_value();
        let pool = Arc::new(Mutex::new(ReadWritePool::new(
            Arc::clone(&rt),
            cfg.raw_block_size,
            cfg.prefetch_buffers,
            cfg.write_buffers,
        )));
        let int_mergers = (0..cfg.num_int_levels)
            .map(|_| LoserTree::new(cmp.clone(), cfg.arity_int))
            .collect();
        let ext_mergers = (0..cfg.num_ext_levels)
            .map(|_| {
                ExtMerger::new(
                    Arc::clone(&rt),
                    cmp.clone(),
                    cfg.raw_block_size,
                    cfg.arity_ext,
                    Arc::clone(&pool),
                    Arc::new(Striping),
                )
            })
            .collect();
        Ok(Self {
            insert_heap: InsertHeap::new(cmp.clone(), n + 1),
            delete_buffer: vec![sentinel; cfg.delete_buffer_size + 1],
            db_cur: cfg.delete_buffer_size,
            group_buffers: (0..cfg.num_int_levels + cfg.num_ext_levels)
                .map(|_| vec![sentinel; n + 1])
                .collect(),
            gb_cur: vec![n; cfg.num_int_levels + cfg.num_ext_levels],
            int_mergers,
            ext_mergers,
            active_levels: 0,
            size_: 0,
            cmp,
            cfg,
        })
    }

    fn max_levels(&self) -> usize {
        self.cfg.num_int_levels + self.cfg.num_ext_levels
    }

    pub fn len(&self) -> usize {
        self.size_ + (self.cfg.delete_buffer_size - self.db_cur) + self.insert_heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate resident bytes (buffers, heap, merger runs).
    pub fn mem_cons(&self) -> usize {
        let v = std::mem::size_of::<V>();
        let buffers = self.cfg.delete_buffer_size
            + (self.max_levels() + 1) * self.cfg.insert_heap_size;
        let merger_runs: usize = self.int_mergers.iter().map(|m| m.len()).sum();
        (buffers + merger_runs) * v
            + (self.cfg.prefetch_buffers + self.cfg.write_buffers + self.ext_mergers.len())
                * self.cfg.raw_block_size
    }

    pub fn push(&mut self, value: V) -> Result<()> {
        if self.insert_heap.is_full() {
            self.empty_insert_heap()?;
        }
        self.insert_heap.push(value);
        Ok(())
    }

    pub fn top(&self) -> Option<V> {
        let db = (self.db_cur < self.cfg.delete_buffer_size)
            .then(|| self.delete_buffer[self.db_cur]);
        let ih = self.insert_heap.top().copied();
        match (db, ih) {
            (None, None) => None,
            (Some(v), None) | (None, Some(v)) => Some(v),
            (Some(d), Some(h)) => Some(if self.cmp.less(&h, &d) { h } else { d }),
        }
    }

    pub fn pop(&mut self) -> Result<Option<V>> {
        let d = self.cfg.delete_buffer_size;
        let db_empty = self.db_cur == d;
        let heap_wins = match (db_empty, self.insert_heap.top()) {
            (true, _) => true,
            (false, None) => false,
            (false, Some(h)) => self.cmp.less(h, &self.delete_buffer[self.db_cur]),
        };
        if heap_wins {
            return Ok(self.insert_heap.pop());
        }
        let v = self.delete_buffer[self.db_cur];
        self.db_cur += 1;
        if self.db_cur == d && self.size_ > 0 {
            self.refill_delete_buffer()?;
        }
        Ok(Some(v))
    }

    // ------------------------------------------------------------------
    // Overflow cascade
    // ------------------------------------------------------------------

    /// Sort the full insert heap into a fresh segment, re-rank the delete
    /// buffer and the level-0 group buffer against it, and push the residue
    /// into the lowest level with space.
    fn empty_insert_heap(&mut self) -> Result<()> {
        let n = self.cfg.insert_heap_size;
        let d = self.cfg.delete_buffer_size;
        debug_assert_eq!(self.insert_heap.len(), n + 1);
        trace!(n, "insert heap overflow");

        let mut all = self.insert_heap.take_all();
        sort_values(&mut all, &self.cmp);
        // The largest element stays behind in the heap so the new segment
        // has exactly N elements.
        let largest = all[n];
        self.insert_heap.push(largest);
        all.truncate(n);
        all.push(self.cmp.max_value());

        // Snapshot of delete buffer + group buffer 0; both sorted, and every
        // delete-buffer element is at most every group-buffer element, so
        // the concatenation is sorted.
        let sz1 = d - self.db_cur;
        let sz2 = n - self.gb_cur[0];
        let mut temp: Vec<V> = Vec::with_capacity(sz1 + sz2 + 1);
        temp.extend_from_slice(&self.delete_buffer[self.db_cur..d]);
        temp.extend_from_slice(&self.group_buffers[0][self.gb_cur[0]..n]);
        temp.push(self.cmp.max_value());

        let mut tpos = 0usize;
        let mut spos = 0usize;

        // Re-fill the delete buffer with the globally smallest sz1.
        self.db_cur = d - sz1;
        merge2(
            &self.cmp,
            &temp,
            &mut tpos,
            &all,
            &mut spos,
            &mut self.delete_buffer[d - sz1..d],
        );
        // Then group buffer 0 with the next sz2.
        self.gb_cur[0] = n - sz2;
        merge2(
            &self.cmp,
            &temp,
            &mut tpos,
            &all,
            &mut spos,
            &mut self.group_buffers[0][n - sz2..n],
        );
        // The rest forms the new segment of exactly N elements.
        let mut seg = vec![self.cmp.max_value(); n];
        merge2(&self.cmp, &temp, &mut tpos, &all, &mut spos, &mut seg[..]);

        let free_level = self.make_space_available(0)?;
        self.int_mergers[0].insert_array(seg);

        // A deeper cascade invalidated the group buffers of the drained
        // levels; their remainders go back through merger 0.
        if free_level > 0 {
            for i in (0..=free_level.min(self.max_levels() - 1)).rev() {
                let cur = self.gb_cur[i];
                if cur < n {
                    let leftover: Vec<V> = self.group_buffers[i][cur..n].to_vec();
                    self.int_mergers[0].insert_array(leftover);
                    self.gb_cur[i] = n;
                }
            }
        }

        self.size_ += n;
        if self.db_cur == d {
            self.refill_delete_buffer()?;
        }
        Ok(())
    }

    /// Ensure level `level` can accept a segment, draining full levels
    /// upward. Returns the level where space was finally available.
    fn make_space_available(&mut self, level: usize) -> Result<usize> {
        let nil = self.cfg.num_int_levels;
        debug_assert!(level < self.max_levels());
        if level == self.active_levels {
            self.active_levels += 1;
        }
        let space = if level < nil {
            self.int_mergers[level].space_available()
        } else if level == self.max_levels() - 1 {
            true
        } else {
            self.ext_mergers[level - nil].space_available()
        };
        if space {
            return Ok(level);
        }
        let final_level = self.make_space_available(level + 1)?;
        debug!(level, final_level, "cascading full merger level");
        if level < nil - 1 {
            let seg = self.int_mergers[level].drain_all();
            self.int_mergers[level + 1].insert_array(seg);
        } else if level == nil - 1 {
            let sz = self.int_mergers[level].len();
            let (int_part, ext_part) = (&mut self.int_mergers[level], &mut self.ext_mergers[0]);
            ext_part.append_merger(int_part, sz)?;
        } else {
            let idx = level - nil;
            let (lower, upper) = self.ext_mergers.split_at_mut(idx + 1);
            let sz = lower[idx].len();
            upper[0].append_ext_merger(&mut lower[idx], sz)?;
        }
        Ok(final_level)
    }

    // ------------------------------------------------------------------
    // Buffer refilling
    // ------------------------------------------------------------------

    /// Refill `group_buffers[j]` from its merger; returns the number of
    /// elements now buffered.
    fn refill_group_buffer(&mut self, j: usize) -> Result<usize> {
        let n = self.cfg.insert_heap_size;
        let nil = self.cfg.num_int_levels;
        let tree_size = if j < nil {
            self.int_mergers[j].len()
        } else {
            self.ext_mergers[j - nil].len()
        };
        let buffer_size = n - self.gb_cur[j];
        let (old_target, delete_size) = if tree_size + buffer_size >= n {
            (0, n - buffer_size)
        } else {
            (n - tree_size - buffer_size, tree_size)
        };
        if delete_size > 0 {
            let cur = self.gb_cur[j];
            self.group_buffers[j].copy_within(cur..n, old_target);
            self.gb_cur[j] = old_target;
            let fill = old_target + buffer_size..old_target + buffer_size + delete_size;
            if j < nil {
                self.int_mergers[j].multi_merge(&mut self.group_buffers[j][fill]);
            } else {
                self.ext_mergers[j - nil].multi_merge(&mut self.group_buffers[j][fill])?;
            }
        }
        Ok(delete_size + buffer_size)
    }

    /// Refill the delete buffer from the highest non-empty group buffers.
    fn refill_delete_buffer(&mut self) -> Result<()> {
        let n = self.cfg.insert_heap_size;
        let d = self.cfg.delete_buffer_size;
        let mut total = 0usize;
        for i in (0..self.active_levels).rev() {
            if n - self.gb_cur[i] < d {
                let length = self.refill_group_buffer(i)?;
                if length == 0 && i + 1 == self.active_levels {
                    self.active_levels -= 1;
                } else {
                    total += length;
                }
            } else {
                // Already enough buffered; a sufficient lower bound.
                total += d;
            }
        }

        let length = if total >= d {
            self.size_ -= d;
            d
        } else {
            debug_assert_eq!(self.size_, total);
            self.size_ = 0;
            total
        };
        self.db_cur = d - length;
        let out_range = d - length..d;

        match self.active_levels {
            0 => {}
            1 => {
                let cur = self.gb_cur[0];
                let (src, dst) = (cur..cur + length, out_range);
                let tmp: Vec<V> = self.group_buffers[0][src].to_vec();
                self.delete_buffer[dst].copy_from_slice(&tmp);
                self.gb_cur[0] += length;
            }
            2 => {
                let (mut c0, mut c1) = (self.gb_cur[0], self.gb_cur[1]);
                merge2(
                    &self.cmp,
                    &self.group_buffers[0],
                    &mut c0,
                    &self.group_buffers[1],
                    &mut c1,
                    &mut self.delete_buffer[out_range],
                );
                self.gb_cur[0] = c0;
                self.gb_cur[1] = c1;
            }
            3 => {
                let (mut c0, mut c1, mut c2) = (self.gb_cur[0], self.gb_cur[1], self.gb_cur[2]);
                merge3(
                    &self.cmp,
                    &self.group_buffers[0],
                    &mut c0,
                    &self.group_buffers[1],
                    &mut c1,
                    &self.group_buffers[2],
                    &mut c2,
                    &mut self.delete_buffer[out_range],
                );
                self.gb_cur[0] = c0;
                self.gb_cur[1] = c1;
                self.gb_cur[2] = c2;
            }
            4 => {
                let (mut c0, mut c1, mut c2, mut c3) = (
                    self.gb_cur[0],
                    self.gb_cur[1],
                    self.gb_cur[2],
                    self.gb_cur[3],
                );
                merge4(
                    &self.cmp,
                    &self.group_buffers[0],
                    &mut c0,
                    &self.group_buffers[1],
                    &mut c1,
                    &self.group_buffers[2],
                    &mut c2,
                    &self.group_buffers[3],
                    &mut c3,
                    &mut self.delete_buffer[out_range],
                );
                self.gb_cur[0] = c0;
                self.gb_cur[1] = c1;
                self.gb_cur[2] = c2;
                self.gb_cur[3] = c3;
            }
            _ => {
                return Err(ExtError::PreconditionViolation(
                    "more than 4 group buffers simultaneously non-empty \
                     (hard limit of the delete-buffer refill)"
                        .into(),
                ))
            }
        }
        Ok(())
    }
}
