//! Parallel external priority queue.
//!
//! Values flow through per-worker insertion heaps into sorted internal
//! arrays; when the internal-array budget overflows, the arrays are merged
//! and streamed out as an external array with a prefetched resident prefix.
//! Extraction is served from a bounded extract buffer refilled by merging
//! the heads of every source; a winner tree per source group keeps the
//! global minimum cheap to find. Bulk pushes are concurrent across workers
//! (one heap per worker); the extract side is single-threaded.

mod external_array;
mod internal_array;
mod minima;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{par_sort_values, ValueOrder};
use crate::error::{ExtError, Result};
use crate::merge::SliceMerger;
use crate::pq::InsertHeap;
use crate::storage::Pod;
use crate::Runtime;

use external_array::ExternalArray;
use internal_array::InternalArray;
use minima::MinimaTree;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PpqConfig {
    /// Number of workers `T`; `bulk_push` partitions by worker id.
    pub num_workers: usize,

    /// Overall RAM budget in bytes: insertion heaps + internal arrays +
    /// extract buffer + per-array write/prefetch buffers.
    pub total_ram: usize,

    /// RAM bound of one insertion heap, in bytes.
    pub single_heap_ram: usize,

    /// Extract-buffer capacity, in bytes.
    pub extract_buffer_ram: usize,

    /// Raw size of external-array blocks.
    pub raw_block_size: usize,

    /// Prefetch window per external array, in blocks.
    pub num_prefetch_blocks: usize,

    /// Write buffering per external array, in blocks.
    pub num_write_buffer_blocks: usize,
}

impl Default for PpqConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().clamp(1, 8),
            total_ram: 256 << 20,
            single_heap_ram: 1 << 20,
            extract_buffer_ram: 8 << 20,
            raw_block_size: 128 * 1024,
            num_prefetch_blocks: 2,
            num_write_buffer_blocks: 4,
        }
    }
}

// ============================================================================
// Shared mutable state
// ============================================================================

struct Arrays<V: Pod> {
    ia: Vec<InternalArray<V>>,
    /// Bytes held by internal arrays (including extracted prefixes, which
    /// still occupy their allocation).
    ram_ia: usize,
    ea: Vec<ExternalArray<V>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Xb,
    Heap(usize),
    Ia(usize),
    Ea(usize),
}

// ============================================================================
// ParallelPq
// ============================================================================

pub struct ParallelPq<V: Pod, C: ValueOrder<V>> {
    rt: Arc<Runtime>,
    cmp: C,
    cfg: PpqConfig,
    heap_capacity: usize,
    xb_capacity: usize,
    ia_budget: usize,

    heaps: Vec<Mutex<InsertHeap<V, C>>>,
    arrays: Mutex<Arrays<V>>,
    count: AtomicUsize,

    // Extract side; all access is through `&mut self`.
    xb: Vec<V>,
    xb_cur: usize,
    heaps_tree: MinimaTree<V, C>,
    ia_tree: MinimaTree<V, C>,
    ea_tree: MinimaTree<V, C>,

    in_bulk: bool,
    in_limit: bool,
    limit_ub: Option<V>,
    limit_heaps: Vec<Mutex<InsertHeap<V, C>>>,

    /// Replayed on every subsequent operation once set; the index names the
    /// external array whose I/O failed.
    poison: Option<(ExtError, Option<usize>)>,
}

impl<V: Pod, C: ValueOrder<V>> ParallelPq<V, C> {
    pub fn new(rt: Arc<Runtime>, cmp: C, cfg: PpqConfig) -> Result<Self> {
        cmp.validate()?;
        let vsize = std::mem::size_of::<V>();
        if cfg.num_workers == 0 {
            return Err(ExtError::Config("at least one worker".into()));
        }
        let heap_capacity = (cfg.single_heap_ram / vsize).max(16);
        let xb_capacity = (cfg.extract_buffer_ram / vsize).max(64);
        let reserved = cfg.num_workers * cfg.single_heap_ram
            + cfg.extract_buffer_ram
            + (cfg.num_write_buffer_blocks + cfg.num_prefetch_blocks) * cfg.raw_block_size;
        let ia_budget = cfg.total_ram.checked_sub(reserved).ok_or_else(|| {
            ExtError::Config("total_ram too small for heaps, extract buffer and pools".into())
        })?;
        if ia_budget < cfg.num_workers * cfg.single_heap_ram {
            return Err(ExtError::Config(
                "internal-array budget smaller than one round of heap flushes".into(),
            ));
        }
        let mut heaps_tree = MinimaTree::new(cmp.clone());
        heaps_tree.resize(cfg.num_workers);
        Ok(Self {
            heaps: (0..cfg.num_workers)
                .map(|_| Mutex::new(InsertHeap::new(cmp.clone(), heap_capacity)))
                .collect(),
            arrays: Mutex::new(Arrays {
                ia: Vec::new(),
                ram_ia: 0,
                ea: Vec::new(),
            }),
            count: AtomicUsize::new(0),
            xb: Vec::new(),
            xb_cur: 0,
            heaps_tree,
            ia_tree: MinimaTree::new(cmp.clone()),
            ea_tree: MinimaTree::new(cmp.clone()),
            in_bulk: false,
            in_limit: false,
            limit_ub: None,
            limit_heaps: Vec::new(),
            poison: None,
            rt,
            cmp,
            heap_capacity,
            xb_capacity,
            ia_budget,
            cfg,
        })
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_workers(&self) -> usize {
        self.cfg.num_workers
    }

    pub fn num_internal_arrays(&self) -> usize {
        self.arrays.lock().ia.len()
    }

    pub fn num_external_arrays(&self) -> usize {
        self.arrays.lock().ea.len()
    }

    /// Approximate resident bytes.
    pub fn mem_cons(&self) -> usize {
        let vsize = std::mem::size_of::<V>();
        let arrays = self.arrays.lock();
        arrays.ram_ia
            + self.xb.len() * vsize
            + self.heaps.len() * self.heap_capacity * vsize
            + arrays.ea.len()
                * (self.cfg.num_prefetch_blocks + 1)
                * self.cfg.raw_block_size
    }

    fn check_poison(&self) -> Result<()> {
        match &self.poison {
            Some((err, _)) => Err(err.replay()),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Single push: a bulk of one from worker 0.
    pub fn push(&mut self, value: V) -> Result<()> {
        self.check_poison()?;
        if self.in_bulk || self.in_limit {
            return Err(ExtError::PreconditionViolation(
                "push inside a bulk or limit scope".into(),
            ));
        }
        let changed = self.insert_into_heap(0, value)?;
        self.count.fetch_add(1, Ordering::Relaxed);
        let top = self.heaps[0].lock().top().copied();
        self.heaps_tree.update(0, top);
        if changed {
            self.rebuild_array_trees();
        }
        Ok(())
    }

    /// Open a bulk-push scope. `hint` is the expected bulk size (currently
    /// only reported for tracing).
    pub fn bulk_push_begin(&mut self, hint: usize) -> Result<()> {
        self.check_poison()?;
        if self.in_bulk || self.in_limit {
            return Err(ExtError::PreconditionViolation("nested bulk scope".into()));
        }
        trace!(hint, "bulk push scope opened");
        self.in_bulk = true;
        Ok(())
    }

    /// Insert from worker `thread_id`. Concurrent across workers,
    /// non-concurrent within one worker.
    pub fn bulk_push(&self, value: V, thread_id: usize) -> Result<()> {
        if !self.in_bulk {
            return Err(ExtError::PreconditionViolation(
                "bulk_push outside a bulk scope".into(),
            ));
        }
        self.check_poison()?;
        self.insert_into_heap(thread_id, value)?;
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Barrier: publishes all workers' heap minima; `top`/`pop` become
    /// legal again.
    pub fn bulk_push_end(&mut self) -> Result<()> {
        if !self.in_bulk {
            return Err(ExtError::PreconditionViolation(
                "bulk_push_end outside a bulk scope".into(),
            ));
        }
        self.in_bulk = false;
        self.rebuild_heap_tree();
        self.rebuild_array_trees();
        Ok(())
    }

    /// Insert into worker `t`'s heap, flushing it into a fresh internal
    /// array first when full. Returns whether the array sets changed.
    fn insert_into_heap(&self, t: usize, value: V) -> Result<bool> {
        let vsize = std::mem::size_of::<V>();
        let mut heap = self.heaps[t].lock();
        let mut changed = false;
        if heap.is_full() {
            let mut run = heap.take_all();
            drop(heap);
            par_sort_values(&mut run, &self.cmp);
            let mut arrays = self.arrays.lock();
            arrays.ram_ia += run.len() * vsize;
            arrays.ia.push(InternalArray::new(run));
            if arrays.ram_ia > self.ia_budget {
                self.externalize_internal_arrays(&mut arrays)?;
            }
            changed = true;
            heap = self.heaps[t].lock();
        }
        heap.push(value);
        Ok(changed)
    }

    /// Merge every internal array into one sorted stream and write it out
    /// as a new external array.
    fn externalize_internal_arrays(&self, arrays: &mut Arrays<V>) -> Result<()> {
        let total: usize = arrays.ia.iter().map(|a| a.len()).sum();
        debug!(
            arrays = arrays.ia.len(),
            total, "externalizing internal arrays"
        );
        if total == 0 {
            arrays.ia.clear();
            arrays.ram_ia = 0;
            return Ok(());
        }
        let mut ea = ExternalArray::new(
            Arc::clone(&self.rt),
            self.cfg.raw_block_size,
            total,
            self.cfg.num_prefetch_blocks,
            self.cfg.num_write_buffer_blocks,
        )?;
        {
            let sources: Vec<&[V]> = arrays.ia.iter().map(|a| a.remaining()).collect();
            let mut merger = SliceMerger::new(&self.cmp, sources);
            while let Some((_, v)) = merger.pop() {
                ea.push_back(v)?;
            }
        }
        ea.finish_write_phase()?;
        arrays.ea.push(ea);
        arrays.ia.clear();
        arrays.ram_ia = 0;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Extraction
    // ------------------------------------------------------------------

    pub fn top(&mut self) -> Result<Option<V>> {
        self.check_poison()?;
        if self.in_bulk {
            return Err(ExtError::PreconditionViolation(
                "top inside a bulk scope".into(),
            ));
        }
        self.ensure_extract_buffer()?;
        Ok(self.peek().map(|(_, v)| v))
    }

    pub fn pop(&mut self) -> Result<Option<V>> {
        self.check_poison()?;
        if self.in_bulk {
            return Err(ExtError::PreconditionViolation(
                "pop inside a bulk scope".into(),
            ));
        }
        self.ensure_extract_buffer()?;
        let Some((source, value)) = self.peek() else {
            return Ok(None);
        };
        self.advance_source(source)?;
        self.count.fetch_sub(1, Ordering::Relaxed);
        Ok(Some(value))
    }

    /// Extract up to `n` smallest elements, ascending, into `out`.
    pub fn bulk_pop(&mut self, out: &mut Vec<V>, n: usize) -> Result<()> {
        self.check_poison()?;
        if self.in_bulk || self.in_limit {
            return Err(ExtError::PreconditionViolation(
                "bulk_pop inside a bulk or limit scope".into(),
            ));
        }
        let target = out.len() + n;
        while out.len() < target {
            // Fast path: with every heap empty nothing can undercut the
            // extract buffer, so it is copied wholesale.
            if self.xb_cur < self.xb.len() && self.heaps_tree.winner().is_none() {
                let take = (target - out.len()).min(self.xb.len() - self.xb_cur);
                out.extend_from_slice(&self.xb[self.xb_cur..self.xb_cur + take]);
                self.xb_cur += take;
                self.count.fetch_sub(take, Ordering::Relaxed);
                continue;
            }
            match self.pop()? {
                Some(v) => out.push(v),
                None => break,
            }
        }
        Ok(())
    }

    /// The current global minimum and its source group.
    fn peek(&self) -> Option<(Source, V)> {
        let mut best: Option<(Source, V)> = self
            .xb
            .get(self.xb_cur)
            .copied()
            .map(|v| (Source::Xb, v));
        for (src, cand) in [
            self.heaps_tree.winner().map(|(t, v)| (Source::Heap(t), v)),
            self.ia_tree.winner().map(|(i, v)| (Source::Ia(i), v)),
            self.ea_tree.winner().map(|(j, v)| (Source::Ea(j), v)),
        ]
        .into_iter()
        .flatten()
        {
            best = match best {
                None => Some((src, cand)),
                Some((_, cur)) if self.cmp.less(&cand, &cur) => Some((src, cand)),
                keep => keep,
            };
        }
        best.map(|(s, v)| (s, v))
    }

    fn advance_source(&mut self, source: Source) -> Result<()> {
        match source {
            Source::Xb => {
                self.xb_cur += 1;
            }
            Source::Heap(t) => {
                let mut heap = self.heaps[t].lock();
                heap.pop();
                let top = heap.top().copied();
                drop(heap);
                self.heaps_tree.update(t, top);
            }
            Source::Ia(i) => {
                let arrays = self.arrays.get_mut();
                arrays.ia[i].advance(1);
                if arrays.ia[i].is_empty() {
                    arrays.ram_ia -= arrays.ia[i].capacity() * std::mem::size_of::<V>();
                    arrays.ia.swap_remove(i);
                    self.rebuild_array_trees();
                } else {
                    let first = *arrays.ia[i].first();
                    self.ia_tree.update(i, Some(first));
                }
            }
            Source::Ea(j) => {
                let arrays = self.arrays.get_mut();
                if let Err(e) = arrays.ea[j].remove(1) {
                    return Err(self.poison_ea(j, e));
                }
                if arrays.ea[j].is_empty() {
                    arrays.ea.swap_remove(j);
                    self.rebuild_array_trees();
                } else {
                    let first = arrays.ea[j].first();
                    self.ea_tree.update(j, Some(first));
                }
            }
        }
        Ok(())
    }

    fn poison_ea(&mut self, idx: usize, err: ExtError) -> ExtError {
        let bid = self
            .arrays
            .get_mut()
            .ea
            .get(idx)
            .map(|ea| ea.first_bid())
            .unwrap_or_default();
        tracing::error!(%bid, %err, "external array IO failed, queue poisoned");
        self.poison = Some((err.replay(), Some(idx)));
        err
    }

    /// Drop the external array whose I/O failed, accepting the loss of its
    /// elements, and clear the poisoned state. Returns the element count
    /// lost.
    pub fn discard_poisoned_array(&mut self) -> Result<usize> {
        let Some((_, Some(idx))) = self.poison.take() else {
            return Err(ExtError::PreconditionViolation(
                "no poisoned external array to discard".into(),
            ));
        };
        let arrays = self.arrays.get_mut();
        let lost = if idx < arrays.ea.len() {
            let dead = arrays.ea.swap_remove(idx);
            dead.len()
        } else {
            0
        };
        self.count.fetch_sub(lost, Ordering::Relaxed);
        self.rebuild_array_trees();
        Ok(lost)
    }

    // ------------------------------------------------------------------
    // Extract-buffer refill
    // ------------------------------------------------------------------

    fn ensure_extract_buffer(&mut self) -> Result<()> {
        if self.xb_cur < self.xb.len() {
            return Ok(());
        }
        self.refill_extract_buffer()
    }

    /// Merge the heads of every source into a fresh extract buffer. All
    /// insertion heaps are flushed into internal arrays first, so the
    /// buffer afterwards caps every remaining source.
    fn refill_extract_buffer(&mut self) -> Result<()> {
        self.flush_all_heaps()?;
        self.xb.clear();
        self.xb_cur = 0;

        let xb_capacity = self.xb_capacity;
        let cmp = self.cmp.clone();
        let mut failed: Option<(usize, ExtError)> = None;
        {
            let arrays = self.arrays.get_mut();
            for (j, ea) in arrays.ea.iter_mut().enumerate() {
                if let Err(e) = ea.wait() {
                    failed = Some((j, e));
                    break;
                }
            }
            if failed.is_none() {
                // Merging may not run past the resident data of any array
                // that still has blocks on disk.
                let bound = arrays
                    .ea
                    .iter()
                    .filter(|ea| !ea.fully_requested() && !ea.is_empty())
                    .map(|ea| ea.prefix_max())
                    .fold(None::<V>, |acc, m| match acc {
                        None => Some(m),
                        Some(cur) if cmp.less(&m, &cur) => Some(m),
                        keep => keep,
                    });

                // Sources are merged in place over pointer ranges into the
                // arrays' own storage; external arrays contribute one range
                // per resident block. The bound trims each range to its
                // eligible prefix.
                enum Owner {
                    Ia(usize),
                    Ea(usize),
                }
                let mut owners: Vec<Owner> = Vec::new();
                let mut sources: Vec<&[V]> = Vec::new();
                for (i, a) in arrays.ia.iter().enumerate() {
                    let slice = a.remaining();
                    let eligible = match &bound {
                        Some(b) => slice.partition_point(|x| cmp.le(x, b)),
                        None => slice.len(),
                    };
                    if eligible > 0 {
                        owners.push(Owner::Ia(i));
                        sources.push(&slice[..eligible]);
                    }
                }
                for (j, ea) in arrays.ea.iter().enumerate() {
                    for slice in ea.prefix_slices() {
                        let eligible = match &bound {
                            Some(b) => slice.partition_point(|x| cmp.le(x, b)),
                            None => slice.len(),
                        };
                        if eligible > 0 {
                            owners.push(Owner::Ea(j));
                            sources.push(&slice[..eligible]);
                        }
                    }
                }

                let mut merger = SliceMerger::new(&cmp, sources);
                let take = merger.len().min(xb_capacity);
                trace!(
                    sources = owners.len(),
                    total = merger.len(),
                    take,
                    "extract buffer refill"
                );
                self.xb.reserve(take);
                while self.xb.len() < take {
                    let (_, v) = merger.pop().expect("sources not exhausted");
                    self.xb.push(v);
                }

                // Apply per-owner consumption.
                let mut ia_taken = vec![0usize; arrays.ia.len()];
                let mut ea_taken = vec![0usize; arrays.ea.len()];
                for (s, owner) in owners.iter().enumerate() {
                    match owner {
                        Owner::Ia(i) => ia_taken[*i] += merger.consumed(s),
                        Owner::Ea(j) => ea_taken[*j] += merger.consumed(s),
                    }
                }
                drop(merger);
                for i in (0..arrays.ia.len()).rev() {
                    if ia_taken[i] > 0 {
                        arrays.ia[i].advance(ia_taken[i]);
                    }
                    if arrays.ia[i].is_empty() {
                        arrays.ram_ia -=
                            arrays.ia[i].capacity() * std::mem::size_of::<V>();
                        arrays.ia.swap_remove(i);
                    }
                }
                for j in (0..arrays.ea.len()).rev() {
                    if ea_taken[j] > 0 {
                        if let Err(e) = arrays.ea[j].remove(ea_taken[j]) {
                            failed = Some((j, e));
                            break;
                        }
                    }
                    if arrays.ea[j].is_empty() {
                        arrays.ea.swap_remove(j);
                    }
                }
            }
        }
        if let Some((j, e)) = failed {
            return Err(self.poison_ea(j, e));
        }
        self.rebuild_array_trees();
        Ok(())
    }

    fn flush_all_heaps(&mut self) -> Result<()> {
        let vsize = std::mem::size_of::<V>();
        let mut changed = false;
        for t in 0..self.heaps.len() {
            let heap = self.heaps[t].get_mut();
            if heap.is_empty() {
                continue;
            }
            let mut run = heap.take_all();
            par_sort_values(&mut run, &self.cmp);
            {
                let mut arrays = self.arrays.lock();
                arrays.ram_ia += run.len() * vsize;
                arrays.ia.push(InternalArray::new(run));
            }
            changed = true;
            self.heaps_tree.update(t, None);
        }
        if changed {
            let mut arrays = self.arrays.lock();
            if arrays.ram_ia > self.ia_budget {
                self.externalize_internal_arrays(&mut arrays)?;
            }
        }
        Ok(())
    }

    fn rebuild_heap_tree(&mut self) {
        self.heaps_tree.resize(self.heaps.len());
        for t in 0..self.heaps.len() {
            let top = self.heaps[t].get_mut().top().copied();
            self.heaps_tree.update(t, top);
        }
    }

    fn rebuild_array_trees(&mut self) {
        let arrays = self.arrays.get_mut();
        let ia_firsts: Vec<Option<V>> =
            arrays.ia.iter().map(|a| Some(*a.first())).collect();
        let ea_firsts: Vec<Option<V>> = arrays.ea.iter().map(|ea| Some(ea.first())).collect();
        self.ia_tree.resize(ia_firsts.len());
        for (i, f) in ia_firsts.into_iter().enumerate() {
            self.ia_tree.update(i, f);
        }
        self.ea_tree.resize(ea_firsts.len());
        for (j, f) in ea_firsts.into_iter().enumerate() {
            self.ea_tree.update(j, f);
        }
    }

    // ------------------------------------------------------------------
    // External-array maintenance
    // ------------------------------------------------------------------

    /// Coalesce all external arrays into one, bounding the merger width and
    /// the number of open block sequences.
    pub fn merge_external_arrays(&mut self) -> Result<()> {
        self.check_poison()?;
        let mut failed: Option<(usize, ExtError)> = None;
        {
            let cmp = self.cmp.clone();
            let cfg = self.cfg.clone();
            let rt = Arc::clone(&self.rt);
            let arrays = self.arrays.get_mut();
            if arrays.ea.len() <= 1 {
                return Ok(());
            }
            let total: usize = arrays.ea.iter().map(|ea| ea.len()).sum();
            debug!(arrays = arrays.ea.len(), total, "merging external arrays");
            let mut merged = ExternalArray::new(
                rt,
                cfg.raw_block_size,
                total,
                cfg.num_prefetch_blocks,
                cfg.num_write_buffer_blocks,
            )?;
            'merge: {
                for (j, ea) in arrays.ea.iter_mut().enumerate() {
                    if let Err(e) = ea.wait() {
                        failed = Some((j, e));
                        break 'merge;
                    }
                }
                let mut tree = MinimaTree::new(cmp);
                tree.resize(arrays.ea.len());
                for (j, ea) in arrays.ea.iter().enumerate() {
                    tree.update(j, Some(ea.first()));
                }
                while let Some((j, v)) = tree.winner() {
                    merged.push_back(v)?;
                    if let Err(e) = arrays.ea[j].remove(1) {
                        failed = Some((j, e));
                        break 'merge;
                    }
                    let ea = &arrays.ea[j];
                    tree.update(j, if ea.is_empty() { None } else { Some(ea.first()) });
                }
                merged.finish_write_phase()?;
                arrays.ea.clear();
                arrays.ea.push(merged);
            }
        }
        if let Some((j, e)) = failed {
            return Err(self.poison_ea(j, e));
        }
        self.rebuild_array_trees();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Limit scopes
    // ------------------------------------------------------------------

    /// Open a limit scope: until [`limit_end`](Self::limit_end), pushed
    /// values promise to be at most `ub`, which lets them be ranked against
    /// a frontier snapshot instead of the whole queue.
    pub fn limit_begin(&mut self, ub: V, hint: usize) -> Result<()> {
        self.check_poison()?;
        if self.in_bulk || self.in_limit {
            return Err(ExtError::PreconditionViolation("nested limit scope".into()));
        }
        trace!(hint, "limit scope opened");
        self.in_limit = true;
        self.limit_ub = Some(ub);
        self.limit_heaps = (0..self.heaps.len())
            .map(|_| Mutex::new(InsertHeap::unbounded(self.cmp.clone())))
            .collect();
        Ok(())
    }

    /// Insert `value <= ub` from worker `thread_id`.
    pub fn limit_push(&self, value: V, thread_id: usize) -> Result<()> {
        if !self.in_limit {
            return Err(ExtError::PreconditionViolation(
                "limit_push outside a limit scope".into(),
            ));
        }
        self.check_poison()?;
        let ub = self.limit_ub.as_ref().expect("limit scope carries a bound");
        if self.cmp.less(ub, &value) {
            return Err(ExtError::PreconditionViolation(
                "limit_push above the scope's bound".into(),
            ));
        }
        self.limit_heaps[thread_id].lock().push(value);
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pop the minimum among the already-ranked queue and the limit heaps.
    pub fn limit_top_pop(&mut self) -> Result<Option<V>> {
        if !self.in_limit {
            return Err(ExtError::PreconditionViolation(
                "limit_top_pop outside a limit scope".into(),
            ));
        }
        self.check_poison()?;
        self.ensure_extract_buffer()?;
        let frontier = self.peek();

        let mut best_lh: Option<(usize, V)> = None;
        for (t, heap) in self.limit_heaps.iter().enumerate() {
            if let Some(&top) = heap.lock().top() {
                best_lh = match best_lh {
                    None => Some((t, top)),
                    Some((_, cur)) if self.cmp.less(&top, &cur) => Some((t, top)),
                    keep => keep,
                };
            }
        }

        let lh_wins = match (&frontier, &best_lh) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some((_, f)), Some((_, top))) => self.cmp.less(top, f),
        };
        if lh_wins {
            let (t, _) = best_lh.expect("winner tracked");
            let v = self.limit_heaps[t].lock().pop();
            self.count.fetch_sub(1, Ordering::Relaxed);
            return Ok(v);
        }
        match frontier {
            None => Ok(None),
            Some((source, value)) => {
                self.advance_source(source)?;
                self.count.fetch_sub(1, Ordering::Relaxed);
                Ok(Some(value))
            }
        }
    }

    /// Close the scope, merging the limit heaps into the regular insertion
    /// pipeline.
    pub fn limit_end(&mut self) -> Result<()> {
        if !self.in_limit {
            return Err(ExtError::PreconditionViolation(
                "limit_end outside a limit scope".into(),
            ));
        }
        let heaps = std::mem::take(&mut self.limit_heaps);
        for (t, heap) in heaps.into_iter().enumerate() {
            let mut heap = heap.into_inner();
            for v in heap.take_all() {
                self.insert_into_heap(t, v)?;
            }
        }
        self.in_limit = false;
        self.limit_ub = None;
        self.rebuild_heap_tree();
        self.rebuild_array_trees();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DefaultOrder;
    use crate::test_util::runtime;

    /// Small budgets so a few thousand elements hit the external path.
    fn small_cfg(workers: usize) -> PpqConfig {
        PpqConfig {
            num_workers: workers,
            total_ram: 64 * 1024,
            single_heap_ram: 1024,
            extract_buffer_ram: 2048,
            raw_block_size: 4096,
            num_prefetch_blocks: 2,
            num_write_buffer_blocks: 2,
        }
    }

    fn ppq(rt: Arc<Runtime>, workers: usize) -> ParallelPq<u64, DefaultOrder<u64>> {
        ParallelPq::new(rt, DefaultOrder::new(), small_cfg(workers)).unwrap()
    }

    #[test]
    fn push_pop_round_trip_spills_externally() {
        let (_dir, rt) = runtime(2, 1 << 24);
        let mut pq = ppq(rt, 1);
        let n = 50_000u64;
        for v in 0..n {
            pq.push(v).unwrap();
        }
        assert_eq!(pq.len(), n as usize);
        assert!(pq.num_external_arrays() > 0, "budget forces externalization");
        for v in 0..n {
            assert_eq!(pq.pop().unwrap(), Some(v), "at element {v}");
        }
        assert_eq!(pq.pop().unwrap(), None);
    }

    #[test]
    fn descending_input_pops_ascending() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let mut pq = ppq(rt, 1);
        let n = 20_000u64;
        for v in (0..n).rev() {
            pq.push(v).unwrap();
        }
        let mut out = Vec::new();
        pq.bulk_pop(&mut out, n as usize).unwrap();
        assert_eq!(out, (0..n).collect::<Vec<u64>>());
        assert!(pq.is_empty());
    }

    #[test]
    fn concurrent_bulk_push_from_workers() {
        let (_dir, rt) = runtime(2, 1 << 24);
        let workers = 4;
        let mut pq = ppq(rt, workers);
        let per_worker = 10_000u64;
        pq.bulk_push_begin((workers as u64 * per_worker) as usize).unwrap();
        std::thread::scope(|s| {
            for t in 0..workers {
                let pq = &pq;
                s.spawn(move || {
                    for i in 0..per_worker {
                        // Disjoint value lanes per worker.
                        pq.bulk_push(i * workers as u64 + t as u64, t).unwrap();
                    }
                });
            }
        });
        pq.bulk_push_end().unwrap();
        assert_eq!(pq.len(), (workers as u64 * per_worker) as usize);

        let mut out = Vec::new();
        pq.bulk_pop(&mut out, workers * per_worker as usize).unwrap();
        assert_eq!(out.len(), workers * per_worker as usize);
        assert!(out.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(out[0], 0);
        assert_eq!(*out.last().unwrap(), workers as u64 * per_worker - 1);
    }

    #[test]
    fn interleaved_pushes_and_pops_stay_ordered() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let mut pq = ppq(rt, 1);
        // Push a batch, pop half, push smaller values, verify ordering.
        for v in 1000..3000u64 {
            pq.push(v).unwrap();
        }
        for v in 1000..2000u64 {
            assert_eq!(pq.pop().unwrap(), Some(v));
        }
        for v in 0..500u64 {
            pq.push(v).unwrap();
        }
        for v in 0..500u64 {
            assert_eq!(pq.pop().unwrap(), Some(v));
        }
        for v in 2000..3000u64 {
            assert_eq!(pq.pop().unwrap(), Some(v));
        }
    }

    #[test]
    fn limit_scope_pops_respect_bound() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let mut pq = ppq(rt, 1);
        for v in [50u64, 60, 70] {
            pq.push(v).unwrap();
        }
        pq.limit_begin(55, 4).unwrap();
        pq.limit_push(52, 0).unwrap();
        pq.limit_push(51, 0).unwrap();
        assert!(pq.limit_push(56, 0).is_err(), "above the bound");

        assert_eq!(pq.limit_top_pop().unwrap(), Some(50));
        assert_eq!(pq.limit_top_pop().unwrap(), Some(51));
        assert_eq!(pq.limit_top_pop().unwrap(), Some(52));
        pq.limit_end().unwrap();
        assert_eq!(pq.pop().unwrap(), Some(60));
        assert_eq!(pq.pop().unwrap(), Some(70));
    }

    #[test]
    fn scope_misuse_is_a_precondition_violation() {
        let (_dir, rt) = runtime(1, 1 << 24);
        let mut pq = ppq(rt, 1);
        assert!(matches!(
            pq.bulk_push(1, 0),
            Err(ExtError::PreconditionViolation(_))
        ));
        pq.limit_begin(10, 1).unwrap();
        let mut out = Vec::new();
        assert!(matches!(
            pq.bulk_pop(&mut out, 1),
            Err(ExtError::PreconditionViolation(_))
        ));
        pq.limit_end().unwrap();
    }

    #[test]
    fn merge_external_arrays_coalesces() {
        let (_dir, rt) = runtime(2, 1 << 24);
        let mut pq = ppq(rt, 1);
        let n = 60_000u64;
        for v in 0..n {
            pq.push(v).unwrap();
        }
        if pq.num_external_arrays() > 1 {
            pq.merge_external_arrays().unwrap();
            assert_eq!(pq.num_external_arrays(), 1);
        }
        for v in 0..n {
            assert_eq!(pq.pop().unwrap(), Some(v));
        }
    }
}
