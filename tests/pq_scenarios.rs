//! End-to-end priority-queue scenarios: large round trips through the
//! parallel queue, the limit protocol driving a Dijkstra fragment, and the
//! universal ordering invariants on both queue implementations.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use extmem::common::{DefaultOrder, ValueOrder};
use extmem::ppq::{ParallelPq, PpqConfig};
use extmem::pq::{PqConfig, SequenceHeap};
use extmem::storage::Pod;
use extmem::{Config, Runtime};

fn runtime(devices: usize) -> (tempfile::TempDir, Arc<Runtime>) {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::new(Config::with_devices(dir.path(), devices, 1 << 28)).unwrap();
    (dir, rt)
}

/// Budgets small enough that a million elements must spill to disk.
fn ppq_cfg(workers: usize) -> PpqConfig {
    PpqConfig {
        num_workers: workers,
        total_ram: 1 << 20,
        single_heap_ram: 64 * 1024,
        extract_buffer_ram: 128 * 1024,
        raw_block_size: 64 * 1024,
        num_prefetch_blocks: 2,
        num_write_buffer_blocks: 2,
    }
}

#[test]
fn s1_ppq_ascending_round_trip() {
    let (_dir, rt) = runtime(2);
    let mut pq = ParallelPq::new(rt, DefaultOrder::<u64>::new(), ppq_cfg(1)).unwrap();
    let n: u64 = 1_000_000;

    for chunk_start in (0..n).step_by(1024) {
        pq.bulk_push_begin(1024).unwrap();
        for v in chunk_start..(chunk_start + 1024).min(n) {
            pq.bulk_push(v, 0).unwrap();
        }
        pq.bulk_push_end().unwrap();
    }
    assert_eq!(pq.len(), n as usize);
    assert!(pq.num_external_arrays() > 0, "1M elements must spill");

    let mut expect = 0u64;
    let mut out = Vec::new();
    while expect < n {
        out.clear();
        pq.bulk_pop(&mut out, 1024).unwrap();
        assert!(!out.is_empty());
        for &v in &out {
            assert_eq!(v, expect);
            expect += 1;
        }
    }
    assert!(pq.is_empty());
}

#[test]
fn s2_ppq_descending_input() {
    let (_dir, rt) = runtime(1);
    let mut pq = ParallelPq::new(rt, DefaultOrder::<u64>::new(), ppq_cfg(1)).unwrap();
    let n: u64 = 1_000_000;
    for v in (0..n).rev() {
        pq.push(v).unwrap();
    }
    for v in 0..n {
        assert_eq!(pq.pop().unwrap(), Some(v), "at element {v}");
    }
    assert_eq!(pq.pop().unwrap(), None);
}

#[test]
fn s3_ppq_random_with_four_workers() {
    let (_dir, rt) = runtime(2);
    let workers = 4;
    let per_worker = 250_000usize;
    let mut pq = ParallelPq::new(rt, DefaultOrder::<u64>::new(), ppq_cfg(workers)).unwrap();

    // Seeded per-worker streams derived from the scenario seed.
    let mut inputs: Vec<Vec<u64>> = Vec::new();
    for t in 0..workers {
        let mut rng = StdRng::seed_from_u64(12345 + t as u64);
        inputs.push((0..per_worker).map(|_| rng.random_range(0..100_000_000u64)).collect());
    }

    pq.bulk_push_begin(workers * per_worker).unwrap();
    std::thread::scope(|s| {
        for (t, values) in inputs.iter().enumerate() {
            let pq = &pq;
            s.spawn(move || {
                for &v in values {
                    pq.bulk_push(v, t).unwrap();
                }
            });
        }
    });
    pq.bulk_push_end().unwrap();

    let mut expected: Vec<u64> = inputs.into_iter().flatten().collect();
    expected.sort_unstable();

    let mut got = Vec::with_capacity(expected.len());
    while got.len() < expected.len() {
        let before = got.len();
        pq.bulk_pop(&mut got, 4096).unwrap();
        assert!(got.len() > before, "queue drained early");
    }
    assert_eq!(got, expected);
}

// ----------------------------------------------------------------------
// S4: limit protocol driving a Dijkstra fragment
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct DistNode {
    dist: u64,
    node: u64,
}

unsafe impl Pod for DistNode {}

#[derive(Clone)]
struct DistOrder;

impl ValueOrder<DistNode> for DistOrder {
    fn less(&self, a: &DistNode, b: &DistNode) -> bool {
        (a.dist, a.node) < (b.dist, b.node)
    }
    fn min_value(&self) -> DistNode {
        DistNode { dist: 0, node: 0 }
    }
    fn max_value(&self) -> DistNode {
        DistNode {
            dist: u64::MAX,
            node: u64::MAX,
        }
    }
}

/// Fixed random graph: 100 nodes, out-degree 6, weights in 1..=100.
fn build_graph() -> Vec<Vec<(usize, u64)>> {
    const N: usize = 100;
    let mut rng = StdRng::seed_from_u64(777);
    let mut adj = vec![Vec::new(); N];
    for u in 0..N {
        // A ring edge keeps the graph connected.
        adj[u].push(((u + 1) % N, 1 + rng.random_range(0..100u64)));
        for _ in 0..5 {
            let v = rng.random_range(0..N);
            let w = 1 + rng.random_range(0..100u64);
            if v != u {
                adj[u].push((v, w));
            }
        }
    }
    adj
}

fn reference_dijkstra(adj: &[Vec<(usize, u64)>], source: usize) -> Vec<u64> {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;
    let mut dist = vec![u64::MAX; adj.len()];
    let mut heap = BinaryHeap::new();
    dist[source] = 0;
    heap.push(Reverse((0u64, source)));
    while let Some(Reverse((d, u))) = heap.pop() {
        if d > dist[u] {
            continue;
        }
        for &(v, w) in &adj[u] {
            if d + w < dist[v] {
                dist[v] = d + w;
                heap.push(Reverse((d + w, v)));
            }
        }
    }
    dist
}

#[test]
fn s4_limit_protocol_dijkstra_fragment() {
    let (_dir, rt) = runtime(1);
    let adj = build_graph();
    let n = adj.len();
    let max_edge = 100u64;
    let expected = reference_dijkstra(&adj, 0);

    let mut cfg = ppq_cfg(1);
    cfg.extract_buffer_ram = 4096;
    let mut pq = ParallelPq::new(rt, DistOrder, cfg).unwrap();
    let mut dist = vec![u64::MAX; n];
    dist[0] = 0;
    pq.push(DistNode { dist: 0, node: 0 }).unwrap();

    while let Some(top) = pq.top().unwrap() {
        let u = top.node as usize;
        let deg = adj[u].len();
        pq.limit_begin(
            DistNode {
                dist: top.dist + max_edge,
                node: u64::MAX,
            },
            deg,
        )
        .unwrap();
        let settled = pq.limit_top_pop().unwrap().expect("top() was non-empty");
        let (d, u) = (settled.dist, settled.node as usize);
        if d <= dist[u] {
            dist[u] = d;
            for &(v, w) in &adj[u] {
                if d + w < dist[v] {
                    dist[v] = d + w;
                    pq.limit_push(
                        DistNode {
                            dist: d + w,
                            node: v as u64,
                        },
                        0,
                    )
                    .unwrap();
                }
            }
        }
        pq.limit_end().unwrap();
    }
    assert_eq!(dist, expected);
}

// ----------------------------------------------------------------------
// Universal invariants on the sequence heap
// ----------------------------------------------------------------------

fn seq_heap_cfg() -> PqConfig {
    PqConfig {
        insert_heap_size: 256,
        delete_buffer_size: 32,
        arity_int: 16,
        arity_ext: 16,
        num_int_levels: 2,
        num_ext_levels: 2,
        raw_block_size: 4096,
        prefetch_buffers: 2,
        write_buffers: 4,
    }
}

#[test]
fn sequence_heap_sorts_any_permutation() {
    let (_dir, rt) = runtime(1);
    let mut pq = SequenceHeap::new(rt, DefaultOrder::<u64>::new(), seq_heap_cfg()).unwrap();
    let n = 100_000usize;
    let mut rng = StdRng::seed_from_u64(31337);
    let mut input: Vec<u64> = (0..n as u64).collect();
    for i in (1..n).rev() {
        input.swap(i, rng.random_range(0..=i));
    }
    for &v in &input {
        pq.push(v).unwrap();
    }
    assert_eq!(pq.len(), n);
    for v in 0..n as u64 {
        assert_eq!(pq.pop().unwrap(), Some(v), "at element {v}");
    }
    assert!(pq.is_empty());
}

#[test]
fn pops_are_non_decreasing_under_interleaving() {
    let (_dir, rt) = runtime(1);
    let mut pq = SequenceHeap::new(rt, DefaultOrder::<u64>::new(), seq_heap_cfg()).unwrap();
    let mut rng = StdRng::seed_from_u64(2024);
    let mut floor = 0u64;
    let mut in_queue = 0usize;
    for round in 0..50_000 {
        if in_queue == 0 || rng.random_range(0..5) > 1 {
            // Pushes may go below previous pops; the floor only binds pops.
            pq.push(rng.random_range(floor..floor + 10_000)).unwrap();
            in_queue += 1;
        } else {
            let v = pq.pop().unwrap().unwrap();
            assert!(v >= floor, "round {round}: pop {v} under floor {floor}");
            floor = v;
            in_queue -= 1;
        }
    }
}
