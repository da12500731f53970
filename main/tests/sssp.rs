//! Delta-stepping single-source shortest paths, driven through the public
//! API: `for_each` over an ordered-by-integer-metric worklist with a
//! distance-bucket indexer. The scheduler is free to reorder work, but the
//! algorithm is deterministic: final distances must match Dijkstra for
//! every delta shift and thread count.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::Mutex;
use std::sync::Once;
use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;
use rand::SeedableRng;

use gravel::{
    ForEachOptions, OrderedByIntegerMetric, Runtime, RuntimeOptions, for_each, iterate_cloned,
    set_active_threads,
};

static INIT: Once = Once::new();
static LOCK: Mutex<()> = Mutex::new(());

fn with_runtime<R>(f: impl FnOnce() -> R) -> R {
    INIT.call_once(|| {
        let rt = Runtime::with_options(RuntimeOptions {
            pin_threads: false,
            ..Default::default()
        });
        std::mem::forget(rt);
    });
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    f()
}

const INFINITY: u32 = u32::MAX;

type Graph = Vec<Vec<(usize, u32)>>;

/// A connected random digraph with bounded edge weights.
fn build_graph(nodes: usize, extra_edges: usize, seed: u64) -> Graph {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut graph: Graph = vec![Vec::new(); nodes];

    // a random spine keeps everything reachable from node 0
    for v in 1..nodes {
        let u = rng.gen_range(0..v);
        let w = rng.gen_range(1..=100);
        graph[u].push((v, w));
    }
    for _ in 0..extra_edges {
        let u = rng.gen_range(0..nodes);
        let v = rng.gen_range(0..nodes);
        let w = rng.gen_range(1..=100);
        graph[u].push((v, w));
    }
    graph
}

fn dijkstra(graph: &Graph, source: usize) -> Vec<u32> {
    let mut dist = vec![INFINITY; graph.len()];
    let mut heap = BinaryHeap::new();
    dist[source] = 0;
    heap.push(Reverse((0u32, source)));

    while let Some(Reverse((d, u))) = heap.pop() {
        if d > dist[u] {
            continue;
        }
        for &(v, w) in &graph[u] {
            let nd = d + w;
            if nd < dist[v] {
                dist[v] = nd;
                heap.push(Reverse((nd, v)));
            }
        }
    }
    dist
}

#[derive(Copy, Clone, Debug)]
struct UpdateRequest {
    node: usize,
    distance: u32,
}

fn delta_step_sssp(graph: &Graph, source: usize, delta_shift: u32, strict: bool) -> Vec<u32> {
    let dist: Vec<AtomicU32> = (0..graph.len()).map(|_| AtomicU32::new(INFINITY)).collect();
    dist[source].store(0, Ordering::Relaxed);

    let dist_ref = &dist;
    let initial = [UpdateRequest {
        node: source,
        distance: 0,
    }];

    let indexer = move |req: &UpdateRequest| req.distance >> delta_shift;
    let wl = if strict {
        OrderedByIntegerMetric::with_barrier(indexer)
    } else {
        OrderedByIntegerMetric::new(indexer)
    };

    for_each(
        &iterate_cloned(&initial),
        |req: UpdateRequest, ctx| {
            // stale request: a shorter path already won
            if dist_ref[req.node].load(Ordering::Relaxed) < req.distance {
                return Ok(());
            }
            for &(dest, weight) in &graph[req.node] {
                let new_dist = req.distance + weight;
                let old = dist_ref[dest].fetch_min(new_dist, Ordering::Relaxed);
                if new_dist < old {
                    ctx.push(UpdateRequest {
                        node: dest,
                        distance: new_dist,
                    });
                }
            }
            Ok(())
        },
        ForEachOptions::named("SSSP")
            .without_conflict_detection()
            .with_worklist(wl),
    );

    dist.into_iter().map(|d| d.into_inner()).collect()
}

#[test]
fn test_matches_dijkstra_across_shifts_and_threads() {
    with_runtime(|| {
        let graph = build_graph(2000, 6000, 7);
        let expected = dijkstra(&graph, 0);
        let max = gravel::runtime().max_threads();

        for threads in [1, 2.min(max), max] {
            set_active_threads(threads);
            for shift in [0, 2, 13] {
                let got = delta_step_sssp(&graph, 0, shift, false);
                assert_eq!(got, expected, "threads={threads} shift={shift}");
            }
        }
    });
}

#[test]
fn test_strict_bucket_mode_matches_dijkstra() {
    with_runtime(|| {
        let graph = build_graph(500, 1500, 11);
        let expected = dijkstra(&graph, 0);
        let max = gravel::runtime().max_threads();

        for threads in [1, max] {
            set_active_threads(threads);
            let got = delta_step_sssp(&graph, 0, 3, true);
            assert_eq!(got, expected, "threads={threads}");
        }
    });
}

#[test]
fn test_unreachable_nodes_stay_infinite() {
    with_runtime(|| {
        // two disconnected components: distances in the second stay infinite
        let mut graph = build_graph(100, 200, 3);
        graph.extend(vec![Vec::new(); 50]);

        let got = delta_step_sssp(&graph, 0, 4, false);
        for d in &got[100..] {
            assert_eq!(*d, INFINITY);
        }
    });
}
