//! gravel: a shared-memory parallel graph-analytics runtime.
//!
//! The hard part of irregular graph computations is not the analytics, it
//! is the parallel execution substrate underneath: worklists of small
//! tasks, work stealing, termination detection, NUMA-aware memory, and
//! speculative conflict handling. gravel packages that substrate as a
//! library; analytic kernels (BFS, SSSP, clustering, ...) are clients that
//! express themselves as operators over parallel loops.
//!
//! Create a [`Runtime`] first; it owns the worker pool and the statistics
//! manager and must outlive every loop:
//!
//! ```no_run
//! use gravel::{DoAllOptions, Runtime, do_all, iterate};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let _rt = Runtime::new();
//!
//! let out: Vec<AtomicUsize> = (0..1024).map(|_| AtomicUsize::new(0)).collect();
//! do_all(
//!     &iterate(0..1024),
//!     |i| out[i].store(i + 1, Ordering::Relaxed),
//!     DoAllOptions::named("increment").stealing(),
//! );
//! ```
//!
//! Loops that generate work use [`for_each`]; the operator receives a
//! [`UserContext`] to push follow-up items, and may use [`acquire`] for
//! speculative conflict detection. Priority scheduling comes from
//! [`OrderedByIntegerMetric`], typically with a delta-stepping indexer.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod runtime;
pub mod utility;

pub use substrate::barrier::{
    Barrier, CountingBarrier, DisseminationBarrier, MCSBarrier, SimpleBarrier, TopoBarrier,
};
pub use substrate::heaps::{BumpHeap, FixedSizeHeap, Pow2BlockHeap};
pub use substrate::per_thread::{PerSocket, PerThread};
pub use substrate::termination::TerminationVariant;
pub use substrate::thread_pool::{current_socket, current_tid};
pub use substrate::topology::topology;

pub use runtime::context::{
    Lockable, LockSlot, LoopError, MethodFlag, SimpleRuntimeContext, acquire, set_thread_context,
};
pub use runtime::executor::{
    DoAllOptions, ForEachOptions, OnEachOptions, UserContext, do_all, for_each,
    for_each_parameter, on_each,
};
pub use runtime::handle::{Runtime, RuntimeOptions, active_threads, runtime, set_active_threads};
pub use runtime::range::{iterate, iterate_cloned, iterate_slice, IndexedRange};
pub use runtime::reduction::{Accumulator, ReduceLogicalOr, ReduceMax, ReduceMin};
pub use runtime::stats::StatTotal;
pub use runtime::worklist::chunked::{PerSocketChunkFifo, PerSocketChunkLifo};
pub use runtime::worklist::obim::OrderedByIntegerMetric;
pub use runtime::worklist::serial::SerialBucketWl;
pub use runtime::worklist::simple::{Fifo, Lifo};
pub use runtime::worklist::Worklist;

use runtime::handle::runtime as rt;

/// Report a statistic taking only the first thread's value.
pub fn report_stat_single(region: &str, category: &str, value: i64) {
    rt().stats().add_int(region, category, value, StatTotal::Single);
}

/// Report a statistic reduced by minimum across threads.
pub fn report_stat_min(region: &str, category: &str, value: i64) {
    rt().stats().add_int(region, category, value, StatTotal::Min);
}

/// Report a statistic reduced by maximum across threads.
pub fn report_stat_max(region: &str, category: &str, value: i64) {
    rt().stats().add_int(region, category, value, StatTotal::Max);
}

/// Report a statistic summed across threads.
pub fn report_stat_sum(region: &str, category: &str, value: i64) {
    rt().stats().add_int(region, category, value, StatTotal::Sum);
}

/// Report a statistic averaged over all contributions.
pub fn report_stat_avg(region: &str, category: &str, value: i64) {
    rt().stats().add_int(region, category, value, StatTotal::Avg);
}

/// Report a floating-point statistic with the given reduction.
pub fn report_stat_fp(region: &str, category: &str, value: f64, total: StatTotal) {
    rt().stats().add_fp(region, category, value, total);
}

/// Report a single-valued string parameter.
pub fn report_param(region: &str, category: &str, value: &str) {
    rt().stats().add_param(region, category, value);
}

/// Redirect statistics output from stdout to `path`.
pub fn set_stat_file(path: impl Into<std::path::PathBuf>) {
    rt().stats().set_stat_file(path);
}

/// Merge and print all statistics now. Also happens automatically when the
/// [`Runtime`] is dropped.
pub fn print_stats() {
    rt().stats().print();
}

/// Report each thread's page-pool allocation count under `category`.
pub fn report_page_alloc(category: &'static str) {
    on_each(
        move |tid, _num| {
            report_stat_sum(
                "PageAlloc",
                category,
                substrate::page_pool::pages_allocated_for_thread(tid),
            );
        },
        OnEachOptions::default(),
    );
}

/// Pre-allocate `pages` pool pages, spread across the active threads.
pub fn prealloc_pages(pages: usize) {
    let n = active_threads();
    let per_thread = pages.div_ceil(n);
    rt().pool()
        .run(n, move |_tid| substrate::page_pool::prealloc(per_thread));
}
