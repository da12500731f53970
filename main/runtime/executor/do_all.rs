//! The deterministic stealing loop for independent work.
//!
//! Each worker owns a *window* of the index space, packed into one atomic
//! word (begin in the high half, end in the low half). Owners claim small
//! batches from the front by CAS; thieves cut off the upper half of a
//! victim's remainder by CAS on the same word, so every index is claimed
//! exactly once no matter how claims and steals interleave.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam::utils::CachePadded;

use crate::runtime::handle::runtime;
use crate::runtime::range::IndexedRange;
use crate::runtime::stats::StatTotal;

#[derive(Clone)]
pub struct DoAllOptions {
    /// Tag for statistics; absent means no stats.
    pub loopname: Option<&'static str>,
    /// Suppress stats even if `loopname` is set.
    pub no_stats: bool,
    /// Let workers that exhaust their own window steal from others.
    pub steal: bool,
    /// Batch size for window claims.
    pub chunk_size: u32,
}

impl Default for DoAllOptions {
    fn default() -> Self {
        Self {
            loopname: None,
            no_stats: false,
            steal: false,
            chunk_size: 16,
        }
    }
}

impl DoAllOptions {
    pub fn named(loopname: &'static str) -> Self {
        Self {
            loopname: Some(loopname),
            ..Default::default()
        }
    }

    pub fn stealing(mut self) -> Self {
        self.steal = true;
        self
    }
}

fn pack(begin: u32, end: u32) -> u64 {
    ((begin as u64) << 32) | end as u64
}

fn unpack(window: u64) -> (u32, u32) {
    ((window >> 32) as u32, window as u32)
}

/// Claim up to `chunk` indices from the front of `window`.
fn claim(window: &AtomicU64, chunk: u32) -> Option<(u32, u32)> {
    let mut cur = window.load(Ordering::Acquire);
    loop {
        let (begin, end) = unpack(cur);
        if begin >= end {
            return None;
        }
        let new_begin = end.min(begin + chunk);
        match window.compare_exchange_weak(
            cur,
            pack(new_begin, end),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Some((begin, new_begin)),
            Err(observed) => cur = observed,
        }
    }
}

/// Cut off the upper half of `window`'s remainder.
fn steal_half(window: &AtomicU64) -> Option<(u32, u32)> {
    let mut cur = window.load(Ordering::Acquire);
    loop {
        let (begin, end) = unpack(cur);
        if begin >= end {
            return None;
        }
        let mid = begin + (end - begin) / 2;
        match window.compare_exchange_weak(
            cur,
            pack(begin, mid),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Some((mid, end)),
            Err(observed) => cur = observed,
        }
    }
}

/// Apply `operator` to every item of `range` exactly once. The operator
/// must not push work, must not acquire lockables, and must not depend on
/// visitation order.
pub fn do_all<R, F>(range: &R, operator: F, opts: DoAllOptions)
where
    R: IndexedRange,
    F: Fn(R::Item) + Sync,
{
    let rt = runtime();
    let n = rt.active_threads();
    let len = range.len();
    assert!(
        len <= u32::MAX as usize,
        "do_all ranges are limited to u32::MAX items"
    );

    let stat_name = if opts.no_stats { None } else { opts.loopname };
    let start = stat_name.map(|_| Instant::now());

    let windows: Vec<CachePadded<AtomicU64>> = (0..n)
        .map(|w| {
            let (begin, end) = range.local_range(w, n);
            CachePadded::new(AtomicU64::new(pack(begin as u32, end as u32)))
        })
        .collect();

    let steal = opts.steal;
    let chunk = opts.chunk_size.max(1);
    let windows = &windows;

    rt.pool().run(n, |tid| {
        let mut iterations = 0usize;

        'work: loop {
            while let Some((begin, end)) = claim(&windows[tid], chunk) {
                for i in begin..end {
                    operator(range.index(i as usize));
                }
                iterations += (end - begin) as usize;
            }

            if !steal {
                break;
            }

            // own window is dry: grab half of someone else's remainder
            for offset in 1..n {
                let victim = (tid + offset) % n;
                if let Some((begin, end)) = steal_half(&windows[victim]) {
                    windows[tid].store(pack(begin, end), Ordering::Release);
                    continue 'work;
                }
            }
            break;
        }

        if let Some(name) = stat_name {
            rt.stats()
                .add_int(name, "Iterations", iterations as i64, StatTotal::Sum);
        }
    });

    if let (Some(name), Some(start)) = (stat_name, start) {
        let millis = start.elapsed().as_millis() as i64;
        rt.stats().add_int(name, "Time", millis, StatTotal::Max);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::runtime::handle::runtime;
    use crate::runtime::handle::test_support::with_runtime;
    use crate::runtime::range::{iterate, iterate_slice};

    #[test]
    fn test_increment_coverage() {
        with_runtime(|| {
            // matches the classic foreach benchmark: out[i] = in[i] + 1
            let size = 1 << 16;
            let input: Vec<usize> = (0..size).collect();
            let output: Vec<AtomicUsize> = (0..size).map(|_| AtomicUsize::new(0)).collect();

            do_all(
                &iterate_slice(&input),
                |i| {
                    output[*i].store(i + 1, Ordering::Relaxed);
                },
                DoAllOptions::named("increment"),
            );

            for (i, out) in output.iter().enumerate() {
                assert_eq!(out.load(Ordering::Relaxed), i + 1);
            }
        });
    }

    #[test]
    fn test_exactly_once_with_stealing() {
        with_runtime(|| {
            let size = 100_000;
            let counts: Vec<AtomicUsize> = (0..size).map(|_| AtomicUsize::new(0)).collect();

            do_all(
                &iterate(0..size),
                |i| {
                    counts[i].fetch_add(1, Ordering::Relaxed);
                },
                DoAllOptions::default().stealing(),
            );

            assert!(counts.iter().all(|c| c.load(Ordering::Relaxed) == 1));
        });
    }

    #[test]
    fn test_uneven_work_with_stealing() {
        with_runtime(|| {
            // the last worker's slice carries nearly all the work; stealing
            // must still visit every index exactly once
            let n = runtime().active_threads();
            let size = 10_000;
            let counts: Vec<AtomicUsize> = (0..size).map(|_| AtomicUsize::new(0)).collect();

            do_all(
                &iterate(0..size),
                |i| {
                    if i >= size - size / (n + 1) {
                        std::thread::yield_now();
                    }
                    counts[i].fetch_add(1, Ordering::Relaxed);
                },
                DoAllOptions {
                    loopname: Some("uneven"),
                    steal: true,
                    chunk_size: 8,
                    ..Default::default()
                },
            );

            assert!(counts.iter().all(|c| c.load(Ordering::Relaxed) == 1));
        });
    }

    #[test]
    fn test_empty_range() {
        with_runtime(|| {
            do_all(&iterate(0..0), |_| panic!("must not run"), DoAllOptions::default());
        });
    }
}
