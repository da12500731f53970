//! The low-level per-thread executor.

use std::time::Instant;

use crate::runtime::handle::runtime;
use crate::runtime::stats::StatTotal;

#[derive(Default, Clone)]
pub struct OnEachOptions {
    /// Tag for statistics; absent means no stats.
    pub loopname: Option<&'static str>,
    /// Suppress the summary timer even if `loopname` is set.
    pub no_stats: bool,
}

impl OnEachOptions {
    pub fn named(loopname: &'static str) -> Self {
        Self {
            loopname: Some(loopname),
            ..Default::default()
        }
    }
}

/// Run `operator(tid, num_threads)` exactly once on every active thread.
/// Must be called outside any other executor.
pub fn on_each<F>(operator: F, opts: OnEachOptions)
where
    F: Fn(usize, usize) + Send + Sync,
{
    let rt = runtime();
    let n = rt.active_threads();

    let stat_name = if opts.no_stats { None } else { opts.loopname };
    let start = stat_name.map(|_| Instant::now());

    rt.pool().run(n, |tid| operator(tid, n));

    if let (Some(name), Some(start)) = (stat_name, start) {
        let millis = start.elapsed().as_millis() as i64;
        rt.stats().add_int(name, "Time", millis, StatTotal::Max);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::runtime::handle::test_support::with_runtime;
    use crate::runtime::handle::{runtime, set_active_threads};

    #[test]
    fn test_runs_once_per_thread() {
        with_runtime(|| {
            let n = runtime().active_threads();
            let hits: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();

            on_each(
                |tid, num| {
                    assert_eq!(num, n);
                    hits[tid].fetch_add(1, Ordering::Relaxed);
                },
                OnEachOptions::default(),
            );

            for h in &hits {
                assert_eq!(h.load(Ordering::Relaxed), 1);
            }
        });
    }

    #[test]
    fn test_respects_active_threads() {
        with_runtime(|| {
            let max = runtime().max_threads();
            set_active_threads(1);

            let count = AtomicUsize::new(0);
            on_each(
                |tid, num| {
                    assert_eq!(tid, 0);
                    assert_eq!(num, 1);
                    count.fetch_add(1, Ordering::Relaxed);
                },
                OnEachOptions::named("on-each-single"),
            );
            assert_eq!(count.load(Ordering::Relaxed), 1);

            set_active_threads(max);
        });
    }
}
