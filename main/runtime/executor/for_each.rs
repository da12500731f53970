//! The worklist-driven executor.
//!
//! Workers seed the worklist with their local slice of the initial range,
//! then cycle pop → apply → push until the termination detector agrees the
//! loop is globally quiet. With conflict detection enabled, each iteration
//! runs under a [`SimpleRuntimeContext`]; an operator that loses a race
//! reports [`LoopError::Conflict`], the iteration is cancelled (its locks
//! released, its pushes discarded) and the original item is re-pushed for
//! retry. Commit means releasing the iteration's locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam::utils::CachePadded;
use substrate::heaps::BumpHeap;

use crate::runtime::context::{
    LoopError, SimpleRuntimeContext, set_thread_context,
};
use crate::runtime::handle::runtime;
use crate::runtime::loop_stats::LoopStatistics;
use crate::runtime::range::IndexedRange;
use crate::runtime::stats::StatTotal;
use crate::runtime::worklist::Worklist;
use crate::runtime::worklist::chunked::PerSocketChunkFifo;

/// The operator's handle for pushing new work and using loop facilities.
pub struct UserContext<'a, T> {
    pushes: Vec<T>,
    allow_push: bool,
    bump: Option<&'a mut BumpHeap>,
}

impl<'a, T> UserContext<'a, T> {
    pub(crate) fn new(allow_push: bool, bump: Option<&'a mut BumpHeap>) -> Self {
        Self {
            pushes: Vec::new(),
            allow_push,
            bump,
        }
    }

    /// Queue `item` for execution. Buffered until the iteration commits;
    /// an aborted iteration's pushes are discarded.
    pub fn push(&mut self, item: T) {
        assert!(self.allow_push, "operator pushed in a no_pushes loop");
        self.pushes.push(item);
    }

    pub fn push_all(&mut self, items: impl IntoIterator<Item = T>) {
        assert!(self.allow_push, "operator pushed in a no_pushes loop");
        self.pushes.extend(items);
    }

    /// Zeroed scratch memory that lives until the end of this iteration.
    /// Requires the loop to run with `per_iter_alloc`.
    pub fn per_iter_alloc(&mut self, bytes: usize) -> &mut [u8] {
        let heap = self
            .bump
            .as_mut()
            .expect("per_iter_alloc not enabled for this loop");
        let layout = std::alloc::Layout::from_size_align(bytes.max(1), 16).unwrap();
        let ptr = heap.allocate(layout);
        // zero it so callers never see stale iteration data
        unsafe {
            std::ptr::write_bytes(ptr, 0, bytes);
            std::slice::from_raw_parts_mut(ptr, bytes)
        }
    }

    pub(crate) fn into_pushes(self) -> Vec<T> {
        self.pushes
    }
}

pub struct ForEachOptions<T: Send> {
    /// Tag for statistics; absent means no stats.
    pub loopname: Option<&'static str>,
    /// Suppress stats even if `loopname` is set.
    pub no_stats: bool,
    /// Assert that the operator never pushes.
    pub no_pushes: bool,
    /// Skip installing a conflict-detection context per iteration.
    pub disable_conflict_detection: bool,
    /// Give each iteration a bump heap via `UserContext::per_iter_alloc`.
    pub per_iter_alloc: bool,
    /// Allow the operator to stop the loop with `LoopError::Break`.
    pub parallel_break: bool,
    /// Custom worklist; default is the per-socket chunked FIFO.
    pub wl: Option<Box<dyn Worklist<T>>>,
}

impl<T: Send> Default for ForEachOptions<T> {
    fn default() -> Self {
        Self {
            loopname: None,
            no_stats: false,
            no_pushes: false,
            disable_conflict_detection: false,
            per_iter_alloc: false,
            parallel_break: false,
            wl: None,
        }
    }
}

impl<T: Send> ForEachOptions<T> {
    pub fn named(loopname: &'static str) -> Self {
        Self {
            loopname: Some(loopname),
            ..Default::default()
        }
    }

    pub fn with_worklist(mut self, wl: impl Worklist<T> + 'static) -> Self {
        self.wl = Some(Box::new(wl));
        self
    }

    pub fn without_conflict_detection(mut self) -> Self {
        self.disable_conflict_detection = true;
        self
    }

    pub fn with_parallel_break(mut self) -> Self {
        self.parallel_break = true;
        self
    }
}

/// Run `operator` over `range` and everything it pushes, until quiescence
/// (or until a worker raises the break flag).
///
/// With conflict detection (the default), items must be re-executable: an
/// iteration may run several times before it commits, so operators must be
/// idempotent up to their lock acquisitions.
pub fn for_each<R, F, T>(range: &R, operator: F, opts: ForEachOptions<T>)
where
    T: Send + Clone + 'static,
    R: IndexedRange<Item = T>,
    F: Fn(T, &mut UserContext<'_, T>) -> Result<(), LoopError> + Sync,
{
    let rt = runtime();
    let n = rt.active_threads();
    rt.prepare_loop(n);

    let default_wl;
    let wl: &dyn Worklist<T> = match &opts.wl {
        Some(custom) => &**custom,
        None => {
            default_wl = PerSocketChunkFifo::<T>::new();
            &default_wl
        }
    };

    let stat_name = if opts.no_stats { None } else { opts.loopname };
    let start = stat_name.map(|_| Instant::now());

    let conflicts = !opts.disable_conflict_detection;
    let allow_push = !opts.no_pushes;
    let allow_break = opts.parallel_break;
    let per_iter = opts.per_iter_alloc;

    let break_flag = CachePadded::new(AtomicBool::new(false));
    let break_flag = &break_flag;

    let barrier_guard = rt.barrier();
    let term_guard = rt.termination();
    let barrier = &**barrier_guard;
    let term = &**term_guard;

    rt.pool().run(n, |tid| {
        // seed with this worker's slice, then rendezvous so nobody signals
        // the detector before everyone has initialized it
        let (lo, hi) = range.local_range(tid, n);
        wl.push_initial(&mut (lo..hi).map(|i| range.index(i)));
        term.initialize_thread();
        barrier.wait();

        let mut stats = LoopStatistics::new(stat_name);
        let mut bump = per_iter.then(BumpHeap::new);
        let ctx = SimpleRuntimeContext::new();
        let mut did_work = false;

        'main: loop {
            loop {
                if break_flag.load(Ordering::Relaxed) {
                    break 'main;
                }
                let Some(item) = wl.pop() else {
                    break;
                };
                did_work = true;
                stats.inc_iterations();

                let backup = conflicts.then(|| item.clone());
                if conflicts {
                    ctx.start_iteration();
                    set_thread_context(Some(&ctx));
                }

                let mut uctx = UserContext::new(allow_push, bump.as_mut());
                let result = operator(item, &mut uctx);

                if conflicts {
                    set_thread_context(None);
                }
                let pushes = uctx.into_pushes();

                match result {
                    Ok(()) | Err(LoopError::ReachedFailsafe) => {
                        if conflicts {
                            ctx.commit_iteration();
                        }
                        stats.inc_pushes(pushes.len());
                        for item in pushes {
                            wl.push(item);
                        }
                    }
                    Err(LoopError::Conflict) => {
                        assert!(
                            conflicts,
                            "operator reported a conflict in a loop without conflict detection"
                        );
                        stats.inc_conflicts();
                        ctx.cancel_iteration();
                        // discard speculative pushes, retry the original
                        drop(pushes);
                        wl.push(backup.expect("conflicting iteration keeps its item"));
                    }
                    Err(LoopError::Break) => {
                        assert!(
                            allow_break,
                            "operator requested a break in a loop without parallel_break"
                        );
                        if conflicts {
                            ctx.commit_iteration();
                        }
                        stats.inc_pushes(pushes.len());
                        for item in pushes {
                            wl.push(item);
                        }
                        break_flag.store(true, Ordering::Release);
                    }
                }

                if let Some(bump) = bump.as_mut() {
                    bump.reset();
                }
            }

            term.signal_worked(did_work);
            did_work = false;
            if !term.working() {
                break;
            }
            std::hint::spin_loop();
        }
    });

    drop(term_guard);
    drop(barrier_guard);

    if let (Some(name), Some(start)) = (stat_name, start) {
        let millis = start.elapsed().as_millis() as i64;
        rt.stats().add_int(name, "Time", millis, StatTotal::Max);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::runtime::context::{LockSlot, MethodFlag, acquire};
    use crate::runtime::handle::test_support::with_runtime;
    use crate::runtime::range::iterate_cloned;
    use crate::runtime::reduction::Accumulator;
    use crate::runtime::worklist::chunked::PerSocketChunkLifo;

    #[test]
    fn test_countdown_executes_exactly_n_plus_one() {
        with_runtime(|| {
            // from {100}, push n-1 while n > 0: exactly 101 executions
            let executions = AtomicUsize::new(0);
            let initial = [100u32];

            for_each(
                &iterate_cloned(&initial),
                |n, ctx| {
                    executions.fetch_add(1, Ordering::Relaxed);
                    if n > 0 {
                        ctx.push(n - 1);
                    }
                    Ok(())
                },
                ForEachOptions::named("countdown").without_conflict_detection(),
            );

            assert_eq!(executions.load(Ordering::Relaxed), 101);
        });
    }

    #[test]
    fn test_initial_items_visited_exactly_once() {
        with_runtime(|| {
            let size = 10_000;
            let initial: Vec<usize> = (0..size).collect();
            let counts: Vec<AtomicUsize> = (0..size).map(|_| AtomicUsize::new(0)).collect();
            let counts_ref = &counts;

            for_each(
                &iterate_cloned(&initial),
                |i, _ctx| {
                    counts_ref[i].fetch_add(1, Ordering::Relaxed);
                    Ok(())
                },
                ForEachOptions {
                    no_pushes: true,
                    disable_conflict_detection: true,
                    ..Default::default()
                },
            );

            assert!(counts.iter().all(|c| c.load(Ordering::Relaxed) == 1));
        });
    }

    #[test]
    fn test_conflict_retry_commits_everything() {
        with_runtime(|| {
            // all iterations fight over a handful of locks; every item must
            // still commit exactly once
            let num_locks = 4;
            let locks: Vec<LockSlot> = (0..num_locks).map(|_| LockSlot::new()).collect();
            let locks_ref = &locks;
            let commits: Accumulator<usize> = Accumulator::new();
            let commits_ref = &commits;

            let items: Vec<usize> = (0..1000).collect();

            for_each(
                &iterate_cloned(&items),
                |i, _ctx| {
                    acquire(&locks_ref[i % num_locks], MethodFlag::Write)?;
                    // a second acquisition, to exercise multi-lock commit
                    acquire(&locks_ref[(i + 1) % num_locks], MethodFlag::Write)?;
                    commits_ref.update(1);
                    Ok(())
                },
                ForEachOptions::named("conflict-retry"),
            );

            assert_eq!(commits.reduce(), items.len());
            // all locks returned to free
            assert!(locks.iter().all(|l| l.owner_addr() == 0));
        });
    }

    #[test]
    fn test_custom_worklist() {
        with_runtime(|| {
            let executions = AtomicUsize::new(0);
            let initial: Vec<u32> = (0..100).collect();

            for_each(
                &iterate_cloned(&initial),
                |_n, _ctx| {
                    executions.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                },
                ForEachOptions::default()
                    .without_conflict_detection()
                    .with_worklist(PerSocketChunkLifo::<u32>::new()),
            );

            assert_eq!(executions.load(Ordering::Relaxed), 100);
        });
    }

    #[test]
    fn test_parallel_break_stops_early() {
        with_runtime(|| {
            let executions = AtomicUsize::new(0);
            let items: Vec<usize> = (0..100_000).collect();

            for_each(
                &iterate_cloned(&items),
                |i, _ctx| {
                    executions.fetch_add(1, Ordering::Relaxed);
                    if i == 0 {
                        return Err(LoopError::Break);
                    }
                    Ok(())
                },
                ForEachOptions::default()
                    .without_conflict_detection()
                    .with_parallel_break(),
            );

            // the break must actually cut the loop short; item 0 sits in
            // thread 0's first chunk, so almost everything else is skipped
            let ran = executions.load(Ordering::Relaxed);
            assert!(ran >= 1);
            assert!(ran < items.len());
        });
    }

    #[test]
    fn test_failsafe_commits() {
        with_runtime(|| {
            let executions = AtomicUsize::new(0);
            let initial = [1u32, 2, 3];

            for_each(
                &iterate_cloned(&initial),
                |_n, _ctx| {
                    executions.fetch_add(1, Ordering::Relaxed);
                    Err(LoopError::ReachedFailsafe)
                },
                ForEachOptions::default(),
            );

            assert_eq!(executions.load(Ordering::Relaxed), 3);
        });
    }

    #[test]
    fn test_per_iter_alloc() {
        with_runtime(|| {
            let initial: Vec<usize> = (0..200).collect();
            let sum = Accumulator::new();
            let sum_ref = &sum;

            for_each(
                &iterate_cloned(&initial),
                |i, ctx| {
                    let scratch = ctx.per_iter_alloc(256);
                    assert!(scratch.iter().all(|&b| b == 0));
                    scratch[i % 256] = 1;
                    sum_ref.update(scratch.iter().map(|&b| b as usize).sum::<usize>());
                    Ok(())
                },
                ForEachOptions {
                    per_iter_alloc: true,
                    disable_conflict_detection: true,
                    ..Default::default()
                },
            );

            assert_eq!(sum.reduce(), 200);
        });
    }
}
