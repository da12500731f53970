//! The process-wide runtime handle.
//!
//! [`Runtime`] brings the substrate up in dependency order (topology,
//! thread pool and storage arenas, page pool, barrier, termination
//! detection, statistics) and tears it down in reverse; its destructor
//! prints the accumulated statistics. Only one runtime may exist in a
//! process at a time; components reach it through a process-global pointer
//! installed at construction.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use atomic_refcell::{AtomicRef, AtomicRefCell};
use substrate::barrier::{Barrier, TopoBarrier};
use substrate::termination::{TerminationDetection, TerminationVariant, create_termination};
use substrate::thread_pool::ThreadPool;

use crate::runtime::stats::StatManager;

#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// Pin workers to their assigned cpus.
    pub pin_threads: bool,
    /// Idle workers spin with `sched_yield` instead of sleeping.
    pub spin_yield: bool,
    /// Which termination detector the loops use.
    pub termination: TerminationVariant,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            pin_threads: true,
            spin_yield: false,
            termination: TerminationVariant::default(),
        }
    }
}

pub struct RuntimeInner {
    pool: ThreadPool,
    /// The loop barrier, re-built when the active thread count changes.
    barrier: AtomicRefCell<Box<dyn Barrier>>,
    termination: AtomicRefCell<Box<dyn TerminationDetection>>,
    stats: StatManager,
    active_threads: AtomicUsize,
    /// The thread count the barrier is currently sized for.
    loop_threads: AtomicUsize,
}

impl RuntimeInner {
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn stats(&self) -> &StatManager {
        &self.stats
    }

    pub fn max_threads(&self) -> usize {
        self.pool.max_threads()
    }

    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::Relaxed)
    }

    /// Size the barrier and termination detector for a loop over `n`
    /// threads. Master only, between loops.
    pub(crate) fn prepare_loop(&self, n: usize) {
        assert!(
            !self.pool.in_parallel(),
            "cannot prepare a loop while another loop is running"
        );
        if self.loop_threads.swap(n, Ordering::Relaxed) != n {
            self.barrier.borrow_mut().reinit(n);
        }
        self.termination.borrow_mut().reinit(n);
    }

    /// Shared borrow of the loop barrier. Workers of the current loop may
    /// hold this concurrently; `prepare_loop` requires it released.
    pub(crate) fn barrier(&self) -> AtomicRef<'_, Box<dyn Barrier>> {
        self.barrier.borrow()
    }

    pub(crate) fn termination(&self) -> AtomicRef<'_, Box<dyn TerminationDetection>> {
        self.termination.borrow()
    }
}

static RUNTIME: AtomicPtr<RuntimeInner> = AtomicPtr::new(std::ptr::null_mut());

/// The installed runtime. Fatal when no [`Runtime`] exists.
pub fn runtime() -> &'static RuntimeInner {
    let ptr = RUNTIME.load(Ordering::Acquire);
    assert!(
        !ptr.is_null(),
        "gravel runtime not initialized; create a gravel::Runtime first"
    );
    // SAFETY: the pointer targets the live Runtime's boxed inner state and
    // is cleared before that box is freed
    unsafe { &*ptr }
}

/// The runtime guard. Dropping it prints statistics and shuts the worker
/// pool down.
pub struct Runtime {
    inner: Box<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_options(RuntimeOptions::default())
    }

    pub fn with_options(opts: RuntimeOptions) -> Self {
        // bring-up order: the pool initializes topology and the storage
        // arenas; barriers and termination allocate per-thread slots; the
        // stats manager allocates its per-thread maps last
        let pool = ThreadPool::new(opts.pin_threads, opts.spin_yield);
        let max = pool.max_threads();

        let barrier: Box<dyn Barrier> = Box::new(TopoBarrier::new(max));
        let mut termination = create_termination(opts.termination);
        termination.reinit(max);
        let stats = StatManager::new();

        let inner = Box::new(RuntimeInner {
            pool,
            barrier: AtomicRefCell::new(barrier),
            termination: AtomicRefCell::new(termination),
            stats,
            active_threads: AtomicUsize::new(max),
            loop_threads: AtomicUsize::new(max),
        });

        let ptr = &*inner as *const RuntimeInner as *mut RuntimeInner;
        RUNTIME
            .compare_exchange(
                std::ptr::null_mut(),
                ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|_| panic!("double initialization of the gravel runtime"));

        Self { inner }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // teardown order is the reverse of bring-up: report, invalidate the
        // global heaps, uninstall the handle, then join the pool (with the
        // inner box)
        self.inner.stats.print();
        substrate::heaps::pow2_heap().mark_invalid();
        RUNTIME.store(std::ptr::null_mut(), Ordering::Release);
    }
}

/// Set the number of threads participating in subsequent loops. Clamped to
/// `[1, max_threads]`; returns the value actually set. Only callable
/// between loops.
pub fn set_active_threads(n: usize) -> usize {
    let rt = runtime();
    assert!(
        !rt.pool.in_parallel(),
        "the active thread count may only change between loops"
    );
    let n = n.clamp(1, rt.max_threads());
    rt.active_threads.store(n, Ordering::Relaxed);
    n
}

/// The number of threads the next loop will use.
pub fn active_threads() -> usize {
    runtime().active_threads()
}


#[cfg(test)]
mod tests {
    use super::test_support::with_runtime;
    use super::*;

    #[test]
    fn test_active_threads_clamped() {
        with_runtime(|| {
            let max = runtime().max_threads();

            assert_eq!(set_active_threads(0), 1);
            assert_eq!(active_threads(), 1);

            assert_eq!(set_active_threads(usize::MAX), max);
            assert_eq!(active_threads(), max);
        });
    }

    #[test]
    fn test_runtime_accessible_from_workers() {
        with_runtime(|| {
            let rt = runtime();
            rt.pool().run(rt.max_threads(), |_| {
                // workers can reach the handle through the global pointer
                let _ = runtime().active_threads();
            });
        });
    }
}
