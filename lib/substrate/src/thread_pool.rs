//! The worker thread pool.
//!
//! The pool owns one OS thread per detected cpu (the calling thread doubles
//! as worker 0, the *master*) and runs one task closure across the first `n`
//! workers of a round. Rounds are started by a futex broadcast latch and
//! finished through a condvar count-down latch, so an idle pool burns no
//! cpu unless spin-yield mode was requested.
//!
//! Task closures are lifetime-scoped onto the pool with
//! [`scope`](ThreadPool::scope), so callers can borrow stack data into the
//! workers without `Arc` or locking. The scope object unsafely transmutes
//! the task closure lifetime; if making substantial changes here, check the
//! `compile_fail` tests below still fail to compile, since they guard
//! against the scope becoming unsound through lifetime variance.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use atomic_refcell::{AtomicRefCell, AtomicRefMut};

use crate::sync::count_down_latch::{self, build_count_down_latch};
use crate::sync::latch::Latch;
use crate::topology::topology;

std::thread_local! {
    /// The pool thread id of the current thread. Pool workers set this at
    /// startup; every other thread (including the master between rounds)
    /// reads 0, the master's identity.
    static THREAD_ID: Cell<usize> = const { Cell::new(0) };
}

/// The pool thread id of the calling thread. 0 outside of pool workers.
pub fn current_tid() -> usize {
    THREAD_ID.with(|x| x.get())
}

/// The socket of the calling thread's assigned cpu.
pub fn current_socket() -> usize {
    topology().socket(current_tid())
}

/// A task that is run by the pool threads. The argument is the worker's tid.
pub trait TaskFn: Fn(usize) + Send + Sync {}
impl<T> TaskFn for T where T: Fn(usize) + Send + Sync {}

struct SharedState {
    /// The task to run during the next round. `None` tells workers to exit.
    task: AtomicRefCell<Option<Box<dyn TaskFn>>>,
    /// Number of workers participating in the current round; workers with
    /// `tid >= n_active` pass the round without running the task.
    n_active: AtomicUsize,
    /// Has a thread panicked?
    has_thread_panicked: AtomicBool,
}

/// The worker thread pool. One per process, owned by the runtime handle.
pub struct ThreadPool {
    /// Handles for joining threads when they've exited.
    thread_handles: Vec<std::thread::JoinHandle<()>>,
    /// State shared between all threads.
    shared_state: Arc<SharedState>,
    /// Opened by the master to start a round.
    start_latch: Latch,
    /// The master uses this to wait for the workers to finish a round. In an
    /// `AtomicRefCell` so that `run` can take `&self`; only the master ever
    /// borrows it, and a re-entrant borrow is a caller bug.
    end_waiter: AtomicRefCell<count_down_latch::LatchWaiter>,
    /// True while a round is running; guards against re-entrant `run`.
    in_parallel: AtomicBool,
}

impl ThreadPool {
    /// Build the pool for the detected topology. The calling thread becomes
    /// worker 0 and `max_threads() - 1` OS threads are spawned, each pinned
    /// to its assigned cpu when `pin` is set. With `spin_yield`, idle
    /// workers spin with `sched_yield` instead of sleeping on a futex.
    pub fn new(pin: bool, spin_yield: bool) -> Self {
        let topo = topology();
        let num_threads = topo.max_threads();

        let shared_state = Arc::new(SharedState {
            task: AtomicRefCell::new(None),
            n_active: AtomicUsize::new(0),
            has_thread_panicked: AtomicBool::new(false),
        });

        let start_latch = Latch::new();
        let (end_counters, end_waiter) = build_count_down_latch(num_threads - 1);

        // the master is worker 0; set up its affinity and storage arenas
        // before any worker can observe them
        if pin {
            pin_to_cpu(topo.cpu(0));
        }
        crate::per_thread::init_current_thread();

        let mut thread_handles = Vec::new();

        for (i, mut end_counter) in end_counters.into_iter().enumerate() {
            let thread_idx = i + 1;
            let shared_state_clone = Arc::clone(&shared_state);
            let mut start_waiter = start_latch.waiter(spin_yield);

            let handle = std::thread::Builder::new()
                .name("gravel-worker".to_string())
                .spawn(move || {
                    THREAD_ID.with(|x| x.set(thread_idx));
                    if pin {
                        pin_to_cpu(topology().cpu(thread_idx));
                    }
                    crate::per_thread::init_current_thread();

                    work_loop(
                        thread_idx,
                        &shared_state_clone,
                        &mut start_waiter,
                        &mut end_counter,
                    )
                })
                .unwrap();

            thread_handles.push(handle);
        }

        let pool = Self {
            thread_handles,
            shared_state,
            start_latch,
            end_waiter: AtomicRefCell::new(end_waiter),
            in_parallel: AtomicBool::new(false),
        };

        // one empty round, so that every worker has pinned itself and set
        // up its storage arenas before the pool is handed to callers that
        // allocate per-thread slots
        pool.run(pool.max_threads(), |_| {});

        pool
    }

    /// The total number of workers, including the master.
    pub fn max_threads(&self) -> usize {
        self.thread_handles.len() + 1
    }

    /// True while a task round is in flight. Used by callers to reject
    /// operations that are only legal between rounds.
    pub fn in_parallel(&self) -> bool {
        self.in_parallel.load(Ordering::Relaxed)
    }

    /// Run `f` once on each of the workers `0..n`, blocking until all have
    /// returned. The master runs the tid-0 share itself. Fatal if called
    /// from inside a running round.
    pub fn run<F>(&self, n: usize, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        self.scope(|s| s.run(n, |tid| f(tid)));
    }

    /// Create a new scope for the pool. The scope will ensure that any task
    /// run on the pool within this scope has completed before leaving the
    /// scope.
    //
    // SAFETY: This works because:
    //
    // 1. WorkerScope<'scope> is covariant over 'scope.
    // 2. TaskRunner<'a, 'scope> is invariant over WorkerScope<'scope>, so TaskRunner<'a, 'scope>
    //    is invariant over 'scope.
    // 3. FnOnce(TaskRunner<'a, 'scope>) is contravariant over TaskRunner<'a, 'scope>, so
    //    FnOnce(TaskRunner<'a, 'scope>) is invariant over 'scope.
    //
    // This means that the provided scope closure cannot take a TaskRunner<'a, 'scope2> where
    // 'scope2 is shorter than 'scope, and therefore 'scope must be as long as this function call.
    //
    // If TaskRunner<'a, 'scope> was covariant over 'scope, then FnOnce(TaskRunner<'a, 'scope>)
    // would have been contravariant over 'scope. This would have allowed the user to provide a
    // scope closure that could take a TaskRunner<'a, 'scope2> where 'scope2 is shorter than
    // 'scope. Then when TaskRunner<'a, 'scope2>::run(...) would eventually be called, the run
    // closure would capture data with a lifetime of only 'scope2, which would be a shorter
    // lifetime than the scope closure's lifetime of 'scope. Then, any captured mutable references
    // would be accessible from both the run closure and the scope closure, leading to mutable
    // aliasing.
    pub fn scope<'scope>(
        &'scope self,
        f: impl for<'a> FnOnce(TaskRunner<'a, 'scope>) + 'scope,
    ) {
        assert_eq!(
            current_tid(),
            0,
            "ThreadPool::run may only be called from the master thread"
        );
        assert!(
            !self.in_parallel.swap(true, Ordering::Relaxed),
            "re-entrant ThreadPool::run; executors must not be nested"
        );
        assert!(
            !self
                .shared_state
                .has_thread_panicked
                .load(Ordering::Relaxed),
            "Attempting to use a thread pool that previously panicked"
        );

        // makes sure that the task is properly cleared even if 'f' panics
        let mut scope = WorkerScope::<'scope> {
            pool: self,
            end_waiter: self.end_waiter.borrow_mut(),
            _phantom: Default::default(),
        };

        let runner = TaskRunner { scope: &mut scope };

        f(runner);
    }

    fn join_internal(&mut self) {
        // a `None` task indicates that the threads should end
        assert!(self.shared_state.task.borrow().is_none());

        // only check the thread join return value if no threads have yet panicked
        let check_for_errors = !self
            .shared_state
            .has_thread_panicked
            .load(Ordering::Relaxed);

        // release the workers into the sentinel round
        self.start_latch.open();

        for handle in self.thread_handles.drain(..) {
            let result = handle.join();
            if check_for_errors {
                result.expect("A thread panicked while stopping");
            }
        }
    }
}

impl std::ops::Drop for ThreadPool {
    fn drop(&mut self) {
        self.join_internal();
    }
}

fn pin_to_cpu(cpu: u32) {
    let mut cpus = nix::sched::CpuSet::new();
    if cpus.set(cpu as usize).is_err() {
        log::warn!("cpu {cpu} does not fit in the affinity mask; not pinning");
        return;
    }
    if let Err(e) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &cpus) {
        log::warn!("failed to pin thread to cpu {cpu}: {e}");
    }
}

struct WorkerScope<'scope> {
    pool: &'scope ThreadPool,
    end_waiter: AtomicRefMut<'scope, count_down_latch::LatchWaiter>,
    // when we are dropped, it's like dropping the task
    _phantom: PhantomData<Box<dyn TaskFn + 'scope>>,
}

impl std::ops::Drop for WorkerScope<'_> {
    fn drop(&mut self) {
        // if the task was set (if `TaskRunner::run` was called)
        if self.pool.shared_state.task.borrow().is_some() {
            // wait for the workers to finish the round
            self.end_waiter.wait();

            // clear the task
            *self.pool.shared_state.task.borrow_mut() = None;

            // generally following https://docs.rs/rayon/latest/rayon/fn.scope.html#panics;
            // if we're already unwinding (the master's own task share
            // panicked), don't panic again from inside drop
            if self
                .pool
                .shared_state
                .has_thread_panicked
                .load(Ordering::Relaxed)
                && !std::thread::panicking()
            {
                self.pool.in_parallel.store(false, Ordering::Relaxed);
                panic!("A worker thread panicked");
            }
        }

        self.pool.in_parallel.store(false, Ordering::Relaxed);
    }
}

/// Allows a single task to run per pool scope.
pub struct TaskRunner<'a, 'scope> {
    // SAFETY: Self must be invariant over 'scope, which is why we use &mut here. See the
    // documentation for scope() above for details.
    scope: &'a mut WorkerScope<'scope>,
}

impl<'scope> TaskRunner<'_, 'scope> {
    /// Run a task once on each of the workers `0..n`. The calling thread
    /// runs the tid-0 share before this returns; the scope blocks until the
    /// remaining workers have finished.
    pub fn run(self, n: usize, f: impl Fn(usize) + Send + Sync + 'scope) {
        let pool = self.scope.pool;
        assert!(
            n >= 1 && n <= pool.max_threads(),
            "invalid thread count {n} (max {})",
            pool.max_threads()
        );

        let f = Box::new(f);

        // SAFETY: WorkerScope will drop this TaskFn before the end of 'scope
        let f = unsafe {
            std::mem::transmute::<Box<dyn TaskFn + 'scope>, Box<dyn TaskFn + 'static>>(f)
        };

        pool.shared_state.n_active.store(n, Ordering::Relaxed);
        *pool.shared_state.task.borrow_mut() = Some(f);

        // release the workers, then run the master's share
        pool.start_latch.open();

        match pool.shared_state.task.borrow().deref() {
            Some(task) => (task)(0),
            None => unreachable!(),
        }
    }
}

fn work_loop(
    thread_idx: usize,
    shared_state: &SharedState,
    start_waiter: &mut crate::sync::latch::LatchWaiter,
    end_counter: &mut count_down_latch::LatchCounter,
) {
    // we don't use `catch_unwind` here for two main reasons:
    //
    // 1. `catch_unwind` requires that the closure is `UnwindSafe`, which means that `TaskFn` also
    // needs to be `UnwindSafe`. This is a big restriction on the types of tasks that we could run,
    // since it requires that there's no interior mutability in the closure. rayon seems to get
    // around this by wrapping the closure in `AssertUnwindSafe`, under the assumption that the
    // panic will be propagated later with `resume_unwinding`, but this is a little more difficult
    // to reason about compared to simply avoiding `catch_unwind` altogether.
    // https://github.com/rayon-rs/rayon/blob/c571f8ffb4f74c8c09b4e1e6d9979b71b4414d07/rayon-core/src/unwind.rs#L9
    //
    // 2. There is a footgun with `catch_unwind` that could cause unexpected behaviour. If the
    // closure called `panic_any()` with a type that has a Drop implementation, and that Drop
    // implementation panics, it will cause a panic that is not caught by the `catch_unwind`,
    // causing the thread to panic again with no chance to clean up properly. The work pool would
    // then deadlock. Since we don't use `catch_unwind`, the thread will instead "panic when
    // panicking" and abort, which is a more ideal outcome.
    // https://github.com/rust-lang/rust/issues/86027

    // this will poison the pool when it's dropped
    struct PoisonWhenDropped<'a>(&'a SharedState);

    impl std::ops::Drop for PoisonWhenDropped<'_> {
        fn drop(&mut self) {
            // if we panicked, then inform other threads that we panicked and allow them to exit
            // gracefully
            self.0.has_thread_panicked.store(true, Ordering::Relaxed);
        }
    }

    let poison_when_dropped = PoisonWhenDropped(shared_state);

    loop {
        // wait for a new round
        start_waiter.wait();

        // scope used to make sure we drop the task borrow before counting down
        {
            match shared_state.task.borrow().deref() {
                Some(task) => {
                    if thread_idx < shared_state.n_active.load(Ordering::Relaxed) {
                        (task)(thread_idx);
                    }
                }
                None => {
                    // received the sentinel value
                    break;
                }
            };
        }

        // SAFETY: we do not hold any references/borrows to the task at this time
        end_counter.count_down();
    }

    // didn't panic, so forget the poison handler and return normally
    std::mem::forget(poison_when_dropped);
}

#[cfg(any(test, doctest))]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32};

    use super::*;

    #[test]
    fn test_scope() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);

        let mut counter = 0u32;
        for _ in 0..3 {
            pool.scope(|_| {
                counter += 1;
            });
        }

        assert_eq!(counter, 3);
    }

    #[test]
    fn test_run() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);
        let n = pool.max_threads();

        let counter = AtomicU32::new(0);
        for _ in 0..3 {
            pool.run(n, |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(counter.load(Ordering::SeqCst), 3 * n as u32);
    }

    #[test]
    fn test_partial_round() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);

        // only worker 0 participates; the others pass the round
        let counter = AtomicU32::new(0);
        for _ in 0..3 {
            pool.run(1, |tid| {
                assert_eq!(tid, 0);
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_distinct_tids() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);
        let n = pool.max_threads();

        let seen: Vec<AtomicU32> = (0..n).map(|_| AtomicU32::new(0)).collect();
        pool.run(n, |tid| {
            assert_eq!(tid, current_tid());
            seen[tid].fetch_add(1, Ordering::SeqCst);
        });

        for s in &seen {
            assert_eq!(s.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_scope_runner_order() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);

        let flag = AtomicBool::new(false);
        pool.scope(|s| {
            s.run(1, |_| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .unwrap();
            });
        });

        assert_eq!(flag.load(Ordering::SeqCst), true);
    }

    #[test]
    fn test_non_aliasing_borrows() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);

        let mut counter = 0;
        pool.scope(|s| {
            counter += 1;
            s.run(1, |_| {
                let _x = counter;
            });
        });

        assert_eq!(counter, 1);
    }

    // should not compile: "cannot assign to `counter` because it is borrowed"
    /// ```compile_fail
    /// # use substrate::thread_pool::ThreadPool;
    /// let pool = ThreadPool::new(false, false);
    ///
    /// let mut counter = 0;
    /// pool.scope(|s| {
    ///     s.run(1, |_| {
    ///         let _x = counter;
    ///     });
    ///     counter += 1;
    /// });
    ///
    /// assert_eq!(counter, 1);
    /// ```
    fn _test_aliasing_borrows() {}

    #[test]
    #[should_panic]
    fn test_panic_all() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);
        let n = pool.max_threads();

        pool.run(n, |tid| {
            // all threads panic
            panic!("{}", tid);
        });
    }

    // should not compile: "`x` does not live long enough"
    /// ```compile_fail
    /// # use substrate::thread_pool::ThreadPool;
    /// let pool = ThreadPool::new(false, false);
    ///
    /// let x = 5;
    /// pool.scope(|s| {
    ///     s.run(1, |_| {
    ///         std::panic::panic_any(&x);
    ///     });
    /// });
    /// ```
    fn _test_panic_any() {}

    // should not compile: "closure may outlive the current function, but it borrows `x`, which is
    // owned by the current function"
    /// ```compile_fail
    /// # use substrate::thread_pool::ThreadPool;
    /// let pool = ThreadPool::new(false, false);
    ///
    /// pool.scope(|s| {
    ///     // 'x' will be dropped when the closure is dropped, but 's' lives longer than that
    ///     let x = 5;
    ///     s.run(1, |_| {
    ///         let _x = x;
    ///     });
    /// });
    /// ```
    fn _test_scope_lifetime() {}

    #[test]
    fn test_queues() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);
        let num_threads = pool.max_threads();

        // a non-copy usize wrapper
        struct Wrapper(usize);

        let queues: Vec<_> = (0..num_threads)
            .map(|_| crossbeam::queue::SegQueue::<Wrapper>::new())
            .collect();

        // queues[0] has Wrapper(0), queues[1] has Wrapper(1), etc
        for (i, queue) in queues.iter().enumerate() {
            queue.push(Wrapper(i));
        }

        let num_iters = 3;
        for _ in 0..num_iters {
            pool.run(num_threads, |tid| {
                // take item from queue n and push it to queue n+1
                let wrapper = queues[tid].pop().unwrap();
                queues[(tid + 1) % num_threads].push(wrapper);
            });
        }

        for (i, queue) in queues.iter().enumerate() {
            assert_eq!(
                queue.pop().unwrap().0,
                i.wrapping_sub(num_iters) % num_threads
            );
        }
    }
}
