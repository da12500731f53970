//! Dijkstra-style two-pass termination detection.
//!
//! Detects that no worker has work nor will receive any, without a barrier
//! per round. Each worker repeatedly reports whether it made progress via
//! `signal_worked`; a token circulates (around a ring, or up and down a
//! binary tree) carrying a black/white color. The master declares global
//! termination only after two consecutive all-white traversals, which
//! tolerates a worker pushing work after another worker already reported
//! idle: the recipient blackens itself and the next traversal re-opens the
//! loop.
//!
//! The typical worker loop is:
//!
//! ```text
//! term.initialize_thread();
//! // ... all threads rendezvous ...
//! loop {
//!     let did_work = drain_some_work();
//!     term.signal_worked(did_work);
//!     if !term.working() { break; }
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crossbeam::utils::CachePadded;

use crate::per_thread::PerThread;
use crate::thread_pool::current_tid;

pub trait TerminationDetection: Send + Sync {
    /// Prepare for a loop over `n` active threads. Called between loops.
    fn reinit(&mut self, n: usize);

    /// Reset the calling thread's token state. All active threads must call
    /// this (and rendezvous) before any thread calls `signal_worked`.
    fn initialize_thread(&self);

    /// Report whether the calling thread made progress since its last call.
    /// Not the fast path: callers buffer work status and call this between
    /// batches.
    fn signal_worked(&self, did_work: bool);

    /// False iff all threads should terminate.
    fn working(&self) -> bool;
}

/// Which detector the runtime should use.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TerminationVariant {
    #[default]
    Ring,
    Tree,
}

pub fn create_termination(variant: TerminationVariant) -> Box<dyn TerminationDetection> {
    match variant {
        TerminationVariant::Ring => Box::new(RingTermination::new()),
        TerminationVariant::Tree => Box::new(TreeTermination::new()),
    }
}

#[derive(Default)]
struct RingHolder {
    token_is_black: AtomicBool,
    has_token: AtomicBool,
    process_is_black: AtomicBool,
    /// Only used by the master.
    last_was_white: AtomicBool,
}

/// Token ring: thread t hands the token to thread `(t + 1) % n`.
pub struct RingTermination {
    data: PerThread<RingHolder>,
    global_term: CachePadded<AtomicBool>,
    active_threads: usize,
}

impl RingTermination {
    pub fn new() -> Self {
        Self {
            data: PerThread::new(|_| RingHolder::default()),
            global_term: CachePadded::new(AtomicBool::new(false)),
            active_threads: 1,
        }
    }

    /// Send the token onwards.
    fn prop_token(&self, is_black: bool) {
        let next = (current_tid() + 1) % self.active_threads;
        let th = self.data.get_remote(next);
        th.token_is_black.store(is_black, Ordering::Relaxed);
        th.has_token.store(true, Ordering::Release);
    }

    fn is_master() -> bool {
        current_tid() == 0
    }
}

impl Default for RingTermination {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationDetection for RingTermination {
    fn reinit(&mut self, n: usize) {
        self.active_threads = n;
    }

    fn initialize_thread(&self) {
        let th = self.data.get();
        th.token_is_black.store(false, Ordering::Relaxed);
        th.process_is_black.store(true, Ordering::Relaxed);
        th.last_was_white.store(true, Ordering::Relaxed);
        th.has_token.store(Self::is_master(), Ordering::Relaxed);
        if Self::is_master() {
            self.global_term.store(false, Ordering::Relaxed);
        }
    }

    fn signal_worked(&self, did_work: bool) {
        debug_assert!(!(did_work && !self.working()));

        let th = self.data.get();
        if did_work {
            th.process_is_black.store(true, Ordering::Relaxed);
        }
        if !th.has_token.load(Ordering::Acquire) {
            return;
        }

        if Self::is_master() {
            let failed = th.token_is_black.load(Ordering::Relaxed)
                || th.process_is_black.load(Ordering::Relaxed);
            th.token_is_black.store(false, Ordering::Relaxed);
            th.process_is_black.store(false, Ordering::Relaxed);
            if th.last_was_white.load(Ordering::Relaxed) && !failed {
                // this was the second all-white traversal
                self.global_term.store(true, Ordering::Release);
                return;
            }
            th.last_was_white.store(!failed, Ordering::Relaxed);
        }

        // normal thread, or recirculation by the master
        debug_assert!(self.working(), "no token should circulate after global termination");
        let taint = th.process_is_black.load(Ordering::Relaxed)
            || th.token_is_black.load(Ordering::Relaxed);
        th.process_is_black.store(false, Ordering::Relaxed);
        th.token_is_black.store(false, Ordering::Relaxed);
        th.has_token.store(false, Ordering::Relaxed);
        self.prop_token(taint);
    }

    fn working(&self) -> bool {
        !self.global_term.load(Ordering::Acquire)
    }
}

const TREE_CHILDREN: usize = 2;

/// Child token state: -1 = not reported, 0 = white, 1 = black.
#[derive(Default)]
struct TreeHolder {
    /// Incoming from above.
    down_token: AtomicBool,
    /// Incoming from below.
    up_token: [AtomicI32; TREE_CHILDREN],
    process_is_black: AtomicBool,
    has_token: AtomicBool,
    /// Only used by the master.
    last_was_white: AtomicBool,
}

/// Binary tree: colors combine upward to the master, tokens flow back down.
pub struct TreeTermination {
    data: PerThread<TreeHolder>,
    global_term: CachePadded<AtomicBool>,
    active_threads: usize,
}

impl TreeTermination {
    pub fn new() -> Self {
        Self {
            data: PerThread::new(|_| TreeHolder::default()),
            global_term: CachePadded::new(AtomicBool::new(false)),
            active_threads: 1,
        }
    }

    fn children(&self, tid: usize) -> impl Iterator<Item = usize> + '_ {
        let n = self.active_threads;
        (0..TREE_CHILDREN)
            .map(move |c| TREE_CHILDREN * tid + c + 1)
            .filter(move |&c| c < n)
    }

    fn process_token(&self) {
        let tid = current_tid();
        let th = self.data.get();

        // have all up tokens?
        let mut have_all = th.has_token.load(Ordering::Relaxed);
        let mut black = th.process_is_black.load(Ordering::Relaxed);
        for (slot, _child) in self.children(tid).enumerate() {
            let up = th.up_token[slot].load(Ordering::Acquire);
            if up == -1 {
                have_all = false;
            } else {
                black |= up == 1;
            }
        }

        // have the tokens, propagate
        if have_all {
            th.process_is_black.store(false, Ordering::Relaxed);
            th.has_token.store(false, Ordering::Relaxed);
            if tid == 0 {
                if th.last_was_white.load(Ordering::Relaxed) && !black {
                    // this was the second all-white sweep
                    self.global_term.store(true, Ordering::Release);
                    return;
                }
                th.last_was_white.store(!black, Ordering::Relaxed);
                th.down_token.store(true, Ordering::Relaxed);
            } else {
                let parent = (tid - 1) / TREE_CHILDREN;
                let slot = (tid - 1) % TREE_CHILDREN;
                self.data.get_remote(parent).up_token[slot]
                    .store(black as i32, Ordering::Release);
            }
        }

        // received a down token, restart the sweep below us
        if th.down_token.load(Ordering::Acquire) {
            th.down_token.store(false, Ordering::Relaxed);
            th.has_token.store(true, Ordering::Relaxed);
            for (slot, child) in self.children(tid).enumerate() {
                th.up_token[slot].store(-1, Ordering::Relaxed);
                self.data
                    .get_remote(child)
                    .down_token
                    .store(true, Ordering::Release);
            }
        }
    }
}

impl Default for TreeTermination {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationDetection for TreeTermination {
    fn reinit(&mut self, n: usize) {
        self.active_threads = n;
    }

    fn initialize_thread(&self) {
        let tid = current_tid();
        let th = self.data.get();
        th.down_token.store(false, Ordering::Relaxed);
        for slot in &th.up_token {
            slot.store(-1, Ordering::Relaxed);
        }
        th.process_is_black.store(true, Ordering::Relaxed);
        th.has_token.store(true, Ordering::Relaxed);
        th.last_was_white.store(true, Ordering::Relaxed);
        if tid == 0 {
            self.global_term.store(false, Ordering::Relaxed);
        }
    }

    fn signal_worked(&self, did_work: bool) {
        debug_assert!(!(did_work && !self.working()));

        let th = self.data.get();
        if did_work {
            th.process_is_black.store(true, Ordering::Relaxed);
        }
        self.process_token();
    }

    fn working(&self) -> bool {
        !self.global_term.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::barrier::{Barrier, TopoBarrier};
    use crate::thread_pool::ThreadPool;

    fn run_until_quiet(variant: TerminationVariant) {
        let pool = ThreadPool::new(false, false);
        let n = pool.max_threads();

        let mut term = create_termination(variant);
        term.reinit(n);
        let mut barrier = TopoBarrier::new(n);
        barrier.reinit(n);

        // each thread "works" a decreasing number of times, then reports idle
        let work_left: Vec<AtomicUsize> = (0..n).map(|t| AtomicUsize::new(t * 3)).collect();

        let term = &*term;
        let barrier = &barrier;
        let work_left = &work_left;
        pool.run(n, |tid| {
            term.initialize_thread();
            barrier.wait();

            loop {
                let remaining = work_left[tid].load(Ordering::Relaxed);
                let did_work = remaining > 0;
                if did_work {
                    work_left[tid].store(remaining - 1, Ordering::Relaxed);
                }

                term.signal_worked(did_work);
                if !term.working() {
                    break;
                }
                std::hint::spin_loop();
            }

            // termination may only be declared once all work is done
            assert_eq!(work_left[tid].load(Ordering::Relaxed), 0);
        });
    }

    #[test]
    fn test_ring_terminates() {
        let _guard = crate::test_util::serialize();
        run_until_quiet(TerminationVariant::Ring);
    }

    #[test]
    fn test_tree_terminates() {
        let _guard = crate::test_util::serialize();
        run_until_quiet(TerminationVariant::Tree);
    }

    #[test]
    fn test_reusable_across_loops() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);
        let n = pool.max_threads();

        let mut term = create_termination(TerminationVariant::Ring);
        let mut barrier = TopoBarrier::new(n);
        barrier.reinit(n);

        for _ in 0..3 {
            term.reinit(n);
            let term_ref = &*term;
            let barrier_ref = &barrier;
            pool.run(n, |_| {
                term_ref.initialize_thread();
                barrier_ref.wait();

                let mut worked_once = true;
                loop {
                    term_ref.signal_worked(worked_once);
                    worked_once = false;
                    if !term_ref.working() {
                        break;
                    }
                    std::hint::spin_loop();
                }
            });
        }
    }
}
