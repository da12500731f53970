//! Thread barriers.
//!
//! The topological barrier is the fast path: per-socket arrival counters
//! combine into a tree across sockets, so most waits touch only memory on
//! the waiter's own socket. The simple barrier chains two one-way barriers
//! and stays correct across thread-count changes. The counting, MCS-tree
//! and dissemination barriers exist for comparison benchmarks.
//!
//! `wait` is a full memory barrier: writes made by a thread before its k-th
//! `wait` are visible to every other thread after that thread's k-th `wait`
//! returns. `reinit` may only be called while no thread is inside `wait`
//! (the simple barrier also tolerates reinit between its two phases).

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::per_thread::{PerSocket, PerThread};
use crate::thread_pool::current_tid;
use crate::topology::topology;

pub trait Barrier: Send + Sync {
    /// Block until all active threads have arrived.
    fn wait(&self);
    /// Rebuild for `n` active threads. No thread may be inside `wait`.
    fn reinit(&mut self, n: usize);
    fn name(&self) -> &'static str;
}

/// Hierarchical barrier: non-leaders check in at their socket's arrival
/// counter, leaders combine across sockets in a 4-ary tree and wake through
/// a binary tree.
pub struct TopoBarrier {
    nodes: PerSocket<TopoNode>,
    sense: PerThread<AtomicU32>,
}

#[derive(Default)]
struct TopoNode {
    /// Arrival-tree parent socket + 1; 0 for the root.
    parent: AtomicUsize,
    /// Wake-tree child sockets + 1; 0 when absent.
    wake_children: [AtomicUsize; 2],
    have_child: AtomicU32,
    child_not_ready: AtomicU32,
    parent_sense: AtomicU32,
}

impl TopoBarrier {
    pub fn new(active_threads: usize) -> Self {
        let mut this = Self {
            nodes: PerSocket::new(|_| TopoNode::default()),
            sense: PerThread::new(|_| AtomicU32::new(1)),
        };
        this.reinit(active_threads);
        this
    }
}

impl Barrier for TopoBarrier {
    fn reinit(&mut self, n: usize) {
        let topo = topology();
        let pkgs = topo.cumulative_max_socket(n - 1) + 1;

        for i in 0..pkgs {
            let node = self.nodes.get_remote_by_socket(i);

            let mut have = 0;
            for j in 0..4 {
                if 4 * i + j + 1 < pkgs {
                    have += 1;
                }
            }
            for t in 0..n {
                if topo.socket(t) == i && !topo.is_leader(t) {
                    have += 1;
                }
            }

            node.child_not_ready.store(have, Ordering::Relaxed);
            node.have_child.store(have, Ordering::Relaxed);
            node.parent
                .store(if i == 0 { 0 } else { (i - 1) / 4 + 1 }, Ordering::Relaxed);
            for (c, slot) in node.wake_children.iter().enumerate() {
                let child = 2 * i + c + 1;
                slot.store(
                    if child < pkgs { child + 1 } else { 0 },
                    Ordering::Relaxed,
                );
            }
            node.parent_sense.store(0, Ordering::Relaxed);
        }

        for t in 0..n {
            self.sense.get_remote(t).store(1, Ordering::Relaxed);
        }
    }

    fn wait(&self) {
        let topo = topology();
        let id = current_tid();
        let node = self.nodes.get();
        let sense = self.sense.get();
        let s = sense.load(Ordering::Relaxed);
        let leader = topo.is_leader(id);

        // completion tree
        if leader {
            while node.child_not_ready.load(Ordering::Acquire) != 0 {
                std::hint::spin_loop();
            }
            node.child_not_ready
                .store(node.have_child.load(Ordering::Relaxed), Ordering::Relaxed);
            let parent = node.parent.load(Ordering::Relaxed);
            if parent != 0 {
                self.nodes
                    .get_remote_by_socket(parent - 1)
                    .child_not_ready
                    .fetch_sub(1, Ordering::AcqRel);
            }
        } else {
            node.child_not_ready.fetch_sub(1, Ordering::AcqRel);
        }

        // wait for signal
        if id != 0 {
            while node.parent_sense.load(Ordering::Acquire) != s {
                std::hint::spin_loop();
            }
        }

        // signal children in wakeup tree
        if leader {
            for slot in &node.wake_children {
                let child = slot.load(Ordering::Relaxed);
                if child != 0 {
                    self.nodes
                        .get_remote_by_socket(child - 1)
                        .parent_sense
                        .store(s, Ordering::Release);
                }
            }
            if id == 0 {
                node.parent_sense.store(s, Ordering::Release);
            }
        }

        sense.store(s.wrapping_add(1), Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "TopoBarrier"
    }
}

struct OneWayState {
    count: usize,
    generation: usize,
}

/// A single-use rendezvous that self-resets once everyone has arrived.
struct OneWayBarrier {
    state: Mutex<OneWayState>,
    total: usize,
    cond: Condvar,
}

impl OneWayBarrier {
    fn new(total: usize) -> Self {
        Self {
            state: Mutex::new(OneWayState {
                count: 0,
                generation: 0,
            }),
            total,
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        let gen = state.generation;
        state.count += 1;
        if state.count >= self.total {
            state.count = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cond.notify_all();
        } else {
            let _state = self
                .cond
                .wait_while(state, |s| s.generation == gen)
                .unwrap();
        }
    }

    fn reinit(&mut self, total: usize) {
        let state = self.state.get_mut().unwrap();
        state.count = 0;
        self.total = total;
    }
}

/// Two chained one-way barriers. Slower than the topological barrier, but
/// the second phase guarantees every thread has left the first before any
/// thread can re-enter it, which makes this barrier safe to use around
/// active-thread-count changes.
pub struct SimpleBarrier {
    phase1: OneWayBarrier,
    phase2: OneWayBarrier,
}

impl SimpleBarrier {
    pub fn new(active_threads: usize) -> Self {
        Self {
            phase1: OneWayBarrier::new(active_threads),
            phase2: OneWayBarrier::new(active_threads),
        }
    }
}

impl Barrier for SimpleBarrier {
    fn wait(&self) {
        self.phase1.wait();
        self.phase2.wait();
    }

    fn reinit(&mut self, n: usize) {
        self.phase1.reinit(n);
        self.phase2.reinit(n);
    }

    fn name(&self) -> &'static str {
        "SimpleBarrier"
    }
}

/// Centralized sense-reversing barrier with a single arrival counter.
pub struct CountingBarrier {
    count: crossbeam::utils::CachePadded<AtomicUsize>,
    sense: crossbeam::utils::CachePadded<AtomicU32>,
    num: usize,
    local_sense: PerThread<AtomicU32>,
}

impl CountingBarrier {
    pub fn new(active_threads: usize) -> Self {
        let mut this = Self {
            count: crossbeam::utils::CachePadded::new(AtomicUsize::new(0)),
            sense: crossbeam::utils::CachePadded::new(AtomicU32::new(0)),
            num: 0,
            local_sense: PerThread::new(|_| AtomicU32::new(0)),
        };
        this.reinit(active_threads);
        this
    }
}

impl Barrier for CountingBarrier {
    fn reinit(&mut self, n: usize) {
        self.num = n;
        self.count.store(n, Ordering::Relaxed);
        self.sense.store(0, Ordering::Relaxed);
        for t in 0..self.local_sense.len() {
            self.local_sense.get_remote(t).store(0, Ordering::Relaxed);
        }
    }

    fn wait(&self) {
        let local = self.local_sense.get();
        let s = 1 - local.load(Ordering::Relaxed);
        local.store(s, Ordering::Relaxed);

        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.count.store(self.num, Ordering::Relaxed);
            self.sense.store(s, Ordering::Release);
        } else {
            while self.sense.load(Ordering::Acquire) != s {
                std::hint::spin_loop();
            }
        }
    }

    fn name(&self) -> &'static str {
        "CountingBarrier"
    }
}

#[derive(Default)]
struct McsNode {
    child_not_ready: [AtomicU32; 4],
    have_child: [AtomicU32; 4],
    /// Arrival-tree parent tid + 1; 0 for the root.
    parent: AtomicUsize,
    /// Which `child_not_ready` slot of the parent this thread signals.
    parent_slot: AtomicUsize,
    /// Wake-tree child tids + 1; 0 when absent.
    wake_children: [AtomicUsize; 2],
    parent_sense: AtomicU32,
    sense: AtomicU32,
}

/// MCS tree barrier: per-thread 4-ary arrival tree and binary wakeup tree.
pub struct MCSBarrier {
    nodes: PerThread<McsNode>,
}

impl MCSBarrier {
    pub fn new(active_threads: usize) -> Self {
        let mut this = Self {
            nodes: PerThread::new(|_| McsNode::default()),
        };
        this.reinit(active_threads);
        this
    }
}

impl Barrier for MCSBarrier {
    fn reinit(&mut self, n: usize) {
        for i in 0..n {
            let node = self.nodes.get_remote(i);
            for j in 0..4 {
                let v = (4 * i + j + 1 < n) as u32;
                node.child_not_ready[j].store(v, Ordering::Relaxed);
                node.have_child[j].store(v, Ordering::Relaxed);
            }
            node.parent
                .store(if i == 0 { 0 } else { (i - 1) / 4 + 1 }, Ordering::Relaxed);
            node.parent_slot
                .store(if i == 0 { 0 } else { (i - 1) % 4 }, Ordering::Relaxed);
            for (c, slot) in node.wake_children.iter().enumerate() {
                let child = 2 * i + c + 1;
                slot.store(if child < n { child + 1 } else { 0 }, Ordering::Relaxed);
            }
            node.parent_sense.store(0, Ordering::Relaxed);
            node.sense.store(1, Ordering::Relaxed);
        }
    }

    fn wait(&self) {
        let node = self.nodes.get();

        while node
            .child_not_ready
            .iter()
            .any(|c| c.load(Ordering::Acquire) != 0)
        {
            std::hint::spin_loop();
        }
        for j in 0..4 {
            node.child_not_ready[j]
                .store(node.have_child[j].load(Ordering::Relaxed), Ordering::Relaxed);
        }

        let s = node.sense.load(Ordering::Relaxed);
        let parent = node.parent.load(Ordering::Relaxed);
        if parent != 0 {
            let slot = node.parent_slot.load(Ordering::Relaxed);
            self.nodes.get_remote(parent - 1).child_not_ready[slot]
                .store(0, Ordering::Release);
            while node.parent_sense.load(Ordering::Acquire) != s {
                std::hint::spin_loop();
            }
        }

        // signal children in wakeup tree
        for slot in &node.wake_children {
            let child = slot.load(Ordering::Relaxed);
            if child != 0 {
                self.nodes
                    .get_remote(child - 1)
                    .parent_sense
                    .store(s, Ordering::Release);
            }
        }

        node.sense.store(1 - s, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "MCSBarrier"
    }
}

const DISSEM_ROUNDS: usize = 32;

struct DissemNode {
    /// `flags[parity][round]`, written by the round partner.
    flags: [[AtomicU32; DISSEM_ROUNDS]; 2],
    /// Partner tid per round.
    partner: [AtomicUsize; DISSEM_ROUNDS],
    parity: AtomicU32,
    sense: AtomicU32,
}

impl Default for DissemNode {
    fn default() -> Self {
        Self {
            flags: Default::default(),
            partner: [0; DISSEM_ROUNDS].map(AtomicUsize::new),
            parity: AtomicU32::new(0),
            sense: AtomicU32::new(1),
        }
    }
}

/// Dissemination barrier: `ceil(log2(n))` pairwise signalling rounds, no
/// central counter at all.
pub struct DisseminationBarrier {
    nodes: PerThread<DissemNode>,
    log_p: usize,
}

impl DisseminationBarrier {
    pub fn new(active_threads: usize) -> Self {
        let mut this = Self {
            nodes: PerThread::new(|_| DissemNode::default()),
            log_p: 0,
        };
        this.reinit(active_threads);
        this
    }
}

impl Barrier for DisseminationBarrier {
    fn reinit(&mut self, n: usize) {
        self.log_p = n.next_power_of_two().trailing_zeros() as usize;
        assert!(self.log_p <= DISSEM_ROUNDS);

        for i in 0..n {
            let node = self.nodes.get_remote(i);
            node.parity.store(0, Ordering::Relaxed);
            node.sense.store(1, Ordering::Relaxed);
            for p in &node.flags {
                for f in p {
                    f.store(0, Ordering::Relaxed);
                }
            }
            let mut d = 1;
            for r in 0..self.log_p {
                node.partner[r].store((i + d) % n, Ordering::Relaxed);
                d *= 2;
            }
        }
    }

    fn wait(&self) {
        let node = self.nodes.get();
        let parity = node.parity.load(Ordering::Relaxed) as usize;
        let sense = node.sense.load(Ordering::Relaxed);

        for r in 0..self.log_p {
            let partner = node.partner[r].load(Ordering::Relaxed);
            self.nodes.get_remote(partner).flags[parity][r].store(sense, Ordering::Release);
            while node.flags[parity][r].load(Ordering::Acquire) != sense {
                std::hint::spin_loop();
            }
        }

        if parity == 1 {
            node.sense.store(1 - sense, Ordering::Relaxed);
        }
        node.parity.store(1 - parity as u32, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "DisseminationBarrier"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::thread_pool::ThreadPool;

    fn exercise(pool: &ThreadPool, barrier: &mut dyn Barrier, rounds: usize) {
        let n = pool.max_threads();
        barrier.reinit(n);

        // every thread must get through every round
        let barrier = &*barrier;
        pool.run(n, |_| {
            for _ in 0..rounds {
                barrier.wait();
            }
        });
    }

    #[test]
    fn test_all_barriers_complete() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);

        let n = pool.max_threads();
        let mut barriers: Vec<Box<dyn Barrier>> = vec![
            Box::new(CountingBarrier::new(n)),
            Box::new(MCSBarrier::new(n)),
            Box::new(TopoBarrier::new(n)),
            Box::new(DisseminationBarrier::new(n)),
            Box::new(SimpleBarrier::new(n)),
        ];

        for b in &mut barriers {
            exercise(&pool, b.as_mut(), 256);
        }
    }

    #[test]
    fn test_reinit_smaller() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);
        let n = pool.max_threads();

        let mut barrier = TopoBarrier::new(n);
        let mut m = n;
        while m >= 1 {
            barrier.reinit(m);
            let b = &barrier;
            pool.run(m, |_| {
                for _ in 0..64 {
                    b.wait();
                }
            });
            m /= 2;
        }
    }

    #[test]
    fn test_barrier_visibility() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);
        let n = pool.max_threads();

        let barrier = TopoBarrier::new(n);
        let slots: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();

        let rounds = 64;
        let b = &barrier;
        let slots_ref = &slots;
        pool.run(n, |tid| {
            for round in 1..=rounds {
                // write, then rendezvous, then read everyone else's write
                slots_ref[tid].store(round, Ordering::Relaxed);
                b.wait();
                for s in slots_ref {
                    assert!(s.load(Ordering::Relaxed) >= round);
                }
                b.wait();
            }
        });
    }
}
