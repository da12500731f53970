//! Per-thread and per-socket storage.
//!
//! Each thread owns a fixed-size arena; a slot manager hands out per-type
//! *offsets* into every arena at once. The address of `(thread, offset)` is
//! stable for the program's lifetime: arenas are never unmapped, and a
//! freed offset goes to a free list for reuse by a later allocation.
//!
//! Offsets are powers of two with a cache-line minimum, allocated bump-style
//! from the front of the arena; freed offsets of a larger class are split
//! "vending-machine change" style when a smaller class needs one.

use std::marker::PhantomData;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use once_cell::sync::Lazy;

use crate::page_pool;
use crate::thread_pool::current_tid;
use crate::topology::topology;

/// Arena size per thread: one pool page.
const ARENA_BYTES: usize = page_pool::PAGE_BYTES;

/// Minimum slot class: one (generous) cache line, so no two slots ever
/// share a line.
const MIN_CLASS_LOG2: u32 = 7;
const MAX_CLASS_LOG2: u32 = ARENA_BYTES.trailing_zeros();

static_assertions::const_assert_eq!(1 << MIN_CLASS_LOG2, 128);

/// The slot manager for one storage domain (per-thread or per-socket).
pub struct PerBackend {
    next_loc: AtomicUsize,
    /// Arena base pointer per tid. For the per-socket domain, every member
    /// of a socket aliases the leader's arena.
    heads: Box<[AtomicPtr<u8>]>,
    /// Freed offsets by log2 size class.
    free_offsets: Mutex<Vec<Vec<usize>>>,
}

impl PerBackend {
    fn new(max_threads: usize) -> Self {
        Self {
            next_loc: AtomicUsize::new(0),
            heads: (0..max_threads)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            free_offsets: Mutex::new(vec![Vec::new(); (MAX_CLASS_LOG2 + 1) as usize]),
        }
    }

    fn class_log2(size: usize) -> u32 {
        let log2 = size
            .next_power_of_two()
            .trailing_zeros()
            .max(MIN_CLASS_LOG2);
        assert!(
            log2 < MAX_CLASS_LOG2,
            "per-thread slot of {size} bytes is too large"
        );
        log2
    }

    /// Hand out an offset able to hold `size` bytes, reusing freed offsets
    /// when possible.
    pub fn alloc_offset(&self, size: usize) -> usize {
        let ll = Self::class_log2(size);
        let size = 1usize << ll;

        if self.next_loc.load(Ordering::Relaxed) + size <= ARENA_BYTES {
            // simple path, where we allocate bump ptr style
            let offset = self.next_loc.fetch_add(size, Ordering::Relaxed);
            if offset + size <= ARENA_BYTES {
                return offset;
            }
        }

        let mut free = self.free_offsets.lock().unwrap();

        if let Some(offset) = free[ll as usize].pop() {
            return offset;
        }

        // find a bigger class to split
        let Some(bigger) = (ll as usize + 1..free.len()).find(|&i| !free[i].is_empty()) else {
            panic!("per-thread storage out of memory");
        };

        // Use the first piece equal to the required size and produce vending
        // machine change for the rest.
        let offset = free[bigger].pop().unwrap();
        let end = offset + (1 << bigger);
        let mut start = offset + size;
        let mut i = bigger - 1;
        while start < end {
            free[i].push(start);
            start += 1 << i;
            i -= 1;
        }

        offset
    }

    /// Return an offset for reuse. If it was the most recent bump
    /// allocation, the bump pointer is rolled back instead.
    pub fn dealloc_offset(&self, offset: usize, size: usize) {
        let ll = Self::class_log2(size);
        let size = 1usize << ll;

        let expected = offset + size;
        if self
            .next_loc
            .compare_exchange(expected, offset, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            // allocation was at the end, so recovered some memory
            return;
        }

        self.free_offsets.lock().unwrap()[ll as usize].push(offset);
    }

    /// The slot address for `(tid, offset)`. Stable for the program's
    /// lifetime once the thread's arena exists.
    pub fn remote(&self, tid: usize, offset: usize) -> *mut u8 {
        let base = self.heads[tid].load(Ordering::Acquire);
        assert!(
            !base.is_null(),
            "per-thread arena for tid {tid} is not initialized; \
             the thread pool must be built first"
        );
        unsafe { base.add(offset) }
    }

    /// The calling thread's slot address for `offset`.
    pub fn local(&self, offset: usize) -> *mut u8 {
        self.remote(current_tid(), offset)
    }

    /// Set up the calling thread's arena. Called by every pool worker at
    /// startup; idempotent so successive pools reuse the arenas.
    fn init_thread(&self) {
        let tid = current_tid();
        if !self.heads[tid].load(Ordering::Acquire).is_null() {
            return;
        }
        let arena = page_pool::alloc_pages(ARENA_BYTES / page_pool::PAGE_BYTES, true);
        unsafe { std::ptr::write_bytes(arena, 0, ARENA_BYTES) };
        self.heads[tid].store(arena, Ordering::Release);
    }

    /// Set up the calling thread's view of its socket's arena. The socket
    /// leader allocates and publishes; other members spin until the leader's
    /// pointer appears, then alias it.
    fn init_socket(&self) {
        let topo = topology();
        let tid = current_tid();
        let leader = topo.leader(tid);

        if tid == leader {
            self.init_thread();
            return;
        }

        if !self.heads[tid].load(Ordering::Acquire).is_null() {
            return;
        }

        // wait for the leader to publish the socket arena
        loop {
            let base = self.heads[leader].load(Ordering::Acquire);
            if !base.is_null() {
                self.heads[tid].store(base, Ordering::Release);
                return;
            }
            std::hint::spin_loop();
        }
    }
}

static PTS_BACKEND: Lazy<PerBackend> = Lazy::new(|| PerBackend::new(topology().max_threads()));
static PSS_BACKEND: Lazy<PerBackend> = Lazy::new(|| PerBackend::new(topology().max_threads()));

/// The per-thread storage backend.
pub fn pts_backend() -> &'static PerBackend {
    &PTS_BACKEND
}

/// The per-socket storage backend.
pub fn pss_backend() -> &'static PerBackend {
    &PSS_BACKEND
}

/// Initialize the calling thread's arenas. The thread pool calls this on
/// the master and on every worker before the first round.
pub fn init_current_thread() {
    pts_backend().init_thread();
    pss_backend().init_socket();
}

/// One `T` per thread, each in its owning thread's arena.
///
/// `get_remote` makes every slot observable from every thread, so `T` must
/// be `Sync`; accessing another thread's slot carries no synchronization
/// beyond what `T` provides.
pub struct PerThread<T> {
    offset: usize,
    _marker: PhantomData<T>,
}

impl<T: Sync> PerThread<T> {
    /// Construct a `T` in every thread's slot. `init` is called with each
    /// tid, on the constructing thread.
    pub fn new(mut init: impl FnMut(usize) -> T) -> Self {
        assert!(std::mem::align_of::<T>() <= 1 << MIN_CLASS_LOG2);

        let b = pts_backend();
        let offset = b.alloc_offset(std::mem::size_of::<T>().max(1));
        for tid in 0..topology().max_threads() {
            unsafe { std::ptr::write(b.remote(tid, offset) as *mut T, init(tid)) };
        }
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    /// The calling thread's slot. One array load plus a pointer add.
    pub fn get(&self) -> &T {
        unsafe { &*(pts_backend().local(self.offset) as *const T) }
    }

    /// Thread `tid`'s slot. The reference is valid (and its address stable)
    /// for the life of this `PerThread`.
    pub fn get_remote(&self, tid: usize) -> &T {
        unsafe { &*(pts_backend().remote(tid, self.offset) as *const T) }
    }

    /// Number of slots (`max_threads`).
    pub fn len(&self) -> usize {
        topology().max_threads()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0..self.len()).map(|tid| self.get_remote(tid))
    }
}

impl<T> Drop for PerThread<T> {
    fn drop(&mut self) {
        let b = pts_backend();
        for tid in 0..topology().max_threads() {
            unsafe { std::ptr::drop_in_place(b.remote(tid, self.offset) as *mut T) };
        }
        b.dealloc_offset(self.offset, std::mem::size_of::<T>().max(1));
    }
}

/// One `T` per socket, stored in the socket leader's arena and shared by
/// every thread on that socket.
pub struct PerSocket<T> {
    offset: usize,
    _marker: PhantomData<T>,
}

impl<T: Sync> PerSocket<T> {
    /// Construct a `T` in every socket's slot. `init` is called with each
    /// socket index.
    pub fn new(mut init: impl FnMut(usize) -> T) -> Self {
        assert!(std::mem::align_of::<T>() <= 1 << MIN_CLASS_LOG2);

        let topo = topology();
        let b = pss_backend();
        let offset = b.alloc_offset(std::mem::size_of::<T>().max(1));
        for socket in 0..topo.max_sockets() {
            let leader = topo.leader_for_socket(socket);
            unsafe { std::ptr::write(b.remote(leader, offset) as *mut T, init(socket)) };
        }
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    /// The calling thread's socket slot.
    pub fn get(&self) -> &T {
        unsafe { &*(pss_backend().local(self.offset) as *const T) }
    }

    /// The slot of the given socket.
    pub fn get_remote_by_socket(&self, socket: usize) -> &T {
        let leader = topology().leader_for_socket(socket);
        unsafe { &*(pss_backend().remote(leader, self.offset) as *const T) }
    }
}

impl<T> Drop for PerSocket<T> {
    fn drop(&mut self) {
        let topo = topology();
        let b = pss_backend();
        for socket in 0..topo.max_sockets() {
            let leader = topo.leader_for_socket(socket);
            unsafe { std::ptr::drop_in_place(b.remote(leader, self.offset) as *mut T) };
        }
        b.dealloc_offset(self.offset, std::mem::size_of::<T>().max(1));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::thread_pool::ThreadPool;

    #[test]
    fn test_stable_addresses() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);

        let pt: PerThread<AtomicUsize> = PerThread::new(|tid| AtomicUsize::new(tid));

        let addrs: Vec<_> = (0..pool.max_threads())
            .map(|t| pt.get_remote(t) as *const AtomicUsize)
            .collect();

        // same address on every later call
        for (t, &addr) in addrs.iter().enumerate() {
            assert_eq!(pt.get_remote(t) as *const AtomicUsize, addr);
            assert_eq!(pt.get_remote(t).load(Ordering::Relaxed), t);
        }

        // distinct threads get distinct, non-line-sharing slots
        for w in addrs.windows(2) {
            assert_ne!(w[0], w[1]);
        }
    }

    #[test]
    fn test_local_slot_matches_remote() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);
        let n = pool.max_threads();

        let pt: PerThread<AtomicUsize> = PerThread::new(|_| AtomicUsize::new(0));

        pool.run(n, |tid| {
            pt.get().store(tid + 1, Ordering::Relaxed);
        });

        for t in 0..n {
            assert_eq!(pt.get_remote(t).load(Ordering::Relaxed), t + 1);
        }
    }

    #[test]
    fn test_offset_reuse() {
        let _guard = crate::test_util::serialize();
        let _pool = ThreadPool::new(false, false);

        // creating and dropping many instances must not exhaust the arena
        for round in 0..10_000usize {
            let pt: PerThread<AtomicUsize> = PerThread::new(|_| AtomicUsize::new(round));
            assert_eq!(pt.get().load(Ordering::Relaxed), round);
        }
    }

    #[test]
    fn test_per_socket_shared_on_socket() {
        let _guard = crate::test_util::serialize();
        let pool = ThreadPool::new(false, false);
        let n = pool.max_threads();
        let topo = topology();

        let ps: PerSocket<AtomicUsize> = PerSocket::new(|_| AtomicUsize::new(0));

        // every member of a socket observes the leader's slot
        pool.run(n, |tid| {
            if topo.is_leader(tid) {
                ps.get().store(tid + 100, Ordering::SeqCst);
            }
        });
        pool.run(n, |tid| {
            let leader = topo.leader(tid);
            assert_eq!(ps.get().load(Ordering::SeqCst), leader + 100);
        });
    }

    #[test]
    fn test_drop_runs_destructors() {
        let _guard = crate::test_util::serialize();
        let _pool = ThreadPool::new(false, false);

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        DROPS.store(0, Ordering::Relaxed);
        let pt: PerThread<Counted> = PerThread::new(|_| Counted);
        drop(pt);
        assert_eq!(DROPS.load(Ordering::Relaxed), topology().max_threads());
    }
}
