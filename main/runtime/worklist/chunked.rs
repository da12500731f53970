//! Per-socket chunked worklists.
//!
//! Items move in fixed-size chunks. Each thread owns up to two chunks: one
//! it pushes into and one it pops from. A filled push chunk is published to
//! the owning thread's *socket pool*; a drained pop chunk is recycled and
//! replaced from that pool. When a socket pool runs dry, socket leaders
//! steal half of another socket's pooled chunks. Chunk memory comes from a
//! fixed-size heap backed by the page pool, so chunks stay on the socket
//! that carved them.

use std::alloc::Layout;
use std::mem::MaybeUninit;

use crossbeam::queue::SegQueue;
use crossbeam::utils::CachePadded;
use substrate::heaps::FixedSizeHeap;
use substrate::per_thread::PerThread;
use substrate::thread_pool::current_tid;
use substrate::topology::topology;

use super::Worklist;
use crate::utility::OwnedByThread;

pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// A fixed-capacity ring of items; the payload of one chunk.
struct FixedRing<T, const K: usize> {
    head: usize,
    len: usize,
    slots: [MaybeUninit<T>; K],
}

impl<T, const K: usize> FixedRing<T, K> {
    fn new() -> Self {
        Self {
            head: 0,
            len: 0,
            // SAFETY: an array of MaybeUninit needs no initialization
            slots: unsafe { MaybeUninit::uninit().assume_init() },
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn push_back(&mut self, value: T) -> Result<(), T> {
        if self.len == K {
            return Err(value);
        }
        self.slots[(self.head + self.len) % K].write(value);
        self.len += 1;
        Ok(())
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let idx = self.head;
        self.head = (self.head + 1) % K;
        self.len -= 1;
        // SAFETY: slot `idx` was written by a successful push
        Some(unsafe { self.slots[idx].assume_init_read() })
    }

    fn pop_back(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        let idx = (self.head + self.len) % K;
        // SAFETY: slot `idx` was written by a successful push
        Some(unsafe { self.slots[idx].assume_init_read() })
    }
}

impl<T, const K: usize> Drop for FixedRing<T, K> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

/// An owning chunk pointer, movable through the socket pools.
struct ChunkPtr<T, const K: usize>(*mut FixedRing<T, K>);

// SAFETY: a ChunkPtr uniquely owns its chunk; sending it transfers the
// items, which is fine for T: Send.
unsafe impl<T: Send, const K: usize> Send for ChunkPtr<T, K> {}

/// A thread's private chunk pair.
struct Tld<T, const K: usize> {
    push_chunk: *mut FixedRing<T, K>,
    pop_chunk: *mut FixedRing<T, K>,
    /// Rotation cursor for cross-socket stealing.
    rotation: usize,
}

impl<T, const K: usize> Default for Tld<T, K> {
    fn default() -> Self {
        Self {
            push_chunk: std::ptr::null_mut(),
            pop_chunk: std::ptr::null_mut(),
            rotation: 0,
        }
    }
}

// SAFETY: the raw chunk pointers are owned by the slot; the owner-thread
// convention of OwnedByThread serializes access.
unsafe impl<T: Send, const K: usize> Send for Tld<T, K> {}

/// The chunked worklist. `IS_LIFO` selects pop order within a thread's own
/// chunks; transfer between threads is unordered either way.
pub struct PerSocketChunkQueue<T: Send, const K: usize = DEFAULT_CHUNK_SIZE, const IS_LIFO: bool = false> {
    heap: FixedSizeHeap,
    tld: PerThread<OwnedByThread<Tld<T, K>>>,
    /// Published full chunks, one pool per socket.
    pools: Vec<CachePadded<SegQueue<ChunkPtr<T, K>>>>,
}

/// Chunked FIFO: pushes and pops use separate chunks, giving roughly
/// breadth-first order per thread. The default `for_each` worklist.
pub type PerSocketChunkFifo<T, const K: usize = DEFAULT_CHUNK_SIZE> =
    PerSocketChunkQueue<T, K, false>;

/// Chunked LIFO: one chunk serves both ends, giving depth-first order per
/// thread.
pub type PerSocketChunkLifo<T, const K: usize = DEFAULT_CHUNK_SIZE> =
    PerSocketChunkQueue<T, K, true>;

impl<T: Send, const K: usize, const IS_LIFO: bool> PerSocketChunkQueue<T, K, IS_LIFO> {
    pub fn new() -> Self {
        Self {
            heap: FixedSizeHeap::new(Layout::new::<FixedRing<T, K>>()),
            tld: PerThread::new(|_| OwnedByThread::new(Tld::default())),
            pools: (0..topology().max_sockets())
                .map(|_| CachePadded::new(SegQueue::new()))
                .collect(),
        }
    }

    fn alloc_chunk(&self) -> *mut FixedRing<T, K> {
        let ptr = self.heap.allocate() as *mut FixedRing<T, K>;
        // SAFETY: the heap hands out blocks sized and aligned for the ring
        unsafe { ptr.write(FixedRing::new()) };
        ptr
    }

    /// # Safety
    /// `ptr` must be a chunk allocated by this worklist, not referenced
    /// anywhere else.
    unsafe fn free_chunk(&self, ptr: *mut FixedRing<T, K>) {
        unsafe { std::ptr::drop_in_place(ptr) };
        self.heap.deallocate(ptr as *mut u8);
    }

    #[allow(clippy::mut_from_ref)]
    fn tld(&self) -> &mut Tld<T, K> {
        // SAFETY: only the owning thread touches its chunk pair
        unsafe { self.tld.get().get_mut() }
    }

    fn my_pool(&self) -> &SegQueue<ChunkPtr<T, K>> {
        &self.pools[topology().socket(current_tid())]
    }

    fn do_push(&self, item: T) {
        let tld = self.tld();
        // LIFO pushes into the pop chunk so its own pushes come back first
        let slot = if IS_LIFO {
            &mut tld.pop_chunk
        } else {
            &mut tld.push_chunk
        };

        if slot.is_null() {
            *slot = self.alloc_chunk();
        }
        // SAFETY: our own chunk
        let chunk = unsafe { &mut **slot };
        if let Err(item) = chunk.push_back(item) {
            // chunk is full: publish it and start a fresh one
            self.my_pool().push(ChunkPtr(*slot));
            *slot = self.alloc_chunk();
            // SAFETY: freshly allocated, definitely has room
            let fresh = unsafe { &mut **slot };
            let pushed = fresh.push_back(item);
            debug_assert!(pushed.is_ok());
        }
    }

    fn pop_local(chunk: &mut FixedRing<T, K>) -> Option<T> {
        if IS_LIFO {
            chunk.pop_back()
        } else {
            chunk.pop_front()
        }
    }

    fn do_pop(&self) -> Option<T> {
        let tld = self.tld();

        if !tld.pop_chunk.is_null() {
            // SAFETY: our own chunk
            let chunk = unsafe { &mut *tld.pop_chunk };
            if let Some(item) = Self::pop_local(chunk) {
                return Some(item);
            }
            // drained; recycle it
            // SAFETY: nothing else references our drained pop chunk
            unsafe { self.free_chunk(tld.pop_chunk) };
            tld.pop_chunk = std::ptr::null_mut();
        }

        // refill from the socket pool, then by stealing
        if let Some(ChunkPtr(chunk)) = self.fetch_chunk(tld) {
            tld.pop_chunk = chunk;
            // SAFETY: the chunk is ours now
            if let Some(item) = Self::pop_local(unsafe { &mut *chunk }) {
                return Some(item);
            }
        }

        // last resort: drain our own unpublished push buffer
        if !IS_LIFO && tld.pop_chunk.is_null() && !tld.push_chunk.is_null() {
            tld.pop_chunk = tld.push_chunk;
            tld.push_chunk = std::ptr::null_mut();
            // SAFETY: our own chunk
            return Self::pop_local(unsafe { &mut *tld.pop_chunk });
        }

        None
    }

    /// Pull a chunk from the own socket's pool, else steal. Only leaders
    /// cross socket boundaries; when they do, they take half of the
    /// victim's pooled chunks for their own socket.
    fn fetch_chunk(&self, tld: &mut Tld<T, K>) -> Option<ChunkPtr<T, K>> {
        let topo = topology();
        let tid = current_tid();
        let my_socket = topo.socket(tid);

        if let Some(chunk) = self.pools[my_socket].pop() {
            return Some(chunk);
        }

        if self.pools.len() == 1 || !topo.is_leader(tid) {
            return None;
        }

        let n = self.pools.len();
        for i in 0..n - 1 {
            let victim = (my_socket + 1 + tld.rotation + i) % n;
            if victim == my_socket {
                continue;
            }
            let victim_pool = &self.pools[victim];
            if let Some(first) = victim_pool.pop() {
                tld.rotation = tld.rotation.wrapping_add(i + 1);
                let take = victim_pool.len() / 2;
                for _ in 0..take {
                    match victim_pool.pop() {
                        Some(chunk) => self.pools[my_socket].push(chunk),
                        None => break,
                    }
                }
                return Some(first);
            }
        }
        None
    }

    /// Publish the calling thread's private chunks so other threads (and
    /// emptiness checks) can see their items. Used by bucket schedulers at
    /// rendezvous points.
    pub fn flush_local(&self) {
        let tld = self.tld();
        for slot in [&mut tld.push_chunk, &mut tld.pop_chunk] {
            if slot.is_null() {
                continue;
            }
            // SAFETY: our own chunk
            let len = unsafe { &**slot }.len();
            if len > 0 {
                self.pools[topology().socket(current_tid())].push(ChunkPtr(*slot));
            } else {
                // SAFETY: drained and unshared
                unsafe { self.free_chunk(*slot) };
            }
            *slot = std::ptr::null_mut();
        }
    }

    /// True when every socket pool is empty. Items may still sit in other
    /// threads' private chunks; advisory only.
    fn pools_empty(&self) -> bool {
        self.pools.iter().all(|p| p.is_empty())
    }
}

impl<T: Send, const K: usize, const IS_LIFO: bool> Default for PerSocketChunkQueue<T, K, IS_LIFO> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send, const K: usize, const IS_LIFO: bool> Drop for PerSocketChunkQueue<T, K, IS_LIFO> {
    fn drop(&mut self) {
        for tid in 0..self.tld.len() {
            // SAFETY: drop is a quiescent point
            let tld = unsafe { self.tld.get_remote(tid).get_mut() };
            for slot in [tld.push_chunk, tld.pop_chunk] {
                if !slot.is_null() {
                    // SAFETY: private chunk of a quiescent thread
                    unsafe { self.free_chunk(slot) };
                }
            }
            tld.push_chunk = std::ptr::null_mut();
            tld.pop_chunk = std::ptr::null_mut();
        }
        for pool in &self.pools {
            while let Some(ChunkPtr(chunk)) = pool.pop() {
                // SAFETY: popped from the pool, so uniquely owned
                unsafe { self.free_chunk(chunk) };
            }
        }
    }
}

impl<T: Send, const K: usize, const IS_LIFO: bool> Worklist<T>
    for PerSocketChunkQueue<T, K, IS_LIFO>
{
    fn push(&self, item: T) {
        self.do_push(item);
    }

    fn pop(&self) -> Option<T> {
        self.do_pop()
    }

    fn empty(&self) -> bool {
        self.pools_empty()
    }
}
