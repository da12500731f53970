//! Block heaps layered on the page pool.
//!
//! [`FixedSizeHeap`] serves blocks of one size from per-thread free lists,
//! carving fresh page-pool pages when a list runs dry. [`Pow2BlockHeap`]
//! fans out over one fixed-size heap per power-of-two size class.
//! [`BumpHeap`] is a linear allocator for iteration-scoped scratch memory.
//!
//! A block freed on thread T goes back to T's free list, keeping hot blocks
//! on their socket. Heaps accept frees even after they have been marked
//! invalid at teardown, so a straggling `deallocate` is benign.

use std::alloc::Layout;
use std::cell::Cell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::queue::SegQueue;
use crossbeam::utils::CachePadded;
use once_cell::sync::Lazy;

use crate::page_pool;
use crate::thread_pool::current_tid;
use crate::topology::topology;

/// A heap serving blocks of a single size.
pub struct FixedSizeHeap {
    block_size: usize,
    /// Per-thread block free lists, indexed by tid.
    free: Vec<CachePadded<SegQueue<usize>>>,
    /// Every page carved by this heap, for return to the page pool on drop.
    pages: Mutex<Vec<usize>>,
    invalid: AtomicBool,
}

impl FixedSizeHeap {
    /// A heap whose blocks can hold values of `layout`. The block size is
    /// `layout.size()` rounded up to the alignment, so that consecutively
    /// carved blocks stay aligned.
    pub fn new(layout: Layout) -> Self {
        let align = layout.align().max(16);
        let block_size = layout.size().max(1).next_multiple_of(align);
        assert!(
            block_size <= page_pool::PAGE_BYTES,
            "block size {block_size} exceeds a pool page"
        );

        let n = topology().max_threads();
        Self {
            block_size,
            free: (0..n).map(|_| CachePadded::new(SegQueue::new())).collect(),
            pages: Mutex::new(Vec::new()),
            invalid: AtomicBool::new(false),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocate one block. O(1) against the calling thread's free list; on
    /// an empty list, carves a fresh page into blocks.
    pub fn allocate(&self) -> *mut u8 {
        assert!(
            !self.invalid.load(Ordering::Relaxed),
            "allocating from a heap after teardown"
        );

        let tid = current_tid();
        if let Some(addr) = self.free[tid].pop() {
            return addr as *mut u8;
        }

        // carve a new page; hand out the first block and bank the rest
        let page = page_pool::page_alloc() as usize;
        self.pages.lock().unwrap().push(page);

        let nblocks = page_pool::PAGE_BYTES / self.block_size;
        for i in 1..nblocks {
            self.free[tid].push(page + i * self.block_size);
        }
        page as *mut u8
    }

    /// Return a block to the calling thread's free list. Accepted even
    /// after teardown so dangling frees are benign.
    pub fn deallocate(&self, ptr: *mut u8) {
        self.free[current_tid()].push(ptr as usize);
    }

    /// Number of blocks currently on free lists (for tests; racy under
    /// concurrent use).
    pub fn free_blocks(&self) -> usize {
        self.free.iter().map(|q| q.len()).sum()
    }

    fn mark_invalid(&self) {
        self.invalid.store(true, Ordering::Relaxed);
    }
}

impl Drop for FixedSizeHeap {
    fn drop(&mut self) {
        for page in self.pages.lock().unwrap().drain(..) {
            page_pool::page_free(page as *mut u8);
        }
    }
}

/// Smallest pow2 class served (2^4 = 16 bytes).
const MIN_CLASS_LOG2: u32 = 4;
/// Largest pow2 class served (2^17 = 128 KiB).
const MAX_CLASS_LOG2: u32 = 17;

/// A variable-size allocator over power-of-two size classes. Good for small
/// and medium allocations; anything larger should go to the page pool
/// directly.
pub struct Pow2BlockHeap {
    heaps: Vec<FixedSizeHeap>,
}

impl Pow2BlockHeap {
    pub fn new() -> Self {
        let heaps = (MIN_CLASS_LOG2..=MAX_CLASS_LOG2)
            .map(|l| {
                FixedSizeHeap::new(Layout::from_size_align(1 << l, 16).unwrap())
            })
            .collect();
        Self { heaps }
    }

    fn class_for(bytes: usize) -> usize {
        assert!(bytes > 0, "zero-sized pow2 allocation");
        let log2 = bytes.next_power_of_two().trailing_zeros().max(MIN_CLASS_LOG2);
        assert!(
            log2 <= MAX_CLASS_LOG2,
            "allocation of {bytes} bytes exceeds the largest pow2 class"
        );
        (log2 - MIN_CLASS_LOG2) as usize
    }

    /// Allocate at least `bytes`, rounded up to the next size class.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        self.heaps[Self::class_for(bytes)].allocate()
    }

    /// Free an allocation. `bytes` must be the size passed to
    /// [`allocate`](Self::allocate) so the right class is chosen.
    pub fn deallocate(&self, ptr: *mut u8, bytes: usize) {
        self.heaps[Self::class_for(bytes)].deallocate(ptr);
    }

    pub fn mark_invalid(&self) {
        for h in &self.heaps {
            h.mark_invalid();
        }
    }
}

impl Default for Pow2BlockHeap {
    fn default() -> Self {
        Self::new()
    }
}

static POW2_HEAP: Lazy<Pow2BlockHeap> = Lazy::new(Pow2BlockHeap::new);

/// The process-wide pow2 heap. Never torn down; the runtime marks it
/// invalid at shutdown so late allocations fail loudly while late frees are
/// still accepted.
pub fn pow2_heap() -> &'static Pow2BlockHeap {
    &POW2_HEAP
}

/// A linear allocator for per-iteration scratch memory. Not thread-safe;
/// each worker owns its own.
pub struct BumpHeap {
    /// Page-pool pages backing the heap, in allocation order.
    pages: Vec<usize>,
    /// Index of the page the cursor is in.
    current_page: Cell<usize>,
    /// Byte offset of the cursor within the current page.
    cursor: Cell<usize>,
}

impl BumpHeap {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            current_page: Cell::new(0),
            cursor: Cell::new(0),
        }
    }

    /// Allocate `layout` from the bump region, pulling a fresh page when the
    /// current one is exhausted. The memory is valid until
    /// [`reset`](Self::reset).
    pub fn allocate(&mut self, layout: Layout) -> *mut u8 {
        assert!(
            layout.size() <= page_pool::PAGE_BYTES && layout.align() <= page_pool::PAGE_BYTES,
            "per-iteration allocation of {} bytes is too large",
            layout.size()
        );

        if self.pages.is_empty() {
            self.pages.push(page_pool::page_alloc() as usize);
        }

        loop {
            let base = self.pages[self.current_page.get()];
            let aligned = (base + self.cursor.get()).next_multiple_of(layout.align());
            let end = aligned + layout.size();

            if end <= base + page_pool::PAGE_BYTES {
                self.cursor.set(end - base);
                return aligned as *mut u8;
            }

            // current page exhausted; move to the next, pulling one if needed
            if self.current_page.get() + 1 == self.pages.len() {
                self.pages.push(page_pool::page_alloc() as usize);
            }
            self.current_page.set(self.current_page.get() + 1);
            self.cursor.set(0);
        }
    }

    /// Snap the cursor back to the start. Pages are retained for reuse;
    /// everything previously allocated is invalidated.
    pub fn reset(&mut self) {
        self.current_page.set(0);
        self.cursor.set(0);
    }
}

impl Default for BumpHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BumpHeap {
    fn drop(&mut self) {
        for page in self.pages.drain(..) {
            page_pool::page_free(page as *mut u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_round_trip() {
        let _guard = crate::test_util::serialize();
        let heap = FixedSizeHeap::new(Layout::new::<[u64; 8]>());

        let a = heap.allocate();
        let free_before = heap.free_blocks();
        heap.deallocate(a);

        // free capacity is restored and the same address is available again
        assert_eq!(heap.free_blocks(), free_before + 1);
        let b = heap.allocate();
        assert_eq!(a, b);
        heap.deallocate(b);
    }

    #[test]
    fn test_fixed_blocks_distinct() {
        let _guard = crate::test_util::serialize();
        let heap = FixedSizeHeap::new(Layout::new::<u128>());

        let mut blocks: Vec<*mut u8> = (0..100).map(|_| heap.allocate()).collect();
        blocks.sort();
        blocks.dedup();
        assert_eq!(blocks.len(), 100);

        for b in blocks {
            heap.deallocate(b);
        }
    }

    #[test]
    fn test_pow2_classes() {
        let _guard = crate::test_util::serialize();
        let heap = Pow2BlockHeap::new();

        for size in [1, 15, 16, 17, 100, 4096, 1 << 17] {
            let p = heap.allocate(size);
            unsafe {
                std::ptr::write_bytes(p, 0x5A, size);
            }
            heap.deallocate(p, size);
        }
    }

    #[test]
    #[should_panic]
    fn test_pow2_too_large() {
        let _guard = crate::test_util::serialize();
        let heap = Pow2BlockHeap::new();
        let _ = heap.allocate((1 << 17) + 1);
    }

    #[test]
    fn test_bump_reset() {
        let _guard = crate::test_util::serialize();
        let mut heap = BumpHeap::new();

        let a = heap.allocate(Layout::from_size_align(100, 8).unwrap());
        let b = heap.allocate(Layout::from_size_align(100, 8).unwrap());
        assert_ne!(a, b);

        heap.reset();
        let c = heap.allocate(Layout::from_size_align(100, 8).unwrap());
        assert_eq!(a, c);
    }

    #[test]
    fn test_bump_spills_to_new_page() {
        let _guard = crate::test_util::serialize();
        let mut heap = BumpHeap::new();
        let big = Layout::from_size_align(page_pool::PAGE_BYTES / 2 + 1, 8).unwrap();

        let a = heap.allocate(big);
        let b = heap.allocate(big);
        assert_ne!(a, b);

        heap.reset();
        assert_eq!(heap.allocate(big), a);
    }
}
