//! The NUMA-aware page pool.
//!
//! Pages are obtained from the OS in large aligned blocks, preferring huge
//! pages and falling back to regular pages with an optional pre-fault pass.
//! Freed pages go to the free list of the thread that originally allocated
//! them, so a loop that allocates and frees on the same thread never leaves
//! its socket. The fast path is a lock-free per-thread queue; the only lock
//! protects the page→owner map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crossbeam::queue::SegQueue;
use crossbeam::utils::CachePadded;
use once_cell::sync::Lazy;

use crate::thread_pool::current_tid;
use crate::topology::topology;

/// The pool's allocation granule. Matches the common huge-page size so that
/// a single granule can be served by one TLB entry.
pub const PAGE_BYTES: usize = 2 * 1024 * 1024;

static HUGE_PAGE_FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

/// Obtain `n` contiguous pool pages directly from the OS. Tries
/// `MAP_HUGETLB` first; on failure retries with regular pages, optionally
/// touching each hardware page to pre-fault the mapping. Aborts on OS
/// failure; there is no usable fallback.
pub fn alloc_pages(n: usize, prefault: bool) -> *mut u8 {
    assert!(n > 0);
    let len = n * PAGE_BYTES;

    let base_flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    let mut ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            base_flags | libc::MAP_HUGETLB,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        if !HUGE_PAGE_FALLBACK_WARNED.swap(true, Ordering::Relaxed) {
            log::warn!("huge page allocation failed; falling back to regular pages");
        }

        ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, base_flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            panic!("out of memory: mmap of {len} bytes failed");
        }

        if prefault {
            let os_page = 4096;
            for off in (0..len).step_by(os_page) {
                unsafe {
                    std::ptr::write_volatile((ptr as *mut u8).add(off), 0);
                }
            }
        }
    }

    ptr as *mut u8
}

/// Unmap pages returned by [`alloc_pages`]. `n` must match the allocation.
pub fn free_pages(ptr: *mut u8, n: usize) {
    let rv = unsafe { libc::munmap(ptr as *mut libc::c_void, n * PAGE_BYTES) };
    assert_eq!(rv, 0, "munmap failed");
}

struct PagePool {
    /// Per-thread free lists. Lock-free; indexed by tid.
    free: Vec<CachePadded<SegQueue<usize>>>,
    /// Per-thread count of pages obtained from the OS.
    counts: Vec<CachePadded<AtomicI64>>,
    /// Which thread's list a page returns to when freed.
    owner: Mutex<HashMap<usize, usize>>,
}

static POOL: Lazy<PagePool> = Lazy::new(|| {
    let n = topology().max_threads();
    PagePool {
        free: (0..n).map(|_| CachePadded::new(SegQueue::new())).collect(),
        counts: (0..n).map(|_| CachePadded::new(AtomicI64::new(0))).collect(),
        owner: Mutex::new(HashMap::new()),
    }
});

fn alloc_from_os() -> usize {
    let ptr = alloc_pages(1, true) as usize;
    let tid = current_tid();
    POOL.counts[tid].fetch_add(1, Ordering::Relaxed);
    POOL.owner.lock().unwrap().insert(ptr, tid);
    ptr
}

/// Allocate one pool page, preferring the calling thread's free list.
pub fn page_alloc() -> *mut u8 {
    let tid = current_tid();
    if let Some(ptr) = POOL.free[tid].pop() {
        return ptr as *mut u8;
    }
    alloc_from_os() as *mut u8
}

/// Return a page to the pool. The page goes back to the free list of the
/// thread that originally obtained it from the OS.
pub fn page_free(ptr: *mut u8) {
    let addr = ptr as usize;
    let owner = {
        let map = POOL.owner.lock().unwrap();
        *map.get(&addr).expect("freeing a page the pool never allocated")
    };
    POOL.free[owner].push(addr);
}

/// Pre-populate the calling thread's free list with `n` pages.
pub fn prealloc(n: usize) {
    let tid = current_tid();
    for _ in 0..n {
        let ptr = alloc_from_os();
        POOL.free[tid].push(ptr);
    }
}

/// Pages obtained from the OS by `tid`, for statistics reporting.
pub fn pages_allocated_for_thread(tid: usize) -> i64 {
    POOL.counts[tid].load(Ordering::Relaxed)
}

/// Total pages obtained from the OS across all threads.
pub fn pages_allocated_total() -> i64 {
    POOL.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
}
