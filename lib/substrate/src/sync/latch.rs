//! The generation-counted broadcast latch that starts thread-pool rounds.
//!
//! The latch is a single shared `u32` generation counter. Opening the latch
//! bumps the counter and futex-wakes everyone parked on it; each waiter
//! remembers the last generation it saw and blocks until the counter moves
//! one past that. Release-acquire ordering on the counter makes writes
//! before an `open` visible to a waiter once its `wait` returns.
//!
//! The pool serializes opens against waits (it waits for the round-end
//! latch in between), so a waiter observing the counter more than one step
//! ahead means the two sides fell out of sync, and the waiter panics
//! rather than silently skipping rounds. The counter wraps, so 2^32
//! unmatched opens would alias back to "not opened"; nothing gets close.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;

/// The opening side of the latch, held by the pool master.
#[derive(Debug)]
pub struct Latch {
    generation: Arc<AtomicU32>,
}

/// The waiting side, one per worker.
#[derive(Debug, Clone)]
pub struct LatchWaiter {
    /// The last generation this waiter got through.
    seen: u32,
    generation: Arc<AtomicU32>,
    /// Spin with `sched_yield` instead of futex-sleeping. Can help for
    /// short rounds, at the price of busy cpus.
    spin_yield: bool,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            generation: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A waiter whose next [`wait()`](LatchWaiter::wait) blocks until the
    /// next [`open()`](Self::open). Waiters must be created before the
    /// first open; the pool makes all of its waiters at construction.
    pub fn waiter(&self, spin_yield: bool) -> LatchWaiter {
        let seen = self.generation.load(Ordering::Relaxed);
        assert_eq!(seen, 0, "waiters must be created before the latch is opened");
        LatchWaiter {
            seen,
            generation: Arc::clone(&self.generation),
            spin_yield,
        }
    }

    /// Open the latch, releasing every waiter of the current generation.
    ///
    /// Takes `&self`; the caller must be the latch's single opener, which
    /// the pool's round bookkeeping enforces.
    pub fn open(&self) {
        // the increment wraps
        self.generation.fetch_add(1, Ordering::Release);
        futex_wake_all(&self.generation);
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl LatchWaiter {
    /// Block until the latch opens the generation after the one this
    /// waiter last got through.
    pub fn wait(&mut self) {
        loop {
            let current = self.generation.load(Ordering::Acquire);
            match current.wrapping_sub(self.seen) {
                // not open yet
                0 => {}
                1 => break,
                ahead => panic!("latch ran {ahead} generations ahead of a waiter"),
            }

            if self.spin_yield {
                std::hint::spin_loop();
                std::thread::yield_now();
            } else {
                futex_wait(&self.generation, current);
            }
        }

        self.seen = self.seen.wrapping_add(1);
    }
}

// The two futex operations the latch needs, via raw syscalls; the unused
// timeout / second-word / mask arguments are always null. FUTEX_PRIVATE
// is fine since the latch is never shared across processes.

/// Wake every thread parked on `word`.
fn futex_wake_all(word: &AtomicU32) {
    let rv = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            // the kernel truncates the wake count to an int
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null_mut::<u32>(),
            0u32,
        )
    };
    assert!(rv >= 0, "FUTEX_WAKE failed: {}", Errno::last());
}

/// Park on `word` until it moves away from `expected` (or spuriously).
fn futex_wait(word: &AtomicU32, expected: u32) {
    let rv = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null_mut::<u32>(),
            0u32,
        )
    };
    if rv < 0 {
        let errno = Errno::last();
        // EAGAIN: the word already moved; EINTR: signal. Both mean re-check.
        assert!(
            matches!(errno, Errno::EAGAIN | Errno::EINTR),
            "FUTEX_WAIT failed: {errno}"
        );
    }
}
