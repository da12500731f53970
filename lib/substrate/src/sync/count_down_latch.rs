use std::sync::{Arc, Condvar, Mutex};

/// A counter handle for a reusable count-down latch, held by one worker
/// thread. Each counter must count down exactly once per generation.
#[derive(Debug)]
pub struct LatchCounter {
    inner: Arc<LatchInner>,
    /// An ID for this counter's count-down round.
    generation: usize,
}

/// The waiter side of the latch, held by the master. `wait()` returns once
/// every counter of the current generation has counted down.
#[derive(Debug)]
pub struct LatchWaiter {
    inner: Arc<LatchInner>,
    /// An ID for this waiter's count-down round.
    generation: usize,
}

#[derive(Debug)]
struct LatchInner {
    lock: Mutex<LatchState>,
    cond: Condvar,
}

#[derive(Debug)]
struct LatchState {
    /// The current latch "round".
    generation: usize,
    /// Counters remaining in this generation.
    counters: usize,
    /// Total number of counters.
    total_counters: usize,
}

/// Build a latch with `counters` counter handles and a single waiter. The
/// populations are fixed for the latch's lifetime; the thread pool sizes
/// them once at construction.
pub fn build_count_down_latch(counters: usize) -> (Vec<LatchCounter>, LatchWaiter) {
    let inner = Arc::new(LatchInner {
        lock: Mutex::new(LatchState {
            generation: 0,
            counters,
            total_counters: counters,
        }),
        cond: Condvar::new(),
    });

    let handles = (0..counters)
        .map(|_| LatchCounter {
            inner: Arc::clone(&inner),
            generation: 0,
        })
        .collect();

    let waiter = LatchWaiter {
        inner,
        generation: 0,
    };

    (handles, waiter)
}

impl LatchCounter {
    /// Decrement the latch count and wake the waiter if the count reaches 0.
    /// Must not be called again until the waiter has returned from its
    /// matching [`LatchWaiter::wait()`] call; calling early panics.
    pub fn count_down(&mut self) {
        let counters;
        {
            let mut lock = self.inner.lock.lock().unwrap();

            if self.generation != lock.generation {
                let latch_gen = lock.generation;
                std::mem::drop(lock);
                panic!(
                    "Counter generation does not match latch generation ({} != {})",
                    self.generation, latch_gen
                );
            }

            lock.counters = lock.counters.checked_sub(1).unwrap();
            counters = lock.counters;
        }

        // if this is the last counter, notify the waiter
        if counters == 0 {
            self.inner.cond.notify_all();
        }

        self.generation = self.generation.wrapping_add(1);
    }
}

impl std::ops::Drop for LatchCounter {
    fn drop(&mut self) {
        // a counter dropped mid-generation (a panicking worker) must not
        // leave the waiter blocked forever
        let mut lock = self.inner.lock.lock().unwrap();
        lock.total_counters = lock.total_counters.checked_sub(1).unwrap();

        // if we haven't already counted down during the current generation
        if self.generation == lock.generation {
            lock.counters = lock.counters.checked_sub(1).unwrap();
        }

        if lock.counters == 0 {
            self.inner.cond.notify_all();
        }
    }
}

impl LatchWaiter {
    /// Wait for the latch count to reach 0, then reset the latch for the
    /// next generation. If the count already reached 0 for the current
    /// generation, this returns immediately.
    pub fn wait(&mut self) {
        {
            let lock = self.inner.lock.lock().unwrap();

            let mut lock = self
                .inner
                .cond
                // wait until we're in the active generation and all counters have counted down
                .wait_while(lock, |x| self.generation != x.generation || x.counters > 0)
                .unwrap();

            // the single waiter resets the latch for the next round
            lock.counters = lock.total_counters;
            lock.generation = lock.generation.wrapping_add(1);
        }

        self.generation = self.generation.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_no_counters() {
        let (counters, mut waiter) = build_count_down_latch(0);
        assert!(counters.is_empty());

        // with no counters, wait returns immediately each generation
        waiter.wait();
        waiter.wait();
    }

    #[test]
    fn test_single_thread() {
        let (mut counters, mut waiter) = build_count_down_latch(1);
        let counter = &mut counters[0];

        counter.count_down();
        waiter.wait();
        counter.count_down();
        waiter.wait();
        counter.count_down();
        waiter.wait();
    }

    #[test]
    #[should_panic]
    fn test_double_count() {
        let (mut counters, _waiter) = build_count_down_latch(1);
        counters[0].count_down();
        counters[0].count_down();
    }

    #[test]
    fn test_multi_thread() {
        use rand::{Rng, SeedableRng};

        use crate::sync::latch::Latch;

        let repeat = 30;
        let (counters, mut end_waiter) = build_count_down_latch(5);
        let start_latch = Latch::new();

        // counters may not run ahead into the next generation on their own;
        // release each round with a broadcast latch, the way the pool does.
        // Randomized sleeps vary the order in which counters arrive.
        let handles: Vec<_> = counters
            .into_iter()
            .enumerate()
            .map(|(seed, mut counter)| {
                let mut start_waiter = start_latch.waiter(false);
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed as u64);
                std::thread::spawn(move || {
                    for _ in 0..repeat {
                        start_waiter.wait();
                        std::thread::sleep(Duration::from_millis(rng.gen_range(0..3)));
                        counter.count_down();
                    }
                })
            })
            .collect();

        for _ in 0..repeat {
            start_latch.open();
            end_waiter.wait();
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
