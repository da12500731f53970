//! Ordered-by-integer-metric (OBIM) priority scheduling.
//!
//! An indexer maps each item to a bucket; each bucket is its own chunked
//! worklist. Threads drain the lowest bucket they know of and advance (or
//! rewind, after a push below their cursor) independently, so the global
//! schedule is *approximate* priority: lower buckets drain first in
//! expectation, with reordering allowed within and across buckets.
//!
//! In barrier mode, threads advance their cursor only together: when a
//! thread finds its bucket empty it publishes its private chunks and
//! rendezvouses on the loop barrier; the master then picks the globally
//! lowest non-empty bucket for everyone. That reclaims strict
//! bucket-by-bucket order at the cost of parallelism.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use substrate::per_thread::PerThread;
use substrate::thread_pool::current_tid;

use super::Worklist;
use super::chunked::PerSocketChunkFifo;
use crate::runtime::handle::runtime;
use crate::utility::OwnedByThread;

type Bucket<T> = Arc<PerSocketChunkFifo<T>>;

struct Cursor<T: Send> {
    current: Option<(u32, Bucket<T>)>,
}

impl<T: Send> Default for Cursor<T> {
    fn default() -> Self {
        Self { current: None }
    }
}

/// The OBIM worklist. `indexer` maps an item to its bucket; lower buckets
/// are scheduled first (approximately, or strictly under barrier mode).
pub struct OrderedByIntegerMetric<T, I>
where
    T: Send,
    I: Fn(&T) -> u32 + Sync,
{
    indexer: I,
    buckets: Mutex<BTreeMap<u32, Bucket<T>>>,
    cursors: PerThread<OwnedByThread<Cursor<T>>>,
    barrier_mode: bool,
    /// Barrier mode: the bucket picked at the last rendezvous.
    next_round: Mutex<Option<(u32, Bucket<T>)>>,
    /// Barrier mode: set once a rendezvous finds no work anywhere.
    done: AtomicBool,
}

impl<T, I> OrderedByIntegerMetric<T, I>
where
    T: Send,
    I: Fn(&T) -> u32 + Sync,
{
    /// Approximate-priority scheduling.
    pub fn new(indexer: I) -> Self {
        Self::with_mode(indexer, false)
    }

    /// Strict bucket-by-bucket scheduling: cursors only advance at a
    /// rendezvous of all loop threads.
    pub fn with_barrier(indexer: I) -> Self {
        Self::with_mode(indexer, true)
    }

    fn with_mode(indexer: I, barrier_mode: bool) -> Self {
        Self {
            indexer,
            buckets: Mutex::new(BTreeMap::new()),
            cursors: PerThread::new(|_| OwnedByThread::new(Cursor::default())),
            barrier_mode,
            next_round: Mutex::new(None),
            done: AtomicBool::new(false),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn cursor(&self) -> &mut Cursor<T> {
        // SAFETY: each thread touches only its own cursor slot
        unsafe { self.cursors.get().get_mut() }
    }

    fn bucket_for(&self, index: u32) -> Bucket<T> {
        let mut map = self.buckets.lock().unwrap();
        map.entry(index)
            .or_insert_with(|| Arc::new(PerSocketChunkFifo::new()))
            .clone()
    }

    fn do_push(&self, item: T) {
        let index = (self.indexer)(&item);
        let bucket = self.bucket_for(index);
        bucket.push(item);

        if !self.barrier_mode {
            // a push below the cursor rewinds this thread
            let cursor = self.cursor();
            if cursor.current.as_ref().map_or(true, |(k, _)| index < *k) {
                cursor.current = Some((index, bucket));
            }
        }
    }

    /// Approximate pop: drain the cursor bucket, else rescan for the lowest
    /// bucket that yields an item (checking our own private chunks too).
    fn pop_approx(&self) -> Option<T> {
        let cursor = self.cursor();

        if let Some((_, bucket)) = &cursor.current {
            if let Some(item) = bucket.pop() {
                return Some(item);
            }
        }

        // advance: try every bucket from the lowest up. Emptiness checks
        // are advisory, so actually attempt a pop on each.
        let candidates: Vec<(u32, Bucket<T>)> = {
            let map = self.buckets.lock().unwrap();
            map.iter().map(|(k, b)| (*k, b.clone())).collect()
        };

        for (index, bucket) in candidates {
            if let Some(item) = bucket.pop() {
                cursor.current = Some((index, bucket));
                return Some(item);
            }
        }

        cursor.current = None;
        None
    }

    /// Barrier-mode pop: drain the round's bucket; when it runs dry for
    /// this thread, rendezvous with everyone and let the master pick the
    /// next bucket. Once a rendezvous finds nothing, the loop is done for
    /// every thread at once.
    fn pop_strict(&self) -> Option<T> {
        if self.done.load(Ordering::Acquire) {
            return None;
        }

        let cursor = self.cursor();
        let rt = runtime();

        loop {
            if let Some((_, bucket)) = &cursor.current {
                if let Some(item) = bucket.pop() {
                    return Some(item);
                }
            }

            // publish our private chunks so the master's scan sees them
            {
                let buckets: Vec<Bucket<T>> = {
                    let map = self.buckets.lock().unwrap();
                    map.values().cloned().collect()
                };
                for bucket in buckets {
                    bucket.flush_local();
                }
            }

            let barrier = rt.barrier();
            barrier.wait();
            if current_tid() == 0 {
                let map = self.buckets.lock().unwrap();
                let next = map
                    .iter()
                    .find(|(_, b)| !b.empty())
                    .map(|(k, b)| (*k, b.clone()));
                if next.is_none() {
                    self.done.store(true, Ordering::Release);
                }
                *self.next_round.lock().unwrap() = next;
            }
            barrier.wait();

            if self.done.load(Ordering::Acquire) {
                cursor.current = None;
                return None;
            }
            cursor.current = self.next_round.lock().unwrap().clone();
        }
    }
}

impl<T, I> Worklist<T> for OrderedByIntegerMetric<T, I>
where
    T: Send,
    I: Fn(&T) -> u32 + Sync,
{
    fn push(&self, item: T) {
        self.do_push(item);
    }

    fn pop(&self) -> Option<T> {
        if self.barrier_mode {
            self.pop_strict()
        } else {
            self.pop_approx()
        }
    }

    fn empty(&self) -> bool {
        self.buckets.lock().unwrap().values().all(|b| b.empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handle::test_support::with_runtime;

    #[test]
    fn test_prefers_lower_buckets() {
        with_runtime(|| {
            let wl = OrderedByIntegerMetric::new(|x: &u32| x / 10);
            for x in [35, 5, 25, 15] {
                wl.push(x);
            }

            // single-threaded, pops come in bucket order
            assert_eq!(wl.pop(), Some(5));
            assert_eq!(wl.pop(), Some(15));
            assert_eq!(wl.pop(), Some(25));
            assert_eq!(wl.pop(), Some(35));
            assert_eq!(wl.pop(), None);
        });
    }

    #[test]
    fn test_push_rewinds_cursor() {
        with_runtime(|| {
            let wl = OrderedByIntegerMetric::new(|x: &u32| *x);
            wl.push(50);
            assert_eq!(wl.pop(), Some(50));

            // cursor sits at bucket 50; a lower push must still come out
            wl.push(7);
            assert_eq!(wl.pop(), Some(7));
            assert_eq!(wl.pop(), None);
        });
    }

    #[test]
    fn test_drained_bucket_accepts_new_items() {
        with_runtime(|| {
            let wl = OrderedByIntegerMetric::new(|x: &u32| x / 10);
            wl.push(12);
            assert_eq!(wl.pop(), Some(12));

            // bucket 1 was drained; pushing into it again is still valid
            wl.push(13);
            wl.push(27);
            assert_eq!(wl.pop(), Some(13));
            assert_eq!(wl.pop(), Some(27));
        });
    }
}
