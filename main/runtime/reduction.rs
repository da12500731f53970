//! Reducible values: per-thread cells merged on demand.
//!
//! Workers update their own thread's cell without synchronization; the
//! master folds all cells into a result between loops. `reduce` must not
//! run concurrently with updates.

use substrate::per_thread::PerThread;
use substrate::topology::topology;

use crate::utility::OwnedByThread;

/// A sum reducer (`update` adds).
pub struct Accumulator<T> {
    cells: PerThread<OwnedByThread<T>>,
}

impl<T> Accumulator<T>
where
    T: Default + Clone + std::ops::AddAssign + Send,
{
    pub fn new() -> Self {
        Self {
            cells: PerThread::new(|_| OwnedByThread::new(T::default())),
        }
    }

    /// Add `value` to the calling thread's partial sum.
    pub fn update(&self, value: T) {
        // SAFETY: the calling thread owns its cell
        unsafe { *self.cells.get().get_mut() += value };
    }

    /// Fold all partial sums. Single-threaded; workers must be quiescent.
    pub fn reduce(&self) -> T {
        let mut total = T::default();
        for tid in 0..topology().max_threads() {
            // SAFETY: quiescent point
            total += unsafe { self.cells.get_remote(tid).get_mut().clone() };
        }
        total
    }

    /// Clear every cell for reuse. Single-threaded.
    pub fn reset(&self) {
        for tid in 0..topology().max_threads() {
            // SAFETY: quiescent point
            unsafe { *self.cells.get_remote(tid).get_mut() = T::default() };
        }
    }
}

impl<T> Default for Accumulator<T>
where
    T: Default + Clone + std::ops::AddAssign + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A max reducer. `reduce` is `None` until the first update.
pub struct ReduceMax<T> {
    cells: PerThread<OwnedByThread<Option<T>>>,
}

impl<T: Ord + Clone + Send> ReduceMax<T> {
    pub fn new() -> Self {
        Self {
            cells: PerThread::new(|_| OwnedByThread::new(None)),
        }
    }

    pub fn update(&self, value: T) {
        // SAFETY: the calling thread owns its cell
        let cell = unsafe { self.cells.get().get_mut() };
        match cell {
            Some(cur) if *cur >= value => {}
            _ => *cell = Some(value),
        }
    }

    pub fn reduce(&self) -> Option<T> {
        (0..topology().max_threads())
            // SAFETY: quiescent point
            .filter_map(|tid| unsafe { self.cells.get_remote(tid).get_mut().clone() })
            .max()
    }
}

impl<T: Ord + Clone + Send> Default for ReduceMax<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A min reducer. `reduce` is `None` until the first update.
pub struct ReduceMin<T> {
    cells: PerThread<OwnedByThread<Option<T>>>,
}

impl<T: Ord + Clone + Send> ReduceMin<T> {
    pub fn new() -> Self {
        Self {
            cells: PerThread::new(|_| OwnedByThread::new(None)),
        }
    }

    pub fn update(&self, value: T) {
        // SAFETY: the calling thread owns its cell
        let cell = unsafe { self.cells.get().get_mut() };
        match cell {
            Some(cur) if *cur <= value => {}
            _ => *cell = Some(value),
        }
    }

    pub fn reduce(&self) -> Option<T> {
        (0..topology().max_threads())
            // SAFETY: quiescent point
            .filter_map(|tid| unsafe { self.cells.get_remote(tid).get_mut().clone() })
            .min()
    }
}

impl<T: Ord + Clone + Send> Default for ReduceMin<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A logical-or reducer.
pub struct ReduceLogicalOr {
    cells: PerThread<OwnedByThread<bool>>,
}

impl ReduceLogicalOr {
    pub fn new() -> Self {
        Self {
            cells: PerThread::new(|_| OwnedByThread::new(false)),
        }
    }

    pub fn update(&self, value: bool) {
        // SAFETY: the calling thread owns its cell
        unsafe { *self.cells.get().get_mut() |= value };
    }

    pub fn reduce(&self) -> bool {
        // SAFETY: quiescent point
        (0..topology().max_threads()).any(|tid| unsafe { *self.cells.get_remote(tid).get_mut() })
    }
}

impl Default for ReduceLogicalOr {
    fn default() -> Self {
        Self::new()
    }
}
