//! Per-thread loop counters, reported when the loop tears down.

use crate::runtime::handle::runtime;
use crate::runtime::stats::StatTotal;

/// Counters one worker keeps while running a loop. Reported as `Sum` stats
/// under the loop name on drop, so totals aggregate across workers.
pub struct LoopStatistics {
    loopname: Option<&'static str>,
    iterations: usize,
    pushes: usize,
    conflicts: usize,
}

impl LoopStatistics {
    /// Counters for a loop. With `None`, counting and reporting are both
    /// disabled (the `no_stats` path).
    pub fn new(loopname: Option<&'static str>) -> Self {
        Self {
            loopname,
            iterations: 0,
            pushes: 0,
            conflicts: 0,
        }
    }

    pub fn inc_iterations(&mut self) {
        self.iterations += 1;
    }

    pub fn inc_pushes(&mut self, n: usize) {
        self.pushes += n;
    }

    pub fn inc_conflicts(&mut self) {
        self.conflicts += 1;
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts
    }
}

impl Drop for LoopStatistics {
    fn drop(&mut self) {
        let Some(name) = self.loopname else {
            return;
        };
        let stats = runtime().stats();
        stats.add_int(name, "Iterations", self.iterations as i64, StatTotal::Sum);
        stats.add_int(
            name,
            "Commits",
            (self.iterations - self.conflicts) as i64,
            StatTotal::Sum,
        );
        stats.add_int(name, "Pushes", self.pushes as i64, StatTotal::Sum);
        stats.add_int(name, "Conflicts", self.conflicts as i64, StatTotal::Sum);
    }
}
