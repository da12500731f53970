//! Parallel loop executors.
//!
//! - [`on_each`]: one task per active thread.
//! - [`do_all`]: stealing loop over a range of independent items.
//! - [`for_each`]: worklist-driven loop whose operator may push new items,
//!   optionally with speculative conflict detection.
//! - [`for_each_parameter`]: the cautious ParaMeter profiler.

pub mod do_all;
pub mod for_each;
pub mod on_each;
pub mod parameter;

pub use do_all::{DoAllOptions, do_all};
pub use for_each::{ForEachOptions, UserContext, for_each};
pub use on_each::{OnEachOptions, on_each};
pub use parameter::for_each_parameter;
