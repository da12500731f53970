//! The ParaMeter executor: a cautious, deterministic `for_each` variant
//! that measures available parallelism.
//!
//! Work executes in logical rounds. Within a round every ready iteration
//! runs speculatively (acquiring its neighborhood's locks) but serially
//! observable; iterations that conflict with an earlier one in the round
//! are deferred. Locks are held to the end of the round and released in
//! one commit step, so the round's committed count is exactly the number
//! of iterations that could have run in parallel. One CSV row per round
//! goes to the file named by `GRAVEL_PARAMETER_OUTFILE`.
//!
//! This is not a fast path: it reproduces `for_each`'s final state while
//! logging a parallelism profile.

use std::io::Write;

use anyhow::Context;

use crate::runtime::context::{LoopError, SimpleRuntimeContext, set_thread_context};
use crate::runtime::executor::for_each::{ForEachOptions, UserContext};
use crate::runtime::range::IndexedRange;
use crate::runtime::stats::StatTotal;
use crate::runtime::handle::runtime;

/// Environment variable naming the profile output file.
pub const PARAMETER_OUTFILE_VAR: &str = "GRAVEL_PARAMETER_OUTFILE";

struct StepStats {
    step: usize,
    parallelism: usize,
    wl_size: usize,
    nh_size: usize,
}

fn write_profile(loopname: &str, rows: &[StepStats]) -> anyhow::Result<()> {
    let Some(path) = std::env::var_os(PARAMETER_OUTFILE_VAR) else {
        return Ok(());
    };

    let mut out = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening parameter profile '{}'", path.to_string_lossy()))?;

    writeln!(out, "LOOPNAME, STEP, PARALLELISM, WORKLIST_SIZE, NEIGHBORHOOD_SIZE")?;
    for row in rows {
        writeln!(
            out,
            "{}, {}, {}, {}, {}",
            loopname, row.step, row.parallelism, row.wl_size, row.nh_size
        )?;
    }
    Ok(())
}

/// Execute the loop in rounds on the calling thread, recording per-round
/// parallelism. Produces the same final state as [`for_each`] would for a
/// conforming operator.
///
/// [`for_each`]: crate::runtime::executor::for_each::for_each
pub fn for_each_parameter<R, F, T>(range: &R, operator: F, opts: ForEachOptions<T>)
where
    T: Send + Clone + 'static,
    R: IndexedRange<Item = T>,
    F: Fn(T, &mut UserContext<'_, T>) -> Result<(), LoopError>,
{
    let rt = runtime();
    assert!(
        !rt.pool().in_parallel(),
        "the parameter executor may not run inside another loop"
    );

    let loopname = opts.loopname.unwrap_or("PARAMETER");
    let allow_push = !opts.no_pushes;

    let mut current: Vec<T> = (0..range.len()).map(|i| range.index(i)).collect();
    let mut rows: Vec<StepStats> = Vec::new();
    let mut total_committed = 0usize;

    let mut step = 0;
    while !current.is_empty() {
        let wl_size = current.len();
        let mut next: Vec<T> = Vec::new();
        // contexts of committed iterations; their locks are held until the
        // end of the round so later iterations see the true neighborhood
        let mut committed: Vec<Box<SimpleRuntimeContext>> = Vec::new();

        for item in current.drain(..) {
            let ctx = Box::new(SimpleRuntimeContext::new());
            ctx.start_iteration();
            set_thread_context(Some(&*ctx));

            let mut uctx = UserContext::new(allow_push, None);
            let backup = item.clone();
            let result = operator(item, &mut uctx);

            set_thread_context(None);
            let pushes = uctx.into_pushes();

            match result {
                Ok(()) | Err(LoopError::ReachedFailsafe) => {
                    next.extend(pushes);
                    committed.push(ctx);
                }
                Err(LoopError::Conflict) => {
                    // deferred to the next round
                    ctx.cancel_iteration();
                    drop(pushes);
                    next.push(backup);
                }
                Err(LoopError::Break) => {
                    panic!("the parameter executor does not support parallel_break");
                }
            }
        }

        let parallelism = committed.len();
        let mut nh_size = 0;
        for ctx in &committed {
            nh_size += ctx.commit_iteration();
        }
        total_committed += parallelism;

        rows.push(StepStats {
            step,
            parallelism,
            wl_size,
            nh_size,
        });
        step += 1;
        current = next;
    }

    if !opts.no_stats {
        rt.stats().add_int(
            loopname,
            "ParaMeterRounds",
            rows.len() as i64,
            StatTotal::Single,
        );
        rt.stats().add_int(
            loopname,
            "ParaMeterCommitted",
            total_committed as i64,
            StatTotal::Single,
        );
    }

    if let Err(e) = write_profile(loopname, &rows) {
        log::error!("writing parameter profile: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::runtime::context::{LockSlot, MethodFlag, acquire};
    use crate::runtime::handle::test_support::with_runtime;
    use crate::runtime::range::iterate_cloned;

    #[test]
    fn test_same_final_state_as_for_each() {
        with_runtime(|| {
            // countdown loop: must execute 101 times in total
            let executions = Cell::new(0usize);
            let initial = [100u32];

            for_each_parameter(
                &iterate_cloned(&initial),
                |n, ctx| {
                    executions.set(executions.get() + 1);
                    if n > 0 {
                        ctx.push(n - 1);
                    }
                    Ok(())
                },
                ForEachOptions {
                    no_stats: true,
                    ..Default::default()
                },
            );

            assert_eq!(executions.get(), 101);
        });
    }

    #[test]
    fn test_conflicting_items_serialize_across_rounds() {
        with_runtime(|| {
            // every item wants the same lock: one commit per round
            let lock = LockSlot::new();
            let lock_ref = &lock;
            let commits = Cell::new(0usize);
            let commits_ref = &commits;
            let items: Vec<usize> = (0..5).collect();

            for_each_parameter(
                &iterate_cloned(&items),
                |_i, _ctx| {
                    acquire(lock_ref, MethodFlag::Write)?;
                    commits_ref.set(commits_ref.get() + 1);
                    Ok(())
                },
                ForEachOptions {
                    no_stats: true,
                    ..Default::default()
                },
            );

            assert_eq!(commits.get(), 5);
            assert_eq!(lock.owner_addr(), 0);
        });
    }
}
