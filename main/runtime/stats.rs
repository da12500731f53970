//! The statistics manager.
//!
//! Threads accumulate numeric and string samples into per-thread maps keyed
//! by `(region, category)`; a single-threaded merge at print time combines
//! them under each stat's declared reduction. Output is CSV-shaped:
//!
//! ```text
//! STAT_TYPE, REGION, CATEGORY, TOTAL_TYPE, TOTAL
//! STAT, SSSP, Iterations, TSUM, 42
//! ```
//!
//! Setting `PRINT_PER_THREAD_STATS` in the environment appends a
//! `ThreadValues` detail row per entry.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use substrate::per_thread::PerThread;
use substrate::topology::topology;

use crate::utility::OwnedByThread;

const SEP: &str = ", ";
const THREAD_SEP: &str = "; ";
const THREAD_NAME: &str = "ThreadValues";

/// How per-thread samples of one stat combine into its total.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatTotal {
    /// Only the first thread's value.
    Single,
    Min,
    Max,
    Sum,
    /// Sum divided by the number of contributions.
    Avg,
}

impl StatTotal {
    fn as_str(self) -> &'static str {
        match self {
            StatTotal::Single => "SINGLE",
            StatTotal::Min => "TMIN",
            StatTotal::Max => "TMAX",
            StatTotal::Sum => "TSUM",
            StatTotal::Avg => "TAVG",
        }
    }
}

/// One thread's running value for a stat.
#[derive(Clone, Debug)]
struct Scalar<T> {
    total_ty: StatTotal,
    value: T,
    /// Contribution count, for `Avg`.
    count: usize,
}

trait Sample: Copy + PartialOrd + std::ops::Add<Output = Self> {
    fn div_count(self, count: usize) -> Self;
}

impl Sample for i64 {
    fn div_count(self, count: usize) -> Self {
        self / count as i64
    }
}

impl Sample for f64 {
    fn div_count(self, count: usize) -> Self {
        self / count as f64
    }
}

impl<T: Sample> Scalar<T> {
    fn new(total_ty: StatTotal, value: T) -> Self {
        Self {
            total_ty,
            value,
            count: 1,
        }
    }

    fn add(&mut self, value: T) {
        match self.total_ty {
            StatTotal::Single => self.value = value,
            StatTotal::Min => {
                if value < self.value {
                    self.value = value;
                }
            }
            StatTotal::Max => {
                if value > self.value {
                    self.value = value;
                }
            }
            StatTotal::Sum | StatTotal::Avg => {
                self.value = self.value + value;
                self.count += 1;
            }
        }
    }
}

type Key = (String, String);

#[derive(Default)]
struct ThreadStats {
    ints: HashMap<Key, Scalar<i64>>,
    fps: HashMap<Key, Scalar<f64>>,
    params: HashMap<Key, String>,
}

/// A stat merged across threads, with per-thread values in tid order.
struct Merged<T> {
    total_ty: StatTotal,
    values: Vec<T>,
    total_count: usize,
}

impl<T: Sample> Merged<T> {
    fn total(&self) -> T {
        let mut it = self.values.iter().copied();
        let first = it.next().expect("merged stat with no values");
        match self.total_ty {
            StatTotal::Single => first,
            StatTotal::Min => it.fold(first, |a, b| if b < a { b } else { a }),
            StatTotal::Max => it.fold(first, |a, b| if b > a { b } else { a }),
            StatTotal::Sum => it.fold(first, |a, b| a + b),
            StatTotal::Avg => it.fold(first, |a, b| a + b).div_count(self.total_count),
        }
    }
}

/// Process-wide statistics manager, owned by the runtime handle.
pub struct StatManager {
    per_thread: PerThread<OwnedByThread<ThreadStats>>,
    outfile: Mutex<Option<PathBuf>>,
}

impl StatManager {
    pub fn new() -> Self {
        Self {
            per_thread: PerThread::new(|_| OwnedByThread::new(ThreadStats::default())),
            outfile: Mutex::new(None),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn local(&self) -> &mut ThreadStats {
        // SAFETY: called from the reporting thread for its own slot
        unsafe { self.per_thread.get().get_mut() }
    }

    pub fn add_int(&self, region: &str, category: &str, value: i64, total_ty: StatTotal) {
        self.local()
            .ints
            .entry((region.to_string(), category.to_string()))
            .and_modify(|s| s.add(value))
            .or_insert_with(|| Scalar::new(total_ty, value));
    }

    pub fn add_fp(&self, region: &str, category: &str, value: f64, total_ty: StatTotal) {
        self.local()
            .fps
            .entry((region.to_string(), category.to_string()))
            .and_modify(|s| s.add(value))
            .or_insert_with(|| Scalar::new(total_ty, value));
    }

    /// String parameters always reduce as `Single`: last writer per thread,
    /// first thread at merge.
    pub fn add_param(&self, region: &str, category: &str, value: &str) {
        self.local()
            .params
            .insert((region.to_string(), category.to_string()), value.to_string());
    }

    pub fn set_stat_file(&self, path: impl Into<PathBuf>) {
        *self.outfile.lock().unwrap() = Some(path.into());
    }

    /// Merge all per-thread maps and render the report. Must run while no
    /// loop is in flight.
    fn render(&self) -> String {
        // SAFETY: merge is single-threaded and the workers are quiescent
        let threads: Vec<&ThreadStats> = (0..topology().max_threads())
            .map(|t| unsafe { &*self.per_thread.get_remote(t).get_mut() })
            .collect();

        let mut ints: BTreeMap<Key, Merged<i64>> = BTreeMap::new();
        let mut fps: BTreeMap<Key, Merged<f64>> = BTreeMap::new();
        let mut params: BTreeMap<Key, Vec<String>> = BTreeMap::new();

        for stats in &threads {
            for (key, scalar) in &stats.ints {
                let m = ints.entry(key.clone()).or_insert_with(|| Merged {
                    total_ty: scalar.total_ty,
                    values: Vec::new(),
                    total_count: 0,
                });
                m.values.push(scalar.value);
                m.total_count += scalar.count;
            }
            for (key, scalar) in &stats.fps {
                let m = fps.entry(key.clone()).or_insert_with(|| Merged {
                    total_ty: scalar.total_ty,
                    values: Vec::new(),
                    total_count: 0,
                });
                m.values.push(scalar.value);
                m.total_count += scalar.count;
            }
            for (key, value) in &stats.params {
                params.entry(key.clone()).or_default().push(value.clone());
            }
        }

        if ints.is_empty() && fps.is_empty() && params.is_empty() {
            return String::new();
        }

        let per_thread_rows = std::env::var_os("PRINT_PER_THREAD_STATS").is_some();

        let mut out = String::new();
        out.push_str("STAT_TYPE");
        out.push_str(SEP);
        out.push_str("REGION");
        out.push_str(SEP);
        out.push_str("CATEGORY");
        out.push_str(SEP);
        out.push_str("TOTAL_TYPE");
        out.push_str(SEP);
        out.push_str("TOTAL\n");

        let mut emit = |kind: &str,
                        key: &Key,
                        total_ty: &str,
                        total: String,
                        values: Option<Vec<String>>| {
            out.push_str(kind);
            out.push_str(SEP);
            out.push_str(&key.0);
            out.push_str(SEP);
            out.push_str(&key.1);
            out.push_str(SEP);
            out.push_str(total_ty);
            out.push_str(SEP);
            out.push_str(&total);
            out.push('\n');

            if let Some(values) = values {
                out.push_str(kind);
                out.push_str(SEP);
                out.push_str(&key.0);
                out.push_str(SEP);
                out.push_str(&key.1);
                out.push_str(SEP);
                out.push_str(THREAD_NAME);
                out.push_str(SEP);
                out.push_str(&values.join(THREAD_SEP));
                out.push('\n');
            }
        };

        for (key, m) in &ints {
            let values =
                per_thread_rows.then(|| m.values.iter().map(|v| v.to_string()).collect());
            emit("STAT", key, m.total_ty.as_str(), m.total().to_string(), values);
        }
        for (key, m) in &fps {
            let values =
                per_thread_rows.then(|| m.values.iter().map(|v| v.to_string()).collect());
            emit("STAT", key, m.total_ty.as_str(), m.total().to_string(), values);
        }
        for (key, values) in &params {
            let detail = per_thread_rows.then(|| values.clone());
            emit(
                "PARAM",
                key,
                StatTotal::Single.as_str(),
                values[0].clone(),
                detail,
            );
        }

        out
    }

    /// Print the merged report to stdout, or to the configured stat file.
    pub fn print(&self) {
        let report = self.render();
        if report.is_empty() {
            return;
        }

        let outfile = self.outfile.lock().unwrap().clone();
        let result = match outfile {
            None => std::io::stdout()
                .write_all(report.as_bytes())
                .context("writing stats to stdout"),
            Some(path) => std::fs::write(&path, &report)
                .with_context(|| format!("writing stats to '{}'", path.display())),
        };

        if let Err(e) = result {
            log::error!("printing stats: {e:#}");
        }
    }

    /// The merged total of an integer stat, for tests and reductions that
    /// read their own reports back.
    pub fn lookup_int(&self, region: &str, category: &str) -> Option<i64> {
        let key = (region.to_string(), category.to_string());
        let threads: Vec<&ThreadStats> = (0..topology().max_threads())
            .map(|t| unsafe { &*self.per_thread.get_remote(t).get_mut() })
            .collect();

        let mut merged: Option<Merged<i64>> = None;
        for stats in &threads {
            if let Some(scalar) = stats.ints.get(&key) {
                let m = merged.get_or_insert_with(|| Merged {
                    total_ty: scalar.total_ty,
                    values: Vec::new(),
                    total_count: 0,
                });
                m.values.push(scalar.value);
                m.total_count += scalar.count;
            }
        }
        merged.map(|m| m.total())
    }
}

impl Default for StatManager {
    fn default() -> Self {
        Self::new()
    }
}
