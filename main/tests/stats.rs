//! Statistics round-trips through the public reporting API.

use std::sync::Mutex;
use std::sync::Once;

use gravel::{
    OnEachOptions, Runtime, RuntimeOptions, on_each, print_stats, report_param, report_stat_sum,
    set_active_threads, set_stat_file,
};

static INIT: Once = Once::new();
static LOCK: Mutex<()> = Mutex::new(());

fn with_runtime<R>(f: impl FnOnce() -> R) -> R {
    INIT.call_once(|| {
        let rt = Runtime::with_options(RuntimeOptions {
            pin_threads: false,
            ..Default::default()
        });
        std::mem::forget(rt);
    });
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    f()
}

#[test]
fn test_sum_report_round_trip() {
    with_runtime(|| {
        let max = gravel::runtime().max_threads();
        set_active_threads(max.min(2));

        // thread 0 reports 3, thread 1 reports 4 (or only 3 on one cpu)
        on_each(
            |tid, _num| {
                report_stat_sum("R", "C", 3 + tid as i64);
            },
            OnEachOptions::default(),
        );
        report_param("run", "kind", "round-trip");

        let path = std::env::temp_dir().join(format!("gravel-stats-{}.csv", std::process::id()));
        set_stat_file(&path);
        print_stats();

        let report = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(report.starts_with("STAT_TYPE, REGION, CATEGORY, TOTAL_TYPE, TOTAL\n"));
        let expected = if max >= 2 { 7 } else { 3 };
        assert!(
            report.contains(&format!("STAT, R, C, TSUM, {expected}\n")),
            "missing sum row in:\n{report}"
        );
        assert!(report.contains("PARAM, run, kind, SINGLE, round-trip\n"));

        set_active_threads(max);
    });
}
