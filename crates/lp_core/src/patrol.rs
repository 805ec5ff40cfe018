//! The patrol thread: ages allocations, announces leaks, writes reports.

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::library_context::LibraryGuard;
use crate::report::{human_size, LeakReport};
use crate::stack_trace::StackTrace;
use crate::table::AllocationTable;
use crate::watch_switch::{WatchState, WatchSwitch};

const PATROL_INTERVAL: Duration = Duration::from_secs(5);

/// Statistics lines are withheld until watching has been active this long,
/// to avoid disproportionate figures.
const STATS_GRACE: Duration = Duration::from_secs(1);

pub struct PatrolThread {
    _thread: std::thread::JoinHandle<()>,
}

impl PatrolThread {
    /// Spawns the patrol. It runs for the process lifetime; there is no
    /// shutdown, by design — this is a diagnostic tool.
    pub fn spawn(table: Arc<AllocationTable>, switch: Arc<WatchSwitch>) -> Self {
        let thread = std::thread::Builder::new()
            .name("lp-patrol".to_owned())
            .spawn(move || patrol_main(&table, &switch))
            .expect("could not spawn the patrol thread");
        Self { _thread: thread }
    }
}

fn patrol_main(table: &AllocationTable, switch: &WatchSwitch) {
    // Everything this thread does (report formatting, symbol resolution)
    // allocates; none of it may be tracked.
    let _ctx = LibraryGuard::enter();

    let env = table.environment();
    let mut progress = open_stream(&env.progress_file_path);
    let mut leak_stream = open_stream(&env.leak_report_file_path);
    let mut memory_usage = env.memory_usage_file_path.as_deref().and_then(open_stream);
    if let Some(stream) = &mut memory_usage {
        let _ = writeln!(stream, "#Time\tTotal RSS\tTracked live bytes");
    }

    if let Some(stream) = &mut progress {
        let _ = writeln!(stream, "patrol thread started");
        let _ = stream.flush();
    }

    if let Some(delay) = env.auto_start_time {
        std::thread::sleep(delay);
        switch.set(WatchState::Watching);
    }

    let mut leak_occurrences: std::collections::HashMap<Arc<StackTrace>, u32, ahash::RandomState> =
        Default::default();
    let mut next_leak_report: Option<Instant> = None;
    let started = Instant::now();

    loop {
        std::thread::sleep(PATROL_INTERVAL);

        let (stats, leaks) = table.patrol_update_allocation_states();
        let report_time = Instant::now();

        if let Some(stream) = &mut progress {
            if stats.enabled {
                if let Some(elapsed) = stats.time_since_enabled() {
                    if elapsed >= STATS_GRACE {
                        let secs = elapsed.as_secs_f64();
                        let _ = writeln!(
                            stream,
                            "Allocs per second: {:.1}",
                            stats.allocation_count as f64 / secs
                        );
                        let _ = writeln!(
                            stream,
                            "Frees per second: {:.1}",
                            stats.free_count as f64 / secs
                        );
                        let _ = writeln!(
                            stream,
                            "Reallocs per second: {:.1}",
                            stats.realloc_count as f64 / secs
                        );
                    }
                }
            }

            for leak in &leaks {
                let occurrences = leak_occurrences
                    .entry(Arc::clone(&leak.stack_trace))
                    .or_insert(0);
                *occurrences += 1;
                let callstack = leak.stack_trace.hash_value();
                if *occurrences == 1 {
                    let _ = writeln!(
                        stream,
                        "[Callstack {callstack:#x}] Found new leak: lost {:#x} ({} bytes)",
                        leak.memory, leak.size
                    );
                    let _ = write!(stream, "{}", leak.stack_trace);
                } else {
                    let _ = writeln!(
                        stream,
                        "[Callstack {callstack:#x}] Lost {:#x} ({} bytes), {occurrences} times again.",
                        leak.memory, leak.size
                    );
                }
            }
            let _ = stream.flush();
        }

        if let Some(stream) = &mut memory_usage {
            let rss = memory_stats::memory_stats().map_or(0, |stats| stats.physical_mem);
            let _ = writeln!(
                stream,
                "{:.1}\t{rss}\t{}",
                started.elapsed().as_secs_f64(),
                table.tracked_live_bytes()
            );
            let _ = stream.flush();
        }

        // Schedule the first leak report only once accounting has been
        // running for a while; then keep the cadence.
        if next_leak_report.is_none() {
            next_leak_report = Some(report_time + env.leak_report_interval);
        }
        if next_leak_report.is_some_and(|at| report_time > at) {
            let report = table.patrol_make_leak_report();
            if let Some(stream) = &mut leak_stream {
                let elapsed = stats.time_since_enabled().unwrap_or_default();
                write_leak_report(stream, &report, elapsed);
            }
            next_leak_report = Some(report_time + env.leak_report_interval);
        }
    }
}

fn open_stream(path: &Path) -> Option<BufWriter<File>> {
    match File::create(path) {
        Ok(file) => Some(BufWriter::new(file)),
        Err(err) => {
            log::warn!("could not open report stream {path:?}: {err}");
            None
        }
    }
}

fn write_leak_report(stream: &mut BufWriter<File>, report: &LeakReport, elapsed: Duration) {
    let _ = writeln!(stream, "[t={:.1}] Begin leak report:", elapsed.as_secs_f64());

    if !report.ratio_allocations_with_suspicious_fingerprint.is_nan() {
        let _ = writeln!(
            stream,
            "Ratio suspicious fingerprint/allocations: {:.4}",
            report.ratio_allocations_with_suspicious_fingerprint
        );
    }
    if !report.average_stack_traces_per_fingerprint.is_nan() {
        let _ = writeln!(
            stream,
            "Average number of stack traces per suspicious fingerprint: {:.2}",
            report.average_stack_traces_per_fingerprint
        );
    }
    if !report.ratio_leaky_stacks.is_nan() {
        let _ = writeln!(
            stream,
            "Leaky stack traces ratio (non-leaky/maybe/leaky): {:.2} / {:.2} / {:.2}\n",
            report.ratio_non_leaky_stacks,
            report.ratio_maybe_leaky_stacks,
            report.ratio_leaky_stacks
        );
    }

    for leak in &report.leaks {
        let _ = writeln!(
            stream,
            "[Callstack {:#x}] lost ~{} in ~{:.1} allocations (leak ratio = {:.2})",
            leak.stack_trace.hash_value(),
            human_size(leak.lost_bytes_estimated as f64),
            leak.lost_allocations_estimated,
            leak.leak_ratio
        );
        let _ = write!(stream, "{}", leak.stack_trace);
    }

    let _ = writeln!(stream, "End of leak report.");
    let _ = stream.flush();
}
