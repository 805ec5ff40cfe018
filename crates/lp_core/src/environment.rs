//! Tunables read once from the process environment.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration of the suspicion engine.
///
/// Read once at startup and immutable afterwards. All durations are parsed
/// from integer seconds; values that fail to parse or are not greater than
/// zero fall back to the default.
#[derive(Clone, Debug)]
pub struct Environment {
    /// Maximum expected life of most (non-leaky) allocations.
    ///
    /// For light allocations (initially, all allocations), when this time is
    /// surpassed without a free, successive allocations with the same
    /// fingerprint will be closely watched to determine whether they are
    /// leaks or just long-lived allocations.
    ///
    /// When a closely watched allocation reaches this age without being
    /// freed, it becomes suspicious and a page-protection tripwire is armed.
    ///
    /// Since fingerprints are very rough, allocations from unrelated,
    /// innocent code may also become closely watched accidentally.
    pub time_for_allocation_to_become_suspicious: Duration,

    /// Once a closely watched allocation enters the suspicious state it has
    /// this long to receive an access and become non-suspicious again.
    /// Otherwise it is declared a leak.
    pub closely_watched_allocations_access_max_interval: Duration,

    /// Once this many closely watched allocations from one stack trace have
    /// finished without leaking, the trace is considered innocent and no
    /// more of its allocations are closely watched.
    pub enough_samples_to_prove_no_leak: u32,

    /// The number of regions the OS lets us protect is limited
    /// (65k on Linux x86_64), hence a global cap on live closely watched
    /// allocations.
    pub global_max_live_closely_watched_allocations: u32,

    pub max_live_closely_watched_allocations_per_trace: u32,

    pub leak_report_interval: Duration,

    /// Once this much time passes, watching begins on its own. All
    /// application initialization should have completed by then, so startup
    /// artifacts are not reported as leaks. `None` means watching only
    /// starts when `leakpatrol-start` is invoked.
    pub auto_start_time: Option<Duration>,

    pub page_size: usize,

    /// The shared-memory word other processes write to enable watching.
    pub comm_file_path: PathBuf,

    /// Throughput figures and incremental leak announcements.
    pub progress_file_path: PathBuf,

    /// Periodic aggregate leak reports.
    pub leak_report_file_path: PathBuf,

    /// RSS samples vs. tracked live bytes. Disabled when unset.
    pub memory_usage_file_path: Option<PathBuf>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            time_for_allocation_to_become_suspicious: Duration::from_secs(30),
            closely_watched_allocations_access_max_interval: Duration::from_secs(1),
            enough_samples_to_prove_no_leak: 5,
            global_max_live_closely_watched_allocations: 50_000,
            max_live_closely_watched_allocations_per_trace: 30,
            leak_report_interval: Duration::from_secs(30),
            auto_start_time: None,
            page_size: page_size(),
            comm_file_path: PathBuf::from("/tmp/alloc-comm"),
            progress_file_path: PathBuf::from("/tmp/alloc-report"),
            leak_report_file_path: PathBuf::from("/tmp/leak-report"),
            memory_usage_file_path: None,
        }
    }
}

impl Environment {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            time_for_allocation_to_become_suspicious: env_secs(
                "ALLOC_TIME_SUSPICIOUS",
                defaults.time_for_allocation_to_become_suspicious,
            ),
            closely_watched_allocations_access_max_interval: env_secs(
                "ALLOC_MAX_ACCESS_INTERVAL",
                defaults.closely_watched_allocations_access_max_interval,
            ),
            enough_samples_to_prove_no_leak: env_int(
                "ALLOC_ENOUGH_SAMPLES_TO_PROVE_NO_LEAK",
                defaults.enough_samples_to_prove_no_leak,
            ),
            global_max_live_closely_watched_allocations: env_int(
                "ALLOC_GLOBAL_MAX_CLOSELY_WATCHED",
                defaults.global_max_live_closely_watched_allocations,
            ),
            max_live_closely_watched_allocations_per_trace: env_int(
                "ALLOC_MAX_CLOSELY_WATCHED",
                defaults.max_live_closely_watched_allocations_per_trace,
            ),
            leak_report_interval: env_secs("ALLOC_LEAK_REPORT_INTERVAL", defaults.leak_report_interval),
            auto_start_time: match env_int("ALLOC_AUTO_START_TIME", 0u64) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            page_size: defaults.page_size,
            comm_file_path: env_path("ALLOC_COMM_FILE").unwrap_or(defaults.comm_file_path),
            progress_file_path: env_path("ALLOC_PROGRESS_FILE").unwrap_or(defaults.progress_file_path),
            leak_report_file_path: env_path("ALLOC_LEAK_REPORT_FILE")
                .unwrap_or(defaults.leak_report_file_path),
            memory_usage_file_path: env_path("ALLOC_MEMORY_USAGE_FILE"),
        }
    }

    /// Closely watched allocations are oversized to whole pages so that a
    /// tripwire can cover them exactly.
    #[inline]
    pub fn round_up_to_page_multiple(&self, size: usize) -> usize {
        (size + (self.page_size - 1)) & !(self.page_size - 1)
    }
}

fn page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        // sysconf has no business failing here, but 4k is true nearly everywhere.
        return 4096;
    }
    page as usize
}

/// Integer environment variable, must be greater than zero.
fn env_int<T: TryFrom<u64>>(name: &str, default: T) -> T {
    let Ok(text) = std::env::var(name) else {
        return default;
    };
    match text.trim().parse::<u64>() {
        Ok(value) if value > 0 => T::try_from(value).unwrap_or(default),
        _ => {
            log::warn!("ignoring {name}={text:?}: expected an integer greater than zero");
            default
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_int(name, default.as_secs()))
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        let env = Environment {
            page_size: 4096,
            ..Default::default()
        };
        assert_eq!(env.round_up_to_page_multiple(0), 0);
        assert_eq!(env.round_up_to_page_multiple(1), 4096);
        assert_eq!(env.round_up_to_page_multiple(4095), 4096);
        assert_eq!(env.round_up_to_page_multiple(4096), 4096);
        assert_eq!(env.round_up_to_page_multiple(4097), 8192);
    }

    #[test]
    fn defaults() {
        let env = Environment::default();
        assert_eq!(env.time_for_allocation_to_become_suspicious, Duration::from_secs(30));
        assert_eq!(
            env.closely_watched_allocations_access_max_interval,
            Duration::from_secs(1)
        );
        assert_eq!(env.enough_samples_to_prove_no_leak, 5);
        assert_eq!(env.global_max_live_closely_watched_allocations, 50_000);
        assert_eq!(env.max_live_closely_watched_allocations_per_trace, 30);
        assert!(env.auto_start_time.is_none());
        assert!(env.page_size.is_power_of_two());
    }

    #[test]
    fn auto_start_zero_means_disabled() {
        // The default value of the auto-start tunable is zero, which maps to `None`.
        assert!(Environment::default().auto_start_time.is_none());
    }
}
