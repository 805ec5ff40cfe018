//! Leak-report data and formatting helpers.

use std::sync::Arc;

use crate::stack_trace::StackTrace;

/// One leaky stack trace with its statistical estimates.
#[derive(Clone, Debug)]
pub struct LeakEstimate {
    pub stack_trace: Arc<StackTrace>,
    /// Fraction of finished samples that leaked.
    pub leak_ratio: f32,
    pub lost_allocations_estimated: f32,
    pub lost_bytes_estimated: f32,
}

/// Periodic aggregate produced by the patrol thread. Ratio fields are NaN
/// when their denominator is zero; writers skip those.
#[derive(Clone, Debug)]
pub struct LeakReport {
    pub ratio_allocations_with_suspicious_fingerprint: f32,
    pub average_stack_traces_per_fingerprint: f32,
    pub ratio_leaky_stacks: f32,
    pub ratio_non_leaky_stacks: f32,
    pub ratio_maybe_leaky_stacks: f32,
    /// Sorted descending by estimated lost bytes.
    pub leaks: Vec<LeakEstimate>,
}

/// `1536` -> `"1.5 kiB"`. Good enough for a report meant for eyeballs.
pub fn human_size(size: f64) -> String {
    const UNITS: [&str; 4] = ["bytes", "kiB", "MiB", "GiB"];
    let mut size = size;
    let mut unit = UNITS[0];
    for next_unit in UNITS {
        unit = next_unit;
        if size < 1024.0 {
            break;
        }
        size /= 1024.0;
    }
    if unit == "bytes" {
        format!("{size:.0} {unit}")
    } else {
        format!("{size:.1} {unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_size_units() {
        assert_eq!(human_size(0.0), "0 bytes");
        assert_eq!(human_size(512.0), "512 bytes");
        assert_eq!(human_size(1536.0), "1.5 kiB");
        assert_eq!(human_size(3.0 * 1024.0 * 1024.0), "3.0 MiB");
        assert_eq!(human_size(2.5 * 1024.0 * 1024.0 * 1024.0), "2.5 GiB");
    }
}
