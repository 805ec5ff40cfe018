//! Full stack traces for closely watched allocations.
//!
//! The hot path captures instruction pointers only; symbols are resolved
//! lazily when the patrol thread writes a report. Capture allocates (the
//! frame vector, plus whatever the unwinder itself needs), so callers must
//! hold the library reentrancy guard.

use std::hash::{Hash, Hasher};

/// Ordered instruction pointers, topmost frame first, with value equality
/// and a stable hash.
#[derive(Clone, Debug)]
pub struct StackTrace {
    frames: Vec<usize>,
    hash: u64,
}

impl StackTrace {
    /// Captures the current call stack, omitting the topmost
    /// `num_skip_frames` frames (so the instrumentation machinery does not
    /// show up in every trace).
    pub fn capture(num_skip_frames: usize) -> Self {
        let mut frames = Vec::with_capacity(32);
        let mut hash = 0u64;
        let mut skip = num_skip_frames;
        backtrace::trace(|frame| {
            if skip > 0 {
                skip -= 1;
                return true;
            }
            let ip = frame.ip() as usize;
            frames.push(ip);
            hash = (hash << 1) ^ hash_word(ip as u64);
            true
        });
        Self { frames, hash }
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The precomputed fold of the frame pointers. Stable for the process
    /// lifetime, suitable as an interning key.
    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for StackTrace {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.frames == other.frames
    }
}

impl Eq for StackTrace {}

impl Hash for StackTrace {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

fn hash_word(word: u64) -> u64 {
    // Fibonacci mixing; the fold in `capture` shifts successive frames so
    // that permutations of the same addresses hash differently.
    word.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// Resolves symbols frame by frame. This allocates and takes the dynamic
/// linker's lock; only the patrol thread uses it, under the reentrancy
/// guard.
impl std::fmt::Display for StackTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, &ip) in self.frames.iter().enumerate() {
            let frame_number = self.frames.len() - 1 - index;

            let mut name: Option<String> = None;
            backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
                if name.is_none() {
                    name = symbol.name().map(|n| n.to_string());
                }
            });

            match name {
                Some(name) => writeln!(f, "    #{frame_number} {ip:#x} in {name}")?,
                None => writeln!(f, "    #{frame_number} {ip:#x}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn capture_here() -> StackTrace {
        StackTrace::capture(0)
    }

    #[test]
    fn capture_is_not_empty() {
        let trace = capture_here();
        assert!(!trace.is_empty());
    }

    #[test]
    fn equal_captures_compare_and_hash_equal() {
        // Both captures must go through the same call site, otherwise the
        // test function's own frame differs.
        let traces: Vec<StackTrace> = (0..2).map(|_| capture_here()).collect();
        assert_eq!(traces[0], traces[1]);
        assert_eq!(traces[0].hash_value(), traces[1].hash_value());
    }

    #[test]
    fn skipping_frames_shortens_the_trace() {
        let full = StackTrace::capture(0);
        let skipped = StackTrace::capture(2);
        assert!(skipped.frames().len() < full.frames().len());
    }

    #[test]
    fn display_emits_one_line_per_frame() {
        let trace = capture_here();
        let rendered = trace.to_string();
        assert_eq!(rendered.lines().count(), trace.frames().len());
        assert!(rendered.starts_with("    #"));
    }
}
