//! Stack-trace interning.
//!
//! Long-running processes map from a handful of sites over and over; one
//! shared trace per site keeps the per-mapping cost at an `Arc` clone.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use lp_core::StackTrace;

/// Frames between `StackTrace::capture` and the mmap wrapper's caller.
const SKIP_INSTRUMENTATION_FRAMES: usize = 4;

type InternTable = std::collections::HashMap<u64, Arc<StackTrace>, ahash::RandomState>;

static INTERNED: Lazy<Mutex<InternTable>> = Lazy::new(|| Mutex::new(InternTable::default()));

/// A shared handle on an interned [`StackTrace`]. The table entry is evicted
/// when the last handle outside the table is dropped.
#[derive(Clone, Debug)]
pub struct InternedStackTrace {
    inner: Arc<StackTrace>,
}

impl InternedStackTrace {
    pub fn capture() -> Self {
        let trace = StackTrace::capture(SKIP_INSTRUMENTATION_FRAMES);
        let hash = trace.hash_value();
        let inner = Arc::clone(
            INTERNED
                .lock()
                .entry(hash)
                .or_insert_with(|| Arc::new(trace)),
        );
        Self { inner }
    }

    pub fn get(&self) -> &StackTrace {
        &self.inner
    }

    pub fn shared(&self) -> Arc<StackTrace> {
        Arc::clone(&self.inner)
    }
}

impl Drop for InternedStackTrace {
    fn drop(&mut self) {
        let mut table = INTERNED.lock();
        // Two owners left means: the table, plus the handle being dropped.
        if Arc::strong_count(&self.inner) == 2 {
            table.remove(&self.inner.hash_value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn capture_here() -> InternedStackTrace {
        InternedStackTrace::capture()
    }

    #[test]
    fn same_site_interns_to_one_trace() {
        let handles: Vec<InternedStackTrace> = (0..3).map(|_| capture_here()).collect();
        assert!(Arc::ptr_eq(&handles[0].inner, &handles[1].inner));
        assert!(Arc::ptr_eq(&handles[1].inner, &handles[2].inner));
    }

    #[test]
    fn dropping_the_last_handle_evicts_the_entry() {
        let handle = capture_here();
        let hash = handle.get().hash_value();
        let clone = handle.clone();
        drop(handle);
        assert!(INTERNED.lock().contains_key(&hash));
        drop(clone);
        assert!(!INTERNED.lock().contains_key(&hash));
    }
}
