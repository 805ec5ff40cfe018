//! The allocation table: the fast path under every malloc/free, the aging
//! pass, and the leak-report assembly.
//!
//! Every observed allocation starts as a [`LightAllocation`], a record cheap
//! enough to create on every malloc. If it ages past the suspicion deadline
//! without being freed, its *fingerprint* is marked suspect and future
//! allocations matching it graduate to [`CloselyWatchedAllocation`]s: page
//! aligned, carrying a full stack trace, and eligible for a page-protection
//! tripwire. The patrol thread drives the aging and collects the leaks.

use std::sync::Arc;
use std::time::Instant;

use ahash::RandomState;
use nohash_hasher::IntMap;
use parking_lot::Mutex;

use crate::environment::Environment;
use crate::fingerprint::CallstackFingerprint;
use crate::library_context::{self, LibraryGuard};
use crate::protector::{self, WatchedRanges};
use crate::report::{LeakEstimate, LeakReport};
use crate::stack_trace::StackTrace;
use crate::stats::AllocationStats;
use crate::trace_info::{Trilean, WatchedStackTraceInfo};
use crate::watch_switch::{WatchState, WatchSwitch};

/// `alignment` value meaning "no constraint beyond malloc's".
pub const NO_ALIGNMENT: usize = 1;

/// Frames between `StackTrace::capture` and the shim's caller: the unwinder
/// trampoline, the capture function, the table entry point and the wrapper.
const SKIP_INSTRUMENTATION_FRAMES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZeroFill {
    Unnecessary,
    Needed,
}

/// Fast-path record: everything we are willing to pay for on every single
/// allocation in the process.
#[derive(Clone, Debug)]
pub struct LightAllocation {
    pub memory: usize,
    pub requested_size: usize,
    pub fingerprint: CallstackFingerprint,
    /// When this passes without a free, the fingerprint turns suspicious.
    pub deadline: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloselyWatchedState {
    NotYetSuspicious,
    Suspicious,
}

/// An allocation from a suspicious fingerprint, page aligned and oversized
/// to a page multiple so a tripwire can cover it exactly.
#[derive(Clone, Debug)]
pub struct CloselyWatchedAllocation {
    pub memory: usize,
    pub requested_size: usize,
    pub allocation_time: Instant,
    /// In `NotYetSuspicious` state: when the allocation becomes suspicious.
    /// In `Suspicious` state: when it is declared a leak.
    pub deadline: Instant,
    pub state: CloselyWatchedState,

    // Handle into the suspicious-fingerprint index; the trace record there
    // outlives every allocation referring to it.
    pub fingerprint: CallstackFingerprint,
    pub stack_trace: Arc<StackTrace>,
}

/// One leak, as produced by the aging pass.
#[derive(Clone, Debug)]
pub struct FoundLeak {
    pub stack_trace: Arc<StackTrace>,
    pub memory: usize,
    pub size: usize,
}

type TraceTable = std::collections::HashMap<Arc<StackTrace>, WatchedStackTraceInfo, RandomState>;

/// Everything behind the core lock. The watched range set lives here too:
/// tripwire installation and the state transition it guards are one atomic
/// step.
#[derive(Default)]
struct TableInner {
    light_allocations_by_address: IntMap<usize, LightAllocation>,
    closely_watched_by_address: IntMap<usize, CloselyWatchedAllocation>,

    /// Presence of a fingerprint marks it suspect; entries are never
    /// removed. The inner table holds one record per exact stack trace.
    suspicious_fingerprints: IntMap<CallstackFingerprint, TraceTable>,

    /// Always equal to `closely_watched_by_address.len()`; kept as a counter
    /// so the budget check does not depend on map internals.
    live_closely_watched_all_traces: u32,

    stats: AllocationStats,
    watched_ranges: WatchedRanges,
}

pub struct AllocationTable {
    env: Environment,
    switch: Arc<WatchSwitch>,
    inner: Mutex<TableInner>,
}

impl AllocationTable {
    pub fn new(env: Environment, switch: Arc<WatchSwitch>) -> Self {
        Self {
            env,
            switch,
            inner: Mutex::new(TableInner::default()),
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    #[inline]
    fn bypass_tracking(&self) -> bool {
        library_context::in_library() || self.switch.state() == WatchState::NotWatching
    }

    /// The malloc wrapper must call this *instead* of allocating itself: a
    /// special allocator is used for closely watched allocations, so the
    /// preferred one only runs when we decide to delegate.
    pub fn instrumented_allocate(
        &self,
        size: usize,
        alignment: usize,
        fingerprint: CallstackFingerprint,
        preferred_allocator: impl FnOnce() -> *mut u8,
        zero_fill: ZeroFill,
    ) -> *mut u8 {
        if self.bypass_tracking() {
            return preferred_allocator();
        }
        let _ctx = LibraryGuard::enter();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.stats.ensure_enabled();
        inner.stats.allocation_count += 1;

        if !inner.suspicious_fingerprints.contains_key(&fingerprint) {
            let memory = preferred_allocator();
            if memory.is_null() {
                return memory;
            }
            inner.light_allocations_by_address.insert(
                memory as usize,
                LightAllocation {
                    memory: memory as usize,
                    requested_size: size,
                    fingerprint,
                    deadline: Instant::now() + self.env.time_for_allocation_to_become_suspicious,
                },
            );
            return memory;
        }

        inner.stats.allocation_with_suspicious_fingerprint_count += 1;

        let stack_trace = Arc::new(StackTrace::capture(SKIP_INSTRUMENTATION_FRAMES));
        let live_all_traces = inner.live_closely_watched_all_traces;
        let trace_table = inner
            .suspicious_fingerprints
            .get_mut(&fingerprint)
            .expect("fingerprint checked above; entries are never removed");
        let info = trace_table
            .entry(Arc::clone(&stack_trace))
            .or_insert_with(|| WatchedStackTraceInfo::new(Arc::clone(&stack_trace)));

        if !info.needs_more_closely_watched_allocations(&self.env, live_all_traces) {
            // Suspicious fingerprint, but this exact trace does not need
            // another sample (caps hit, or it is already classified). Not
            // even a light record is kept: the only purpose of one is to
            // graduate here, which already happened.
            info.count_skipped_allocations += 1;
            return preferred_allocator();
        }

        // memalign rounds the alignment to the next power of two itself if
        // necessary (unlikely), at least in glibc.
        let actual_size = self.env.round_up_to_page_multiple(size);
        let memory =
            unsafe { libc::memalign(alignment.max(self.env.page_size), actual_size) } as *mut u8;
        if memory.is_null() {
            return memory;
        }
        if zero_fill == ZeroFill::Needed {
            unsafe { std::ptr::write_bytes(memory, 0, size) };
        }

        info.count_live_closely_watched_allocations += 1;
        info.count_total_closely_watched_allocations_ever_created += 1;
        inner.live_closely_watched_all_traces += 1;

        let now = Instant::now();
        inner.closely_watched_by_address.insert(
            memory as usize,
            CloselyWatchedAllocation {
                memory: memory as usize,
                requested_size: size, // less or equal to what was actually allocated
                allocation_time: now,
                deadline: now + self.env.time_for_allocation_to_become_suspicious,
                state: CloselyWatchedState::NotYetSuspicious,
                fingerprint,
                stack_trace,
            },
        );
        memory
    }

    /// The wrapper pre-dispatches realloc's edge cases (null old pointer,
    /// zero new size) to the allocate/free paths; this handles the rest.
    pub fn instrumented_reallocate(
        &self,
        old_memory: *mut u8,
        new_requested_size: usize,
        preferred_reallocator: impl FnOnce() -> *mut u8,
    ) -> *mut u8 {
        if self.bypass_tracking() {
            return preferred_reallocator();
        }
        let _ctx = LibraryGuard::enter();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.stats.ensure_enabled();
        inner.stats.realloc_count += 1;

        let old_key = old_memory as usize;

        if let Some(mut alloc) = inner.light_allocations_by_address.remove(&old_key) {
            let new_memory = preferred_reallocator();
            if new_memory.is_null() {
                // The old block is still valid; keep the record untouched.
                inner.light_allocations_by_address.insert(old_key, alloc);
                return new_memory;
            }
            alloc.memory = new_memory as usize;
            alloc.requested_size = new_requested_size;
            inner
                .light_allocations_by_address
                .insert(new_memory as usize, alloc);
            return new_memory;
        }

        if let Some(mut alloc) = inner.closely_watched_by_address.remove(&old_key) {
            let old_actual_size = self.env.round_up_to_page_multiple(alloc.requested_size);
            let new_actual_size = self.env.round_up_to_page_multiple(new_requested_size);

            if new_actual_size == old_actual_size {
                // The underlying pages suffice; skip the allocation.
                alloc.requested_size = new_requested_size;
                inner.closely_watched_by_address.insert(old_key, alloc);
                return old_memory;
            }

            // There is no way to realloc aligned memory keeping the
            // alignment, so allocate fresh pages and copy. The old block was
            // not made by the preferred allocator, so it is ours to release.
            let new_memory =
                unsafe { libc::memalign(self.env.page_size, new_actual_size) } as *mut u8;
            if new_memory.is_null() {
                inner.closely_watched_by_address.insert(old_key, alloc);
                return new_memory;
            }

            // Disarm before the copy touches the old pages.
            if let Some(range) = inner.watched_ranges.remove_containing(old_key) {
                protector::protect_read_write(range.start, range.size);
                // The realloc itself proves the allocation is alive.
                alloc.state = CloselyWatchedState::NotYetSuspicious;
                alloc.deadline = Instant::now() + self.env.time_for_allocation_to_become_suspicious;
            }

            unsafe {
                std::ptr::copy_nonoverlapping(
                    old_memory as *const u8,
                    new_memory,
                    alloc.requested_size.min(new_requested_size),
                );
                libc::free(old_memory as *mut libc::c_void);
            }

            alloc.memory = new_memory as usize;
            alloc.requested_size = new_requested_size;
            inner
                .closely_watched_by_address
                .insert(new_memory as usize, alloc);
            return new_memory;
        }

        // Uninstrumented allocation.
        preferred_reallocator()
    }

    pub fn instrumented_free(&self, memory: *mut u8, preferred_free: impl FnOnce()) {
        if memory.is_null() {
            // Nothing to do with free(NULL).
            return;
        }
        if self.bypass_tracking() {
            preferred_free();
            return;
        }
        let _ctx = LibraryGuard::enter();

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.stats.ensure_enabled();
            inner.stats.free_count += 1;

            let key = memory as usize;
            if inner.light_allocations_by_address.remove(&key).is_none() {
                if let Some(alloc) = inner.closely_watched_by_address.remove(&key) {
                    inner.live_closely_watched_all_traces -= 1;
                    if let Some(info) =
                        trace_info_mut(&mut inner.suspicious_fingerprints, &alloc)
                    {
                        info.count_live_closely_watched_allocations -= 1;
                    }
                    if let Some(range) = inner.watched_ranges.remove_containing(key) {
                        protector::protect_read_write(range.start, range.size);
                    }
                }
            }
        }

        preferred_free();
    }

    // ------------------------------------------------------------------------
    // Patrol-thread side.

    /// Ages every tracked allocation past its deadline: light records mark
    /// their fingerprint suspicious, closely watched records become
    /// suspicious (tripwire armed) and then leaks. Returns a statistics
    /// snapshot and the leaks found.
    pub fn patrol_update_allocation_states(&self) -> (AllocationStats, Vec<FoundLeak>) {
        self.update_allocation_states_at(Instant::now())
    }

    fn update_allocation_states_at(&self, now: Instant) -> (AllocationStats, Vec<FoundLeak>) {
        let mut guard = self.inner.lock();
        let TableInner {
            light_allocations_by_address,
            closely_watched_by_address,
            suspicious_fingerprints,
            live_closely_watched_all_traces,
            stats,
            watched_ranges,
        } = &mut *guard;

        // Expired light allocations taint their fingerprint and leave
        // tracking. Their memory stays wherever it is: instances that were
        // live before the fingerprint turned suspect are knowingly lost.
        light_allocations_by_address.retain(|_, alloc| {
            if alloc.deadline < now {
                suspicious_fingerprints
                    .entry(alloc.fingerprint)
                    .or_default();
                false
            } else {
                true
            }
        });

        let mut found_leaks = Vec::new();
        let env = &self.env;
        closely_watched_by_address.retain(|_, alloc| {
            if alloc.deadline >= now {
                return true;
            }
            match alloc.state {
                CloselyWatchedState::NotYetSuspicious => {
                    alloc.state = CloselyWatchedState::Suspicious;
                    alloc.deadline = now + env.closely_watched_allocations_access_max_interval;
                    let size = env.round_up_to_page_multiple(alloc.requested_size);
                    if size > 0 {
                        watched_ranges.insert(alloc.memory, size);
                        protector::protect_none(alloc.memory, size);
                    }
                    true
                }
                CloselyWatchedState::Suspicious => {
                    // No access arrived in time: declare the leak and stop
                    // tracking the block (its memory is not freed; we are a
                    // detector, not a collector).
                    *live_closely_watched_all_traces -= 1;
                    if let Some(info) = trace_info_mut(suspicious_fingerprints, alloc) {
                        info.count_leaked_closely_watched_allocations += 1;
                        info.count_live_closely_watched_allocations -= 1;
                        info.count_total_leaked_memory += alloc.requested_size as u64;
                    }
                    if let Some(range) = watched_ranges.remove_containing(alloc.memory) {
                        protector::protect_read_write(range.start, range.size);
                    }
                    found_leaks.push(FoundLeak {
                        stack_trace: Arc::clone(&alloc.stack_trace),
                        memory: alloc.memory,
                        size: alloc.requested_size,
                    });
                    false
                }
            }
        });

        (stats.clone(), found_leaks)
    }

    /// Walks the suspicious-fingerprint index and classifies every trace.
    pub fn patrol_make_leak_report(&self) -> LeakReport {
        let guard = self.inner.lock();

        let mut count_fingerprints = 0u32;
        let mut count_stacks = 0u32;
        let mut count_leaky_stacks = 0u32;
        let mut count_non_leaky_stacks = 0u32;
        let mut count_maybe_leaky_stacks = 0u32;
        let mut leaks = Vec::new();

        for trace_table in guard.suspicious_fingerprints.values() {
            count_fingerprints += 1;
            for info in trace_table.values() {
                count_stacks += 1;
                match info.has_leaks(&self.env) {
                    Trilean::True => {
                        count_leaky_stacks += 1;
                        leaks.push(LeakEstimate {
                            stack_trace: Arc::clone(&info.stack_trace),
                            leak_ratio: info.leak_ratio(),
                            lost_allocations_estimated: info.lost_allocations_estimated(),
                            lost_bytes_estimated: info.lost_bytes_estimated(),
                        });
                    }
                    Trilean::False => count_non_leaky_stacks += 1,
                    Trilean::Unknown => count_maybe_leaky_stacks += 1,
                }
            }
        }

        let ratio_allocations_with_suspicious_fingerprint = guard
            .stats
            .allocation_with_suspicious_fingerprint_count
            as f32
            / guard.stats.allocation_count as f32;
        drop(guard);

        leaks.sort_by(|a, b| b.lost_bytes_estimated.total_cmp(&a.lost_bytes_estimated));

        LeakReport {
            ratio_allocations_with_suspicious_fingerprint,
            average_stack_traces_per_fingerprint: count_stacks as f32 / count_fingerprints as f32,
            ratio_leaky_stacks: count_leaky_stacks as f32 / count_stacks as f32,
            ratio_non_leaky_stacks: count_non_leaky_stacks as f32 / count_stacks as f32,
            ratio_maybe_leaky_stacks: count_maybe_leaky_stacks as f32 / count_stacks as f32,
            leaks,
        }
    }

    /// Services a protection fault. Returns whether `accessed` was inside a
    /// watched range; if so the range is unprotected and the allocation
    /// disarmed, atomically with the lock, and the faulting instruction can
    /// be retried.
    pub fn handle_fault_at(&self, accessed: usize) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(range) = inner.watched_ranges.remove_containing(accessed) else {
            return false;
        };
        protector::protect_read_write(range.start, range.size);

        // The access proves the allocation is alive: back to the unsuspected
        // state, with a fresh full suspicion deadline.
        if let Some(alloc) = inner.closely_watched_by_address.get_mut(&range.start) {
            alloc.state = CloselyWatchedState::NotYetSuspicious;
            alloc.deadline = Instant::now() + self.env.time_for_allocation_to_become_suspicious;
        }
        true
    }

    // ------------------------------------------------------------------------
    // Introspection, used by the patrol's memory-usage stream and by tests.

    pub fn light_allocation_count(&self) -> usize {
        self.inner.lock().light_allocations_by_address.len()
    }

    pub fn closely_watched_count(&self) -> usize {
        self.inner.lock().closely_watched_by_address.len()
    }

    pub fn is_fingerprint_suspicious(&self, fingerprint: CallstackFingerprint) -> bool {
        self.inner
            .lock()
            .suspicious_fingerprints
            .contains_key(&fingerprint)
    }

    pub fn stats(&self) -> AllocationStats {
        self.inner.lock().stats.clone()
    }

    /// Requested bytes currently tracked in either tier.
    pub fn tracked_live_bytes(&self) -> u64 {
        let guard = self.inner.lock();
        let light: u64 = guard
            .light_allocations_by_address
            .values()
            .map(|alloc| alloc.requested_size as u64)
            .sum();
        let watched: u64 = guard
            .closely_watched_by_address
            .values()
            .map(|alloc| alloc.requested_size as u64)
            .sum();
        light + watched
    }

    /// Snapshot of the per-trace records under one fingerprint.
    pub fn trace_infos(&self, fingerprint: CallstackFingerprint) -> Vec<WatchedStackTraceInfo> {
        self.inner
            .lock()
            .suspicious_fingerprints
            .get(&fingerprint)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        let guard = self.inner.lock();
        let live_sum: u32 = guard
            .suspicious_fingerprints
            .values()
            .flat_map(|table| table.values())
            .map(|info| info.count_live_closely_watched_allocations)
            .sum();
        assert_eq!(live_sum, guard.live_closely_watched_all_traces);
        assert_eq!(
            guard.live_closely_watched_all_traces as usize,
            guard.closely_watched_by_address.len()
        );
        assert!(
            guard.live_closely_watched_all_traces
                <= self.env.global_max_live_closely_watched_allocations
        );
        for info in guard
            .suspicious_fingerprints
            .values()
            .flat_map(|table| table.values())
        {
            assert!(
                info.count_leaked_closely_watched_allocations
                    <= info.count_total_closely_watched_allocations_ever_created
                        - info.count_live_closely_watched_allocations
            );
        }
        for alloc in guard.closely_watched_by_address.values() {
            assert_eq!(alloc.memory % self.env.page_size, 0);
            assert!(!guard.light_allocations_by_address.contains_key(&alloc.memory));
        }
    }
}

fn trace_info_mut<'a>(
    suspicious_fingerprints: &'a mut IntMap<CallstackFingerprint, TraceTable>,
    alloc: &CloselyWatchedAllocation,
) -> Option<&'a mut WatchedStackTraceInfo> {
    suspicious_fingerprints
        .get_mut(&alloc.fingerprint)?
        .get_mut(&alloc.stack_trace)
}
