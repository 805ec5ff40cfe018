//! The leakpatrol suspicion engine.
//!
//! A probabilistic heap-leak detector for long-running processes, where a
//! precise tracker (every allocation, with its stack trace) would cost too
//! much. Instead every allocation passes through a two-tier pipeline:
//!
//! 1. A **light** record keyed by a lossy [`CallstackFingerprint`]: a few
//!    integer operations per malloc, nothing more. If the allocation is
//!    freed in time the record simply disappears.
//! 2. If a light record ages past the suspicion threshold, its fingerprint
//!    is marked suspect. From then on allocations matching it are **closely
//!    watched**: page aligned, carrying a full [`StackTrace`], budgeted, and
//!    eventually guarded by a page-protection tripwire. An access trips the
//!    wire and proves the allocation alive; silence past the access deadline
//!    declares a leak.
//!
//! A background [`PatrolThread`] drives the aging and periodically writes
//! leak reports with statistical estimates of lost allocations and bytes.
//!
//! The detector is statistical by construction: it may under- or over-count,
//! and it never frees anything. See the `lp_shim` crate for the allocator
//! interposition layer that feeds [`AllocationTable`].

pub mod environment;
pub mod fingerprint;
pub mod library_context;
pub mod patrol;
pub mod protector;
pub mod report;
pub mod setup;
pub mod stack_trace;
pub mod stats;
pub mod table;
pub mod trace_info;
pub mod watch_switch;

pub use environment::Environment;
pub use fingerprint::CallstackFingerprint;
pub use library_context::{in_library, LibraryGuard};
pub use patrol::PatrolThread;
pub use report::{LeakEstimate, LeakReport};
pub use stack_trace::StackTrace;
pub use stats::AllocationStats;
pub use table::{AllocationTable, FoundLeak, ZeroFill, NO_ALIGNMENT};
pub use trace_info::{Trilean, WatchedStackTraceInfo};
pub use watch_switch::{SwitchError, WatchState, WatchSwitch};
