//! Anonymous-mapping range tracker.
//!
//! Independent of the heap suspicion engine: this tool answers "who mapped
//! the anonymous memory that is still around?" rather than "who leaked?".
//! It interposes `mmap`/`munmap`, keeps one [`MemorySlice`] per live piece
//! of each mapping (partial unmaps split slices), and appends events with
//! interned stack ids to a log.

pub mod interned_stack_trace;
pub mod memory_map;
pub mod wrapper;

pub use interned_stack_trace::InternedStackTrace;
pub use memory_map::{MemoryMap, MemorySlice, MmapAllocation};
