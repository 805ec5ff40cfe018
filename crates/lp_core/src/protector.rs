//! Page-protection tripwires.
//!
//! A tripwire makes a closely watched allocation's pages inaccessible; the
//! next access from the application raises a synchronous fault, which the
//! handler below turns into "this allocation is alive" and a retry of the
//! faulting instruction.
//!
//! The range set itself lives inside the allocation table's locked state so
//! that a single lock covers every transition; this module only holds the
//! process-wide signal plumbing.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::Once;

use once_cell::sync::OnceCell;

use crate::library_context;

/// One protected page range. `start` is page-aligned and doubles as the
/// closely watched allocation's address; `size` is a page multiple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchedRange {
    pub start: usize,
    pub size: usize,
}

impl WatchedRange {
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end()
    }
}

/// Ordered set of disjoint watched ranges, keyed by start address.
#[derive(Default, Debug)]
pub struct WatchedRanges {
    ranges: BTreeMap<usize, WatchedRange>,
}

impl WatchedRanges {
    /// The caller guarantees disjointness (an address is closely watched by
    /// at most one allocation) and page alignment.
    pub fn insert(&mut self, start: usize, size: usize) {
        let range = WatchedRange { start, size };
        debug_assert!(!self.contains(range.start));
        debug_assert!(size == 0 || !self.contains(range.end() - 1));
        self.ranges.insert(start, range);
    }

    pub fn containing(&self, addr: usize) -> Option<&WatchedRange> {
        let (_, range) = self.ranges.range(..=addr).next_back()?;
        range.contains(addr).then_some(range)
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.containing(addr).is_some()
    }

    pub fn remove_containing(&mut self, addr: usize) -> Option<WatchedRange> {
        let range = *self.containing(addr)?;
        self.ranges.remove(&range.start)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

// ----------------------------------------------------------------------------
// mprotect plumbing. Failure to change protections breaks the tripwire
// invariant, and both callers (aging pass, fault handler) have no way to
// back out, so failures are fatal.

pub(crate) fn protect_none(start: usize, size: usize) {
    if size == 0 {
        return;
    }
    if unsafe { libc::mprotect(start as *mut libc::c_void, size, libc::PROT_NONE) } != 0 {
        fatal(b"leakpatrol: mprotect(PROT_NONE) failed\n");
    }
}

pub(crate) fn protect_read_write(start: usize, size: usize) {
    if size == 0 {
        return;
    }
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    if unsafe { libc::mprotect(start as *mut libc::c_void, size, prot) } != 0 {
        fatal(b"leakpatrol: mprotect(PROT_READ|PROT_WRITE) failed\n");
    }
}

/// Fixed-length diagnostic and abort. Safe to call from the fault handler:
/// `write(2)` and `abort(2)` are async-signal-safe, and nothing allocates.
fn fatal(msg: &'static [u8]) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}

// ----------------------------------------------------------------------------
// The fault handler.

struct SavedAction(libc::sigaction);

// SAFETY: written once under `Once`, then only read.
unsafe impl Send for SavedAction {}
unsafe impl Sync for SavedAction {}

static PREVIOUS_ACTION: OnceCell<SavedAction> = OnceCell::new();

/// Attaches the handler to the synchronous memory-fault signal. The mask
/// blocks everything except the other synchronous bug signals: if the
/// handler itself has a bug we want to die the normal way, but no
/// asynchronous signal may interrupt it.
pub fn install_fault_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fault_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;

        libc::sigfillset(&mut action.sa_mask);
        for bug_signal in [
            libc::SIGILL,
            libc::SIGBUS,
            libc::SIGFPE,
            libc::SIGSEGV,
            libc::SIGPIPE,
            libc::SIGSTKFLT,
        ] {
            libc::sigdelset(&mut action.sa_mask, bug_signal);
        }

        let mut previous: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, &action, &mut previous) != 0 {
            fatal(b"leakpatrol: could not install the fault handler\n");
        }
        let _ = PREVIOUS_ACTION.set(SavedAction(previous));
    });
}

thread_local! {
    static INSIDE_FAULT_HANDLER: Cell<bool> = const { Cell::new(false) };
    static PARENT_FAULT_ADDRESS: Cell<usize> = const { Cell::new(0) };
}

extern "C" fn fault_handler(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let accessed = unsafe { (*info).si_addr() } as usize;
    on_fault(accessed);
}

/// The handler body. Must not call anything that could allocate outside the
/// reentrancy guard, and must not assume the range is still watched: another
/// thread may have serviced the same page between the fault and our turn on
/// the lock.
fn on_fault(accessed: usize) {
    if INSIDE_FAULT_HANDLER.with(Cell::get) {
        // Fault inside the fault handler. Two possibilities:
        if accessed != PARENT_FAULT_ADDRESS.with(Cell::get) {
            // a) A bug in this handler, which touched an invalid pointer of
            //    its own.
            const MSG: &[u8] = b"leakpatrol: internal segmentation fault\n";
            unsafe {
                libc::write(libc::STDERR_FILENO, MSG.as_ptr() as *const libc::c_void, MSG.len());
            }
        } else {
            // b) The application accessed genuinely invalid memory: the
            //    parent handler found no watched range and re-probed the
            //    address to distinguish "already serviced elsewhere" from
            //    "really invalid", and the probe faulted again.
        }
        // Either way, die for real under the previous handler.
        restore_previous_and_reraise();
        return;
    }
    INSIDE_FAULT_HANDLER.with(|flag| flag.set(true));
    PARENT_FAULT_ADDRESS.with(|addr| addr.set(accessed));

    // Any allocation from here on (the lock, the unwinder) must bypass
    // tracking on this thread.
    let was_in_library = library_context::set_in_library(true);

    let serviced = match crate::setup::global_table() {
        Some(table) => table.handle_fault_at(accessed),
        None => false,
    };

    if !serviced {
        // The address is in no watched range. Either another thread got the
        // lock first and already unprotected it, or the application is
        // simply broken. Probing tells the two apart: a serviced page reads
        // fine, an invalid pointer faults again into the branch above.
        unsafe {
            std::ptr::read_volatile(accessed as *const u8);
        }
    }

    library_context::set_in_library(was_in_library);
    INSIDE_FAULT_HANDLER.with(|flag| flag.set(false));
}

fn restore_previous_and_reraise() {
    unsafe {
        if let Some(previous) = PREVIOUS_ACTION.get() {
            libc::sigaction(libc::SIGSEGV, &previous.0, std::ptr::null_mut());
        }
        libc::raise(libc::SIGSEGV);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_is_end_exclusive() {
        let mut ranges = WatchedRanges::default();
        ranges.insert(0x1000, 0x1000);

        assert!(!ranges.contains(0xfff));
        assert!(ranges.contains(0x1000));
        assert!(ranges.contains(0x1fff));
        assert!(!ranges.contains(0x2000));
    }

    #[test]
    fn lookup_lands_on_the_right_range() {
        let mut ranges = WatchedRanges::default();
        ranges.insert(0x1000, 0x1000);
        ranges.insert(0x3000, 0x2000);

        assert_eq!(ranges.containing(0x1800).unwrap().start, 0x1000);
        assert_eq!(ranges.containing(0x4fff).unwrap().start, 0x3000);
        assert!(ranges.containing(0x2800).is_none());
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn remove_containing_accepts_interior_addresses() {
        let mut ranges = WatchedRanges::default();
        ranges.insert(0x1000, 0x2000);

        let removed = ranges.remove_containing(0x2123).unwrap();
        assert_eq!(removed, WatchedRange { start: 0x1000, size: 0x2000 });
        assert!(ranges.is_empty());
        assert!(ranges.remove_containing(0x1000).is_none());
    }
}
