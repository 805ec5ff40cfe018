//! `mmap`/`munmap` interposition.
//!
//! Only anonymous mappings are recorded; file-backed ones are some other
//! tool's business. Lengths are rounded up to whole pages before they enter
//! the slice map, so unmap arithmetic works in page units like the kernel's.

use std::io::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, c_int, c_void, off_t, size_t};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use lp_core::library_context::{self, LibraryGuard};

use crate::memory_map::{MemoryMap, MmapAllocation};

static MEMORY_MAP: Lazy<Mutex<MemoryMap>> = Lazy::new(|| Mutex::new(MemoryMap::default()));

/// hash of an interned trace -> small id used in the event log.
type StackIdTable = std::collections::HashMap<u64, usize, ahash::RandomState>;

struct EventLog {
    events: Option<std::io::BufWriter<std::fs::File>>,
    stacks: Option<std::io::BufWriter<std::fs::File>>,
    stack_ids: StackIdTable,
}

static EVENT_LOG: Lazy<Mutex<EventLog>> = Lazy::new(|| {
    let open = |path: &str| match std::fs::File::create(path) {
        Ok(file) => Some(std::io::BufWriter::new(file)),
        Err(err) => {
            log::warn!("could not open {path}: {err}");
            None
        }
    };
    Mutex::new(EventLog {
        events: open("/tmp/mmap-event-log"),
        stacks: open("/tmp/mmap-stack-log"),
        stack_ids: StackIdTable::default(),
    })
});

fn page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 { 4096 } else { page as usize }
}

fn round_up_to_page_multiple(size: usize) -> usize {
    let page = page_size();
    (size + (page - 1)) & !(page - 1)
}

fn resolve_next(cache: &AtomicUsize, name: &'static [u8]) -> usize {
    let cached = cache.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let address = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) } as usize;
    cache.store(address, Ordering::Relaxed);
    address
}

type MmapFn = unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void;
type MunmapFn = unsafe extern "C" fn(*mut c_void, size_t) -> c_int;

fn real_mmap() -> MmapFn {
    static CACHE: AtomicUsize = AtomicUsize::new(0);
    let address = resolve_next(&CACHE, b"mmap\0");
    unsafe { std::mem::transmute::<usize, MmapFn>(address) }
}

fn real_munmap() -> MunmapFn {
    static CACHE: AtomicUsize = AtomicUsize::new(0);
    let address = resolve_next(&CACHE, b"munmap\0");
    unsafe { std::mem::transmute::<usize, MunmapFn>(address) }
}

/// Event-log bookkeeping for one new mapping. New stacks are written to the
/// stack log once and referenced by id afterwards.
fn log_map_event(allocation: &MmapAllocation) {
    let mut event_log = EVENT_LOG.lock();
    let hash = allocation.stack_trace.get().hash_value();
    let next_id = event_log.stack_ids.len() + 1;
    let (stack_id, is_new) = match event_log.stack_ids.entry(hash) {
        std::collections::hash_map::Entry::Occupied(entry) => (*entry.get(), false),
        std::collections::hash_map::Entry::Vacant(entry) => (*entry.insert(next_id), true),
    };

    if is_new {
        if let Some(stacks) = &mut event_log.stacks {
            let _ = writeln!(stacks, "stack {stack_id}:");
            let _ = write!(stacks, "{}", allocation.stack_trace.get());
            let _ = stacks.flush();
        }
    }
    if let Some(events) = &mut event_log.events {
        let _ = writeln!(
            events,
            "MAP {:#x} {} stack={stack_id}",
            allocation.original_start, allocation.original_size
        );
        let _ = events.flush();
    }
}

fn log_unmap_event(start: usize, size: usize) {
    let mut event_log = EVENT_LOG.lock();
    if let Some(events) = &mut event_log.events {
        let _ = writeln!(events, "UNMAP {start:#x} {size}");
        let _ = events.flush();
    }
}

#[no_mangle]
pub extern "C" fn mmap(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let mapped = unsafe { real_mmap()(addr, length, prot, flags, fd, offset) };
    if library_context::in_library() {
        return mapped;
    }
    let _ctx = LibraryGuard::enter();

    if mapped != libc::MAP_FAILED && flags & libc::MAP_ANONYMOUS != 0 {
        let allocation = MmapAllocation::new(mapped as usize, round_up_to_page_multiple(length));
        log_map_event(&allocation);
        MEMORY_MAP.lock().register_map(allocation);
    }
    mapped
}

#[no_mangle]
pub extern "C" fn munmap(addr: *mut c_void, length: size_t) -> c_int {
    let result = unsafe { real_munmap()(addr, length) };
    if library_context::in_library() {
        return result;
    }
    let _ctx = LibraryGuard::enter();

    if result == 0 {
        let start = addr as usize;
        let rounded = round_up_to_page_multiple(length);
        if MEMORY_MAP.lock().register_unmap(start, rounded) {
            log_unmap_event(start, rounded);
        }
    }
    result
}
