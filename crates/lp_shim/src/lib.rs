//! `LD_PRELOAD` allocator interposition for leakpatrol.
//!
//! Exports the C allocation entry points, resolves the real ones through
//! `RTLD_NEXT`, and routes every call through the engine's instrumented
//! operations. Until the load-time constructor has finished wiring the
//! globals, every wrapper delegates to the backing allocator untracked;
//! same when the engine is reentrant on the current thread or watching is
//! off (the engine checks both).
//!
//! The only interposition subtlety worth remembering: `dlsym` itself calls
//! `calloc`, and tolerates it returning null during resolution.

mod callsite;

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_int, c_void, size_t};

use lp_core::setup::global_table;
use lp_core::{ZeroFill, NO_ALIGNMENT};

use crate::callsite::callsite_fingerprint;

#[ctor::ctor]
fn initialize_shim() {
    lp_core::setup::initialize();
}

// ----------------------------------------------------------------------------
// RTLD_NEXT resolution.

fn resolve_next(cache: &AtomicUsize, name: &'static [u8]) -> usize {
    let cached = cache.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    debug_assert!(name.ends_with(b"\0"));
    let address =
        unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const libc::c_char) } as usize;
    if address == 0 {
        const MSG: &[u8] = b"leakpatrol: dlsym(RTLD_NEXT) found no backing allocator\n";
        unsafe {
            libc::write(libc::STDERR_FILENO, MSG.as_ptr() as *const c_void, MSG.len());
            libc::abort();
        }
    }
    cache.store(address, Ordering::Relaxed);
    address
}

macro_rules! real {
    ($fn_name:ident, $symbol:literal, $signature:ty) => {
        fn $fn_name() -> $signature {
            static CACHE: AtomicUsize = AtomicUsize::new(0);
            let address = resolve_next(&CACHE, $symbol);
            unsafe { std::mem::transmute::<usize, $signature>(address) }
        }
    };
}

real!(real_malloc, b"malloc\0", unsafe extern "C" fn(size_t) -> *mut c_void);
real!(real_free, b"free\0", unsafe extern "C" fn(*mut c_void));
real!(real_realloc, b"realloc\0", unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void);
real!(
    real_reallocarray,
    b"reallocarray\0",
    unsafe extern "C" fn(*mut c_void, size_t, size_t) -> *mut c_void
);
real!(
    real_posix_memalign,
    b"posix_memalign\0",
    unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int
);
real!(
    real_aligned_alloc,
    b"aligned_alloc\0",
    unsafe extern "C" fn(size_t, size_t) -> *mut c_void
);
real!(real_valloc, b"valloc\0", unsafe extern "C" fn(size_t) -> *mut c_void);
real!(real_memalign, b"memalign\0", unsafe extern "C" fn(size_t, size_t) -> *mut c_void);
real!(real_pvalloc, b"pvalloc\0", unsafe extern "C" fn(size_t) -> *mut c_void);

type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;

/// `calloc` cannot use the plain resolver: `dlsym` allocates through
/// `calloc` itself. While we are inside the resolution, answer null;
/// fortunately `dlsym` copes.
fn real_calloc() -> Option<CallocFn> {
    static CACHE: AtomicUsize = AtomicUsize::new(0);
    let cached = CACHE.load(Ordering::Relaxed);
    if cached != 0 {
        return Some(unsafe { std::mem::transmute::<usize, CallocFn>(cached) });
    }

    thread_local! {
        static RESOLVING: Cell<bool> = const { Cell::new(false) };
    }
    if RESOLVING.with(Cell::get) {
        return None;
    }
    RESOLVING.with(|flag| flag.set(true));
    let address = resolve_next(&CACHE, b"calloc\0");
    RESOLVING.with(|flag| flag.set(false));
    Some(unsafe { std::mem::transmute::<usize, CallocFn>(address) })
}

// ----------------------------------------------------------------------------
// Exported entry points.
//
// Fingerprints must be computed up here: the capture reads this frame to
// find the application's return address.

#[no_mangle]
pub extern "C" fn malloc(size: size_t) -> *mut c_void {
    let fingerprint = callsite_fingerprint(size);
    let allocate = || unsafe { real_malloc()(size) } as *mut u8;
    match global_table() {
        Some(table) => table
            .instrumented_allocate(size, NO_ALIGNMENT, fingerprint, allocate, ZeroFill::Unnecessary)
            as *mut c_void,
        None => allocate() as *mut c_void,
    }
}

#[no_mangle]
pub extern "C" fn calloc(num_members: size_t, member_size: size_t) -> *mut c_void {
    let Some(real) = real_calloc() else {
        // dlsym probing calloc during its own resolution.
        return std::ptr::null_mut();
    };
    let allocate = || unsafe { real(num_members, member_size) } as *mut u8;

    let Some(size) = num_members.checked_mul(member_size) else {
        // Let the backing allocator produce its own ENOMEM.
        return allocate() as *mut c_void;
    };
    let fingerprint = callsite_fingerprint(size);
    match global_table() {
        Some(table) => {
            table.instrumented_allocate(size, NO_ALIGNMENT, fingerprint, allocate, ZeroFill::Needed)
                as *mut c_void
        }
        None => allocate() as *mut c_void,
    }
}

#[no_mangle]
pub extern "C" fn realloc(old_memory: *mut c_void, new_size: size_t) -> *mut c_void {
    let fingerprint = callsite_fingerprint(new_size);
    let Some(table) = global_table() else {
        return unsafe { real_realloc()(old_memory, new_size) };
    };

    // The underlying primitive hides an allocate and a free; dispatch them
    // to the matching instrumented paths.
    if old_memory.is_null() {
        let allocate = || unsafe { real_malloc()(new_size) } as *mut u8;
        return table
            .instrumented_allocate(new_size, NO_ALIGNMENT, fingerprint, allocate, ZeroFill::Unnecessary)
            as *mut c_void;
    }
    if new_size == 0 {
        table.instrumented_free(old_memory as *mut u8, || unsafe { real_free()(old_memory) });
        return std::ptr::null_mut();
    }

    table.instrumented_reallocate(old_memory as *mut u8, new_size, || unsafe {
        real_realloc()(old_memory, new_size)
    } as *mut u8) as *mut c_void
}

#[no_mangle]
pub extern "C" fn reallocarray(
    old_memory: *mut c_void,
    num_members: size_t,
    member_size: size_t,
) -> *mut c_void {
    let Some(new_size) = num_members.checked_mul(member_size) else {
        return unsafe { real_reallocarray()(old_memory, num_members, member_size) };
    };
    // The fingerprint must be captured in this frame: delegating to the
    // `realloc` wrapper would record a return address inside this module
    // instead of the application's call site.
    let fingerprint = callsite_fingerprint(new_size);
    let Some(table) = global_table() else {
        return unsafe { real_reallocarray()(old_memory, num_members, member_size) };
    };

    if old_memory.is_null() {
        let allocate = || unsafe { real_malloc()(new_size) } as *mut u8;
        return table
            .instrumented_allocate(new_size, NO_ALIGNMENT, fingerprint, allocate, ZeroFill::Unnecessary)
            as *mut c_void;
    }
    if new_size == 0 {
        table.instrumented_free(old_memory as *mut u8, || unsafe { real_free()(old_memory) });
        return std::ptr::null_mut();
    }

    table.instrumented_reallocate(old_memory as *mut u8, new_size, || unsafe {
        real_reallocarray()(old_memory, num_members, member_size)
    } as *mut u8) as *mut c_void
}

#[no_mangle]
pub extern "C" fn free(memory: *mut c_void) {
    match global_table() {
        Some(table) => {
            table.instrumented_free(memory as *mut u8, || unsafe { real_free()(memory) });
        }
        None => unsafe { real_free()(memory) },
    }
}

#[no_mangle]
pub extern "C" fn posix_memalign(
    out_memory: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let fingerprint = callsite_fingerprint(size);
    let Some(table) = global_table() else {
        return unsafe { real_posix_memalign()(out_memory, alignment, size) };
    };

    let mut delegate_result: c_int = 0;
    let allocate = || {
        let mut memory: *mut c_void = std::ptr::null_mut();
        let result = unsafe { real_posix_memalign()(&mut memory, alignment, size) };
        if result != 0 {
            delegate_result = result;
            return std::ptr::null_mut();
        }
        memory as *mut u8
    };

    let memory =
        table.instrumented_allocate(size, alignment, fingerprint, allocate, ZeroFill::Unnecessary);
    if memory.is_null() {
        return if delegate_result != 0 { delegate_result } else { libc::ENOMEM };
    }
    unsafe { *out_memory = memory as *mut c_void };
    0
}

#[no_mangle]
pub extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    let fingerprint = callsite_fingerprint(size);
    let allocate = || unsafe { real_aligned_alloc()(alignment, size) } as *mut u8;
    match global_table() {
        Some(table) => table
            .instrumented_allocate(size, alignment, fingerprint, allocate, ZeroFill::Unnecessary)
            as *mut c_void,
        None => allocate() as *mut c_void,
    }
}

#[no_mangle]
pub extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    let fingerprint = callsite_fingerprint(size);
    let allocate = || unsafe { real_memalign()(alignment, size) } as *mut u8;
    match global_table() {
        Some(table) => table
            .instrumented_allocate(size, alignment, fingerprint, allocate, ZeroFill::Unnecessary)
            as *mut c_void,
        None => allocate() as *mut c_void,
    }
}

#[no_mangle]
pub extern "C" fn valloc(size: size_t) -> *mut c_void {
    let fingerprint = callsite_fingerprint(size);
    let allocate = || unsafe { real_valloc()(size) } as *mut u8;
    match global_table() {
        Some(table) => {
            let page_size = table.environment().page_size;
            table.instrumented_allocate(size, page_size, fingerprint, allocate, ZeroFill::Unnecessary)
                as *mut c_void
        }
        None => allocate() as *mut c_void,
    }
}

#[no_mangle]
pub extern "C" fn pvalloc(size: size_t) -> *mut c_void {
    let fingerprint = callsite_fingerprint(size);
    let allocate = || unsafe { real_pvalloc()(size) } as *mut u8;
    match global_table() {
        Some(table) => {
            let env = table.environment();
            // pvalloc's contract: the whole request is rounded up to pages.
            let rounded = env.round_up_to_page_multiple(size);
            table.instrumented_allocate(
                rounded,
                env.page_size,
                fingerprint,
                allocate,
                ZeroFill::Unnecessary,
            ) as *mut c_void
        }
        None => allocate() as *mut c_void,
    }
}
