//! ABI layer for the four hooked allocation symbols.
//!
//! Each export resolves the global context and forwards. Calls that arrive
//! while the context is still initializing — `dlsym` resolving the host
//! `calloc` re-enters here, and the initializer's own internal allocations
//! do too — are served from the bootstrap page path: encapsulated, never
//! enqueued, never reclaimed.

use std::ffi::c_void;

use cruiser_core::context;
use cruiser_core::interceptor;

/// Hooked `malloc`. Returns a pointer into an encapsulated region.
///
/// # Safety
///
/// Standard C `malloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    match context::global_or_init() {
        Some(ctx) => ctx.malloc(size).cast(),
        None => interceptor::bootstrap_alloc(size).cast(),
    }
}

/// Hooked `free`.
///
/// # Safety
///
/// Standard C `free` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    match context::try_global() {
        Some(ctx) => ctx.free(ptr.cast()),
        // Initialization still in flight: the pointer is either a bootstrap
        // page (never reclaimed) or nothing we handed out. Leaking the
        // handful of loader-window frees is the safe answer.
        None => {}
    }
}

/// Hooked `realloc`.
///
/// # Safety
///
/// Standard C `realloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match context::global_or_init() {
        Some(ctx) => ctx.realloc(ptr.cast(), size).cast(),
        None => interceptor::bootstrap_realloc(ptr.cast(), size).cast(),
    }
}

/// Hooked `calloc`.
///
/// # Safety
///
/// Standard C `calloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    match context::global_or_init() {
        Some(ctx) => ctx.calloc(nmemb, size).cast(),
        None => match nmemb.checked_mul(size) {
            // Bootstrap pages arrive zeroed from the kernel.
            Some(total) => interceptor::bootstrap_alloc(total).cast(),
            None => std::ptr::null_mut(),
        },
    }
}
