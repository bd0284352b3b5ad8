//! The host allocator, resolved behind the interposed symbols.
//!
//! The core never implements allocation itself; it wraps whatever
//! `malloc`/`free`/`realloc`/`calloc` the rest of the link map provides.
//! Under LD_PRELOAD our exports shadow libc's, so the real entry points are
//! recovered with `dlsym(RTLD_NEXT, ..)` at init. Resolution failure is
//! fatal: there is nothing to fall back to.
//!
//! `dlsym` itself may call `calloc` before the pointer is recovered; that
//! single bootstrap allocation is served straight from an anonymous mapping
//! (see [`page_alloc`] and the interceptor's bootstrap path).

use std::ffi::c_void;

type MallocFn = unsafe extern "C" fn(libc::size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type ReallocFn = unsafe extern "C" fn(*mut c_void, libc::size_t) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void;

/// The four resolved host entry points.
#[derive(Clone, Copy)]
pub struct HostAllocator {
    malloc: MallocFn,
    free: FreeFn,
    realloc: ReallocFn,
    calloc: CallocFn,
}

impl HostAllocator {
    /// Resolve all four symbols via the dynamic loader's "next" lookup.
    /// `calloc` is resolved first: looking it up may recurse into our own
    /// `calloc` export, which must find the bootstrap path, not a
    /// half-initialized table.
    pub fn resolve() -> Result<Self, &'static str> {
        // SAFETY: plain dlsym lookups; the returned pointers are only
        // transmuted to the matching libc signatures.
        unsafe {
            let calloc = dlsym_next(c"calloc".as_ptr()).ok_or("calloc")?;
            let malloc = dlsym_next(c"malloc".as_ptr()).ok_or("malloc")?;
            let free = dlsym_next(c"free".as_ptr()).ok_or("free")?;
            let realloc = dlsym_next(c"realloc".as_ptr()).ok_or("realloc")?;
            Ok(Self {
                malloc: std::mem::transmute::<*mut c_void, MallocFn>(malloc),
                free: std::mem::transmute::<*mut c_void, FreeFn>(free),
                realloc: std::mem::transmute::<*mut c_void, ReallocFn>(realloc),
                calloc: std::mem::transmute::<*mut c_void, CallocFn>(calloc),
            })
        }
    }

    /// `malloc(bytes)`.
    ///
    /// # Safety
    ///
    /// Standard allocator contract.
    #[inline]
    pub unsafe fn alloc(&self, bytes: usize) -> *mut u8 {
        unsafe { (self.malloc)(bytes).cast() }
    }

    /// `free(ptr)`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator and not be freed twice.
    #[inline]
    pub unsafe fn dealloc(&self, ptr: *mut u8) {
        unsafe { (self.free)(ptr.cast()) }
    }

    /// `realloc(ptr, bytes)`.
    ///
    /// # Safety
    ///
    /// Standard allocator contract.
    #[inline]
    pub unsafe fn realloc(&self, ptr: *mut u8, bytes: usize) -> *mut u8 {
        unsafe { (self.realloc)(ptr.cast(), bytes).cast() }
    }

    /// `calloc(nmemb, size)`.
    ///
    /// # Safety
    ///
    /// Standard allocator contract.
    #[inline]
    pub unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut u8 {
        unsafe { (self.calloc)(nmemb, size).cast() }
    }
}

unsafe fn dlsym_next(name: *const libc::c_char) -> Option<*mut c_void> {
    let p = unsafe { libc::dlsym(libc::RTLD_NEXT, name) };
    if p.is_null() { None } else { Some(p) }
}

/// Allocate zeroed pages directly from the OS, bypassing the host allocator.
/// Used only for loader-bootstrap allocations that are never reclaimed.
#[must_use]
pub fn page_alloc(bytes: usize) -> *mut u8 {
    // SAFETY: anonymous private mapping; no file descriptor involved.
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            bytes.max(1),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        std::ptr::null_mut()
    } else {
        p.cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_all_four_symbols() {
        assert!(HostAllocator::resolve().is_ok());
    }

    #[test]
    fn alloc_free_roundtrip() {
        let host = HostAllocator::resolve().unwrap();
        unsafe {
            let p = host.alloc(128);
            assert!(!p.is_null());
            p.write_bytes(0xab, 128);
            assert_eq!(*p.add(127), 0xab);
            host.dealloc(p);
        }
    }

    #[test]
    fn realloc_preserves_contents() {
        let host = HostAllocator::resolve().unwrap();
        unsafe {
            let p = host.alloc(16);
            p.write_bytes(0x5a, 16);
            let q = host.realloc(p, 4096);
            assert!(!q.is_null());
            for i in 0..16 {
                assert_eq!(*q.add(i), 0x5a);
            }
            host.dealloc(q);
        }
    }

    #[test]
    fn calloc_zeroes() {
        let host = HostAllocator::resolve().unwrap();
        unsafe {
            let p = host.calloc(8, 8);
            assert!(!p.is_null());
            for i in 0..64 {
                assert_eq!(*p.add(i), 0);
            }
            host.dealloc(p);
        }
    }

    #[test]
    fn page_alloc_returns_writable_memory() {
        let p = page_alloc(4096);
        assert!(!p.is_null());
        unsafe {
            p.write_bytes(0x11, 4096);
            assert_eq!(*p.add(4095), 0x11);
            libc::munmap(p.cast(), 4096);
        }
    }
}
