//! Allocator wrappers.
//!
//! [`Context::malloc`], [`Context::free`], [`Context::realloc`], and
//! [`Context::calloc`] carry the whole interception protocol: enlarge the
//! host request by three words, write the sentinels, hand a descriptor to the
//! owning thread's ring, and on free publish the freed transition in place
//! for the monitor. The C ABI shims in `cruiser-abi` are one-liners over
//! these methods, which keeps every code path drivable from ordinary tests.
//!
//! A thread-local protect flag guards against recursion: any allocation the
//! core makes for itself (ring growth, list nodes, thread spawn) happens
//! inside an [`unprotected`] scope, and the wrappers pass such calls straight
//! through to the host allocator.

use std::cell::Cell;
use std::ptr;

use crate::canary::{
    ALL_ONES, Capsule, EXTRA_WORDS, WORD_BYTES, process_canaries, try_region_bytes, word_size,
};
use crate::config::Mode;
use crate::context::{Context, ExitPhase};
use crate::host::page_alloc;
use crate::metrics::Metrics;
use crate::monitor::monitor_loop;
use crate::report::{self, AttackSite};
use crate::ring::Descriptor;
use crate::thread_record::ThreadRecord;

thread_local! {
    /// Whether allocations by this thread are encapsulated and monitored.
    /// Cleared inside the core's own code paths and on the two background
    /// threads.
    static PROTECT: Cell<bool> = const { Cell::new(true) };

    /// Cached thread record, keyed by owning context.
    static RECORD: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
}

/// Whether the calling thread's allocations are currently protected.
#[must_use]
pub fn protection_enabled() -> bool {
    PROTECT.with(Cell::get)
}

/// RAII scope in which the calling thread's allocator calls pass through to
/// the host unencapsulated.
pub struct UnprotectedGuard {
    prev: bool,
}

/// Enter an unprotected scope. Restores the previous state on drop.
pub fn unprotected() -> UnprotectedGuard {
    let prev = PROTECT.with(|p| p.replace(false));
    UnprotectedGuard { prev }
}

impl Drop for UnprotectedGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        PROTECT.with(|p| p.set(prev));
    }
}

impl Context {
    /// Intercepted `malloc`.
    pub fn malloc(&'static self, bytes: usize) -> *mut u8 {
        if !protection_enabled() {
            // SAFETY: plain pass-through to the host allocator.
            return unsafe { self.host.alloc(bytes) };
        }
        Metrics::inc(&self.metrics.mallocs);
        let ws = word_size(bytes);
        let Some(total) = try_region_bytes(ws) else {
            return ptr::null_mut();
        };
        // SAFETY: requesting an enlarged region from the host.
        let raw = unsafe { self.host.alloc(total) };
        if raw.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: `raw` spans `ws + EXTRA_WORDS` words.
        unsafe { self.encapsulate_and_track(raw, ws) }
    }

    /// Intercepted `calloc`.
    pub fn calloc(&'static self, nmemb: usize, size: usize) -> *mut u8 {
        if !protection_enabled() {
            // SAFETY: plain pass-through to the host allocator.
            return unsafe { self.host.calloc(nmemb, size) };
        }
        let Some(total) = nmemb.checked_mul(size) else {
            return ptr::null_mut();
        };
        Metrics::inc(&self.metrics.callocs);
        let ws = word_size(total);
        // The enlarged request stays in calloc form so the payload arrives
        // zeroed from the host.
        // SAFETY: requesting an enlarged region from the host.
        let raw = unsafe { self.host.calloc(ws + EXTRA_WORDS, WORD_BYTES) };
        if raw.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: `raw` spans `ws + EXTRA_WORDS` words.
        unsafe { self.encapsulate_and_track(raw, ws) }
    }

    /// Intercepted `free`.
    pub fn free(&'static self, user: *mut u8) {
        if user.is_null() {
            return;
        }
        if !protection_enabled() {
            // SAFETY: unprotected buffers were handed out unencapsulated.
            unsafe { self.host.dealloc(user) };
            return;
        }
        self.fork_check();
        Metrics::inc(&self.metrics.frees);
        // SAFETY: a protected pointer was returned by an encapsulating
        // wrapper, so the header words precede it.
        let capsule = unsafe { Capsule::from_user(user) };
        match self.config.mode {
            Mode::Lazy => {
                if self.config.check_duplicate_free
                    && capsule.head() == self.canaries.freed_word(capsule.size())
                {
                    Metrics::inc(&self.metrics.duplicate_frees);
                    report::duplicate_free(user as usize);
                    return;
                }
                // live_word ^ (live ^ freed) == freed_word; the size word and
                // tail stay untouched for the monitor's final verification.
                capsule.xor_head(self.canaries.live ^ self.canaries.freed);
                // The region itself is released by the monitor.
            }
            Mode::Eager => {
                if self.config.check_duplicate_free && capsule.head() == 0 {
                    Metrics::inc(&self.metrics.duplicate_frees);
                    report::duplicate_free(user as usize);
                    return;
                }
                self.eager_retire(&capsule, AttackSite::Free);
                // SAFETY: encapsulated region, ours to return to the host.
                unsafe { self.host.dealloc(capsule.base_ptr()) };
            }
        }
    }

    /// Intercepted `realloc`.
    pub fn realloc(&'static self, user: *mut u8, new_bytes: usize) -> *mut u8 {
        if !protection_enabled() {
            // SAFETY: plain pass-through to the host allocator.
            return unsafe { self.host.realloc(user, new_bytes) };
        }
        if new_bytes == 0 {
            self.free(user);
            return ptr::null_mut();
        }
        if user.is_null() {
            return self.malloc(new_bytes);
        }
        Metrics::inc(&self.metrics.reallocs);

        let new_ws = word_size(new_bytes);
        // SAFETY: protected pointers carry the header words.
        let capsule = unsafe { Capsule::from_user(user) };
        match self.config.mode {
            Mode::Lazy => self.realloc_lazy(user, &capsule, new_ws),
            Mode::Eager => self.realloc_eager(&capsule, new_ws),
        }
    }

    fn realloc_lazy(&'static self, user: *mut u8, capsule: &Capsule, new_ws: usize) -> *mut u8 {
        let ws = capsule.size();
        if new_ws == ws {
            return user;
        }
        if new_ws < ws {
            // In-place shrink. Publication order is load-bearing: the monitor
            // skips the transient head, and a monitor that already saw the
            // final head must find a size and tail that match it. Its head
            // re-read after the size read covers the remaining window.
            capsule.set_head(self.canaries.realloc);
            capsule.set_size(new_ws);
            capsule.set_tail(new_ws, self.canaries.live_word(new_ws));
            capsule.set_head(self.canaries.live_word(new_ws));
            return user;
        }
        // Growth relocates. The size word is about to be trusted for the
        // copy, so the head must still match it.
        if capsule.head() != self.canaries.live_word(ws) {
            self.raise_attack(AttackSite::Realloc, user as usize);
            return ptr::null_mut();
        }
        let Some(total) = try_region_bytes(new_ws) else {
            return ptr::null_mut();
        };
        // SAFETY: requesting an enlarged region from the host.
        let raw = unsafe { self.host.alloc(total) };
        if raw.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: both payloads are at least `min(ws, new_ws)` words.
        unsafe {
            ptr::copy_nonoverlapping(
                user,
                raw.add(crate::canary::HEADER_WORDS * WORD_BYTES),
                ws.min(new_ws) * WORD_BYTES,
            );
        }
        // SAFETY: `raw` spans `new_ws + EXTRA_WORDS` words.
        let new_user = unsafe { self.encapsulate_and_track(raw, new_ws) };
        // Retire the old buffer through the regular lazy-free transition.
        capsule.xor_head(self.canaries.live ^ self.canaries.freed);
        new_user
    }

    fn realloc_eager(&'static self, capsule: &Capsule, new_ws: usize) -> *mut u8 {
        let Some(total) = try_region_bytes(new_ws) else {
            return ptr::null_mut();
        };
        self.eager_retire(capsule, AttackSite::Realloc);
        // SAFETY: resizing the full encapsulated region in place or moved.
        let raw = unsafe { self.host.realloc(capsule.base_ptr(), total) };
        if raw.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: `raw` spans `new_ws + EXTRA_WORDS` words.
        unsafe { self.encapsulate_and_track(raw, new_ws) }
    }

    /// Eager-mode retirement: validate the tail while the buffer is still
    /// owned, then zero the identity so the monitor garbage-collects the
    /// descriptor.
    fn eager_retire(&'static self, capsule: &Capsule, site: AttackSite) {
        let ws = capsule.size();
        if capsule.tail(ws) != self.canaries.live {
            self.raise_attack(site, capsule.user_ptr() as usize);
        }
        capsule.set_head(0);
        Metrics::add(&self.metrics.reclaimed_bytes, (ws * WORD_BYTES) as u64);
    }

    /// Write the sentinels and enqueue the descriptor. Returns the user
    /// pointer.
    ///
    /// # Safety
    ///
    /// `raw` must span at least `ws + EXTRA_WORDS` words.
    pub(crate) unsafe fn encapsulate_and_track(&'static self, raw: *mut u8, ws: usize) -> *mut u8 {
        // SAFETY: per the function contract.
        let capsule = unsafe { Capsule::from_base(raw) };
        let descriptor = match self.config.mode {
            Mode::Lazy => {
                capsule.encapsulate_lazy(ws, &self.canaries);
                Descriptor {
                    user_addr: capsule.user_ptr() as usize,
                    id: 0,
                }
            }
            Mode::Eager => {
                let id = self.fresh_id();
                capsule.encapsulate_eager(ws, id, &self.canaries);
                Descriptor {
                    user_addr: capsule.user_ptr() as usize,
                    id,
                }
            }
        };
        Metrics::add(&self.metrics.allocated_bytes, (ws * WORD_BYTES) as u64);
        self.track(descriptor);
        capsule.user_ptr()
    }

    /// Hand the descriptor to this thread's record. Failure means the buffer
    /// simply goes unmonitored.
    fn track(&'static self, descriptor: Descriptor) {
        match self.thread_record() {
            // SAFETY: the record was claimed by this thread.
            Some(record) => {
                if unsafe { record.produce(descriptor) } {
                    Metrics::inc(&self.metrics.produced);
                } else {
                    Metrics::inc(&self.metrics.dropped);
                }
            }
            None => Metrics::inc(&self.metrics.dropped),
        }
    }

    /// This thread's record in this context's list, claimed on first use.
    fn thread_record(&'static self) -> Option<&'static ThreadRecord> {
        let key = self as *const Self as usize;
        let (cached_ctx, cached_rec) = RECORD.with(Cell::get);
        if cached_ctx == key && cached_rec != 0 {
            // SAFETY: records are never unlinked from a leaked context.
            return Some(unsafe { &*(cached_rec as *const ThreadRecord) });
        }
        // SAFETY: pthread_self is always safe; ids of live threads are nonzero.
        let tid = unsafe { libc::pthread_self() } as usize;
        let record = self
            .records
            .acquire(tid, self.config.initial_ring_capacity)?;
        RECORD.with(|c| c.set((key, record as *const ThreadRecord as usize)));
        Some(record)
    }

    /// Detect a fork and relaunch the background threads in the child. Hangs
    /// off the free wrapper because malloc is the hotter path.
    fn fork_check(&'static self) {
        let cached = self.pid.load(std::sync::atomic::Ordering::Relaxed);
        // SAFETY: getpid is always safe.
        let current = unsafe { libc::getpid() };
        if cached != current
            && self
                .pid
                .compare_exchange(
                    cached,
                    current,
                    std::sync::atomic::Ordering::AcqRel,
                    std::sync::atomic::Ordering::Relaxed,
                )
                .is_ok()
        {
            // Monitor and transmitter did not survive the fork; restart the
            // state machine and respawn them.
            self.set_exit_phase(ExitPhase::Running);
            let _guard = unprotected();
            let ctx: &'static Context = self;
            if std::thread::Builder::new()
                .name("cruiser-monitor".into())
                .spawn(move || monitor_loop(ctx))
                .is_err()
            {
                report::fatal_thread_spawn("monitor");
            }
        }
    }
}

// --- loader bootstrap ------------------------------------------------------

/// Serve an allocation while the interceptor is still initializing (e.g.
/// `dlsym` calling `calloc`). The buffer comes from anonymous pages, is
/// encapsulated so later in-place frees stay harmless, and is never enqueued:
/// the monitor will not see it, and it is never returned to the OS.
#[must_use]
pub fn bootstrap_alloc(bytes: usize) -> *mut u8 {
    let ws = word_size(bytes);
    let Some(total) = try_region_bytes(ws) else {
        return ptr::null_mut();
    };
    let raw = page_alloc(total);
    if raw.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: the mapping spans `ws + EXTRA_WORDS` words.
    let capsule = unsafe { Capsule::from_base(raw) };
    let canaries = process_canaries();
    match Mode::from_raw_env() {
        Mode::Lazy => capsule.encapsulate_lazy(ws, &canaries),
        Mode::Eager => capsule.encapsulate_eager(ws, ALL_ONES, &canaries),
    }
    capsule.user_ptr()
}

/// Bootstrap counterpart of `realloc`: fresh pages, payload copied over, old
/// buffer abandoned.
#[must_use]
pub fn bootstrap_realloc(user: *mut u8, new_bytes: usize) -> *mut u8 {
    if user.is_null() {
        return bootstrap_alloc(new_bytes);
    }
    if new_bytes == 0 {
        return ptr::null_mut();
    }
    // SAFETY: bootstrap pointers are encapsulated by bootstrap_alloc.
    let capsule = unsafe { Capsule::from_user(user) };
    let ws = capsule.size();
    let new_user = bootstrap_alloc(new_bytes);
    if new_user.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: both payloads are at least `min` words long.
    unsafe {
        ptr::copy_nonoverlapping(user, new_user, ws.min(word_size(new_bytes)) * WORD_BYTES);
    }
    new_user
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttackResponse, Config};

    fn context(mode: Mode) -> &'static Context {
        let cfg = Config {
            mode,
            on_attack: AttackResponse::Continue,
            check_duplicate_free: true,
            recycle_capacity: 64,
            ..Config::default()
        };
        Context::new(cfg).unwrap()
    }

    #[test]
    fn protect_guard_nests_and_restores() {
        assert!(protection_enabled());
        {
            let _a = unprotected();
            assert!(!protection_enabled());
            {
                let _b = unprotected();
                assert!(!protection_enabled());
            }
            assert!(!protection_enabled());
        }
        assert!(protection_enabled());
    }

    #[test]
    fn malloc_writes_lazy_sentinels() {
        let ctx = context(Mode::Lazy);
        let user = ctx.malloc(100);
        assert!(!user.is_null());
        let ws = word_size(100);
        let capsule = unsafe { Capsule::from_user(user) };
        assert_eq!(capsule.size(), ws);
        assert_eq!(capsule.head(), ctx.canaries.live_word(ws));
        assert_eq!(capsule.tail(ws), ctx.canaries.live_word(ws));
        assert_eq!(Metrics::get(&ctx.metrics.produced), 1);

        // Full payload writes never touch the sentinels.
        unsafe { user.write_bytes(0xaa, 100) };
        assert_eq!(capsule.size(), ws);

        ctx.free(user);
        assert_eq!(capsule.head(), ctx.canaries.freed_word(ws));
        // Lazy free leaves the region to the monitor.
        assert_eq!(capsule.tail(ws), ctx.canaries.live_word(ws));
    }

    #[test]
    fn malloc_writes_eager_sentinels_and_free_reclaims() {
        let ctx = context(Mode::Eager);
        let user = ctx.malloc(64);
        let ws = word_size(64);
        let capsule = unsafe { Capsule::from_user(user) };
        let id = capsule.head();
        assert_ne!(id, 0);
        assert_eq!(capsule.tail(ws), ctx.canaries.live);

        ctx.free(user);
        assert_eq!(Metrics::get(&ctx.metrics.attacks), 0);
        assert_eq!(
            Metrics::get(&ctx.metrics.reclaimed_bytes),
            (ws * WORD_BYTES) as u64
        );
    }

    #[test]
    fn eager_free_detects_tail_corruption() {
        let ctx = context(Mode::Eager);
        let user = ctx.malloc(64);
        let ws = word_size(64);
        let capsule = unsafe { Capsule::from_user(user) };
        capsule.set_tail(ws, 0xbad);
        ctx.free(user);
        assert_eq!(Metrics::get(&ctx.metrics.attacks), 1);
    }

    #[test]
    fn duplicate_free_is_reported_and_harmless() {
        let ctx = context(Mode::Lazy);
        let user = ctx.calloc(10, 10);
        let ws = word_size(100);
        let capsule = unsafe { Capsule::from_user(user) };

        ctx.free(user);
        let flagged = capsule.head();
        ctx.free(user);
        assert_eq!(Metrics::get(&ctx.metrics.duplicate_frees), 1);
        assert_eq!(capsule.head(), flagged, "second free must not mutate");
        assert_eq!(capsule.head(), ctx.canaries.freed_word(ws));
    }

    #[test]
    fn free_of_null_is_a_noop() {
        let ctx = context(Mode::Lazy);
        ctx.free(ptr::null_mut());
        assert_eq!(Metrics::get(&ctx.metrics.frees), 0);
    }

    #[test]
    fn calloc_zeroes_payload_and_rejects_overflow() {
        let ctx = context(Mode::Lazy);
        assert!(ctx.calloc(usize::MAX, 2).is_null());

        let user = ctx.calloc(100, 4);
        assert!(!user.is_null());
        for i in 0..400 {
            assert_eq!(unsafe { *user.add(i) }, 0);
        }
    }

    #[test]
    fn realloc_same_word_size_returns_same_pointer() {
        let ctx = context(Mode::Lazy);
        let user = ctx.malloc(100);
        let same = ctx.realloc(user, 100);
        assert_eq!(user, same);
    }

    #[test]
    fn realloc_zero_frees_and_returns_null() {
        let ctx = context(Mode::Lazy);
        let user = ctx.malloc(40);
        let capsule = unsafe { Capsule::from_user(user) };
        assert!(ctx.realloc(user, 0).is_null());
        assert_eq!(capsule.head(), ctx.canaries.freed_word(word_size(40)));
    }

    #[test]
    fn realloc_null_allocates() {
        let ctx = context(Mode::Lazy);
        let user = ctx.realloc(ptr::null_mut(), 32);
        assert!(!user.is_null());
        ctx.free(user);
    }

    #[test]
    fn realloc_shrink_rewrites_sentinels_in_place() {
        let ctx = context(Mode::Lazy);
        let user = ctx.malloc(800);
        let shrunk = ctx.realloc(user, 80);
        assert_eq!(shrunk, user);
        let ws = word_size(80);
        let capsule = unsafe { Capsule::from_user(user) };
        assert_eq!(capsule.size(), ws);
        assert_eq!(capsule.head(), ctx.canaries.live_word(ws));
        assert_eq!(capsule.tail(ws), ctx.canaries.live_word(ws));
        ctx.free(user);
    }

    #[test]
    fn realloc_growth_copies_and_retires_the_old_buffer() {
        let ctx = context(Mode::Lazy);
        let user = ctx.malloc(100);
        unsafe { user.write_bytes(0x5c, 100) };
        let old_capsule = unsafe { Capsule::from_user(user) };
        let old_ws = word_size(100);

        let grown = ctx.realloc(user, 1000);
        assert!(!grown.is_null());
        for i in 0..100 {
            assert_eq!(unsafe { *grown.add(i) }, 0x5c);
        }
        let capsule = unsafe { Capsule::from_user(grown) };
        assert_eq!(capsule.size(), word_size(1000));
        // Old buffer went through the lazy-free transition.
        assert_eq!(old_capsule.head(), ctx.canaries.freed_word(old_ws));
        ctx.free(grown);
    }

    #[test]
    fn realloc_growth_with_corrupted_head_raises_attack() {
        let ctx = context(Mode::Lazy);
        let user = ctx.malloc(100);
        let capsule = unsafe { Capsule::from_user(user) };
        capsule.set_head(0xdead);
        assert!(ctx.realloc(user, 1000).is_null());
        assert_eq!(Metrics::get(&ctx.metrics.attacks), 1);
    }

    #[test]
    fn eager_realloc_assigns_a_fresh_identity() {
        let ctx = context(Mode::Eager);
        let user = ctx.malloc(100);
        let old_id = unsafe { Capsule::from_user(user) }.head();
        let grown = ctx.realloc(user, 1000);
        assert!(!grown.is_null());
        let new_id = unsafe { Capsule::from_user(grown) }.head();
        assert_ne!(old_id, new_id);
        ctx.free(grown);
    }

    #[test]
    fn unprotected_calls_pass_through_unencapsulated() {
        let ctx = context(Mode::Lazy);
        let _guard = unprotected();
        let p = ctx.malloc(64);
        assert!(!p.is_null());
        assert_eq!(Metrics::get(&ctx.metrics.mallocs), 0);
        assert_eq!(Metrics::get(&ctx.metrics.produced), 0);
        ctx.free(p);
    }

    #[test]
    fn bootstrap_allocations_are_encapsulated_but_untracked() {
        let user = bootstrap_alloc(256);
        assert!(!user.is_null());
        let capsule = unsafe { Capsule::from_user(user) };
        assert_eq!(capsule.size(), word_size(256));
        unsafe { user.write_bytes(0x7e, 256) };

        let bigger = bootstrap_realloc(user, 512);
        assert!(!bigger.is_null());
        for i in 0..256 {
            assert_eq!(unsafe { *bigger.add(i) }, 0x7e);
        }
    }
}
