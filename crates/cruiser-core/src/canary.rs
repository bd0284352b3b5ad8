//! Per-buffer encapsulation protocol.
//!
//! An encapsulated allocation of `ws` payload words occupies `ws + 3` words:
//!
//! ```text
//! p[0]        head word    lazy:  live ^ ws while live, freed ^ ws once
//!                                 freed, the realloc canary transiently
//!                                 during an in-place shrink
//!                          eager: nonzero allocation id while live, 0 once
//!                                 freed
//! p[1]        size word    ws (payload size in words)
//! p[2..2+ws]  user payload
//! p[2+ws]     tail word    lazy:  live ^ ws (matches the live head)
//!                          eager: the live canary verbatim
//! ```
//!
//! The user pointer is `p + 2` words. Head and tail words race with the
//! monitor thread, so every access goes through atomics on the raw addresses:
//! publication stores are release, inspection loads are acquire.
//!
//! The three canary constants are drawn once per process from `/dev/urandom`
//! (raw `open`/`read`, no allocation — this runs before the host allocator is
//! resolved). Fixed fallback values are used if the read fails.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes per word; canaries, sizes, and ids are one word each.
pub const WORD_BYTES: usize = size_of::<usize>();

/// Words of overhead per encapsulated buffer: head, size, tail.
pub const EXTRA_WORDS: usize = 3;

/// Words preceding the user payload: head and size.
pub const HEADER_WORDS: usize = 2;

/// Sentinel that is never a valid user address. Marks tombstoned container
/// nodes, and substitutes for an eager id that wrapped to the reserved 0.
pub const ALL_ONES: usize = usize::MAX;

/// Payload size in words for a user request of `bytes` bytes.
#[inline]
#[must_use]
pub fn word_size(bytes: usize) -> usize {
    bytes.div_ceil(WORD_BYTES)
}

/// Total region size in bytes for a payload of `ws` words.
#[inline]
#[must_use]
pub fn region_bytes(ws: usize) -> usize {
    (ws + EXTRA_WORDS) * WORD_BYTES
}

/// Checked [`region_bytes`]: `None` when the enlarged request cannot be
/// represented. A wrapped size here would turn a huge request into a tiny
/// region with out-of-bounds sentinel writes.
#[inline]
#[must_use]
pub fn try_region_bytes(ws: usize) -> Option<usize> {
    ws.checked_add(EXTRA_WORDS)?.checked_mul(WORD_BYTES)
}

const FALLBACK_LIVE: usize = 0xcccc_cccc;
const FALLBACK_FREE: usize = 0xfefe_fedd;
const FALLBACK_REALLOC: usize = 0x1010_1010;

/// The process canary constants. Distinct and nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanarySet {
    /// XOR'd with the word size to form the live head/tail word (lazy), and
    /// used verbatim as the tail word (eager).
    pub live: usize,
    /// XOR'd with the word size to form the freed head word (lazy).
    pub freed: usize,
    /// Head word published for the duration of an in-place shrink (lazy).
    pub realloc: usize,
}

impl CanarySet {
    /// Draw a fresh set from `/dev/urandom`, falling back to fixed values.
    #[must_use]
    pub fn generate() -> Self {
        let mut words = [0usize; 3];
        if read_urandom(&mut words) {
            let set = Self {
                live: words[0],
                freed: words[1],
                realloc: words[2],
            };
            if set.is_usable() {
                return set;
            }
        }
        Self::fallback()
    }

    /// The fixed fallback set.
    #[must_use]
    pub const fn fallback() -> Self {
        Self {
            live: FALLBACK_LIVE,
            freed: FALLBACK_FREE,
            realloc: FALLBACK_REALLOC,
        }
    }

    fn is_usable(&self) -> bool {
        self.live != 0
            && self.freed != 0
            && self.realloc != 0
            && self.live != self.freed
            && self.live != self.realloc
            && self.freed != self.realloc
    }

    /// Head/tail word of a live lazy buffer of `ws` payload words.
    #[inline]
    #[must_use]
    pub fn live_word(&self, ws: usize) -> usize {
        self.live ^ ws
    }

    /// Head word of a freed lazy buffer of `ws` payload words.
    #[inline]
    #[must_use]
    pub fn freed_word(&self, ws: usize) -> usize {
        self.freed ^ ws
    }
}

/// Fill `words` from `/dev/urandom` without allocating.
fn read_urandom(words: &mut [usize; 3]) -> bool {
    let wanted = size_of_val(words);
    // SAFETY: plain open/read/close on a byte buffer we own.
    unsafe {
        let fd = libc::open(
            c"/dev/urandom".as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        );
        if fd < 0 {
            return false;
        }
        let n = libc::read(fd, words.as_mut_ptr().cast(), wanted);
        libc::close(fd);
        n == wanted as isize
    }
}

// Canaries used by allocations served before the process context exists
// (loader bootstrap). Published here so a context created later can adopt
// them, keeping early buffers verifiable.
static BOOTSTRAP_LIVE: AtomicUsize = AtomicUsize::new(0);
static BOOTSTRAP_FREE: AtomicUsize = AtomicUsize::new(0);
static BOOTSTRAP_REALLOC: AtomicUsize = AtomicUsize::new(0);

/// Publish the process canary set for bootstrap allocations. First writer
/// wins; later calls return the already-published set.
pub fn publish_process_canaries(set: CanarySet) -> CanarySet {
    match BOOTSTRAP_LIVE.compare_exchange(0, set.live, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            BOOTSTRAP_FREE.store(set.freed, Ordering::Release);
            BOOTSTRAP_REALLOC.store(set.realloc, Ordering::Release);
            set
        }
        Err(_) => process_canaries(),
    }
}

/// The published process canary set, or the fallback if none is published
/// yet (an allocation issued before any initialization began).
#[must_use]
pub fn process_canaries() -> CanarySet {
    let live = BOOTSTRAP_LIVE.load(Ordering::Acquire);
    if live == 0 {
        return CanarySet::fallback();
    }
    let mut freed = BOOTSTRAP_FREE.load(Ordering::Acquire);
    let mut realloc = BOOTSTRAP_REALLOC.load(Ordering::Acquire);
    // The two trailing stores may not have landed yet on another thread.
    if freed == 0 {
        freed = FALLBACK_FREE;
    }
    if realloc == 0 {
        realloc = FALLBACK_REALLOC;
    }
    CanarySet {
        live,
        freed,
        realloc,
    }
}

/// A raw view over one encapsulated region.
///
/// Constructing a `Capsule` asserts that `base` points at a live region of at
/// least `HEADER_WORDS + 1` words whose size word is in bounds; all accessors
/// rely on that contract. Head/size/tail accesses are atomic because they
/// race with the monitor thread.
#[derive(Clone, Copy)]
pub struct Capsule {
    base: *mut usize,
}

impl Capsule {
    /// View the region around a user pointer (`user - 2` words).
    ///
    /// # Safety
    ///
    /// `user` must have been returned by an encapsulating allocation and the
    /// region must still be mapped.
    #[inline]
    #[must_use]
    pub unsafe fn from_user(user: *mut u8) -> Self {
        // SAFETY: per the function contract, the header precedes `user`.
        Self {
            base: unsafe { user.cast::<usize>().sub(HEADER_WORDS) },
        }
    }

    /// View a region from its raw base pointer.
    ///
    /// # Safety
    ///
    /// `base` must point at a region of at least `ws + EXTRA_WORDS` words.
    #[inline]
    #[must_use]
    pub unsafe fn from_base(base: *mut u8) -> Self {
        Self { base: base.cast() }
    }

    /// The raw base handed back to the host allocator.
    #[inline]
    #[must_use]
    pub fn base_ptr(&self) -> *mut u8 {
        self.base.cast()
    }

    /// The user payload pointer (`base + 2` words).
    #[inline]
    #[must_use]
    pub fn user_ptr(&self) -> *mut u8 {
        // SAFETY: the construction contract guarantees the header words exist.
        unsafe { self.base.add(HEADER_WORDS).cast() }
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicUsize {
        // SAFETY: the construction contract guarantees `index` words exist,
        // and usize atomics are always lock-free at word alignment.
        unsafe { AtomicUsize::from_ptr(self.base.add(index)) }
    }

    /// Load the head word (acquire).
    #[inline]
    #[must_use]
    pub fn head(&self) -> usize {
        self.word(0).load(Ordering::Acquire)
    }

    /// Publish a new head word (release).
    #[inline]
    pub fn set_head(&self, value: usize) {
        self.word(0).store(value, Ordering::Release);
    }

    /// XOR the head word in place (release). Used by the lazy free protocol:
    /// `live_word ^ (live ^ freed) == freed_word`.
    #[inline]
    pub fn xor_head(&self, mask: usize) {
        self.word(0).fetch_xor(mask, Ordering::Release);
    }

    /// Load the size word (acquire).
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.word(1).load(Ordering::Acquire)
    }

    /// Publish a new size word (release).
    #[inline]
    pub fn set_size(&self, ws: usize) {
        self.word(1).store(ws, Ordering::Release);
    }

    /// Load the tail word of a `ws`-word payload (acquire).
    #[inline]
    #[must_use]
    pub fn tail(&self, ws: usize) -> usize {
        self.word(HEADER_WORDS + ws).load(Ordering::Acquire)
    }

    /// Publish a new tail word (release).
    #[inline]
    pub fn set_tail(&self, ws: usize, value: usize) {
        self.word(HEADER_WORDS + ws).store(value, Ordering::Release);
    }

    /// Address of the head word, for out-of-process-style reads.
    #[inline]
    #[must_use]
    pub fn head_addr(&self) -> usize {
        self.base as usize
    }

    /// Address of the size word.
    #[inline]
    #[must_use]
    pub fn size_addr(&self) -> usize {
        self.base as usize + WORD_BYTES
    }

    /// Address of the tail word of a `ws`-word payload. Wrapping arithmetic:
    /// an eager-mode monitor computes this from a size word it has not
    /// authenticated yet.
    #[inline]
    #[must_use]
    pub fn tail_addr(&self, ws: usize) -> usize {
        (self.base as usize).wrapping_add(HEADER_WORDS.wrapping_add(ws).wrapping_mul(WORD_BYTES))
    }

    /// Encapsulate as a live lazy buffer: size, tail, then head.
    pub fn encapsulate_lazy(&self, ws: usize, canaries: &CanarySet) {
        let live = canaries.live_word(ws);
        self.set_size(ws);
        self.set_tail(ws, live);
        self.set_head(live);
    }

    /// Encapsulate as a live eager buffer with identity `id`.
    pub fn encapsulate_eager(&self, ws: usize, id: usize, canaries: &CanarySet) {
        self.set_size(ws);
        self.set_tail(ws, canaries.live);
        self.set_head(id);
    }
}
