//! Bounded SPSC ring recycling container nodes.
//!
//! The monitor produces unlinked list nodes into this ring; the transmitter
//! consumes them when inserting, falling back to the host allocator only when
//! the ring runs dry. Unlike the descriptor rings, nothing here is latency
//! sensitive, so both indices are published in batches of [`RECYCLE_BATCH`]
//! to keep the shared cache lines quiet. Items sitting in an unpublished
//! batch stay invisible to the consumer until the batch completes; for node
//! recycling that is a bounded, harmless lag.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::canary::WORD_BYTES;

/// Index-publication batch: four cache lines worth of slots.
pub const RECYCLE_BATCH: usize = 4 * 64 / WORD_BYTES;

struct ProducerSide {
    /// Published producer index; read by the consumer.
    pi: AtomicUsize,
    /// Producer-private true index; `pi` trails it by less than a batch.
    pi_current: UnsafeCell<usize>,
    pi_batch: UnsafeCell<usize>,
    /// Producer-private snapshot of `ci`.
    ci_snapshot: UnsafeCell<usize>,
}

struct ConsumerSide {
    /// Published consumer index; read by the producer.
    ci: AtomicUsize,
    ci_current: UnsafeCell<usize>,
    ci_batch: UnsafeCell<usize>,
    /// Consumer-private snapshot of `pi`.
    pi_snapshot: UnsafeCell<usize>,
}

/// Bounded single-producer / single-consumer pointer ring with batched index
/// publication.
pub struct RecycleRing<T> {
    slots: Box<[UnsafeCell<*mut T>]>,
    mask: usize,
    prod: CachePadded<ProducerSide>,
    cons: CachePadded<ConsumerSide>,
}

// SAFETY: same single-producer/single-consumer confinement argument as the
// descriptor ring; the batched atomic indices still carry release/acquire
// edges for every published slot.
unsafe impl<T> Send for RecycleRing<T> {}
unsafe impl<T> Sync for RecycleRing<T> {}

impl<T> RecycleRing<T> {
    /// Allocate a ring of `capacity` slots (power of two).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "recycle capacity must be a power of two");
        let mut slots: Vec<UnsafeCell<*mut T>> = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(std::ptr::null_mut()));
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            prod: CachePadded::new(ProducerSide {
                pi: AtomicUsize::new(0),
                pi_current: UnsafeCell::new(0),
                pi_batch: UnsafeCell::new(0),
                ci_snapshot: UnsafeCell::new(0),
            }),
            cons: CachePadded::new(ConsumerSide {
                ci: AtomicUsize::new(0),
                ci_current: UnsafeCell::new(0),
                ci_batch: UnsafeCell::new(0),
                pi_snapshot: UnsafeCell::new(0),
            }),
        }
    }

    /// Slot capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Offer a node for reuse. Fails when the ring is full; the caller then
    /// returns the node to the host allocator instead.
    ///
    /// # Safety
    ///
    /// Only the owning producer thread may call this.
    pub unsafe fn produce(&self, node: *mut T) -> bool {
        // SAFETY: producer-private fields, we are the producer.
        let (current, batch, snapshot) = unsafe {
            (
                &mut *self.prod.pi_current.get(),
                &mut *self.prod.pi_batch.get(),
                &mut *self.prod.ci_snapshot.get(),
            )
        };
        if current.wrapping_sub(*snapshot) >= self.capacity() {
            let ci = self.cons.ci.load(Ordering::Acquire);
            if current.wrapping_sub(ci) >= self.capacity() {
                return false;
            }
            *snapshot = ci;
        }
        // SAFETY: slot is producer-owned until published through `pi`.
        unsafe {
            *self.slots[*current & self.mask].get() = node;
        }
        *current = current.wrapping_add(1);
        *batch += 1;
        if *batch >= RECYCLE_BATCH {
            *batch = 0;
            self.prod.pi.store(*current, Ordering::Release);
        }
        true
    }

    /// Take a recycled node, or `None` if nothing is published.
    ///
    /// # Safety
    ///
    /// Only the owning consumer thread may call this.
    pub unsafe fn consume(&self) -> Option<*mut T> {
        // SAFETY: consumer-private fields, we are the consumer.
        let (current, batch, snapshot) = unsafe {
            (
                &mut *self.cons.ci_current.get(),
                &mut *self.cons.ci_batch.get(),
                &mut *self.cons.pi_snapshot.get(),
            )
        };
        if *current == *snapshot {
            let pi = self.prod.pi.load(Ordering::Acquire);
            if *current == pi {
                return None;
            }
            *snapshot = pi;
        }
        // SAFETY: slot `current` was release-published via `pi`.
        let node = unsafe { *self.slots[*current & self.mask].get() };
        *current = current.wrapping_add(1);
        *batch += 1;
        if *batch >= RECYCLE_BATCH {
            *batch = 0;
            self.cons.ci.store(*current, Ordering::Release);
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_consume_returns_none() {
        let ring: RecycleRing<u64> = RecycleRing::new(64);
        assert_eq!(unsafe { ring.consume() }, None);
    }

    #[test]
    fn items_publish_per_batch() {
        let ring: RecycleRing<u64> = RecycleRing::new(256);
        let fake = 0x1000 as *mut u64;

        // One short of a batch: nothing visible yet.
        for _ in 0..RECYCLE_BATCH - 1 {
            assert!(unsafe { ring.produce(fake) });
        }
        assert_eq!(unsafe { ring.consume() }, None);

        // Completing the batch publishes all of it.
        assert!(unsafe { ring.produce(fake) });
        for _ in 0..RECYCLE_BATCH {
            assert_eq!(unsafe { ring.consume() }, Some(fake));
        }
        assert_eq!(unsafe { ring.consume() }, None);
    }

    #[test]
    fn rejects_when_full() {
        let cap = RECYCLE_BATCH * 2;
        let ring: RecycleRing<u64> = RecycleRing::new(cap);
        let fake = 0x2000 as *mut u64;
        for _ in 0..cap {
            assert!(unsafe { ring.produce(fake) });
        }
        assert!(!unsafe { ring.produce(fake) });
    }

    #[test]
    fn wraps_across_many_batches() {
        let ring: RecycleRing<u64> = RecycleRing::new(RECYCLE_BATCH);
        for round in 0..8usize {
            let p = (0x1000 * (round + 1)) as *mut u64;
            for _ in 0..RECYCLE_BATCH {
                assert!(unsafe { ring.produce(p) });
            }
            for _ in 0..RECYCLE_BATCH {
                assert_eq!(unsafe { ring.consume() }, Some(p));
            }
        }
    }
}
