//! Bounded single-producer / single-consumer descriptor ring.
//!
//! Each mutator thread owns a chain of these rings (see `thread_record`); the
//! transmitter thread is the only consumer. The design follows the classic
//! cached-index SPSC ring:
//!
//! - `pi` and `ci` are monotonically increasing words, wrapped via a
//!   power-of-two mask only when indexing; `0 <= pi - ci <= capacity` always.
//! - The producer keeps a private `ci_snapshot` next to `pi` and reloads the
//!   shared `ci` only when the snapshot says "full"; the consumer mirrors this
//!   with `pi_snapshot`. Each side thus stays out of the other's cache line
//!   except on the refresh path.
//! - The slot store is release-published by the `pi` advance and
//!   acquire-consumed via the `pi` load, so a consumer never reads a slot the
//!   producer has not finished writing. `pi` is published on every produce:
//!   this ring carries overflow-detection descriptors, and batching the index
//!   would add detection latency.
//!
//! `produce`/`consume` are `unsafe fn`s: the ring cannot itself enforce that
//! exactly one thread plays each role, so callers uphold the discipline.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use std::cell::UnsafeCell;
use std::ptr;

use crossbeam_utils::CachePadded;

/// The record handed from mutators to the transmitter and on to the
/// descriptor container.
///
/// `id` is the allocation identity snapshot in eager mode and 0 in lazy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// User payload address of the encapsulated buffer.
    pub user_addr: usize,
    /// Eager-mode identity word captured at allocation time.
    pub id: usize,
}

impl Descriptor {
    pub(crate) const EMPTY: Self = Self {
        user_addr: 0,
        id: 0,
    };
}

struct ProducerSide {
    /// Producer index. Written by the producer (release), read by the consumer.
    pi: AtomicUsize,
    /// Producer-private snapshot of `ci`; refreshed only on apparent-full.
    ci_snapshot: UnsafeCell<usize>,
}

struct ConsumerSide {
    /// Consumer index. Written by the consumer (release), read by the producer.
    ci: AtomicUsize,
    /// Consumer-private snapshot of `pi`; refreshed only on apparent-empty.
    pi_snapshot: UnsafeCell<usize>,
}

/// One bounded SPSC ring of descriptors, chainable via `next`.
pub struct Ring {
    slots: Box<[UnsafeCell<Descriptor>]>,
    mask: usize,
    /// Successor ring, linked by the producer when this ring fills up.
    next: AtomicPtr<Ring>,
    prod: CachePadded<ProducerSide>,
    cons: CachePadded<ConsumerSide>,
}

// SAFETY: the SPSC protocol confines every UnsafeCell to a single thread at a
// time: slots in [ci, pi) belong to the consumer, the rest to the producer;
// `ci_snapshot` is producer-only and `pi_snapshot` consumer-only. The atomic
// indices carry the release/acquire edges between the two roles.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Allocate a ring of `capacity` slots (power of two). Returns `None` if
    /// the slot array cannot be allocated; descriptor transport degrades by
    /// dropping descriptors rather than aborting the mutator.
    #[must_use]
    pub fn try_new(capacity: usize) -> Option<Box<Ring>> {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let mut slots: Vec<UnsafeCell<Descriptor>> = Vec::new();
        if slots.try_reserve_exact(capacity).is_err() {
            return None;
        }
        slots.resize_with(capacity, || UnsafeCell::new(Descriptor::EMPTY));
        Some(Box::new(Ring {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            next: AtomicPtr::new(ptr::null_mut()),
            prod: CachePadded::new(ProducerSide {
                pi: AtomicUsize::new(0),
                ci_snapshot: UnsafeCell::new(0),
            }),
            cons: CachePadded::new(ConsumerSide {
                ci: AtomicUsize::new(0),
                pi_snapshot: UnsafeCell::new(0),
            }),
        }))
    }

    /// Slot capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// The successor ring, if the producer has linked one.
    #[inline]
    #[must_use]
    pub fn next(&self) -> *mut Ring {
        self.next.load(Ordering::Acquire)
    }

    /// Link the successor ring. Called by the producer before it switches its
    /// current-ring pointer, so the consumer discovers the successor through
    /// the chain it is already draining.
    #[inline]
    pub fn set_next(&self, next: *mut Ring) {
        self.next.store(next, Ordering::Release);
    }

    /// Push one descriptor. Fails only when the ring is full.
    ///
    /// # Safety
    ///
    /// Only the owning producer thread may call this, and never concurrently
    /// with itself.
    pub unsafe fn produce(&self, node: Descriptor) -> bool {
        let pi = self.prod.pi.load(Ordering::Relaxed);
        // SAFETY: producer-private field, we are the producer.
        let snapshot = unsafe { &mut *self.prod.ci_snapshot.get() };
        if pi.wrapping_sub(*snapshot) >= self.capacity() {
            let ci = self.cons.ci.load(Ordering::Acquire);
            if pi.wrapping_sub(ci) >= self.capacity() {
                return false;
            }
            *snapshot = ci;
        }
        // SAFETY: slot `pi` is outside [ci, pi) and therefore producer-owned;
        // the consumer will not read it until the release store below.
        unsafe {
            *self.slots[pi & self.mask].get() = node;
        }
        self.prod.pi.store(pi.wrapping_add(1), Ordering::Release);
        true
    }

    /// Pop one descriptor, or `None` when the ring is empty.
    ///
    /// # Safety
    ///
    /// Only the owning consumer thread may call this, and never concurrently
    /// with itself.
    pub unsafe fn consume(&self) -> Option<Descriptor> {
        let ci = self.cons.ci.load(Ordering::Relaxed);
        // SAFETY: consumer-private field, we are the consumer.
        let snapshot = unsafe { &mut *self.cons.pi_snapshot.get() };
        if ci == *snapshot {
            let pi = self.prod.pi.load(Ordering::Acquire);
            if ci == pi {
                return None;
            }
            *snapshot = pi;
        }
        // SAFETY: ci < pi, so slot `ci` was release-published by the producer
        // and is consumer-owned until the release store below.
        let node = unsafe { *self.slots[ci & self.mask].get() };
        self.cons.ci.store(ci.wrapping_add(1), Ordering::Release);
        Some(node)
    }
}


#[cfg(all(test, not(loom)))]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone)]
    enum Op {
        Produce(usize),
        Consume,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![(1usize..1_000_000).prop_map(Op::Produce), Just(Op::Consume)]
    }

    proptest! {
        /// Any single-threaded interleaving of produce/consume preserves FIFO
        /// order, never duplicates an item, and respects the capacity bound.
        #[test]
        fn fifo_and_count_invariants(ops in proptest::collection::vec(op_strategy(), 0..400)) {
            let ring = Ring::try_new(8).unwrap();
            let mut model = VecDeque::new();

            for op in ops {
                match op {
                    Op::Produce(v) => {
                        let node = Descriptor { user_addr: v, id: 0 };
                        if unsafe { ring.produce(node) } {
                            model.push_back(v);
                        } else {
                            prop_assert_eq!(model.len(), 8);
                        }
                    }
                    Op::Consume => match unsafe { ring.consume() } {
                        Some(node) => {
                            let expected = model.pop_front();
                            prop_assert_eq!(Some(node.user_addr), expected);
                        }
                        None => prop_assert!(model.is_empty()),
                    },
                }
                prop_assert!(model.len() <= 8);
            }
        }
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::thread;

    /// Loom explores every interleaving of a producer pushing through a full
    /// ring and a consumer draining it: FIFO order and no lost or duplicated
    /// descriptors.
    #[test]
    fn loom_spsc_fifo() {
        const COUNT: usize = 4;

        loom::model(|| {
            let ring: &'static Ring = Box::leak(Ring::try_new(2).unwrap());

            let producer = thread::spawn(move || {
                for i in 1..=COUNT {
                    let node = Descriptor {
                        user_addr: i,
                        id: 0,
                    };
                    while !unsafe { ring.produce(node) } {
                        thread::yield_now();
                    }
                }
            });

            let consumer = thread::spawn(move || {
                let mut expected = 1;
                while expected <= COUNT {
                    match unsafe { ring.consume() } {
                        Some(node) => {
                            assert_eq!(node.user_addr, expected);
                            expected += 1;
                        }
                        None => thread::yield_now(),
                    }
                }
            });

            producer.join().unwrap();
            consumer.join().unwrap();
        });
    }
}
