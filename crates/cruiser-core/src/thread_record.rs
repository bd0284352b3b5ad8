//! Per-mutator descriptor transport records.
//!
//! Every mutator thread owns one [`ThreadRecord`]: a chain of descriptor
//! rings it produces into, and which the transmitter drains. Records live in
//! a lock-free singly linked [`ThreadRecordList`] with head insertion and are
//! never unlinked, so the transmitter's traversal is wait-free. A record
//! whose `thread_id` is 0 is a free slot any new thread may claim with a
//! single CAS, rings included.
//!
//! When a mutator's current ring fills up it allocates a successor of twice
//! the capacity (up to [`MAX_RING_CAPACITY`]), produces into that, and links
//! it via `Ring::set_next` *before* switching its own producer pointer: the
//! transmitter only discovers rings by walking the chain from its consumer
//! end, so the link must be visible before descriptors start landing past it.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::interceptor::unprotected;
use crate::ring::{Descriptor, Ring};

/// Capacity of a thread's first descriptor ring.
pub const INITIAL_RING_CAPACITY: usize = 1024;

/// Ring growth cap: 4,194,304 descriptors.
pub const MAX_RING_CAPACITY: usize = 1 << 22;

/// One mutator thread's transport state.
pub struct ThreadRecord {
    /// Owning thread id; 0 marks the slot reusable.
    thread_id: AtomicUsize,
    /// Ring the producer currently fills. Mutator-private.
    pr: AtomicPtr<Ring>,
    /// Ring the consumer currently drains. Transmitter-private.
    cr: AtomicPtr<Ring>,
    /// Next record in the list.
    next: AtomicPtr<ThreadRecord>,
}

impl ThreadRecord {
    /// Allocate a record claimed by `thread_id` with one initial ring.
    fn try_new(thread_id: usize, initial_capacity: usize) -> Option<Box<Self>> {
        let ring = Box::into_raw(Ring::try_new(initial_capacity)?);
        Some(Box::new(Self {
            thread_id: AtomicUsize::new(thread_id),
            pr: AtomicPtr::new(ring),
            cr: AtomicPtr::new(ring),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }))
    }

    /// The owning thread id (0 = free slot).
    #[inline]
    #[must_use]
    pub fn thread_id(&self) -> usize {
        self.thread_id.load(Ordering::Acquire)
    }

    /// Mark the slot reusable. Called by the transmitter once the owner is
    /// gone and the rings are drained.
    pub fn release_slot(&self) {
        self.thread_id.store(0, Ordering::Release);
    }

    /// Push one descriptor, growing the ring chain if the current ring is
    /// full. Returns `false` only when the growth allocation fails; the
    /// descriptor is then dropped and the buffer goes unmonitored.
    ///
    /// # Safety
    ///
    /// Only the owning mutator thread may call this.
    pub unsafe fn produce(&self, node: Descriptor) -> bool {
        let pr = self.pr.load(Ordering::Relaxed);
        // SAFETY: rings in the chain outlive the record; we are the producer.
        let ring = unsafe { &*pr };
        if unsafe { ring.produce(node) } {
            return true;
        }

        let new_capacity = (ring.capacity() * 2).min(MAX_RING_CAPACITY);
        // The ring itself must come from the host allocator, not back through
        // the interceptor.
        let _guard = unprotected();
        let Some(new_ring) = Ring::try_new(new_capacity) else {
            return false;
        };
        let new_ring = Box::into_raw(new_ring);
        // SAFETY: the fresh ring is empty and still private to this thread.
        unsafe {
            let produced = (*new_ring).produce(node);
            debug_assert!(produced);
        }
        // Link before switching: the consumer reaches the new ring through
        // the old one's next pointer.
        ring.set_next(new_ring);
        self.pr.store(new_ring, Ordering::Relaxed);
        true
    }

    /// Pop one descriptor, advancing to successor rings and releasing
    /// exhausted predecessors.
    ///
    /// # Safety
    ///
    /// Only the consuming transmitter thread may call this.
    pub unsafe fn consume(&self) -> Option<Descriptor> {
        loop {
            let cr = self.cr.load(Ordering::Relaxed);
            // SAFETY: the consumer ring is valid until we release it below.
            let ring = unsafe { &*cr };
            if let Some(node) = unsafe { ring.consume() } {
                return Some(node);
            }
            let next = ring.next();
            if next.is_null() {
                return None;
            }
            // The old ring is drained and the producer moved on; nobody else
            // can reach it once cr advances.
            self.cr.store(next, Ordering::Relaxed);
            // SAFETY: exhausted predecessor, unreachable from both ends now.
            unsafe { drop(Box::from_raw(cr)) };
        }
    }
}

impl Drop for ThreadRecord {
    fn drop(&mut self) {
        // Walk the chain from the consumer end; pr always points into it.
        let mut cur = *self.cr.get_mut();
        while !cur.is_null() {
            // SAFETY: exclusive access during drop; chain nodes are owned.
            let ring = unsafe { Box::from_raw(cur) };
            cur = ring.next();
        }
    }
}

/// Lock-free list of thread records with head insertion and slot reuse.
pub struct ThreadRecordList {
    head: AtomicPtr<ThreadRecord>,
}

impl ThreadRecordList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Claim a record for `thread_id`: reuse a free slot if one exists,
    /// otherwise push a fresh record. Returns `None` if the initial ring
    /// cannot be allocated.
    pub fn acquire(
        &self,
        thread_id: usize,
        initial_capacity: usize,
    ) -> Option<&ThreadRecord> {
        debug_assert_ne!(thread_id, 0);
        for record in self.iter() {
            if record.thread_id.load(Ordering::Relaxed) == 0
                && record
                    .thread_id
                    .compare_exchange(0, thread_id, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return Some(record);
            }
        }

        let _guard = unprotected();
        let record = Box::into_raw(ThreadRecord::try_new(thread_id, initial_capacity)?);
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: `record` is still private to this thread.
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange(head, record, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: records are never unlinked, so the reference lives
                // as long as the list.
                return Some(unsafe { &*record });
            }
        }
    }

    /// Iterate all records, live and free slots alike.
    pub fn iter(&self) -> RecordIter<'_> {
        RecordIter {
            cur: self.head.load(Ordering::Acquire),
            _list: std::marker::PhantomData,
        }
    }
}

impl Default for ThreadRecordList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadRecordList {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: exclusive access during drop; records are list-owned.
            let mut record = unsafe { Box::from_raw(cur) };
            cur = *record.next.get_mut();
        }
    }
}

/// Iterator over the record list.
pub struct RecordIter<'a> {
    cur: *mut ThreadRecord,
    _list: std::marker::PhantomData<&'a ThreadRecordList>,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = &'a ThreadRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: records are never unlinked while the list lives.
        let record = unsafe { &*self.cur };
        self.cur = record.next.load(Ordering::Acquire);
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(n: usize) -> Descriptor {
        Descriptor {
            user_addr: n,
            id: 0,
        }
    }

    #[test]
    fn acquire_creates_then_reuses_slots() {
        let list = ThreadRecordList::new();
        let a = list.acquire(11, 8).unwrap();
        assert_eq!(a.thread_id(), 11);
        assert_eq!(list.iter().count(), 1);

        a.release_slot();
        let b = list.acquire(22, 8).unwrap();
        assert_eq!(b.thread_id(), 22);
        assert_eq!(list.iter().count(), 1, "free slot must be reused");

        let c = list.acquire(33, 8).unwrap();
        assert_eq!(c.thread_id(), 33);
        assert_eq!(list.iter().count(), 2);
    }

    #[test]
    fn produce_grows_the_ring_chain() {
        let list = ThreadRecordList::new();
        let rec = list.acquire(7, 4).unwrap();

        // 4 fit in the initial ring; the rest land in successors.
        for i in 1..=20 {
            assert!(unsafe { rec.produce(desc(i)) });
        }
        for i in 1..=20 {
            assert_eq!(unsafe { rec.consume() }, Some(desc(i)), "FIFO across rings");
        }
        assert_eq!(unsafe { rec.consume() }, None);
    }

    #[test]
    fn growth_caps_at_max_capacity() {
        assert_eq!((MAX_RING_CAPACITY * 2).min(MAX_RING_CAPACITY), MAX_RING_CAPACITY);
    }

    #[test]
    fn concurrent_registration_keeps_every_record() {
        let list: &'static ThreadRecordList = Box::leak(Box::new(ThreadRecordList::new()));
        let threads: Vec<_> = (1..=16usize)
            .map(|tid| {
                std::thread::spawn(move || {
                    let rec = list.acquire(tid, 8).unwrap();
                    assert_eq!(rec.thread_id(), tid);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(list.iter().count(), 16);
    }

    #[test]
    fn producer_and_transmitter_roles_run_concurrently() {
        let list: &'static ThreadRecordList = Box::leak(Box::new(ThreadRecordList::new()));
        let rec = list.acquire(5, 8).unwrap();
        const COUNT: usize = 50_000;

        let rec_ptr = rec as *const ThreadRecord as usize;
        let producer = std::thread::spawn(move || {
            let rec = unsafe { &*(rec_ptr as *const ThreadRecord) };
            for i in 1..=COUNT {
                while !unsafe { rec.produce(desc(i)) } {
                    std::hint::spin_loop();
                }
            }
        });
        let consumer = std::thread::spawn(move || {
            let rec = unsafe { &*(rec_ptr as *const ThreadRecord) };
            let mut expected = 1;
            while expected <= COUNT {
                match unsafe { rec.consume() } {
                    Some(node) => {
                        assert_eq!(node, desc(expected));
                        expected += 1;
                    }
                    None => std::hint::spin_loop(),
                }
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
