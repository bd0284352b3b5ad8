//! Mutator-side overhead benchmarks.
//!
//! Measures the two costs a mutator thread actually pays per allocation:
//! writing the sentinels, and pushing a descriptor into its ring.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use cruiser_core::canary::{Capsule, CanarySet, EXTRA_WORDS};
use cruiser_core::ring::{Descriptor, Ring};

fn bench_encapsulation(c: &mut Criterion) {
    let canaries = CanarySet::fallback();
    let ws = 16usize;
    let mut region = vec![0usize; ws + EXTRA_WORDS];
    // SAFETY: the vec backs a full region for the whole benchmark.
    let capsule = unsafe { Capsule::from_base(region.as_mut_ptr().cast()) };

    let mut group = c.benchmark_group("encapsulation");
    group.throughput(Throughput::Elements(1));
    group.bench_function("lazy_seal", |b| {
        b.iter(|| {
            capsule.encapsulate_lazy(black_box(ws), &canaries);
            black_box(capsule.head())
        });
    });
    group.bench_function("eager_seal", |b| {
        let mut id = 0usize;
        b.iter(|| {
            id = id.wrapping_add(1);
            capsule.encapsulate_eager(black_box(ws), id, &canaries);
            black_box(capsule.head())
        });
    });
    group.bench_function("verify_words", |b| {
        capsule.encapsulate_lazy(ws, &canaries);
        b.iter(|| {
            let head = capsule.head();
            let size = capsule.size();
            let tail = capsule.tail(size);
            black_box(head == canaries.live_word(size) && tail == head)
        });
    });
    group.finish();
}

fn bench_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("descriptor_ring");
    group.throughput(Throughput::Elements(1));

    group.bench_function("produce_consume_uncontended", |b| {
        let ring = Ring::try_new(1024).unwrap();
        let node = Descriptor {
            user_addr: 0x1000,
            id: 1,
        };
        b.iter(|| {
            // SAFETY: single-threaded benchmark plays both roles in turn.
            unsafe {
                assert!(ring.produce(black_box(node)));
                black_box(ring.consume())
            }
        });
    });

    group.bench_function("produce_under_concurrent_drain", |b| {
        let ring: &'static Ring = Box::leak(Ring::try_new(1024).unwrap());
        let stop: &'static std::sync::atomic::AtomicBool =
            Box::leak(Box::new(std::sync::atomic::AtomicBool::new(false)));
        let drainer = std::thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                // SAFETY: this thread is the sole consumer.
                if unsafe { ring.consume() }.is_none() {
                    std::hint::spin_loop();
                }
            }
        });
        let node = Descriptor {
            user_addr: 0x2000,
            id: 2,
        };
        b.iter(|| {
            // SAFETY: this thread is the sole producer.
            while !unsafe { ring.produce(black_box(node)) } {
                std::hint::spin_loop();
            }
        });
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        drainer.join().unwrap();
    });

    group.finish();
}

criterion_group!(benches, bench_encapsulation, bench_ring);
criterion_main!(benches);
