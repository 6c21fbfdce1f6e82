//! A program that uses a process heap as its global allocator, creates and
//! destroys a large number of objects, and checks the heap along the way.
//!
//! Run with `RUST_LOG=info` to follow along. The logger allocates through the
//! same heap, which never logs from inside `GlobalAlloc`.

use segment_heap::{HeapConfig, MmapSupplier, ProcessHeap, UserBackend};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

#[global_allocator]
static ALLOCATOR: ProcessHeap = ProcessHeap::new(
    UserBackend::new(),
    MmapSupplier::new(),
    HeapConfig::new().with_alignment(16),
);

// Minimum number of live objects before we start dropping them
const MIN_OBJECTS: usize = 1024;
// Total number of creations / drops
const OPERATIONS: usize = 64 * 1024;
// Objects hold up to this many u64s
const MAX_LEN: usize = 2048;

fn check(step: usize) {
    let stats = ALLOCATOR.stats().expect("process heap is not reachable");
    let validity = ALLOCATOR.self_check().expect("process heap is not reachable");
    assert!(validity.is_valid(), "step {}: {:?}", step, validity);
    log::info!(
        "step {:>6}: {:>5} used blocks, {:>9} / {:>9} bytes used in {} segments",
        step, stats.used_records, stats.used_bytes, stats.total_bytes, stats.segments
    );
}

fn main() {
    env_logger::init();

    let seed = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let lengths = Uniform::new_inclusive(1usize, MAX_LEN);

    let mut objects: Vec<Vec<u64>> = Vec::new();
    for step in 0..OPERATIONS {
        if objects.len() < MIN_OBJECTS || rng.gen_bool(0.5) {
            let len = lengths.sample(&mut rng);
            objects.push((0..len as u64).collect());
        } else {
            let index = rng.gen_range(0..objects.len());
            let object = objects.swap_remove(index);
            assert!(object.iter().enumerate().all(|(i, &v)| v == i as u64));
        }

        if step % 8192 == 0 {
            check(step);
        }
    }

    drop(objects);
    check(OPERATIONS);
}
