//! Run with:
//!   cargo bench --bench store_buffer

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use remset::{
    DedupMode, StoreBuffer, StoreBufferSettings,
    sim::{ObjectKind, SimHeap},
};

const CHUNK_SIZE: usize = 256 * 1024;
const FIELDS: usize = 4096;

fn setup(dedup: DedupMode) -> (SimHeap, StoreBuffer, usize) {
    let heap = SimHeap::new(CHUNK_SIZE, 4, 1024 * 1024);
    let buffer = StoreBuffer::new(StoreBufferSettings {
        chunk_size: CHUNK_SIZE,
        dedup,
        ..Default::default()
    });
    let holder = heap.allocate_old(ObjectKind::Tagged, FIELDS);
    (heap, buffer, holder)
}

fn bench_record_slot(c: &mut Criterion) {
    let (heap, mut buffer, holder) = setup(DedupMode::Lossy);
    let slots: Vec<_> = (0..FIELDS).map(|i| heap.field(holder, i)).collect();

    c.bench_function("record_slot", |b| {
        let mut i = 0;
        b.iter(|| {
            buffer.record_slot(&heap, black_box(slots[i % FIELDS]));
            i += 1;
        });
    });
}

fn bench_compact(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact");
    let modes = [("lossy", DedupMode::Lossy), ("exact", DedupMode::Exact)];
    for (name, dedup) in modes {
        let (heap, mut buffer, holder) = setup(dedup);
        let pending = buffer.settings().fast_buffer_entries - 1;
        group.bench_function(name, |b| {
            b.iter(|| {
                buffer.gc_prologue();
                for i in 0..pending {
                    // repeats every field a few times
                    buffer.record_slot(&heap, heap.field(holder, i % FIELDS));
                }
                buffer.compact(&heap);
                // drops everything, the fields hold no young pointers
                buffer.sort_uniq(&heap);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_record_slot, bench_compact);
criterion_main!(benches);
