//! Hot-chunk detection and flag-based purging of the aggregate buffer.

use crate::{
    ChunkFlags, ChunkMetadata, HeapAccess, StoreBuffer, slot::WORD_SIZE,
};

/// Sampling passes tried when the reservation is exhausted, as
/// `(stride, threshold)`.
///
/// The first pass samples 1 entry in 97 and exempts chunks where roughly
/// one pointer in 8 is recorded. The last pass samples everything with a
/// zero threshold, which exempts every chunk that has an entry.
pub fn sample_schedule(chunk_size: usize) -> [(usize, usize); 5] {
    let words = chunk_size / WORD_SIZE;
    [
        (97, words / 97 / 8),
        (23, words / 23 / 16),
        (7, words / 7 / 32),
        (3, words / 3 / 256),
        (1, 0),
    ]
}

impl StoreBuffer {
    /// Samples every `stride`-th entry and flags chunks that were sampled
    /// more than `threshold` times as scan-on-scavenge, then purges their
    /// entries.
    pub fn exempt_popular_pages<H: HeapAccess>(
        &mut self,
        heap: &H,
        stride: usize,
        threshold: usize,
    ) {
        debug_assert!(stride > 0);
        for chunk in heap.pointer_chunks() {
            chunk.set_store_buffer_counter(0);
        }

        let mut hit_threshold = false;
        let mut newly_exempted = 0;
        let mut previous: Option<&H::Chunk> = None;
        for &addr in self.old.as_slice().iter().step_by(stride) {
            let chunk = match previous {
                Some(chunk) if chunk.contains(addr) => chunk,
                _ => heap.chunk_of(addr),
            };
            let count = chunk.increment_store_buffer_counter();
            if count >= threshold {
                if !chunk.scan_on_scavenge() {
                    newly_exempted += 1;
                }
                chunk.set_scan_on_scavenge(true);
                hit_threshold = true;
            }
            previous = Some(chunk);
        }

        if hit_threshold {
            self.filter(heap, ChunkFlags::SCAN_ON_SCAVENGE);
        }
        self.old_buffer_is_filtered = true;
        self.stats.exempted_chunks += newly_exempted;

        log::debug!(
            "exempted {newly_exempted} chunks sampling 1 in {stride} \
             (threshold {threshold}), {} entries left",
            self.old.len()
        );
    }

    /// Removes every entry whose chunk has `flag` set.
    pub fn filter<H: HeapAccess>(&mut self, heap: &H, flag: ChunkFlags) {
        let before = self.old.len();
        let mut previous: Option<&H::Chunk> = None;
        self.old.retain(|addr| {
            let chunk = match previous {
                Some(chunk) if chunk.contains(addr) => chunk,
                _ => heap.chunk_of(addr),
            };
            previous = Some(chunk);
            !chunk.flags().contains(flag)
        });
        self.stats.filter_passes += 1;
        log::trace!("filter {flag:?}: {before} -> {} entries", self.old.len());

        // the tables describe entries that may be gone now
        self.dedup.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        SlotRef, StoreBufferSettings,
        sim::{ObjectKind, SimHeap},
    };

    const PAGE: usize = StoreBufferSettings::ENTRIES_PER_PAGE;
    const CHUNK: usize = 64 * 1024;

    fn create_test_env() -> (SimHeap, StoreBuffer) {
        let heap = SimHeap::new(CHUNK, 4, 64 * 1024);
        let buffer = StoreBuffer::new(StoreBufferSettings {
            fast_buffer_entries: PAGE,
            aggregate_buffer_entries: PAGE * 8,
            chunk_size: CHUNK,
            ..Default::default()
        });
        (heap, buffer)
    }

    #[test]
    fn schedule_gets_denser_and_ends_exhaustive() {
        let schedule = sample_schedule(1 << 20);
        assert_eq!(schedule[0], (97, (131_072 / 97) / 8));
        assert!(schedule.windows(2).all(|w| w[0].0 > w[1].0));
        assert_eq!(schedule[4], (1, 0));
    }

    #[test]
    fn filter_removes_only_flagged_chunks_in_order() {
        let (heap, mut buffer) = create_test_env();
        let a = heap.allocate_old_in(1, ObjectKind::Tagged, 8);
        let b = heap.allocate_old_in(2, ObjectKind::Tagged, 8);
        for i in 0..8 {
            buffer.record_slot(&heap, heap.field(a, i));
            buffer.record_slot(&heap, heap.field(b, i));
        }
        buffer.compact(&heap);
        assert_eq!(buffer.len(), 16);

        heap.chunk(1).set_scan_on_scavenge(true);
        buffer.filter(&heap, ChunkFlags::SCAN_ON_SCAVENGE);

        let expected: Vec<SlotRef> = (0..8).map(|i| heap.field(b, i)).collect();
        let entries: Vec<SlotRef> = buffer.entries().collect();
        assert_eq!(entries, expected);
        assert!(buffer.dedup.is_empty(), "filtering invalidates the tables");
    }

    #[test]
    fn sparse_sampling_spares_chunks_below_threshold() {
        let (heap, mut buffer) = create_test_env();
        let hot = heap.allocate_old_in(1, ObjectKind::Tagged, PAGE * 2);
        let cold = heap.allocate_old_in(2, ObjectKind::Tagged, 16);
        for i in 0..PAGE * 2 {
            buffer.record_slot(&heap, heap.field(hot, i));
        }
        for i in 0..16 {
            buffer.record_slot(&heap, heap.field(cold, i));
        }
        buffer.compact(&heap);

        buffer.exempt_popular_pages(&heap, 7, 8);
        assert!(heap.chunk(1).scan_on_scavenge());
        assert!(!heap.chunk(2).scan_on_scavenge());
        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer.stats().exempted_chunks, 1);
        assert!(buffer.is_filtered());
    }

    #[test]
    fn densest_pass_exempts_every_chunk_with_entries() {
        let (heap, mut buffer) = create_test_env();
        let a = heap.allocate_old_in(1, ObjectKind::Tagged, 2);
        let b = heap.allocate_old_in(3, ObjectKind::Tagged, 2);
        buffer.record_slot(&heap, heap.field(a, 0));
        buffer.record_slot(&heap, heap.field(b, 1));
        buffer.compact(&heap);

        buffer.exempt_popular_pages(&heap, 1, 0);
        assert!(buffer.is_empty());
        assert!(heap.chunk(1).scan_on_scavenge());
        assert!(heap.chunk(3).scan_on_scavenge());
        assert!(!heap.chunk(2).scan_on_scavenge());
    }
}
