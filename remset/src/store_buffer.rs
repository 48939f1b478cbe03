//! The store buffer: a remembered set of old-to-young slots.
//!
//! Mutators append slots to the [`FastBuffer`] with
//! [`StoreBuffer::record_slot`]. When it fills up, its entries are
//! compacted into the [`AggregateBuffer`], dropping most duplicates on the
//! way. When the aggregate buffer runs out of committed memory it grows;
//! once the reservation is exhausted, chunks that contribute many entries
//! are switched to scan-on-scavenge and their entries purged.
//!
//! Every slow-path entry point takes the embedding heap as a
//! [`HeapAccess`] handle. All of them run while the mutator is paused.

use std::cell::Cell;

use crate::{
    ChunkFlags, ChunkMetadata, HeapAccess, SlotRef,
    aggregate::AggregateBuffer,
    dedup::DedupFilter,
    error::{SetupError, fatal_out_of_memory},
    fast_buffer::FastBuffer,
    filter::sample_schedule,
    settings::StoreBufferSettings,
};

/// Notifications about chunk rescans during a scavenge.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreBufferEvent {
    StartScanningPages,
    ScanningPage { chunk: usize },
    ScanningPagesDone,
}

pub type EventCallback = Box<dyn FnMut(StoreBufferEvent) + Send>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreBufferStats {
    pub overflows: usize,
    pub compactions: usize,
    pub growths: usize,
    pub filter_passes: usize,
    pub exempted_chunks: usize,
    pub scavenges: usize,
    pub rescanned_chunks: usize,
}

pub struct StoreBuffer {
    pub(crate) settings: StoreBufferSettings,
    pub(crate) fast: FastBuffer,
    pub(crate) old: AggregateBuffer,
    pub(crate) dedup: DedupFilter,
    pub(crate) old_buffer_is_sorted: bool,
    pub(crate) old_buffer_is_filtered: bool,
    pub(crate) during_gc: bool,
    /// Cleared while a scavenge walks the aggregate buffer in place.
    pub(crate) may_move_entries: bool,
    /// Address of the buffer word that answered the last membership query.
    pub(crate) membership_cache: Cell<Option<usize>>,
    pub(crate) events: Option<EventCallback>,
    pub(crate) stats: StoreBufferStats,
}

impl std::fmt::Debug for StoreBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBuffer")
            .field("settings", &self.settings)
            .field("pending", &self.fast.len())
            .field("entries", &self.old.len())
            .field("committed", &self.old.committed())
            .field("sorted", &self.old_buffer_is_sorted)
            .field("filtered", &self.old_buffer_is_filtered)
            .field("during_gc", &self.during_gc)
            .field("dedup_empty", &self.dedup.is_empty())
            .field("stats", &self.stats)
            .finish()
    }
}

impl StoreBuffer {
    /// Reserves both buffers. Failing to get memory from the OS is fatal.
    pub fn set_up(settings: StoreBufferSettings) -> Result<Self, SetupError> {
        settings.validate().map_err(SetupError::InvalidSettings)?;

        let Some(fast) = FastBuffer::new(settings.fast_buffer_entries) else {
            fatal_out_of_memory("StoreBuffer::set_up");
        };
        let Some(old) = AggregateBuffer::new(settings.aggregate_buffer_entries)
        else {
            fatal_out_of_memory("StoreBuffer::set_up");
        };
        let dedup = DedupFilter::new(
            settings.dedup,
            settings.hash_set_length_log2,
            settings.chunk_size,
        );

        log::debug!(
            "store buffer set up: {} fast entries, {} reserved entries",
            fast.capacity(),
            old.reserved()
        );

        Ok(Self {
            settings,
            fast,
            old,
            dedup,
            old_buffer_is_sorted: false,
            old_buffer_is_filtered: false,
            during_gc: false,
            may_move_entries: true,
            membership_cache: Cell::new(None),
            events: None,
            stats: StoreBufferStats::default(),
        })
    }

    #[must_use]
    pub fn new(settings: StoreBufferSettings) -> Self {
        Self::set_up(settings).expect("Invalid Store Buffer Settings")
    }

    /// Returns the committed memory and releases both reservations.
    pub fn tear_down(mut self) {
        self.fast.take();
        self.old.truncate(0);
        if !self.old.uncommit_to(0) {
            log::warn!("failed to uncommit store buffer memory");
        }
        log::debug!("store buffer torn down, {:?}", self.stats);
    }

    pub fn settings(&self) -> &StoreBufferSettings {
        &self.settings
    }

    pub fn stats(&self) -> StoreBufferStats {
        self.stats
    }

    pub fn set_event_callback(&mut self, callback: Option<EventCallback>) {
        self.events = callback;
    }

    pub(crate) fn emit(&mut self, event: StoreBufferEvent) {
        if let Some(callback) = self.events.as_mut() {
            callback(event);
        }
    }

    /// Fast buffer cursor, for code that bumps it directly.
    #[inline]
    pub fn top(&self) -> *mut usize {
        self.fast.top()
    }

    #[inline]
    pub fn limit(&self) -> *mut usize {
        self.fast.limit()
    }

    /// Entries waiting in the fast buffer.
    #[inline]
    pub fn pending(&self) -> usize {
        self.fast.len()
    }

    /// Entries in the aggregate buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.old.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.old.is_empty() && self.fast.is_empty()
    }

    pub fn committed_entries(&self) -> usize {
        self.old.committed()
    }

    pub fn reserved_entries(&self) -> usize {
        self.old.reserved()
    }

    pub fn is_sorted(&self) -> bool {
        self.old_buffer_is_sorted
    }

    pub fn is_filtered(&self) -> bool {
        self.old_buffer_is_filtered
    }

    pub fn during_gc(&self) -> bool {
        self.during_gc
    }

    /// Entries of the aggregate buffer in buffer order.
    pub fn entries(&self) -> impl Iterator<Item = SlotRef> + '_ {
        self.old
            .as_slice()
            .iter()
            // SAFETY: only slot addresses are ever written to the buffer
            .map(|&addr| unsafe { SlotRef::new_unchecked(addr) })
    }

    /// Entries of the fast buffer in recording order.
    pub fn pending_entries(&self) -> impl Iterator<Item = SlotRef> + '_ {
        self.fast
            .as_slice()
            .iter()
            // SAFETY: only slot addresses are ever written to the buffer
            .map(|&addr| unsafe { SlotRef::new_unchecked(addr) })
    }

    /// Remembers `slot`, which now holds a pointer into the young
    /// generation. Drains the fast buffer when it fills up.
    #[inline(always)]
    pub fn record_slot<H: HeapAccess>(&mut self, heap: &H, slot: SlotRef) {
        if self.fast.push(slot) {
            self.store_buffer_overflow(heap);
        }
    }

    #[cold]
    #[inline(never)]
    pub fn store_buffer_overflow<H: HeapAccess>(&mut self, heap: &H) {
        self.stats.overflows += 1;
        log::trace!("store buffer overflow #{}", self.stats.overflows);
        self.compact(heap);
    }

    /// Moves the fast buffer into the aggregate buffer, skipping entries
    /// the dedup filter has already seen.
    pub fn compact<H: HeapAccess>(&mut self, heap: &H) {
        if self.fast.is_empty() {
            return;
        }

        // Reset first so a nested compaction from ensure_space is a no-op.
        let pending = self.fast.take();
        self.ensure_space(heap, pending);
        debug_assert!(self.may_move_entries);

        for index in 0..pending {
            // SAFETY: index < pending <= capacity, nothing pushed since take
            let addr = unsafe { self.fast.read(index) };
            if !self.dedup.insert(addr) {
                continue;
            }
            self.old_buffer_is_sorted = false;
            self.old_buffer_is_filtered = false;
            self.old.push(addr);
        }
        self.stats.compactions += 1;
    }

    /// Guarantees room for `needed` more entries in the aggregate buffer.
    ///
    /// Commits more memory while the reservation allows, then compacts,
    /// then exempts hot chunks with denser and denser sampling. Running out
    /// after the densest pass is fatal.
    pub fn ensure_space<H: HeapAccess>(&mut self, heap: &H, needed: usize) {
        while !self.old.has_space(needed) && self.old.can_grow() {
            if !self.old.grow() {
                fatal_out_of_memory("StoreBuffer::ensure_space");
            }
            self.stats.growths += 1;
            log::debug!(
                "store buffer grew to {} of {} entries",
                self.old.committed(),
                self.old.reserved()
            );
        }

        if self.old.has_space(needed) {
            return;
        }

        debug_assert!(self.may_move_entries);
        self.compact(heap);

        self.old_buffer_is_filtered = true;
        if any_scan_on_scavenge(heap) {
            self.filter(heap, ChunkFlags::SCAN_ON_SCAVENGE);
        }

        if self.old.has_space(needed) {
            return;
        }

        let schedule = sample_schedule(self.settings.chunk_size);
        for (stride, threshold) in schedule {
            self.exempt_popular_pages(heap, stride, threshold);
            if self.old.has_space(needed) {
                return;
            }
        }
        // the densest pass flags every chunk with an entry
        debug_assert!(self.old.is_empty());
        fatal_out_of_memory("StoreBuffer::ensure_space");
    }

    pub fn gc_prologue(&mut self) {
        self.dedup.clear();
        self.during_gc = true;
    }

    pub fn gc_epilogue<H: HeapAccess>(&mut self, heap: &H) {
        self.during_gc = false;
        if self.settings.verify_heap {
            self.verify(heap);
        }
    }
}

pub(crate) fn any_scan_on_scavenge<H: HeapAccess>(heap: &H) -> bool {
    heap.pointer_chunks().any(|chunk| chunk.scan_on_scavenge())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DedupMode,
        sim::{ObjectKind, SimHeap},
    };

    const PAGE: usize = StoreBufferSettings::ENTRIES_PER_PAGE;
    const CHUNK: usize = 64 * 1024;

    fn test_settings() -> StoreBufferSettings {
        StoreBufferSettings {
            fast_buffer_entries: PAGE,
            aggregate_buffer_entries: PAGE * 4,
            hash_set_length_log2: 8,
            chunk_size: CHUNK,
            ..Default::default()
        }
    }

    fn create_test_env() -> (SimHeap, StoreBuffer) {
        let heap = SimHeap::new(CHUNK, 4, 64 * 1024);
        let buffer = StoreBuffer::new(test_settings());
        (heap, buffer)
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = StoreBufferSettings {
            fast_buffer_entries: 3,
            ..test_settings()
        };
        assert!(matches!(
            StoreBuffer::set_up(settings),
            Err(SetupError::InvalidSettings(_))
        ));
    }

    #[test]
    fn compact_drops_duplicates() {
        let (heap, mut buffer) = create_test_env();
        let holder = heap.allocate_old(ObjectKind::Tagged, 2);
        let a = heap.field(holder, 0);
        let b = heap.field(holder, 1);

        buffer.record_slot(&heap, a);
        buffer.record_slot(&heap, b);
        buffer.record_slot(&heap, a);
        assert_eq!(buffer.pending(), 3);

        buffer.compact(&heap);
        assert_eq!(buffer.pending(), 0);
        let mut entries: Vec<SlotRef> = buffer.entries().collect();
        entries.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(entries, expected);
        assert_eq!(buffer.stats().compactions, 1);
    }

    #[test]
    fn compaction_keeps_every_recorded_slot_and_nothing_else() {
        let (heap, mut buffer) = create_test_env();
        let holder = heap.allocate_old(ObjectKind::Tagged, 300);
        let mut recorded = std::collections::HashSet::new();
        for i in 0..PAGE * 2 {
            let slot = heap.field(holder, (i * 7) % 300);
            recorded.insert(slot);
            buffer.record_slot(&heap, slot);
        }
        buffer.compact(&heap);

        let entries: std::collections::HashSet<SlotRef> =
            buffer.entries().collect();
        assert_eq!(entries, recorded, "no slot lost, none invented");
        assert!(buffer.stats().overflows >= 1);
    }

    #[test]
    fn overflow_drains_fast_buffer_before_next_record() {
        let (heap, mut buffer) = create_test_env();
        let holder = heap.allocate_old(ObjectKind::Tagged, PAGE);
        for i in 0..PAGE {
            buffer.record_slot(&heap, heap.field(holder, i));
        }
        assert_eq!(buffer.stats().overflows, 1);
        assert_eq!(buffer.pending(), 0);
        assert_eq!(buffer.len(), PAGE);
    }

    #[test]
    fn ensure_space_grows_by_doubling() {
        let (heap, mut buffer) = create_test_env();
        assert_eq!(buffer.committed_entries(), PAGE);
        buffer.ensure_space(&heap, PAGE + 1);
        assert_eq!(buffer.committed_entries(), PAGE * 2);
        buffer.ensure_space(&heap, PAGE * 3);
        assert_eq!(buffer.committed_entries(), PAGE * 4);
        assert_eq!(buffer.stats().growths, 2);
    }

    #[test]
    fn ensure_space_then_recording_never_grows_twice() {
        let (heap, mut buffer) = create_test_env();
        let holder = heap.allocate_old(ObjectKind::Tagged, PAGE * 2);
        buffer.ensure_space(&heap, PAGE * 2);
        let growths = buffer.stats().growths;

        for i in 0..PAGE * 2 {
            buffer.record_slot(&heap, heap.field(holder, i));
        }
        buffer.compact(&heap);
        assert_eq!(buffer.len(), PAGE * 2);
        assert_eq!(buffer.stats().growths, growths);
    }

    #[test]
    fn exhausted_reservation_exempts_hot_chunk() {
        let (heap, mut buffer) = create_test_env();
        let hot = heap.allocate_old(ObjectKind::Tagged, PAGE * 4);
        let cold = heap.allocate_old_in(2, ObjectKind::Tagged, 4);
        let hot_chunk = heap.chunk_of(hot);

        // fills the reservation exactly
        for i in 0..PAGE * 4 {
            buffer.record_slot(&heap, heap.field(hot, i));
        }
        assert_eq!(buffer.len(), buffer.reserved_entries());
        for i in 0..4 {
            buffer.record_slot(&heap, heap.field(cold, i));
        }
        buffer.compact(&heap);

        assert!(hot_chunk.scan_on_scavenge(), "hot chunk must be exempted");
        assert!(!heap.chunk(2).scan_on_scavenge());
        assert!(
            buffer.entries().all(|slot| !hot_chunk.contains(slot.addr())),
            "entries on exempted chunks are purged"
        );
        assert_eq!(buffer.len(), 4, "cold entries survive");
        assert!(buffer.stats().exempted_chunks >= 1);
        assert!(buffer.is_filtered());
    }

    #[test]
    fn prologue_clears_dedup_tables() {
        let (heap, mut buffer) = create_test_env();
        let holder = heap.allocate_old(ObjectKind::Tagged, 1);
        let slot = heap.field(holder, 0);
        buffer.record_slot(&heap, slot);
        buffer.compact(&heap);
        assert!(!buffer.dedup.is_empty());

        buffer.gc_prologue();
        assert!(buffer.during_gc());
        assert!(buffer.dedup.is_empty());

        buffer.record_slot(&heap, slot);
        buffer.compact(&heap);
        assert_eq!(buffer.len(), 2, "cleared tables let the slot in again");

        buffer.gc_epilogue(&heap);
        assert!(!buffer.during_gc());
    }

    #[test]
    fn exact_mode_never_keeps_duplicates() {
        let heap = SimHeap::new(CHUNK, 4, 64 * 1024);
        let mut buffer = StoreBuffer::new(StoreBufferSettings {
            dedup: DedupMode::Exact,
            ..test_settings()
        });
        let holder = heap.allocate_old(ObjectKind::Tagged, 64);
        for round in 0..4 {
            for i in 0..64 {
                buffer.record_slot(&heap, heap.field(holder, (i + round) % 64));
            }
        }
        buffer.compact(&heap);
        assert_eq!(buffer.len(), 64);
    }

    #[test]
    fn tear_down_releases_memory() {
        let (heap, mut buffer) = create_test_env();
        let holder = heap.allocate_old(ObjectKind::Tagged, 1);
        buffer.record_slot(&heap, heap.field(holder, 0));
        buffer.compact(&heap);
        buffer.tear_down();
    }
}
