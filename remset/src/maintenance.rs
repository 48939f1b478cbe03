//! Whole-buffer passes run outside the recording and scavenge paths.

use crate::{
    ChunkMetadata, HeapAccess, SlotRef, SpaceKind, StoreBuffer,
};

impl StoreBuffer {
    /// Forgets every slot in `[start, end)`, e.g. when the object holding
    /// them is trimmed or freed.
    ///
    /// Pending entries are overwritten with the heap's inert slot, which
    /// the scavenge walk skips. Aggregate entries are removed.
    pub fn remove_slots<H: HeapAccess>(
        &mut self,
        heap: &H,
        start: usize,
        end: usize,
    ) {
        debug_assert!(self.may_move_entries);
        let in_range = |addr: usize| start <= addr && addr < end;

        let inert = heap.inert_slot();
        debug_assert!(
            heap.chunk_of(inert.addr())
                .flags()
                .contains(crate::ChunkFlags::NEVER_EVACUATE)
        );
        for entry in self.fast.as_mut_slice() {
            if in_range(*entry) {
                *entry = inert.addr();
            }
        }

        let before = self.old.len();
        if self.old_buffer_is_sorted {
            let entries = self.old.as_slice();
            let lower = entries.partition_point(|&addr| addr < start);
            let upper =
                lower + entries[lower..].partition_point(|&addr| addr < end);
            self.old.remove_range(lower, upper);
        } else {
            self.old.retain(|addr| !in_range(addr));
        }
        log::trace!(
            "removed {} slots in [{start:#x}, {end:#x})",
            before - self.old.len()
        );

        self.dedup.clear();
    }

    /// Sorts the aggregate buffer and drops duplicates and entries that no
    /// longer point into the young generation. A sorted buffer is left
    /// alone.
    pub fn sort_uniq<H: HeapAccess>(&mut self, heap: &H) {
        self.compact(heap);
        if self.old_buffer_is_sorted {
            return;
        }
        self.old.as_mut_slice().sort_unstable();
        self.uniq(heap);

        self.old_buffer_is_sorted = true;
        self.dedup.clear();
    }

    /// Drops adjacent duplicates and entries whose slot does not hold a
    /// young pointer anymore.
    pub(crate) fn uniq<H: HeapAccess>(&mut self, heap: &H) {
        let mut previous = None;
        self.old.retain(|addr| {
            let duplicate = previous == Some(addr);
            previous = Some(addr);
            if duplicate {
                return false;
            }
            // SAFETY: buffer entries are aligned, non-null heap slots
            let value = unsafe { SlotRef::new_unchecked(addr).load_relaxed() };
            heap.in_new_space(value)
        });
    }

    /// Drops entries left behind by objects that died in a major
    /// collection and unflags chunks of dead large objects.
    ///
    /// Slots are read with relaxed loads; the sweeper may be rewriting dead
    /// memory at the same time.
    pub fn clear_invalid_entries<H: HeapAccess>(&mut self, heap: &H) {
        self.compact(heap);
        let before = self.old.len();
        self.old.retain(|addr| {
            // SAFETY: buffer entries are aligned, non-null heap slots
            let slot = unsafe { SlotRef::new_unchecked(addr) };
            // SAFETY: slot is inside mapped heap memory
            let value = unsafe { slot.load_relaxed() };
            heap.in_new_space(value) && heap.is_slot_in_live_object(slot, value)
        });
        self.dedup.clear();

        for chunk in heap.pointer_chunks() {
            if chunk.owner() == SpaceKind::LargeObject
                && chunk.scan_on_scavenge()
                && !heap.is_large_object_marked(chunk)
            {
                chunk.set_scan_on_scavenge(false);
            }
        }
        log::debug!(
            "cleared invalid entries: {before} -> {}",
            self.old.len()
        );
    }

    /// Panics unless every aggregate entry points into the young
    /// generation from a live object.
    pub fn verify_valid_entries<H: HeapAccess>(&self, heap: &H) {
        for slot in self.entries() {
            // SAFETY: slot is inside mapped heap memory
            let value = unsafe { slot.load_relaxed() };
            assert!(
                heap.in_new_space(value),
                "{slot:?} holds {value:#x}, which is not in new space"
            );
            assert!(
                heap.is_slot_in_live_object(slot, value),
                "{slot:?} is not inside a live object"
            );
        }
    }

    /// Panics unless every aggregate entry lies on a chunk that can hold
    /// pointers. The inert slot is exempt.
    pub fn verify<H: HeapAccess>(&self, heap: &H) {
        let inert = heap.inert_slot();
        for slot in self.entries() {
            if slot == inert {
                continue;
            }
            let owner = heap.chunk_of(slot.addr()).owner();
            assert!(
                owner.holds_pointers(),
                "{slot:?} lies on a {owner:?} chunk"
            );
        }
    }

    /// Linear search of both buffers, newest entries first. Remembers
    /// where the last hit was found.
    pub fn cell_is_in_store_buffer(&self, addr: usize) -> bool {
        let pending = self.fast.as_slice();
        let entries = self.old.as_slice();

        if let Some(cached) = self.membership_cache.get() {
            let live = |slice: &[usize]| {
                let range = slice.as_ptr_range();
                range.start as usize <= cached && cached < range.end as usize
            };
            // SAFETY: only dereferenced after checking it lies in a live slice
            if (live(pending) || live(entries))
                && unsafe { *(cached as *const usize) } == addr
            {
                return true;
            }
        }

        for slice in [pending, entries] {
            let found = slice.iter().rev().find(|&&entry| entry == addr);
            if let Some(found) = found {
                self.membership_cache
                    .set(Some(found as *const usize as usize));
                return true;
            }
        }
        false
    }

    /// Clears the dedup tables, drops stale entries and makes room for
    /// half a fast buffer.
    pub fn clean<H: HeapAccess>(&mut self, heap: &H) {
        self.dedup.clear();
        self.uniq(heap);
        self.ensure_space(heap, self.fast.capacity() / 2);
    }
}
