//! Walking the store buffer during a scavenge.
//!
//! The aggregate buffer is drained from a snapshot: its length is reset to
//! zero and every slot that still points into the young generation after the
//! scavenger processed it is appended again. Afterwards every chunk flagged
//! scan-on-scavenge is scanned field by field. Entries appended during the
//! walk are only seen by the next scavenge.

use crate::{
    ChunkFlags, ChunkMetadata, HeapAccess, SlotRef, SpaceKind, StoreBuffer,
    TargetState, error::fatal_out_of_memory,
    store_buffer::{StoreBufferEvent, any_scan_on_scavenge},
    slot::WORD_SIZE,
};

impl StoreBuffer {
    /// Compacts and drops entries of chunks that will be scanned wholesale.
    /// Returns whether any chunk is flagged scan-on-scavenge.
    pub fn prepare_for_iteration<H: HeapAccess>(&mut self, heap: &H) -> bool {
        self.compact(heap);
        let some_pages_to_scan = any_scan_on_scavenge(heap);
        if some_pages_to_scan {
            self.filter(heap, ChunkFlags::SCAN_ON_SCAVENGE);
        }
        self.dedup.clear();
        some_pages_to_scan
    }

    /// Hands every remembered old-to-young slot to `callback`.
    ///
    /// `callback` is the scavenger: it evacuates the referent, rewrites the
    /// slot and reports whether the slot still points into the young
    /// generation. Such slots are remembered again.
    pub fn iterate_pointers_to_new_space<H, F>(
        &mut self,
        heap: &H,
        mut callback: F,
    ) where
        H: HeapAccess,
        F: FnMut(SlotRef) -> TargetState,
    {
        let some_pages_to_scan = self.prepare_for_iteration(heap);
        let snapshot = self.old.len();

        self.iterate_pointers_in_store_buffer(heap, &mut callback);
        let retained = self.old.len();

        if some_pages_to_scan {
            self.scan_flagged_chunks(heap, &mut callback);
        }

        self.dedup.clear();
        self.stats.scavenges += 1;
        log::debug!(
            "scavenge: {snapshot} entries drained, {retained} retained, \
             {} after chunk scans",
            self.old.len()
        );
    }

    fn iterate_pointers_in_store_buffer<H, F>(
        &mut self,
        heap: &H,
        callback: &mut F,
    ) where
        H: HeapAccess,
        F: FnMut(SlotRef) -> TargetState,
    {
        let limit = self.old.len();
        // SAFETY: shrinking, the entries stay readable through `read`
        unsafe { self.old.set_len(0) };

        self.may_move_entries = false;
        for index in 0..limit {
            // SAFETY: index < limit <= committed; the write cursor never
            // passes index, so the entry was not overwritten yet
            let addr = unsafe { self.old.read(index) };
            let saved = self.old.len();
            self.process_old_to_new_slot(heap, addr, callback);
            debug_assert!((saved..=saved + 1).contains(&self.old.len()));
        }
        self.may_move_entries = true;
    }

    #[inline]
    fn process_old_to_new_slot<H, F>(
        &mut self,
        heap: &H,
        addr: usize,
        callback: &mut F,
    ) where
        H: HeapAccess,
        F: FnMut(SlotRef) -> TargetState,
    {
        // SAFETY: buffer entries and scanned fields are aligned, non-null
        let slot = unsafe { SlotRef::new_unchecked(addr) };
        // SAFETY: slots lie in mapped heap memory, possibly in dead objects
        let value = unsafe { slot.load_relaxed() };

        // anything else is stale or a duplicate whose slot was updated already
        if !heap.in_from_space(value) {
            return;
        }
        if callback(slot) == TargetState::Young {
            self.enter_directly_into_store_buffer(heap, slot);
        }
    }

    /// Appends `slot` during iteration. Entries are never moved here; if the
    /// reservation is full the slot's chunk is rescanned next time instead.
    fn enter_directly_into_store_buffer<H: HeapAccess>(
        &mut self,
        heap: &H,
        slot: SlotRef,
    ) {
        if !self.old.has_space(1) {
            if !self.old.can_grow() {
                heap.chunk_of(slot.addr()).set_scan_on_scavenge(true);
                return;
            }
            if !self.old.grow() {
                fatal_out_of_memory(
                    "StoreBuffer::enter_directly_into_store_buffer",
                );
            }
            self.stats.growths += 1;
        }
        self.old_buffer_is_sorted = false;
        self.old_buffer_is_filtered = false;
        self.old.push(slot.addr());
    }

    fn scan_flagged_chunks<H, F>(&mut self, heap: &H, callback: &mut F)
    where
        H: HeapAccess,
        F: FnMut(SlotRef) -> TargetState,
    {
        self.emit(StoreBufferEvent::StartScanningPages);

        for chunk in heap.pointer_chunks() {
            if !chunk.scan_on_scavenge() {
                continue;
            }
            chunk.set_scan_on_scavenge(false);
            self.emit(StoreBufferEvent::ScanningPage {
                chunk: chunk.address(),
            });
            self.stats.rescanned_chunks += 1;

            match chunk.owner() {
                SpaceKind::LargeObject => {}
                SpaceKind::Map => debug_assert!(chunk.sweeping_completed()),
                owner => {
                    if !chunk.sweeping_completed() {
                        heap.sweep_in_parallel(chunk);
                        if !chunk.sweeping_completed() {
                            // the concurrent sweeper owns the chunk
                            heap.ensure_sweeping_completed();
                        }
                    }
                    assert_eq!(owner, SpaceKind::OldPointer);
                }
            }

            let first_entry = self.old.len();
            heap.visit_pointer_regions(chunk, &mut |start, end| {
                debug_assert!(start.is_multiple_of(WORD_SIZE));
                for addr in (start..end).step_by(WORD_SIZE) {
                    self.process_old_to_new_slot(heap, addr, callback);
                }
            });

            let added = self.old.len() - first_entry;
            if added > self.settings.rescan_retention_limit {
                self.old.truncate(first_entry);
                chunk.set_scan_on_scavenge(true);
                log::trace!(
                    "chunk {:#x} stays scan-on-scavenge, {added} young slots",
                    chunk.address()
                );
            }
        }

        self.emit(StoreBufferEvent::ScanningPagesDone);
    }
}
