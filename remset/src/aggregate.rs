//! The large buffer that receives compacted entries.
//!
//! Entries live at stable addresses inside one reservation. The committed
//! prefix grows by doubling and never moves.

use crate::{
    region::VirtualRegion,
    settings::StoreBufferSettings,
    slot::WORD_SIZE,
};

#[derive(Debug)]
pub struct AggregateBuffer {
    region: VirtualRegion,
    start: *mut usize,
    /// Number of entries in use.
    len: usize,
    /// Number of committed entries.
    committed: usize,
    /// Number of entries the reservation can hold.
    reserved: usize,
}

// SAFETY: `start` points into the owned `region`
unsafe impl Send for AggregateBuffer {}

impl AggregateBuffer {
    /// Reserves room for `entries` and commits the first OS page.
    pub fn new(entries: usize) -> Option<Self> {
        let region = VirtualRegion::reserve(entries * WORD_SIZE)?;
        let initial = StoreBufferSettings::ENTRIES_PER_PAGE.min(entries);
        if !region.commit(region.start(), initial * WORD_SIZE) {
            return None;
        }
        Some(Self {
            start: region.start() as *mut usize,
            region,
            len: 0,
            committed: initial,
            reserved: entries,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn committed(&self) -> usize {
        self.committed
    }

    #[inline]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.committed - self.len
    }

    #[inline]
    pub fn has_space(&self, needed: usize) -> bool {
        self.available() >= needed
    }

    #[inline]
    pub fn can_grow(&self) -> bool {
        self.committed < self.reserved
    }

    /// Commits up to `committed` more entries, bounded by the reservation.
    /// Returns `false` if the OS refused the commit.
    pub fn grow(&mut self) -> bool {
        let grow = self.committed.min(self.reserved - self.committed);
        debug_assert!(grow > 0);
        let addr = self.region.start() + self.committed * WORD_SIZE;
        if !self.region.commit(addr, grow * WORD_SIZE) {
            return false;
        }
        self.committed += grow;
        true
    }

    /// Shrinks the committed prefix back to `entries`, which must cover
    /// every entry in use.
    pub fn uncommit_to(&mut self, entries: usize) -> bool {
        let entries = entries
            .max(self.len)
            .next_multiple_of(StoreBufferSettings::ENTRIES_PER_PAGE);
        if entries >= self.committed {
            return true;
        }
        let addr = self.region.start() + entries * WORD_SIZE;
        if !self.region.uncommit(addr, (self.committed - entries) * WORD_SIZE) {
            return false;
        }
        self.committed = entries;
        true
    }

    #[inline(always)]
    pub fn push(&mut self, addr: usize) {
        debug_assert!(self.len < self.committed, "aggregate buffer overflow");
        // SAFETY: len < committed
        unsafe { self.start.add(self.len).write(addr) };
        self.len += 1;
    }

    /// Reads entry `index`, which may lie past the logical length while an
    /// iteration drains a snapshot.
    ///
    /// # Safety
    /// `index` must be below the committed length.
    #[inline(always)]
    pub unsafe fn read(&self, index: usize) -> usize {
        debug_assert!(index < self.committed);
        // SAFETY: per contract
        unsafe { self.start.add(index).read() }
    }

    /// # Safety
    /// Entries `[len, new_len)` must have been written before.
    #[inline]
    pub unsafe fn set_len(&mut self, new_len: usize) {
        debug_assert!(new_len <= self.committed);
        self.len = new_len;
    }

    #[inline]
    pub fn truncate(&mut self, new_len: usize) {
        self.len = self.len.min(new_len);
    }

    #[inline]
    pub fn as_slice(&self) -> &[usize] {
        // SAFETY: [0, len) is committed and initialized
        unsafe { std::slice::from_raw_parts(self.start, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [usize] {
        // SAFETY: [0, len) is committed and initialized
        unsafe { std::slice::from_raw_parts_mut(self.start, self.len) }
    }

    /// Keeps the entries for which `keep` holds, preserving their order.
    pub fn retain(&mut self, mut keep: impl FnMut(usize) -> bool) {
        let mut write = 0;
        for read in 0..self.len {
            // SAFETY: read < len
            let addr = unsafe { self.read(read) };
            if keep(addr) {
                // SAFETY: write <= read < len
                unsafe { self.start.add(write).write(addr) };
                write += 1;
            }
        }
        self.len = write;
    }

    /// Removes the entries in `[from, to)`, preserving order.
    pub fn remove_range(&mut self, from: usize, to: usize) {
        debug_assert!(from <= to && to <= self.len);
        self.as_mut_slice().copy_within(to.., from);
        self.len -= to - from;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = StoreBufferSettings::ENTRIES_PER_PAGE;

    #[test]
    fn starts_with_one_page_committed() {
        let buffer = AggregateBuffer::new(PAGE * 8).expect("aggregate");
        assert_eq!(buffer.committed(), PAGE);
        assert_eq!(buffer.reserved(), PAGE * 8);
        assert!(buffer.is_empty());
    }

    #[test]
    fn grow_doubles_until_reservation() {
        let mut buffer = AggregateBuffer::new(PAGE * 6).expect("aggregate");
        assert!(buffer.grow());
        assert_eq!(buffer.committed(), PAGE * 2);
        assert!(buffer.grow());
        assert_eq!(buffer.committed(), PAGE * 4);
        assert!(buffer.grow());
        assert_eq!(buffer.committed(), PAGE * 6, "clamped to reservation");
        assert!(!buffer.can_grow());
    }

    #[test]
    fn growth_keeps_entries_in_place() {
        let mut buffer = AggregateBuffer::new(PAGE * 4).expect("aggregate");
        for i in 0..PAGE {
            buffer.push((i + 1) * WORD_SIZE);
        }
        let before = buffer.as_slice().as_ptr();
        assert!(!buffer.has_space(1));
        assert!(buffer.grow());
        buffer.push(4242 * WORD_SIZE);
        assert_eq!(buffer.as_slice().as_ptr(), before);
        assert_eq!(buffer.as_slice()[0], WORD_SIZE);
        assert_eq!(buffer.len(), PAGE + 1);
    }

    #[test]
    fn retain_and_remove_range_preserve_order() {
        let mut buffer = AggregateBuffer::new(PAGE).expect("aggregate");
        for i in 1..=10 {
            buffer.push(i * WORD_SIZE);
        }
        buffer.retain(|addr| addr / WORD_SIZE % 2 == 0);
        let expected: Vec<usize> =
            [2, 4, 6, 8, 10].iter().map(|i| i * WORD_SIZE).collect();
        assert_eq!(buffer.as_slice(), expected.as_slice());

        buffer.remove_range(1, 3);
        let expected: Vec<usize> =
            [2, 8, 10].iter().map(|i| i * WORD_SIZE).collect();
        assert_eq!(buffer.as_slice(), expected.as_slice());
    }

    #[test]
    fn uncommit_never_drops_live_entries() {
        let mut buffer = AggregateBuffer::new(PAGE * 4).expect("aggregate");
        assert!(buffer.grow());
        assert!(buffer.grow());
        for i in 0..PAGE + 1 {
            buffer.push((i + 1) * WORD_SIZE);
        }
        assert!(buffer.uncommit_to(PAGE));
        assert_eq!(buffer.committed(), PAGE * 2);
        assert_eq!(buffer.as_slice()[PAGE], (PAGE + 1) * WORD_SIZE);
    }
}
