//! The mutator-facing bump buffer of freshly recorded slots.
//!
//! The buffer lives at an address aligned to twice its size, so the limit is
//! the first address with the overflow bit set. Generated code may test that
//! bit after bumping `top`; [`FastBuffer::push`] compares against the limit.

use crate::{
    region::VirtualRegion,
    slot::{SlotRef, WORD_SIZE},
};

#[derive(Debug)]
pub struct FastBuffer {
    region: VirtualRegion,
    start: *mut usize,
    limit: *mut usize,
    top: *mut usize,
}

// SAFETY: the pointers all point into `region`, which is owned
unsafe impl Send for FastBuffer {}

impl FastBuffer {
    /// Reserves and commits a buffer of `entries` slots. Returns `None` if
    /// the OS refuses either step.
    pub fn new(entries: usize) -> Option<Self> {
        debug_assert!(entries.is_power_of_two());
        let size = entries * WORD_SIZE;
        let region = VirtualRegion::reserve(size * 3)?;
        let start_addr = region.start().next_multiple_of(size * 2);
        debug_assert!(start_addr + size <= region.end());

        if !region.commit(start_addr, size) {
            return None;
        }

        let start = start_addr as *mut usize;
        // SAFETY: inside the committed range, one past the end
        let limit = unsafe { start.add(entries) };
        let buffer = Self {
            region,
            start,
            limit,
            top: start,
        };
        debug_assert!(buffer.limit as usize & buffer.overflow_bit() != 0);
        debug_assert!(
            (buffer.limit as usize - WORD_SIZE) & buffer.overflow_bit() == 0
        );
        Some(buffer)
    }

    /// Address bit that becomes set exactly when `top` reaches the limit.
    #[inline]
    pub fn overflow_bit(&self) -> usize {
        self.capacity() * WORD_SIZE
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        // SAFETY: both derive from the same allocation
        unsafe { self.limit.offset_from(self.start) as usize }
    }

    #[inline]
    pub fn len(&self) -> usize {
        // SAFETY: both derive from the same allocation
        unsafe { self.top.offset_from(self.start) as usize }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top == self.start
    }

    #[inline]
    pub fn top(&self) -> *mut usize {
        self.top
    }

    #[inline]
    pub fn limit(&self) -> *mut usize {
        self.limit
    }

    /// Appends `slot`. Returns `true` when the buffer just became full and
    /// must be drained before the next push.
    #[inline(always)]
    pub fn push(&mut self, slot: SlotRef) -> bool {
        debug_assert!(self.top < self.limit, "fast buffer overflow missed");
        debug_assert!(self.region.contains(self.top as usize));
        // SAFETY: top < limit and the range is committed
        unsafe {
            self.top.write(slot.addr());
            self.top = self.top.add(1);
        }
        self.top == self.limit
    }

    /// Resets the cursor and returns the number of entries that were
    /// pending. The entries stay readable through [`Self::read`] until the
    /// next push overwrites them.
    #[inline]
    pub fn take(&mut self) -> usize {
        let pending = self.len();
        self.top = self.start;
        pending
    }

    /// # Safety
    /// `index` must be below the capacity.
    #[inline(always)]
    pub unsafe fn read(&self, index: usize) -> usize {
        debug_assert!(index < self.capacity());
        // SAFETY: committed, per contract
        unsafe { self.start.add(index).read() }
    }

    /// Pending entries.
    #[inline]
    pub fn as_slice(&self) -> &[usize] {
        // SAFETY: [start, top) is committed and initialized
        unsafe { std::slice::from_raw_parts(self.start, self.len()) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [usize] {
        // SAFETY: [start, top) is committed and initialized
        unsafe { std::slice::from_raw_parts_mut(self.start, self.len()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::StoreBufferSettings;

    fn slot(n: usize) -> SlotRef {
        SlotRef::new(n * WORD_SIZE).expect("aligned")
    }

    #[test]
    fn limit_has_overflow_bit_set() {
        let entries = StoreBufferSettings::ENTRIES_PER_PAGE;
        let buffer = FastBuffer::new(entries).expect("fast buffer");
        let bit = buffer.overflow_bit();
        assert_eq!(buffer.top() as usize & bit, 0);
        assert_ne!(buffer.limit() as usize & bit, 0);
        assert_eq!(buffer.capacity(), entries);
    }

    #[test]
    fn push_reports_full_exactly_at_capacity() {
        let entries = StoreBufferSettings::ENTRIES_PER_PAGE;
        let mut buffer = FastBuffer::new(entries).expect("fast buffer");
        for i in 1..entries {
            assert!(!buffer.push(slot(i)), "entry {i} must not overflow");
        }
        assert!(buffer.push(slot(entries)), "last entry must overflow");
        assert_eq!(buffer.len(), entries);

        assert_eq!(buffer.take(), entries);
        assert!(buffer.is_empty());
        // SAFETY: below capacity
        assert_eq!(unsafe { buffer.read(0) }, slot(1).addr());
    }
}
