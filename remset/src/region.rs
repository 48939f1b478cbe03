//! Reserved virtual-memory regions backing the store buffer.
//!
//! A [`VirtualRegion`] owns a reservation of address space. Parts of it are
//! committed on demand and the whole mapping is released on drop.

use std::ptr::NonNull;

use crate::system::{
    self, OS_PAGE_SIZE, commit_memory, reserve_memory, uncommit_memory,
};

#[derive(Debug)]
pub struct VirtualRegion {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is plain memory exclusively owned by this value
unsafe impl Send for VirtualRegion {}

impl VirtualRegion {
    /// Reserves `size` bytes, rounded up to whole OS pages.
    #[must_use]
    pub fn reserve(size: usize) -> Option<Self> {
        let size = size.next_multiple_of(OS_PAGE_SIZE);
        let base = reserve_memory(size)?;
        log::trace!("reserved {size} bytes at {:p}", base.as_ptr());
        Some(Self { base, size })
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.start() <= addr && addr < self.end()
    }

    /// Commits `[addr, addr + size)`. Both must be page aligned and inside
    /// the reservation.
    #[must_use]
    pub fn commit(&self, addr: usize, size: usize) -> bool {
        debug_assert!(self.contains(addr) && addr + size <= self.end());
        // SAFETY: inside the reservation, which never starts at null
        let ptr = unsafe { NonNull::new_unchecked(addr as *mut u8) };
        commit_memory(ptr, size)
    }

    /// Gives the pages of `[addr, addr + size)` back, keeping the range
    /// reserved.
    #[must_use]
    pub fn uncommit(&self, addr: usize, size: usize) -> bool {
        debug_assert!(self.contains(addr) && addr + size <= self.end());
        // SAFETY: inside the reservation, which never starts at null
        let ptr = unsafe { NonNull::new_unchecked(addr as *mut u8) };
        uncommit_memory(ptr, size)
    }
}

impl Drop for VirtualRegion {
    fn drop(&mut self) {
        log::trace!("releasing {} bytes at {:p}", self.size, self.base);
        system::unmap_memory(self.base, self.size());
    }
}
