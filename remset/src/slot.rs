//! Slot references: addresses of heap words that hold pointers.

use std::{
    fmt,
    mem,
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};

pub const WORD_SIZE: usize = mem::size_of::<usize>();
pub const WORD_SIZE_LOG2: u32 = WORD_SIZE.trailing_zeros();

/// Address of a word in the heap that holds (or held) a pointer into the
/// young generation.
///
/// The value stored in the slot may change at any time between recording
/// and processing, so a `SlotRef` says nothing about what it points to.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotRef(NonZeroUsize);

/// What the scavenger reports after processing a slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TargetState {
    /// The slot still points into the young generation and must stay
    /// remembered.
    Young,
    /// The referent was promoted or the slot no longer holds a young
    /// pointer.
    Old,
}

impl SlotRef {
    /// Returns `None` for null or unaligned addresses.
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if !addr.is_multiple_of(WORD_SIZE) {
            return None;
        }
        NonZeroUsize::new(addr).map(Self)
    }

    /// # Safety
    /// `addr` must be non-null and word aligned.
    #[inline(always)]
    pub unsafe fn new_unchecked(addr: usize) -> Self {
        debug_assert!(addr != 0 && addr.is_multiple_of(WORD_SIZE));
        // SAFETY: guaranteed by caller
        Self(unsafe { NonZeroUsize::new_unchecked(addr) })
    }

    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.get()
    }

    /// Reads the slot without ordering. The word may live in a dead object
    /// that the concurrent sweeper is rewriting, so the result is only a
    /// hint.
    ///
    /// # Safety
    /// The slot must be inside mapped memory.
    #[inline(always)]
    pub unsafe fn load_relaxed(self) -> usize {
        // SAFETY: aligned and mapped per contract
        unsafe {
            (*(self.addr() as *const AtomicUsize)).load(Ordering::Relaxed)
        }
    }

    /// # Safety
    /// The slot must be inside mapped, writable memory owned by the heap.
    #[inline(always)]
    pub unsafe fn store_relaxed(self, value: usize) {
        // SAFETY: aligned and mapped per contract
        unsafe {
            (*(self.addr() as *const AtomicUsize))
                .store(value, Ordering::Relaxed)
        }
    }
}

impl fmt::Debug for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotRef({:#x})", self.addr())
    }
}

impl From<SlotRef> for usize {
    fn from(slot: SlotRef) -> usize {
        slot.addr()
    }
}
