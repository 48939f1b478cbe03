//! Chunk metadata the store buffer reads and mutates but does not own.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ChunkFlags: u8 {
        /// Scan every pointer field of the chunk at the next scavenge instead
        /// of relying on recorded slots.
        const SCAN_ON_SCAVENGE = 1 << 0;
        /// Objects on the chunk never move.
        const NEVER_EVACUATE = 1 << 1;
    }
}

/// Space a chunk belongs to.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpaceKind {
    New,
    OldPointer,
    OldData,
    Code,
    Map,
    LargeObject,
}

impl SpaceKind {
    /// Spaces whose objects may hold pointers into the young generation.
    #[inline]
    pub fn holds_pointers(self) -> bool {
        matches!(
            self,
            SpaceKind::OldPointer | SpaceKind::Map | SpaceKind::LargeObject
        )
    }
}

/// Capability interface over an externally owned chunk header.
///
/// All mutation goes through `&self`; implementations use interior
/// mutability. The store buffer only mutates chunks while the mutator is
/// paused.
pub trait ChunkMetadata {
    fn address(&self) -> usize;
    fn size(&self) -> usize;

    #[inline]
    fn contains(&self, addr: usize) -> bool {
        let start = self.address();
        start <= addr && addr < start + self.size()
    }

    fn flags(&self) -> ChunkFlags;

    fn set_scan_on_scavenge(&self, on: bool);

    #[inline]
    fn scan_on_scavenge(&self) -> bool {
        self.flags().contains(ChunkFlags::SCAN_ON_SCAVENGE)
    }

    fn store_buffer_counter(&self) -> usize;
    fn set_store_buffer_counter(&self, value: usize);

    /// Bumps the counter and returns its previous value.
    #[inline]
    fn increment_store_buffer_counter(&self) -> usize {
        let old = self.store_buffer_counter();
        self.set_store_buffer_counter(old + 1);
        old
    }

    fn owner(&self) -> SpaceKind;

    /// `false` while the concurrent sweeper still owns dead memory on the
    /// chunk.
    fn sweeping_completed(&self) -> bool;
}
