use crate::system::OS_PAGE_SIZE;
use crate::slot::WORD_SIZE;

/// How compaction suppresses duplicate slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DedupMode {
    /// Two small hash tables that may let duplicates through.
    #[default]
    Lossy,
    /// Growable hash set, never lets a duplicate through.
    Exact,
}

/// Configuration for the store buffer.
#[derive(Debug, Clone)]
pub struct StoreBufferSettings {
    /// Capacity of the fast buffer in entries. Power of two, whole OS pages.
    pub fast_buffer_entries: usize,
    /// Capacity of the aggregate buffer reservation in entries. Whole OS
    /// pages, at least `fast_buffer_entries`.
    pub aggregate_buffer_entries: usize,
    /// log2 of the length of each lossy hash table.
    pub hash_set_length_log2: u32,
    /// Size of a heap chunk in bytes. Power of two; drives hashing and the
    /// sampling thresholds.
    pub chunk_size: usize,
    pub dedup: DedupMode,
    /// Entries a chunk may contribute while it is being rescanned before it
    /// stays scan-on-scavenge instead.
    pub rescan_retention_limit: usize,
    /// Check buffer entries in `gc_epilogue`.
    pub verify_heap: bool,
}

impl Default for StoreBufferSettings {
    fn default() -> Self {
        Self {
            fast_buffer_entries: 16_384,       // 128 KB
            aggregate_buffer_entries: 262_144, // 2 MB
            hash_set_length_log2: 12,
            chunk_size: 1 << 20, // 1 MB
            dedup: DedupMode::Lossy,
            rescan_retention_limit: 1024,
            verify_heap: false,
        }
    }
}

impl StoreBufferSettings {
    pub const ENTRIES_PER_PAGE: usize = OS_PAGE_SIZE / WORD_SIZE;

    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.fast_buffer_entries == 0 || self.aggregate_buffer_entries == 0
        {
            return Err("Sizes must be > 0");
        }
        if !self.fast_buffer_entries.is_power_of_two()
            || !self.fast_buffer_entries.is_multiple_of(Self::ENTRIES_PER_PAGE)
        {
            return Err(
                "fast_buffer_entries must be a power of two of whole pages",
            );
        }
        if !self
            .aggregate_buffer_entries
            .is_multiple_of(Self::ENTRIES_PER_PAGE)
        {
            return Err("aggregate_buffer_entries must fill whole pages");
        }
        if self.aggregate_buffer_entries < self.fast_buffer_entries {
            return Err("aggregate buffer must hold a full fast buffer");
        }
        if !(1..=24).contains(&self.hash_set_length_log2) {
            return Err("hash_set_length_log2 must be between 1 and 24");
        }
        if !self.chunk_size.is_power_of_two() || self.chunk_size < OS_PAGE_SIZE
        {
            return Err("chunk_size must be a power of two of at least a page");
        }
        Ok(())
    }
}
