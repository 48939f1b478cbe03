//! Duplicate suppression used while draining the fast buffer.
//!
//! The lossy filter is two small tables with different hash functions over
//! the in-chunk bits of an address. A hit in either table means the address
//! was already appended since the tables were last cleared. On a double
//! collision the older entry is evicted, so some duplicates get through;
//! a non-duplicate is never dropped.

use std::collections::HashSet;

use crate::{settings::DedupMode, slot::WORD_SIZE_LOG2};

#[derive(Debug)]
pub struct HashFilter {
    set_1: Box<[usize]>,
    set_2: Box<[usize]>,
    length_log2: u32,
    /// In-chunk mask of a word index.
    hash_mask: usize,
    empty: bool,
}

impl HashFilter {
    pub fn new(length_log2: u32, chunk_size: usize) -> Self {
        let length = 1usize << length_log2;
        Self {
            set_1: vec![0; length].into_boxed_slice(),
            set_2: vec![0; length].into_boxed_slice(),
            length_log2,
            hash_mask: (chunk_size - 1) >> WORD_SIZE_LOG2,
            empty: true,
        }
    }

    #[inline]
    fn length_mask(&self) -> usize {
        (1usize << self.length_log2) - 1
    }

    #[inline(always)]
    fn hashes(&self, word: usize) -> (usize, usize) {
        let l = self.length_log2;
        let hash_addr = word & self.hash_mask;
        let hash_1 = (hash_addr ^ (hash_addr >> l)) & self.length_mask();
        let mut hash_2 = hash_addr.wrapping_sub(hash_addr >> l);
        hash_2 ^= hash_2 >> (l * 2);
        hash_2 &= self.length_mask();
        (hash_1, hash_2)
    }

    /// Returns `true` if `addr` was not seen before and should be appended.
    #[inline(always)]
    pub fn insert(&mut self, addr: usize) -> bool {
        // shifted so the value is never zero for a valid slot
        let word = addr >> WORD_SIZE_LOG2;
        debug_assert!(word != 0);
        let (hash_1, hash_2) = self.hashes(word);
        if self.set_1[hash_1] == word || self.set_2[hash_2] == word {
            return false;
        }
        self.empty = false;
        if self.set_1[hash_1] == 0 {
            self.set_1[hash_1] = word;
        } else if self.set_2[hash_2] == 0 {
            self.set_2[hash_2] = word;
        } else {
            self.set_1[hash_1] = word;
            self.set_2[hash_2] = 0;
        }
        true
    }

    pub fn clear(&mut self) {
        if self.empty {
            return;
        }
        self.set_1.fill(0);
        self.set_2.fill(0);
        self.empty = true;
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }
}

#[derive(Debug)]
pub enum DedupFilter {
    Lossy(HashFilter),
    Exact(HashSet<usize, ahash::RandomState>),
}

impl DedupFilter {
    pub fn new(mode: DedupMode, length_log2: u32, chunk_size: usize) -> Self {
        match mode {
            DedupMode::Lossy => {
                Self::Lossy(HashFilter::new(length_log2, chunk_size))
            }
            DedupMode::Exact => Self::Exact(HashSet::default()),
        }
    }

    #[inline(always)]
    pub fn insert(&mut self, addr: usize) -> bool {
        match self {
            Self::Lossy(filter) => filter.insert(addr),
            Self::Exact(set) => set.insert(addr),
        }
    }

    /// Forgets every address. Called whenever the aggregate buffer changes
    /// other than by appending.
    #[inline]
    pub fn clear(&mut self) {
        match self {
            Self::Lossy(filter) => filter.clear(),
            Self::Exact(set) => set.clear(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Lossy(filter) => filter.is_empty(),
            Self::Exact(set) => set.is_empty(),
        }
    }
}
