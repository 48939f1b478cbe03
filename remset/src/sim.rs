//! A small simulated heap implementing [`HeapAccess`].
//!
//! Old space is a run of chunk-aligned chunks in one mapping:
//!
//! | index          | owner        | contents                          |
//! |----------------|--------------|-----------------------------------|
//! | 0              | old data     | the inert slot, never evacuated   |
//! | 1 ..= n        | old pointer  | bump allocated objects            |
//! | n + 1          | map          | bump allocated objects            |
//! | n + 2          | large object | at most one object                |
//!
//! Objects are a header word `len << 2 | kind` followed by `len` payload
//! words. New space is two semispaces; young objects are a header and one
//! payload word.

use std::{
    collections::{HashMap, HashSet},
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    ChunkFlags, ChunkMetadata, HeapAccess, SlotRef, SpaceKind, TargetState,
    error::fatal_out_of_memory,
    slot::WORD_SIZE,
    system::{map_memory, unmap_memory},
};

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    /// Every payload word is a pointer field.
    Tagged = 0,
    /// Payload words are opaque data.
    Raw = 1,
    /// Free space left behind by the sweeper.
    Filler = 2,
}

impl ObjectKind {
    #[inline]
    fn from_header(header: usize) -> Self {
        match header & 0b11 {
            0 => Self::Tagged,
            1 => Self::Raw,
            _ => Self::Filler,
        }
    }

    #[inline]
    fn header(self, len: usize) -> usize {
        len << 2 | self as usize
    }
}

#[derive(Debug)]
pub struct SimChunk {
    address: usize,
    size: usize,
    owner: SpaceKind,
    flags: AtomicU8,
    counter: AtomicUsize,
    swept: AtomicBool,
    /// Owned by the concurrent sweeper; `sweep_in_parallel` leaves it alone.
    claimed: AtomicBool,
    top: AtomicUsize,
}

impl SimChunk {
    fn new(
        address: usize,
        size: usize,
        owner: SpaceKind,
        flags: ChunkFlags,
    ) -> Self {
        Self {
            address,
            size,
            owner,
            flags: AtomicU8::new(flags.bits()),
            counter: AtomicUsize::new(0),
            swept: AtomicBool::new(true),
            claimed: AtomicBool::new(false),
            top: AtomicUsize::new(address),
        }
    }

    fn bump(&self, words: usize) -> Option<usize> {
        let bytes = words * WORD_SIZE;
        let top = self.top.load(Ordering::Relaxed);
        if top + bytes > self.address + self.size {
            return None;
        }
        self.top.store(top + bytes, Ordering::Relaxed);
        Some(top)
    }

    /// Walks the objects on the chunk as `(address, kind, len)`.
    fn objects(
        &self,
    ) -> impl Iterator<Item = (usize, ObjectKind, usize)> + '_ {
        let top = self.top.load(Ordering::Relaxed);
        let mut cursor = self.address;
        std::iter::from_fn(move || {
            if cursor >= top {
                return None;
            }
            // SAFETY: [address, top) holds initialized objects
            let header = unsafe { (cursor as *const usize).read() };
            let object = cursor;
            let len = header >> 2;
            cursor += (len + 1) * WORD_SIZE;
            Some((object, ObjectKind::from_header(header), len))
        })
    }
}

impl ChunkMetadata for SimChunk {
    fn address(&self) -> usize {
        self.address
    }

    fn size(&self) -> usize {
        self.size
    }

    fn flags(&self) -> ChunkFlags {
        ChunkFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    fn set_scan_on_scavenge(&self, on: bool) {
        let bit = ChunkFlags::SCAN_ON_SCAVENGE.bits();
        if on {
            self.flags.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    fn store_buffer_counter(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    fn set_store_buffer_counter(&self, value: usize) {
        self.counter.store(value, Ordering::Relaxed);
    }

    fn owner(&self) -> SpaceKind {
        self.owner
    }

    fn sweeping_completed(&self) -> bool {
        self.swept.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct SimState {
    /// From-space object to its copy, for the running scavenge.
    forwarding: HashMap<usize, usize, ahash::RandomState>,
    promote: HashSet<usize, ahash::RandomState>,
    dead: HashSet<usize, ahash::RandomState>,
    large_object_marked: bool,
}

#[derive(Debug)]
pub struct SimHeap {
    chunk_size: usize,
    old_mapping: NonNull<u8>,
    old_mapping_size: usize,
    chunks: Vec<SimChunk>,
    young_mapping: NonNull<u8>,
    semispace_size: usize,
    young_tops: [AtomicUsize; 2],
    /// Index of the semispace young objects are allocated in and evacuated
    /// from.
    active: AtomicUsize,
    state: Mutex<SimState>,
    forced_sweeps: AtomicUsize,
}

// SAFETY: the mappings are owned; shared state is atomic or behind the mutex
unsafe impl Send for SimHeap {}
// SAFETY: see above
unsafe impl Sync for SimHeap {}

impl SimHeap {
    /// Maps `old_chunks` old pointer chunks plus the inert, map and large
    /// object chunks, and two semispaces of `semispace_size` bytes.
    pub fn new(
        chunk_size: usize,
        old_chunks: usize,
        semispace_size: usize,
    ) -> Self {
        assert!(
            chunk_size.is_power_of_two(),
            "chunk size must be a power of two"
        );
        assert!(old_chunks > 0);
        let chunk_count = old_chunks + 3;

        // one extra chunk to align the first one
        let old_mapping_size = (chunk_count + 1) * chunk_size;
        let Some(old_mapping) = map_memory(old_mapping_size) else {
            fatal_out_of_memory("SimHeap::new");
        };
        let Some(young_mapping) = map_memory(semispace_size * 2) else {
            fatal_out_of_memory("SimHeap::new");
        };

        let base =
            (old_mapping.as_ptr() as usize).next_multiple_of(chunk_size);
        let chunks = (0..chunk_count)
            .map(|index| {
                let owner = match index {
                    0 => SpaceKind::OldData,
                    i if i <= old_chunks => SpaceKind::OldPointer,
                    i if i == old_chunks + 1 => SpaceKind::Map,
                    _ => SpaceKind::LargeObject,
                };
                let flags = if index == 0 {
                    ChunkFlags::NEVER_EVACUATE
                } else {
                    ChunkFlags::empty()
                };
                let address = base + index * chunk_size;
                SimChunk::new(address, chunk_size, owner, flags)
            })
            .collect();

        let young_start = young_mapping.as_ptr() as usize;
        log::debug!(
            "sim heap: {chunk_count} chunks at {base:#x}, \
             semispaces at {young_start:#x}"
        );

        Self {
            chunk_size,
            old_mapping,
            old_mapping_size,
            chunks,
            young_mapping,
            semispace_size,
            young_tops: [
                AtomicUsize::new(young_start),
                AtomicUsize::new(young_start + semispace_size),
            ],
            active: AtomicUsize::new(0),
            state: Mutex::new(SimState {
                large_object_marked: true,
                ..Default::default()
            }),
            forced_sweeps: AtomicUsize::new(0),
        }
    }

    pub fn chunk(&self, index: usize) -> &SimChunk {
        &self.chunks[index]
    }

    /// Number of old pointer chunks.
    pub fn old_chunks(&self) -> usize {
        self.chunks.len() - 3
    }

    fn map_chunk(&self) -> &SimChunk {
        &self.chunks[self.chunks.len() - 2]
    }

    fn large_chunk(&self) -> &SimChunk {
        &self.chunks[self.chunks.len() - 1]
    }

    fn allocate_on(
        &self,
        chunk: &SimChunk,
        kind: ObjectKind,
        len: usize,
    ) -> Option<usize> {
        let object = chunk.bump(len + 1)?;
        // SAFETY: freshly bumped, mapped and unused
        unsafe {
            let words = object as *mut usize;
            words.write(kind.header(len));
            std::ptr::write_bytes(words.add(1), 0, len);
        }
        Some(object)
    }

    /// Allocates on the first old pointer chunk with room.
    pub fn allocate_old(&self, kind: ObjectKind, len: usize) -> usize {
        self.chunks[1..=self.old_chunks()]
            .iter()
            .find_map(|chunk| self.allocate_on(chunk, kind, len))
            .expect("old space exhausted")
    }

    pub fn allocate_old_in(
        &self,
        index: usize,
        kind: ObjectKind,
        len: usize,
    ) -> usize {
        assert!(
            (1..=self.old_chunks()).contains(&index),
            "not an old pointer chunk"
        );
        self.allocate_on(&self.chunks[index], kind, len)
            .expect("old pointer chunk exhausted")
    }

    pub fn allocate_map(&self, len: usize) -> usize {
        self.allocate_on(self.map_chunk(), ObjectKind::Tagged, len)
            .expect("map chunk exhausted")
    }

    /// Allocates the single tagged object of the large object chunk.
    pub fn allocate_large(&self, len: usize) -> usize {
        let chunk = self.large_chunk();
        assert_eq!(
            chunk.top.load(Ordering::Relaxed),
            chunk.address,
            "large object chunk holds one object"
        );
        self.allocate_on(chunk, ObjectKind::Tagged, len)
            .expect("large object does not fit a chunk")
    }

    fn semispace_start(&self, index: usize) -> usize {
        self.young_mapping.as_ptr() as usize + index * self.semispace_size
    }

    fn allocate_in_semispace(&self, index: usize, payload: usize) -> usize {
        let top = self.young_tops[index].load(Ordering::Relaxed);
        let end = self.semispace_start(index) + self.semispace_size;
        assert!(top + 2 * WORD_SIZE <= end, "semispace {index} exhausted");
        self.young_tops[index].store(top + 2 * WORD_SIZE, Ordering::Relaxed);
        // SAFETY: freshly bumped inside the semispace
        unsafe {
            let words = top as *mut usize;
            words.write(ObjectKind::Raw.header(1));
            words.add(1).write(payload);
        }
        top
    }

    /// Allocates a one-word young object in from-space.
    pub fn allocate_young(&self) -> usize {
        let active = self.active.load(Ordering::Relaxed);
        let top = self.young_tops[active].load(Ordering::Relaxed);
        self.allocate_in_semispace(active, top)
    }

    /// Payload slot `index` of `object`.
    pub fn field(&self, object: usize, index: usize) -> SlotRef {
        SlotRef::new(object + (index + 1) * WORD_SIZE)
            .expect("objects are word aligned")
    }

    pub fn write(&self, slot: SlotRef, value: usize) {
        debug_assert!(self.is_heap_address(slot.addr()));
        // SAFETY: slot lies in one of the heap mappings
        unsafe { slot.store_relaxed(value) }
    }

    pub fn read(&self, slot: SlotRef) -> usize {
        debug_assert!(self.is_heap_address(slot.addr()));
        // SAFETY: slot lies in one of the heap mappings
        unsafe { slot.load_relaxed() }
    }

    fn is_heap_address(&self, addr: usize) -> bool {
        let old = self.chunks[0].address;
        let old_end = old + self.chunks.len() * self.chunk_size;
        (old..old_end).contains(&addr) || self.in_new_space(addr)
    }

    /// The next scavenge moves `object` to old space instead of to-space.
    pub fn promote_on_scavenge(&self, object: usize) {
        self.state.lock().promote.insert(object);
    }

    /// Scavenger callback: evacuates the from-space object `slot` points
    /// to, rewrites the slot and reports where the copy ended up.
    pub fn scavenge_slot(&self, slot: SlotRef) -> TargetState {
        let value = self.read(slot);
        if !self.in_from_space(value) {
            return if self.in_new_space(value) {
                TargetState::Young
            } else {
                TargetState::Old
            };
        }

        let mut state = self.state.lock();
        let target = match state.forwarding.get(&value) {
            Some(&target) => target,
            None => {
                // SAFETY: value is a from-space object, its payload follows
                let payload =
                    unsafe { (value as *const usize).add(1).read() };
                let target = if state.promote.remove(&value) {
                    let copy = self.allocate_old(ObjectKind::Raw, 1);
                    self.write(self.field(copy, 0), payload);
                    copy
                } else {
                    let to_space = 1 - self.active.load(Ordering::Relaxed);
                    self.allocate_in_semispace(to_space, payload)
                };
                state.forwarding.insert(value, target);
                target
            }
        };
        drop(state);

        self.write(slot, target);
        if self.in_new_space(target) {
            TargetState::Young
        } else {
            TargetState::Old
        }
    }

    /// Ends a scavenge: to-space becomes from-space and the old from-space
    /// is emptied. Pending promotions are dropped.
    pub fn flip(&self) {
        let evacuated = self.active.load(Ordering::Relaxed);
        self.young_tops[evacuated]
            .store(self.semispace_start(evacuated), Ordering::Relaxed);
        self.active.store(1 - evacuated, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.forwarding.clear();
        state.promote.clear();
    }

    /// Marks an old object dead, as after a major collection.
    pub fn kill(&self, object: usize) {
        self.state.lock().dead.insert(object);
    }

    pub fn mark_large_object(&self, marked: bool) {
        self.state.lock().large_object_marked = marked;
    }

    /// Leaves chunk `index` unswept, sweepable by any thread.
    pub fn start_sweeping(&self, index: usize) {
        let chunk = &self.chunks[index];
        chunk.claimed.store(false, Ordering::Relaxed);
        chunk.swept.store(false, Ordering::Release);
    }

    /// Leaves chunk `index` unswept and owned by the concurrent sweeper.
    pub fn hand_to_sweeper(&self, index: usize) {
        let chunk = &self.chunks[index];
        chunk.claimed.store(true, Ordering::Relaxed);
        chunk.swept.store(false, Ordering::Release);
    }

    /// Number of times a scan had to wait for the concurrent sweeper.
    pub fn forced_sweeps(&self) -> usize {
        self.forced_sweeps.load(Ordering::Relaxed)
    }

    /// Turns dead objects into fillers.
    fn sweep(&self, chunk: &SimChunk) {
        let state = self.state.lock();
        for (object, kind, len) in chunk.objects() {
            if kind != ObjectKind::Filler && state.dead.contains(&object) {
                // SAFETY: header of an object on the chunk
                unsafe {
                    (object as *mut usize)
                        .write(ObjectKind::Filler.header(len));
                }
            }
        }
        chunk.claimed.store(false, Ordering::Relaxed);
        chunk.swept.store(true, Ordering::Release);
        log::trace!("swept chunk {:#x}", chunk.address);
    }
}

impl Drop for SimHeap {
    fn drop(&mut self) {
        unmap_memory(self.old_mapping, self.old_mapping_size);
        unmap_memory(self.young_mapping, self.semispace_size * 2);
    }
}

impl HeapAccess for SimHeap {
    type Chunk = SimChunk;

    fn chunk_of(&self, addr: usize) -> &SimChunk {
        let index = (addr - self.chunks[0].address) / self.chunk_size;
        &self.chunks[index]
    }

    fn pointer_chunks(&self) -> impl Iterator<Item = &SimChunk> {
        self.chunks
            .iter()
            .filter(|chunk| chunk.owner.holds_pointers())
    }

    fn in_new_space(&self, value: usize) -> bool {
        let start = self.semispace_start(0);
        (start..start + self.semispace_size * 2).contains(&value)
    }

    fn in_from_space(&self, value: usize) -> bool {
        let start = self.semispace_start(self.active.load(Ordering::Relaxed));
        (start..start + self.semispace_size).contains(&value)
    }

    fn inert_slot(&self) -> SlotRef {
        // SAFETY: chunk addresses are aligned and non-null
        unsafe { SlotRef::new_unchecked(self.chunks[0].address) }
    }

    fn is_slot_in_live_object(&self, slot: SlotRef, _value: usize) -> bool {
        let addr = slot.addr();
        let chunk = self.chunk_of(addr);
        if !chunk.owner.holds_pointers() {
            return false;
        }
        let holder = chunk
            .objects()
            .find(|&(object, _, len)| {
                object < addr && addr <= object + len * WORD_SIZE
            });
        match holder {
            Some((object, ObjectKind::Tagged, _)) => {
                let state = self.state.lock();
                if chunk.owner == SpaceKind::LargeObject {
                    state.large_object_marked
                } else {
                    !state.dead.contains(&object)
                }
            }
            _ => false,
        }
    }

    fn is_large_object_marked(&self, chunk: &SimChunk) -> bool {
        chunk.owner == SpaceKind::LargeObject
            && self.state.lock().large_object_marked
    }

    fn sweep_in_parallel(&self, chunk: &SimChunk) {
        if chunk.claimed.load(Ordering::Relaxed) || chunk.sweeping_completed() {
            return;
        }
        self.sweep(chunk);
    }

    fn ensure_sweeping_completed(&self) {
        self.forced_sweeps.fetch_add(1, Ordering::Relaxed);
        for chunk in &self.chunks {
            if !chunk.sweeping_completed() {
                self.sweep(chunk);
            }
        }
    }

    fn visit_pointer_regions(
        &self,
        chunk: &SimChunk,
        visitor: &mut dyn FnMut(usize, usize),
    ) {
        for (object, kind, len) in chunk.objects() {
            if kind == ObjectKind::Tagged {
                let start = object + WORD_SIZE;
                visitor(start, start + len * WORD_SIZE);
            }
            if chunk.owner == SpaceKind::LargeObject {
                break;
            }
        }
    }
}
