//! Interface to the heap the store buffer is embedded in.
//!
//! The store buffer is decoupled from any concrete heap layout. The
//! embedding heap implements [`HeapAccess`] and passes itself to every
//! slow-path entry point.

use crate::{ChunkMetadata, SlotRef};

pub trait HeapAccess {
    type Chunk: ChunkMetadata;

    /// Chunk containing `addr`, which may point into the middle of a large
    /// object. Called once per buffer entry during filtering, callers cache
    /// the last result.
    fn chunk_of(&self, addr: usize) -> &Self::Chunk;

    /// Chunks of the spaces that may hold pointers into the young
    /// generation (old pointer, map and large object space).
    fn pointer_chunks(&self) -> impl Iterator<Item = &Self::Chunk>;

    /// Whether `value` is a pointer into either semispace of the young
    /// generation.
    fn in_new_space(&self, value: usize) -> bool;

    /// Whether `value` is a pointer into the semispace being evacuated by
    /// the running scavenge.
    fn in_from_space(&self, value: usize) -> bool;

    /// A slot on a never-evacuated old chunk that never holds a young
    /// pointer. Used to overwrite entries in place.
    fn inert_slot(&self) -> SlotRef;

    /// Whether `slot` lies inside an object that survived the last major
    /// collection. `value` is what the slot held when it was loaded.
    fn is_slot_in_live_object(&self, slot: SlotRef, value: usize) -> bool;

    /// Whether the object on a large-object chunk was marked live.
    fn is_large_object_marked(&self, chunk: &Self::Chunk) -> bool;

    /// Sweeps `chunk` on the calling thread unless the concurrent sweeper
    /// already owns it.
    fn sweep_in_parallel(&self, chunk: &Self::Chunk);

    /// Blocks until concurrent sweeping has finished everywhere.
    fn ensure_sweeping_completed(&self);

    /// Calls `visitor(start, end)` for every region of tagged pointer
    /// fields of the live objects on `chunk`. Raw payloads and free space
    /// are skipped.
    fn visit_pointer_regions(
        &self,
        chunk: &Self::Chunk,
        visitor: &mut dyn FnMut(usize, usize),
    );
}
