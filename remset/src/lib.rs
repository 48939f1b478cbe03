//! A remembered set of old-to-young pointer slots for a generational
//! collector.
//!
//! Mutators record slots through [`StoreBuffer::record_slot`]; the scavenger
//! walks them with [`StoreBuffer::iterate_pointers_to_new_space`]. The
//! embedding heap is reached through [`HeapAccess`] and [`ChunkMetadata`].
//! [`sim`] contains a small heap implementing both.

mod aggregate;
mod chunk;
mod dedup;
mod error;
mod fast_buffer;
mod filter;
mod heap;
mod maintenance;
mod region;
mod scavenge;
mod settings;
mod slot;
mod store_buffer;
mod system;

pub mod sim;

pub use chunk::{ChunkFlags, ChunkMetadata, SpaceKind};
pub use error::{SetupError, fatal_out_of_memory};
pub use filter::sample_schedule;
pub use heap::HeapAccess;
pub use settings::{DedupMode, StoreBufferSettings};
pub use slot::{SlotRef, TargetState, WORD_SIZE};
pub use store_buffer::{
    EventCallback, StoreBuffer, StoreBufferEvent, StoreBufferStats,
};
pub use system::OS_PAGE_SIZE;
