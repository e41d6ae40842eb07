//! Memory allocator core for an in-memory cache server: a slab allocator
//! for large/medium items layered over a page arena, with a small-object
//! allocator (SMA) carved out of the slab allocator's class 0 for values
//! too small to justify a whole slab chunk.
//!
//! Ported from `arcus-memcached`'s `slabs.c` the way
//! `kernel::mem::heap::SlabAllocator` ports a size-classed allocator onto a
//! bitmap page source: same shape (arena → size classes → free lists), new
//! domain. See DESIGN.md for the grounding ledger and the layout decisions
//! the original's C structs required re-deriving for Rust.

mod arena;
mod collab;
mod config;
mod error;
mod facade;
mod pressure;
mod slab;
mod sma;
mod stats;

pub use collab::{NullNotifier, Notifier, StatValue, StatsSink};
pub use config::{InitOptions, TestHooks};
pub use error::{AllocError, AllocResult};
pub use facade::Allocator;
pub use stats::{ArenaStats, SlabClassStats};

/// Size of one SMA block, and of a slab-class-0 chunk (they are the same
/// thing — spec.md §3: "class 0 ... is the SMA's backing class").
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Slots never shrink below this, so a free slot can always hold a
/// [`sma::block::FreeSlotHeader`] plus its tail. See DESIGN.md's "Layout
/// decision".
pub const MIN_SLOT_SIZE: usize = 32;

/// All slot offsets and lengths are multiples of this.
pub const SLOT_ALIGN: usize = 8;

/// One free/used list per 8-byte-granular size step below 8 KiB, plus one
/// jumbo class for everything at or above it (spec.md §3 "SMA indices").
pub const NUM_CLASSES: usize = 1025;
pub const JUMBO_CLASS: usize = NUM_CLASSES - 1;

/// Default floor on class 0's slab count once reservation bootstraps
/// (spec.md §4.2).
pub const RESERVED_SLABS: usize = 4;

/// Percentage of `mem_limit` held back as reserved headroom.
pub const RESERVED_HEADROOM_PCT: usize = 4;

/// `shortage_level` is always in `0..=MAX_SHORTAGE_LEVEL`.
pub const MAX_SHORTAGE_LEVEL: i32 = 100;

/// Class 0 is, by construction, the SMA's backing class.
pub const SMA_CLASS_ID: usize = 0;

/// The smallest *regular* (non-SMA) slab class id `classify` ever returns.
pub const POWER_SMALLEST: usize = 1;
