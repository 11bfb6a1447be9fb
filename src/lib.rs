//! # chunkmap — a crash-consistent shared-memory hash map
//!
//! A hash-indexed key/value store whose entire state lives inside one
//! contiguous byte region supplied by the caller, typically a
//! memory-mapped file shared between two processes. Designed for
//! cooperatively maintained caches:
//!
//! - **Bounded memory** — the region is carved once into per-size-class
//!   chunk pools and never grows.
//! - **Write-behind** — entries carry a dirty flag; [`ChunkMap::sync_step`]
//!   walks the dirty entries oldest-first and hands out the ones due for
//!   flushing to the backing store.
//! - **LRU eviction** — when chunks run out, the least-recently-got (or
//!   least-recently-set) entries are sacrificed and returned to the
//!   caller.
//! - **Crash consistency** — every index mutation is a journaled batch of
//!   word writes; a process dying mid-mutation leaves a region that
//!   [`ChunkMap::connect`] repairs by replay, never a torn index.
//!
//! The writer is single: the caller serialises mutating calls, in-process
//! through `&mut self`, across processes with an external lock. Readers
//! may attach at any time and replay the journal before first use.
//!
//! ## Example
//!
//! ```rust
//! use chunkmap::{ChunkMap, Get, MemRegion, Options};
//!
//! let region = MemRegion::heap(64 * 1024);
//! let mut map = ChunkMap::create(region, &Options::default()).unwrap();
//!
//! // Entries evicted to make room are appended to the caller's buffer,
//! // even when a set ultimately fails for lack of chunks.
//! let mut evicted = Vec::new();
//! map.set(b"hello", b"world", true, &mut evicted).unwrap();
//! assert!(evicted.is_empty());
//! assert!(matches!(map.get(b"hello").unwrap(), Get::Value { .. }));
//!
//! // Flush dirty entries older than the writeback age.
//! map.sync_start();
//! let _ = map.sync_step(1_000_000).unwrap();
//! ```

mod alloc;
mod block;
mod error;
mod hash;
mod journal;
mod layout;
mod map;
mod pool;
mod region;

pub use error::MapError;
pub use hash::{default_hash, HashFn};
pub use layout::{VERSION_MAJOR, VERSION_MINOR};
pub use map::{
    BackupStep, ChainIter, ChunkMap, DirtyState, EntryData, EraseStep, EvictPolicy, Get, Iter,
    MapInfo, Mark, Options, SyncStep,
};
pub use region::MemRegion;
