//! One size class of the chunk allocator.
//!
//! A pool is a fixed-count array of fixed-size chunks with a stack-style
//! free list embedded in the chunks themselves: each free chunk stores the
//! offset of the next free chunk in its first word. Allocated chunks are
//! owned by block chains and their first word is part of the block or
//! chunk header.
//!
//! Pool state (descriptor and free-list words) is written directly, not
//! through the journal: a crash between an allocation and the commit of
//! the linkage that would root it can only leak chunks, and
//! [`crate::alloc::rebuild`] re-derives every free list from the live
//! chains.

use crate::layout::{PoolDesc, NIL};
use crate::region::{self, MemRegion};

/// Shared reference to the descriptor at `desc_off`.
///
/// # Safety
/// `desc_off` must point at an initialised [`PoolDesc`].
pub(crate) unsafe fn desc(region: &MemRegion, desc_off: u64) -> &PoolDesc {
    region::at(region, desc_off)
}

#[allow(clippy::mut_from_ref)]
unsafe fn desc_mut(region: &MemRegion, desc_off: u64) -> &mut PoolDesc {
    region::at_mut(region, desc_off)
}

fn read_word(region: &MemRegion, off: u64) -> u64 {
    u64::from_ne_bytes(region.bytes(off, 8).try_into().unwrap())
}

fn write_word(region: &MemRegion, off: u64, value: u64) {
    region.bytes_mut(off, 8).copy_from_slice(&value.to_ne_bytes());
}

/// Initialise a pool descriptor and thread all its chunks onto the free
/// list in address order.
pub(crate) fn init(
    region: &MemRegion,
    desc_off: u64,
    chunk_size: u64,
    chunk_count: u64,
    base: u64,
) {
    let d = unsafe { desc_mut(region, desc_off) };
    d.chunk_size = chunk_size;
    d.chunk_count = chunk_count;
    d.base = base;
    d.free_head = if chunk_count == 0 { NIL } else { base };
    d.used = 0;
    d._reserved = 0;

    for i in 0..chunk_count {
        let off = base + i * chunk_size;
        let next = if i + 1 < chunk_count {
            off + chunk_size
        } else {
            NIL
        };
        write_word(region, off, next);
    }
}

/// Remove and return one chunk, or `None` when the pool is exhausted.
pub(crate) fn pop(region: &MemRegion, desc_off: u64) -> Option<u64> {
    let head = unsafe { desc(region, desc_off) }.free_head;
    if head == NIL {
        return None;
    }
    let next = read_word(region, head);
    let d = unsafe { desc_mut(region, desc_off) };
    d.free_head = next;
    d.used += 1;
    Some(head)
}

/// Return a chunk to its pool.
pub(crate) fn push(region: &MemRegion, desc_off: u64, chunk: u64) {
    debug_assert!(contains(region, desc_off, chunk), "chunk not in pool");
    let head = unsafe { desc(region, desc_off) }.free_head;
    write_word(region, chunk, head);
    let d = unsafe { desc_mut(region, desc_off) };
    d.free_head = chunk;
    d.used -= 1;
}

/// True when `off` is a chunk boundary inside this pool.
pub(crate) fn contains(region: &MemRegion, desc_off: u64, off: u64) -> bool {
    let d = unsafe { desc(region, desc_off) };
    off >= d.base
        && off < d.base + d.chunk_count * d.chunk_size
        && (off - d.base) % d.chunk_size == 0
}

/// Re-thread the free list from scratch, skipping chunks in `live`.
/// Used by [`crate::alloc::rebuild`] after a `load`.
pub(crate) fn rebuild_free(
    region: &MemRegion,
    desc_off: u64,
    live: &std::collections::HashSet<u64>,
) {
    let (base, size, count) = {
        let d = unsafe { desc(region, desc_off) };
        (d.base, d.chunk_size, d.chunk_count)
    };

    let mut free_head = NIL;
    let mut tail: u64 = NIL;
    let mut used = 0u64;
    for i in 0..count {
        let off = base + i * size;
        if live.contains(&off) {
            used += 1;
            continue;
        }
        if free_head == NIL {
            free_head = off;
        } else {
            write_word(region, tail, off);
        }
        tail = off;
    }
    if tail != NIL {
        write_word(region, tail, NIL);
    }

    let d = unsafe { desc_mut(region, desc_off) };
    d.free_head = free_head;
    d.used = used;
}
