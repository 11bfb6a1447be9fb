//! Fixed-slot redo log embedded in the region.
//!
//! Any mutation of the map head, the bucket table or a block header is
//! expressed as a batch of word-sized writes staged into the journal and
//! committed in one epoch:
//!
//! 1. the writer fills `slots[0..m]` without touching the target bytes,
//! 2. sets `cursor = m`, then `status = PREPARED` (release ordering),
//! 3. applies the writes in slot order,
//! 4. sets `status = APPLIED`, clears the cursor, sets `status = IDLE`.
//!
//! On attach, a `PREPARED` journal is replayed before any other access and
//! an `APPLIED` journal is advanced to `IDLE`, so a crash at any point
//! leaves the index either fully-pre-update or fully-post-update. Replay
//! is idempotent: the slots hold absolute values, not deltas.
//!
//! An operation staging more than [`JOURNAL_SLOTS`] writes is split into
//! multiple epochs; callers order their writes so the structure is
//! consistent at every epoch boundary.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::MapError;
use crate::layout::{
    field_off, journal_off, JournalHead, JournalSlot, JOURNAL_APPLIED, JOURNAL_IDLE,
    JOURNAL_PREPARED, JOURNAL_SLOTS,
};
use crate::region::{self, MemRegion};

/// A staged value; the discriminant fixes the write width.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Val {
    U8(u8),
    U32(u32),
    U64(u64),
}

impl Val {
    fn width(self) -> u8 {
        match self {
            Val::U8(_) => 1,
            Val::U32(_) => 4,
            Val::U64(_) => 8,
        }
    }

    fn raw(self) -> u64 {
        match self {
            Val::U8(v) => v as u64,
            Val::U32(v) => v as u64,
            Val::U64(v) => v,
        }
    }
}

/// Shared reference to the journal head.
///
/// # Safety
/// The region must be at least map-head + journal sized, which every
/// constructor validates.
unsafe fn head(region: &MemRegion) -> &JournalHead {
    region::at(region, journal_off())
}

#[allow(clippy::mut_from_ref)]
unsafe fn head_mut(region: &MemRegion) -> &mut JournalHead {
    region::at_mut(region, journal_off())
}

/// Atomic view of the status byte; release/acquire on it fences the slot
/// writes for a peer process re-reading the journal.
fn status(region: &MemRegion) -> &AtomicU8 {
    let off = journal_off() + field_off!(JournalHead, status);
    unsafe { &*(region.absolute(off) as *const AtomicU8) }
}

/// Zero the journal (region creation).
pub(crate) fn reset(region: &MemRegion) {
    let h = unsafe { head_mut(region) };
    h.cursor = 0;
    h._pad = [0; 7];
    h.slots = [JournalSlot {
        target: 0,
        value: 0,
        width: 0,
        _pad: [0; 7],
    }; JOURNAL_SLOTS];
    status(region).store(JOURNAL_IDLE, Ordering::Release);
}

/// True when no epoch is in flight.
pub(crate) fn is_idle(region: &MemRegion) -> bool {
    status(region).load(Ordering::Acquire) == JOURNAL_IDLE
}

/// Stage one write. If the current epoch is full it is committed first;
/// callers group related writes so a forced epoch boundary never splits a
/// single chain splice.
pub(crate) fn stage(region: &MemRegion, target: u64, val: Val) {
    debug_assert!(
        target as usize + val.width() as usize <= region.len(),
        "journal target out of region"
    );
    if unsafe { head(region) }.cursor as usize == JOURNAL_SLOTS {
        commit(region);
    }
    let h = unsafe { head_mut(region) };
    let slot = &mut h.slots[h.cursor as usize];
    slot.target = target;
    slot.value = val.raw();
    slot.width = val.width();
    h.cursor += 1;
}

/// Stage a u64 field write.
pub(crate) fn j64(region: &MemRegion, target: u64, value: u64) {
    stage(region, target, Val::U64(value));
}

/// Stage a u32 field write.
pub(crate) fn j32(region: &MemRegion, target: u64, value: u32) {
    stage(region, target, Val::U32(value));
}

/// Stage a u8 field write.
pub(crate) fn j8(region: &MemRegion, target: u64, value: u8) {
    stage(region, target, Val::U8(value));
}

/// Number of currently staged slots.
pub(crate) fn cursor(region: &MemRegion) -> usize {
    unsafe { head(region) }.cursor as usize
}

/// Publish the staged slots: anything staged so far becomes visible to
/// replay. Split out of [`commit`] so crash tests can stop here.
pub(crate) fn mark_prepared(region: &MemRegion) {
    status(region).store(JOURNAL_PREPARED, Ordering::Release);
}

/// Apply slots `[0..upto)` to their targets, in order.
pub(crate) fn apply_slots(region: &MemRegion, upto: usize) {
    let h = unsafe { head(region) };
    for slot in &h.slots[..upto] {
        let w = slot.width as usize;
        region
            .bytes_mut(slot.target, w)
            .copy_from_slice(&slot.value.to_ne_bytes()[..w]);
    }
}

/// Commit the current epoch. No-op when nothing is staged.
pub(crate) fn commit(region: &MemRegion) {
    let cursor = unsafe { head(region) }.cursor as usize;
    if cursor == 0 {
        return;
    }
    mark_prepared(region);
    apply_slots(region, cursor);
    status(region).store(JOURNAL_APPLIED, Ordering::Release);
    unsafe { head_mut(region) }.cursor = 0;
    status(region).store(JOURNAL_IDLE, Ordering::Release);
}

/// Replay an interrupted epoch on attach. Returns `true` when a replay or
/// status advance happened.
pub(crate) fn replay(region: &MemRegion) -> Result<bool, MapError> {
    match status(region).load(Ordering::Acquire) {
        JOURNAL_IDLE => Ok(false),
        JOURNAL_PREPARED => {
            let cursor = unsafe { head(region) }.cursor as usize;
            if cursor > JOURNAL_SLOTS {
                return Err(MapError::Corrupt("journal cursor out of range"));
            }
            let h = unsafe { head(region) };
            for slot in &h.slots[..cursor] {
                if !matches!(slot.width, 1 | 4 | 8) {
                    return Err(MapError::Corrupt("journal slot width"));
                }
                if slot.target as usize + slot.width as usize > region.len() {
                    return Err(MapError::Corrupt("journal slot target out of region"));
                }
            }
            log::debug!("replaying {cursor} journaled writes after interrupted epoch");
            apply_slots(region, cursor);
            status(region).store(JOURNAL_APPLIED, Ordering::Release);
            unsafe { head_mut(region) }.cursor = 0;
            status(region).store(JOURNAL_IDLE, Ordering::Release);
            Ok(true)
        }
        JOURNAL_APPLIED => {
            unsafe { head_mut(region) }.cursor = 0;
            status(region).store(JOURNAL_IDLE, Ordering::Release);
            Ok(true)
        }
        _ => Err(MapError::Corrupt("journal status byte")),
    }
}
