//! Block and chunk plumbing: payload packing across chunk chains and the
//! journaled linkage operations that keep the bucket, SET and GET chains
//! consistent.
//!
//! Every function that mutates a header field of a *live* structure stages
//! the write through the journal instead of touching memory; the caller
//! commits the epoch. Fields of a freshly allocated block that nothing
//! links to yet are written directly — until the linking epoch commits,
//! a crash leaves the block unreachable and the index untouched.
//!
//! Chain orientation: `set_prev`/`get_prev` point toward the head (newer
//! entries), `set_next`/`get_next` toward the tail (older entries).

use crate::error::MapError;
use crate::journal;
use crate::layout::{
    bucket_off, field_off, BlockHead, Bucket, ChunkHead, MapHead, BLOCK_HEAD_SIZE, CHUNK_HEAD_SIZE,
    NIL,
};
use crate::region::{self, MemRegion};

/// Shared reference to the block head at `addr`.
///
/// # Safety
/// `addr` must be the offset of an initialised block.
pub(crate) unsafe fn head(region: &MemRegion, addr: u64) -> &BlockHead {
    region::at(region, addr)
}

#[allow(clippy::mut_from_ref)]
pub(crate) unsafe fn head_mut(region: &MemRegion, addr: u64) -> &mut BlockHead {
    region::at_mut(region, addr)
}

unsafe fn chunk(region: &MemRegion, addr: u64) -> &ChunkHead {
    region::at(region, addr)
}

#[allow(clippy::mut_from_ref)]
unsafe fn chunk_mut(region: &MemRegion, addr: u64) -> &mut ChunkHead {
    region::at_mut(region, addr)
}

fn map_head(region: &MemRegion) -> &MapHead {
    unsafe { region::at(region, 0) }
}

/// Payload bytes a head chunk of `capacity` can hold.
pub(crate) fn block_payload_cap(capacity: u64) -> u64 {
    capacity - BLOCK_HEAD_SIZE as u64
}

/// Payload bytes a continuation chunk of `capacity` can hold.
pub(crate) fn chunk_payload_cap(capacity: u64) -> u64 {
    capacity - CHUNK_HEAD_SIZE as u64
}

// ---------------------------------------------------------------------------
// Payload packing
// ---------------------------------------------------------------------------

/// Pack a key (and value, unless the entry is key-only) with u32 length
/// prefixes, native-endian.
pub(crate) fn pack(key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len() + value.map_or(0, |v| 4 + v.len()));
    buf.extend_from_slice(&(key.len() as u32).to_ne_bytes());
    buf.extend_from_slice(key);
    if let Some(v) = value {
        buf.extend_from_slice(&(v.len() as u32).to_ne_bytes());
        buf.extend_from_slice(v);
    }
    buf
}

/// Decode a packed payload back into key and (for non-key-only entries)
/// value.
pub(crate) fn unpack(payload: &[u8], only_key: bool) -> Result<(Vec<u8>, Option<Vec<u8>>), MapError> {
    let take = |buf: &[u8], at: usize| -> Result<(usize, usize), MapError> {
        if at + 4 > buf.len() {
            return Err(MapError::Decode);
        }
        let len = u32::from_ne_bytes(buf[at..at + 4].try_into().unwrap()) as usize;
        let start = at + 4;
        if start + len > buf.len() {
            return Err(MapError::Decode);
        }
        Ok((start, len))
    };

    let (kstart, klen) = take(payload, 0)?;
    let key = payload[kstart..kstart + klen].to_vec();
    if only_key {
        if kstart + klen != payload.len() {
            return Err(MapError::Decode);
        }
        return Ok((key, None));
    }
    let (vstart, vlen) = take(payload, kstart + klen)?;
    if vstart + vlen != payload.len() {
        return Err(MapError::Decode);
    }
    Ok((key, Some(payload[vstart..vstart + vlen].to_vec())))
}

/// The continuation chunks of `addr`'s chain, in order.
pub(crate) fn cont_chunks(region: &MemRegion, addr: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let b = unsafe { head(region, addr) };
    let mut has_next = b.has_next != 0;
    let mut link = b.link;
    while has_next {
        out.push(link);
        let c = unsafe { chunk(region, link) };
        has_next = c.has_next != 0;
        link = c.link;
    }
    out
}

/// Total payload bytes the head chunk plus `conts` can hold.
pub(crate) fn chain_capacity(region: &MemRegion, addr: u64, conts: &[u64]) -> u64 {
    let mut cap = block_payload_cap(unsafe { head(region, addr) }.capacity as u64);
    for &c in conts {
        cap += chunk_payload_cap(unsafe { chunk(region, c) }.capacity as u64);
    }
    cap
}

/// Bytes of packed payload currently stored in the chain.
pub(crate) fn payload_len(region: &MemRegion, addr: u64) -> u64 {
    let b = unsafe { head(region, addr) };
    if b.has_next == 0 {
        return b.link;
    }
    let mut len = block_payload_cap(b.capacity as u64);
    let mut cur = b.link;
    loop {
        let c = unsafe { chunk(region, cur) };
        if c.has_next == 0 {
            return len + c.link;
        }
        len += chunk_payload_cap(c.capacity as u64);
        cur = c.link;
    }
}

/// Copy the whole packed payload out of the chain.
pub(crate) fn read_payload(region: &MemRegion, addr: u64) -> Vec<u8> {
    let total = payload_len(region, addr) as usize;
    let mut out = Vec::with_capacity(total);

    let b = unsafe { head(region, addr) };
    let head_cap = block_payload_cap(b.capacity as u64) as usize;
    let take = total.min(head_cap);
    out.extend_from_slice(region.bytes(addr + BLOCK_HEAD_SIZE as u64, take));

    let mut remaining = total - take;
    let mut has_next = b.has_next != 0;
    let mut link = b.link;
    while remaining > 0 && has_next {
        let c = unsafe { chunk(region, link) };
        let cap = chunk_payload_cap(c.capacity as u64) as usize;
        let take = remaining.min(cap);
        out.extend_from_slice(region.bytes(link + CHUNK_HEAD_SIZE as u64, take));
        remaining -= take;
        has_next = c.has_next != 0;
        link = c.link;
    }
    debug_assert_eq!(remaining, 0, "payload length disagrees with chain");
    out
}

/// Decode the key and value stored at `addr`.
pub(crate) fn read_kv(
    region: &MemRegion,
    addr: u64,
) -> Result<(Vec<u8>, Option<Vec<u8>>), MapError> {
    let only_key = unsafe { head(region, addr) }.only_key != 0;
    unpack(&read_payload(region, addr), only_key)
}

/// True when the entry at `addr` stores exactly `key`.
pub(crate) fn key_matches(region: &MemRegion, addr: u64, key: &[u8]) -> Result<bool, MapError> {
    let payload = read_payload(region, addr);
    if payload.len() < 4 {
        return Err(MapError::Decode);
    }
    let klen = u32::from_ne_bytes(payload[..4].try_into().unwrap()) as usize;
    if 4 + klen > payload.len() {
        return Err(MapError::Decode);
    }
    Ok(&payload[4..4 + klen] == key)
}

/// Scatter `data` across the head chunk at `addr` and the continuation
/// chunks `conts` (whose `capacity` fields must already be set).
///
/// Continuation headers are rewritten directly — a crash mid-write is
/// covered by the head's journaled `has_next`/`link`, which still describe
/// the old chain until the epoch commits. The caller must therefore pass
/// the *new* chain in `conts` rather than reading it back from the head.
pub(crate) fn write_chain_payload(region: &MemRegion, addr: u64, conts: &[u64], data: &[u8]) {
    let head_cap = block_payload_cap(unsafe { head(region, addr) }.capacity as u64) as usize;
    let take = data.len().min(head_cap);
    region
        .bytes_mut(addr + BLOCK_HEAD_SIZE as u64, take)
        .copy_from_slice(&data[..take]);
    let mut written = take;

    // Head linkage: journaled, applied at commit.
    if conts.is_empty() {
        journal::j8(region, addr + field_off!(BlockHead, has_next), 0);
        journal::j64(region, addr + field_off!(BlockHead, link), written as u64);
    } else {
        journal::j8(region, addr + field_off!(BlockHead, has_next), 1);
        journal::j64(region, addr + field_off!(BlockHead, link), conts[0]);
    }

    for (i, &c) in conts.iter().enumerate() {
        let cap = chunk_payload_cap(unsafe { chunk(region, c) }.capacity as u64) as usize;
        let take = (data.len() - written).min(cap);
        region
            .bytes_mut(c + CHUNK_HEAD_SIZE as u64, take)
            .copy_from_slice(&data[written..written + take]);
        written += take;

        let ch = unsafe { chunk_mut(region, c) };
        if i + 1 < conts.len() {
            ch.has_next = 1;
            ch.link = conts[i + 1];
        } else {
            ch.has_next = 0;
            ch.link = take as u64;
        }
    }
    debug_assert_eq!(written, data.len(), "chain too small for payload");
}

// ---------------------------------------------------------------------------
// Bucket chain linkage
// ---------------------------------------------------------------------------

/// Link a freshly created block at the head of bucket `bucket_idx`.
pub(crate) fn bucket_link_new(region: &MemRegion, addr: u64, bucket_idx: u64) {
    let boff = bucket_off(bucket_idx);
    let bucket: &Bucket = unsafe { region::at(region, boff) };
    let old_head = bucket.head;

    // The new block is unreachable until the epoch commits; its own
    // fields go in directly.
    let b = unsafe { head_mut(region, addr) };
    b.bucket = bucket_idx as u32;
    b.bucket_prev = NIL;
    b.bucket_next = old_head;

    if old_head != NIL {
        journal::j64(region, old_head + field_off!(BlockHead, bucket_prev), addr);
    }
    journal::j64(region, boff + field_off!(Bucket, head), addr);
    journal::j32(region, boff + field_off!(Bucket, len), bucket.len + 1);
}

/// Splice a block out of its bucket chain.
pub(crate) fn bucket_unlink(region: &MemRegion, addr: u64) {
    let b = unsafe { head(region, addr) };
    let boff = bucket_off(b.bucket as u64);
    let bucket: &Bucket = unsafe { region::at(region, boff) };
    let (prev, next) = (b.bucket_prev, b.bucket_next);

    if prev == NIL {
        journal::j64(region, boff + field_off!(Bucket, head), next);
    } else {
        journal::j64(region, prev + field_off!(BlockHead, bucket_next), next);
    }
    if next != NIL {
        journal::j64(region, next + field_off!(BlockHead, bucket_prev), prev);
    }
    journal::j32(region, boff + field_off!(Bucket, len), bucket.len.saturating_sub(1));
}

// ---------------------------------------------------------------------------
// SET chain linkage
// ---------------------------------------------------------------------------

/// Link a freshly created block at the SET head.
pub(crate) fn set_push_head_new(region: &MemRegion, addr: u64) {
    let h = map_head(region);
    let old_head = h.set_head;

    let b = unsafe { head_mut(region, addr) };
    b.set_prev = NIL;
    b.set_next = old_head;

    if old_head != NIL {
        journal::j64(region, old_head + field_off!(BlockHead, set_prev), addr);
    } else {
        journal::j64(region, field_off!(MapHead, set_tail), addr);
    }
    journal::j64(region, field_off!(MapHead, set_head), addr);
}

/// Splice a block out of the SET chain, moving the write-behind cursors
/// one step toward the head when they referenced it.
pub(crate) fn set_unlink(region: &MemRegion, addr: u64) {
    let h = map_head(region);
    let b = unsafe { head(region, addr) };
    let (prev, next) = (b.set_prev, b.set_next);

    if prev == NIL {
        journal::j64(region, field_off!(MapHead, set_head), next);
    } else {
        journal::j64(region, prev + field_off!(BlockHead, set_next), next);
    }
    if next == NIL {
        journal::j64(region, field_off!(MapHead, set_tail), prev);
    } else {
        journal::j64(region, next + field_off!(BlockHead, set_prev), prev);
    }

    if h.dirty_tail == addr {
        journal::j64(region, field_off!(MapHead, dirty_tail), prev);
    }
    if h.sync_tail == addr {
        journal::j64(region, field_off!(MapHead, sync_tail), prev);
    }
}

/// Move a live block to the SET head (most recently set).
pub(crate) fn set_move_to_head(region: &MemRegion, addr: u64) {
    let h = map_head(region);
    if h.set_head == addr {
        return;
    }
    let old_head = h.set_head;
    set_unlink(region, addr);
    journal::j64(region, addr + field_off!(BlockHead, set_prev), NIL);
    journal::j64(region, addr + field_off!(BlockHead, set_next), old_head);
    journal::j64(region, old_head + field_off!(BlockHead, set_prev), addr);
    journal::j64(region, field_off!(MapHead, set_head), addr);
}

// ---------------------------------------------------------------------------
// GET chain linkage
// ---------------------------------------------------------------------------

/// Link a freshly created block at the GET head.
pub(crate) fn get_push_head_new(region: &MemRegion, addr: u64) {
    let h = map_head(region);
    let old_head = h.get_head;

    let b = unsafe { head_mut(region, addr) };
    b.get_prev = NIL;
    b.get_next = old_head;

    if old_head != NIL {
        journal::j64(region, old_head + field_off!(BlockHead, get_prev), addr);
    } else {
        journal::j64(region, field_off!(MapHead, get_tail), addr);
    }
    journal::j64(region, field_off!(MapHead, get_head), addr);
}

/// Splice a block out of the GET chain, advancing the backup cursor when
/// it referenced the block.
pub(crate) fn get_unlink(region: &MemRegion, addr: u64) {
    let h = map_head(region);
    let b = unsafe { head(region, addr) };
    let (prev, next) = (b.get_prev, b.get_next);

    if prev == NIL {
        journal::j64(region, field_off!(MapHead, get_head), next);
    } else {
        journal::j64(region, prev + field_off!(BlockHead, get_next), next);
    }
    if next == NIL {
        journal::j64(region, field_off!(MapHead, get_tail), prev);
    } else {
        journal::j64(region, next + field_off!(BlockHead, get_prev), prev);
    }

    if h.backup_tail == addr {
        journal::j64(region, field_off!(MapHead, backup_tail), prev);
    }
}

/// Move a live block to the GET head (most recently got).
pub(crate) fn get_move_to_head(region: &MemRegion, addr: u64) {
    let h = map_head(region);
    if h.get_head == addr {
        return;
    }
    let old_head = h.get_head;
    get_unlink(region, addr);
    journal::j64(region, addr + field_off!(BlockHead, get_prev), NIL);
    journal::j64(region, addr + field_off!(BlockHead, get_next), old_head);
    journal::j64(region, old_head + field_off!(BlockHead, get_prev), addr);
    journal::j64(region, field_off!(MapHead, get_head), addr);
}
