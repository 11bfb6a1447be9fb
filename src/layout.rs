//! `#[repr(C)]` structures that live inside the shared byte region.
//!
//! All structs use fixed-size fields and explicit padding so the layout is
//! identical across compilations and processes mapping the same region.
//! Multi-byte integers are native-endian; a region is not portable across
//! endianness (the version minor number encodes the word size so `load`
//! can reject a foreign dump).

/// Magic bytes at the start of a dump file.
pub const DUMP_MAGIC: [u8; 4] = *b"CMAP";

/// Region format major version.
pub const VERSION_MAJOR: u8 = 1;

/// Region format minor version, derived from the word size so that a dump
/// taken on a 32-bit host is rejected on a 64-bit host and vice versa.
#[cfg(target_pointer_width = "64")]
pub const VERSION_MINOR: u8 = 3;
#[cfg(not(target_pointer_width = "64"))]
pub const VERSION_MINOR: u8 = 2;

/// Sentinel offset meaning "no block / no chunk". Offset 0 is always the
/// map head, never a chunk, so 0 is free to act as nil.
pub const NIL: u64 = 0;

/// Size of the fixed map head at offset 0 of the region.
pub const MAP_HEAD_SIZE: usize = 200;

/// Number of staged writes one journal epoch can hold.
pub const JOURNAL_SLOTS: usize = 20;

/// Eviction walks the GET chain (least-recently-got first).
pub const EVICT_BY_GET: u8 = 0;
/// Eviction walks the SET chain (least-recently-set first).
pub const EVICT_BY_SET: u8 = 1;

/// Journal status values. See [`crate::journal`] for the protocol.
pub const JOURNAL_IDLE: u8 = 0;
pub const JOURNAL_PREPARED: u8 = 1;
pub const JOURNAL_APPLIED: u8 = 2;

/// Map head, at offset 0 of the region.
///
/// Fields are ordered u64-first to avoid implicit alignment padding in
/// `#[repr(C)]`, then explicitly padded to [`MAP_HEAD_SIZE`].
#[repr(C)]
#[derive(Debug)]
pub struct MapHead {
    // 8-byte aligned group
    pub mem_size: u64,       // total region size in bytes
    pub min_chunk_size: u64, // smallest size class
    pub max_chunk_size: u64, // largest size class
    pub bucket_count: u64,   // prime number of hash buckets
    pub element_count: u64,
    pub dirty_count: u64,
    pub only_key_count: u64,
    pub set_head: u64, // most recently set block
    pub set_tail: u64,
    pub get_head: u64, // most recently got block
    pub get_tail: u64,
    pub dirty_tail: u64,    // oldest writeback candidate on the SET chain
    pub sync_tail: u64,     // writeback sweep cursor on the SET chain
    pub backup_tail: u64,   // backup sweep cursor on the GET chain
    pub writeback_age: u64, // seconds before a dirty entry must be flushed
    pub used_chunks: u64,
    pub get_count: u64,
    pub hit_count: u64,
    pub erase_batch: u64, // entries evicted per allocation-pressure sweep

    // 4-byte aligned group
    pub growth_factor: f32,
    pub bucket_ratio: f32, // chunks per hash bucket

    // 1-byte group
    pub version_major: u8,
    pub version_minor: u8,
    pub read_only: u8,
    pub auto_evict: u8,
    pub evict_policy: u8, // EVICT_BY_GET or EVICT_BY_SET
    pub _pad: [u8; 3],

    // Explicit padding to 200 bytes: 19*8 + 8 + 8 = 168, 200 - 168 = 32
    pub _reserved: [u64; 4],
}

const _: () = assert!(std::mem::size_of::<MapHead>() == MAP_HEAD_SIZE);

/// One staged word write inside the journal.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct JournalSlot {
    pub target: u64, // region-relative offset of the byte(s) to write
    pub value: u64,  // new value, low `width` bytes significant
    pub width: u8,   // 1, 4 or 8
    pub _pad: [u8; 7],
}

const _: () = assert!(std::mem::size_of::<JournalSlot>() == 24);

/// The journal block, immediately after the map head.
#[repr(C)]
#[derive(Debug)]
pub struct JournalHead {
    pub cursor: u64, // number of filled slots
    pub status: u8,  // JOURNAL_IDLE / JOURNAL_PREPARED / JOURNAL_APPLIED
    pub _pad: [u8; 7],
    pub slots: [JournalSlot; JOURNAL_SLOTS],
}

/// Size of the journal block.
pub const JOURNAL_SIZE: usize = std::mem::size_of::<JournalHead>();

const _: () = assert!(JOURNAL_SIZE == 16 + JOURNAL_SLOTS * 24);

/// One bucket of the hash index: head of a collision chain of blocks.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Bucket {
    pub head: u64, // offset of the first block, NIL if empty
    pub len: u32,  // number of blocks on the chain
    pub _pad: u32,
}

impl Bucket {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

const _: () = assert!(Bucket::SIZE == 16);

/// Allocator header, after the bucket table.
#[repr(C)]
#[derive(Debug)]
pub struct AllocHead {
    pub pool_count: u64,
    pub total_chunks: u64,
}

pub const ALLOC_HEAD_SIZE: usize = std::mem::size_of::<AllocHead>();

/// Descriptor of one size class. The chunks themselves follow the
/// descriptor table, grouped per pool in ascending size-class order.
#[repr(C)]
#[derive(Debug)]
pub struct PoolDesc {
    pub chunk_size: u64,  // bytes per chunk, including the chunk header
    pub chunk_count: u64, // chunks in this pool
    pub base: u64,        // region offset of the first chunk
    pub free_head: u64,   // first free chunk, NIL if exhausted
    pub used: u64,        // chunks currently allocated out of this pool
    pub _reserved: u64,
}

pub const POOL_DESC_SIZE: usize = std::mem::size_of::<PoolDesc>();

const _: () = assert!(POOL_DESC_SIZE == 48);

/// Header of an entry's head chunk.
///
/// A block is the first chunk of an entry. It carries the bucket linkage,
/// the SET/GET recency links, the write-behind state and the start of the
/// packed payload. Oversized payloads continue into chained chunks headed
/// by [`ChunkHead`].
#[repr(C)]
#[derive(Debug)]
pub struct BlockHead {
    pub capacity: u32, // full chunk size in bytes, including this header
    pub bucket: u32,   // hash bucket this block is chained under
    pub bucket_next: u64,
    pub bucket_prev: u64,
    pub set_next: u64, // toward the SET tail (older)
    pub set_prev: u64, // toward the SET head (newer)
    pub get_next: u64,
    pub get_prev: u64,
    pub sync_time: u64, // last writeback time, caller clock
    /// Next chunk offset when `has_next != 0`, else the number of payload
    /// bytes used in this chunk.
    pub link: u64,
    pub dirty: u8,
    pub only_key: u8,
    pub has_next: u8,
    pub _pad: [u8; 5],
    // packed payload bytes follow
}

pub const BLOCK_HEAD_SIZE: usize = std::mem::size_of::<BlockHead>();

const _: () = assert!(BLOCK_HEAD_SIZE == 80);

/// Header of a continuation chunk.
#[repr(C)]
#[derive(Debug)]
pub struct ChunkHead {
    pub capacity: u32, // full chunk size in bytes, including this header
    pub has_next: u8,
    pub _pad: [u8; 3],
    /// Next chunk offset when `has_next != 0`, else payload bytes used here.
    pub link: u64,
    // payload bytes follow
}

pub const CHUNK_HEAD_SIZE: usize = std::mem::size_of::<ChunkHead>();

const _: () = assert!(CHUNK_HEAD_SIZE == 16);

/// Offset of the journal block.
pub const fn journal_off() -> u64 {
    MAP_HEAD_SIZE as u64
}

/// Offset of the bucket table.
pub const fn buckets_off() -> u64 {
    (MAP_HEAD_SIZE + JOURNAL_SIZE) as u64
}

/// Offset of bucket `index`.
pub fn bucket_off(index: u64) -> u64 {
    buckets_off() + index * Bucket::SIZE as u64
}

/// Offset of the allocator header for a map with `bucket_count` buckets.
pub fn alloc_off(bucket_count: u64) -> u64 {
    buckets_off() + bucket_count * Bucket::SIZE as u64
}

/// Offset of pool descriptor `index`.
pub fn pool_desc_off(bucket_count: u64, index: u64) -> u64 {
    alloc_off(bucket_count) + ALLOC_HEAD_SIZE as u64 + index * POOL_DESC_SIZE as u64
}

/// Offset of the first chunk (the chunk storage area) for a map with
/// `bucket_count` buckets and `pool_count` size classes.
pub fn chunks_off(bucket_count: u64, pool_count: u64) -> u64 {
    pool_desc_off(bucket_count, pool_count)
}

/// Region-relative offset of a named field of a region struct, for staging
/// journal writes. `field_off!(BlockHead, set_next)` is the offset of
/// `set_next` within a block head; add the block's own offset to get the
/// journal target.
macro_rules! field_off {
    ($t:ty, $f:ident) => {
        std::mem::offset_of!($t, $f) as u64
    };
}

pub(crate) use field_off;

// The bucket table must start 8-aligned for the u64 heads inside it.
const _: () = assert!((MAP_HEAD_SIZE + JOURNAL_SIZE) % 8 == 0);
