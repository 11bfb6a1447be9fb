//! The public map surface.
//!
//! `ChunkMap` coordinates the hash index, the recency chains, the chunk
//! allocator and the journal over one [`MemRegion`]. It is single-writer:
//! the caller serialises mutating calls (Rust's `&mut self` enforces this
//! in-process; across processes an external lock does). Readers in other
//! processes attach with [`ChunkMap::connect`], which replays any epoch a
//! dead writer left behind.
//!
//! Expected outcomes are ordinary enum variants ([`Get::NoData`],
//! [`SyncStep::Done`], …); [`MapError`] is reserved for back-pressure and
//! corruption.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::alloc;
use crate::block;
use crate::error::MapError;
use crate::hash::{self, HashFn};
use crate::journal;
use crate::layout::{
    bucket_off, field_off, BlockHead, Bucket, MapHead, BLOCK_HEAD_SIZE, CHUNK_HEAD_SIZE,
    DUMP_MAGIC, EVICT_BY_GET, EVICT_BY_SET, JOURNAL_SIZE, MAP_HEAD_SIZE, NIL, VERSION_MAJOR,
    VERSION_MINOR,
};
use crate::region::{self, MemRegion};

/// Which recency chain eviction walks from the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictPolicy {
    /// Evict the least-recently-got entry.
    #[default]
    ByGet,
    /// Evict the least-recently-set entry.
    BySet,
}

impl EvictPolicy {
    fn as_u8(self) -> u8 {
        match self {
            EvictPolicy::ByGet => EVICT_BY_GET,
            EvictPolicy::BySet => EVICT_BY_SET,
        }
    }

    fn from_u8(v: u8) -> Self {
        if v == EVICT_BY_SET {
            EvictPolicy::BySet
        } else {
            EvictPolicy::ByGet
        }
    }
}

/// Creation-time configuration. Chunk sizes are rounded up to hold at
/// least a block header; the effective values are stored in the region.
#[derive(Debug, Clone)]
pub struct Options {
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub growth_factor: f32,
    /// Chunks per hash bucket; the bucket table is sized to the smallest
    /// prime at or above `chunk_count / bucket_ratio`.
    pub bucket_ratio: f32,
    /// Seconds before a dirty entry becomes due for writeback.
    pub writeback_age: u64,
    /// Entries evicted per sweep when an allocation runs out of chunks.
    pub erase_batch: u64,
    pub auto_evict: bool,
    pub read_only: bool,
    pub evict_policy: EvictPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            min_chunk_size: 64,
            max_chunk_size: 1024,
            growth_factor: 2.0,
            bucket_ratio: 2.0,
            writeback_age: 600,
            erase_batch: 10,
            auto_evict: true,
            read_only: false,
            evict_policy: EvictPolicy::ByGet,
        }
    }
}

/// A decoded entry, as returned by `del`, eviction and the sweeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryData {
    pub key: Vec<u8>,
    /// Empty for key-only entries.
    pub value: Vec<u8>,
    pub dirty: bool,
    pub only_key: bool,
    /// Last writeback time, on the caller's clock.
    pub sync_time: u64,
}

/// Result of a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Get {
    /// The value and the entry's last writeback time.
    Value { value: Vec<u8>, sync_time: u64 },
    NoData,
    /// The key is known but carries no value.
    OnlyKey,
}

/// One step of the eviction loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraseStep {
    /// Usage is already below the target, or nothing is left to evict.
    Done,
    /// This entry was evicted; keep calling.
    Erased(EntryData),
    /// The victim is dirty and `check_dirty` was requested; flush it
    /// before retrying.
    DirtyData(EntryData),
}

/// One step of the writeback sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStep {
    /// The sweep cursor reached the head; snapshot again later.
    Done,
    /// This entry is due: it has been marked clean and stamped, write it
    /// to the backing store (or re-dirty it with
    /// [`ChunkMap::set_dirty_after_sync`] on failure).
    NeedSync(EntryData),
    /// The entry under the cursor needs no writeback; keep calling.
    NoNeedSync,
    /// The cursor passed a key-only entry; keep calling.
    OnlyKey,
}

/// One step of the backup sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupStep {
    Done,
    /// Back up this entry; keep calling.
    NeedBackup(EntryData),
    /// The cursor passed a key-only entry; keep calling.
    OnlyKey,
}

/// Outcome of `check_dirty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    Dirty,
    Clean,
    OnlyKey,
    NoData,
}

/// Outcome of the dirty-flag mutators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Done,
    NoData,
    OnlyKey,
}

/// Header statistics snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MapInfo {
    pub mem_size: u64,
    pub element_count: u64,
    pub dirty_count: u64,
    pub only_key_count: u64,
    pub used_chunks: u64,
    pub total_chunks: u64,
    pub bucket_count: u64,
    pub get_count: u64,
    pub hit_count: u64,
    pub hit_rate: f64,
    pub min_chain: u32,
    pub max_chain: u32,
    pub avg_chain: f32,
}

/// The shared-memory hash map.
pub struct ChunkMap {
    region: MemRegion,
    hash_fn: HashFn,
    /// Test hook: stage journal writes without committing, so crash tests
    /// can drive the prepare/apply steps themselves.
    #[cfg(test)]
    pub(crate) defer_commit: bool,
}

impl ChunkMap {
    // -----------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------

    /// Initialise a fresh map over `region`, discarding its contents.
    pub fn create(region: MemRegion, opts: &Options) -> Result<Self, MapError> {
        let geo = alloc::solve(
            region.len(),
            opts.min_chunk_size,
            opts.max_chunk_size,
            opts.growth_factor,
            opts.bucket_ratio,
        )?;

        let map = Self::attach(region);
        let h = map.head_mut();
        *h = MapHead {
            mem_size: map.region.len() as u64,
            min_chunk_size: geo.classes[0],
            max_chunk_size: *geo.classes.last().unwrap(),
            bucket_count: geo.bucket_count,
            element_count: 0,
            dirty_count: 0,
            only_key_count: 0,
            set_head: NIL,
            set_tail: NIL,
            get_head: NIL,
            get_tail: NIL,
            dirty_tail: NIL,
            sync_tail: NIL,
            backup_tail: NIL,
            writeback_age: opts.writeback_age,
            used_chunks: 0,
            get_count: 0,
            hit_count: 0,
            erase_batch: opts.erase_batch.max(1),
            growth_factor: opts.growth_factor,
            bucket_ratio: opts.bucket_ratio,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            read_only: opts.read_only as u8,
            auto_evict: opts.auto_evict as u8,
            evict_policy: opts.evict_policy.as_u8(),
            _pad: [0; 3],
            _reserved: [0; 4],
        };

        journal::reset(&map.region);
        for b in 0..geo.bucket_count {
            let bucket: &mut Bucket = unsafe { region::at_mut(&map.region, bucket_off(b)) };
            *bucket = Bucket {
                head: NIL,
                len: 0,
                _pad: 0,
            };
        }
        alloc::init(&map.region, &geo);
        Ok(map)
    }

    /// Attach to a region already holding a map, replaying any epoch an
    /// interrupted writer left behind.
    pub fn connect(region: MemRegion) -> Result<Self, MapError> {
        if region.len() < MAP_HEAD_SIZE + JOURNAL_SIZE {
            return Err(MapError::RegionTooSmall {
                needed: MAP_HEAD_SIZE + JOURNAL_SIZE,
                have: region.len(),
            });
        }
        let map = Self::attach(region);
        map.validate_header()?;
        journal::replay(&map.region)?;
        Ok(map)
    }

    fn attach(region: MemRegion) -> Self {
        ChunkMap {
            region,
            hash_fn: hash::default_hash,
            #[cfg(test)]
            defer_commit: false,
        }
    }

    fn validate_header(&self) -> Result<(), MapError> {
        let h = self.head();
        if h.version_major != VERSION_MAJOR || h.version_minor != VERSION_MINOR {
            return Err(MapError::VersionMismatch {
                found_major: h.version_major,
                found_minor: h.version_minor,
                expect_major: VERSION_MAJOR,
                expect_minor: VERSION_MINOR,
            });
        }
        if h.mem_size != self.region.len() as u64 {
            return Err(MapError::Corrupt("header region size"));
        }
        let buckets_end = bucket_off(h.bucket_count);
        if h.bucket_count == 0 || buckets_end as usize > self.region.len() {
            return Err(MapError::Corrupt("bucket table out of region"));
        }
        Ok(())
    }

    /// Install a key hash. Must happen before any access and every handle
    /// attached to the same region must install the same function, or
    /// keys become unfindable. The default is stable across runs and
    /// platforms.
    pub fn set_hash_fn(&mut self, f: HashFn) {
        self.hash_fn = f;
    }

    /// Give the region back, e.g. to reattach later.
    pub fn into_region(self) -> MemRegion {
        self.region
    }

    // -----------------------------------------------------------------
    // Region accessors
    // -----------------------------------------------------------------

    fn head(&self) -> &MapHead {
        unsafe { region::at(&self.region, 0) }
    }

    /// Direct mutable header access; reserved for creation, recovery and
    /// the config knobs. Counters and chains go through the journal.
    #[allow(clippy::mut_from_ref)]
    fn head_mut(&self) -> &mut MapHead {
        unsafe { region::at_mut(&self.region, 0) }
    }

    fn bucket(&self, index: u64) -> &Bucket {
        unsafe { region::at(&self.region, bucket_off(index)) }
    }

    fn commit(&self) {
        #[cfg(test)]
        if self.defer_commit {
            return;
        }
        journal::commit(&self.region);
    }

    fn bucket_index(&self, key: &[u8]) -> u64 {
        hash::bucket_of((self.hash_fn)(key), self.head().bucket_count)
    }

    /// Walk the bucket chain for `key`.
    fn find(&self, key: &[u8]) -> Result<Option<u64>, MapError> {
        let bucket = self.bucket(self.bucket_index(key));
        let limit = alloc::total_chunks(&self.region) + 1;
        let mut addr = bucket.head;
        let mut steps = 0u64;
        while addr != NIL {
            steps += 1;
            if steps > limit {
                return Err(MapError::Corrupt("bucket chain cycle"));
            }
            if block::key_matches(&self.region, addr, key)? {
                return Ok(Some(addr));
            }
            addr = unsafe { block::head(&self.region, addr) }.bucket_next;
        }
        Ok(None)
    }

    fn entry(&self, addr: u64) -> Result<EntryData, MapError> {
        let b = unsafe { block::head(&self.region, addr) };
        let (key, value) = block::read_kv(&self.region, addr)?;
        Ok(EntryData {
            key,
            value: value.unwrap_or_default(),
            dirty: b.dirty != 0,
            only_key: b.only_key != 0,
            sync_time: b.sync_time,
        })
    }

    // -----------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------

    /// Look up `key`, refreshing the GET chain on a hit.
    pub fn get(&mut self, key: &[u8]) -> Result<Get, MapError> {
        let Some(addr) = self.find(key)? else {
            let h = self.head();
            journal::j64(&self.region, field_off!(MapHead, get_count), h.get_count + 1);
            self.commit();
            return Ok(Get::NoData);
        };

        let b = unsafe { block::head(&self.region, addr) };
        if b.only_key != 0 {
            return Ok(Get::OnlyKey);
        }
        let sync_time = b.sync_time;
        let (_, value) = block::read_kv(&self.region, addr)?;

        block::get_move_to_head(&self.region, addr);
        let h = self.head();
        journal::j64(&self.region, field_off!(MapHead, get_count), h.get_count + 1);
        journal::j64(&self.region, field_off!(MapHead, hit_count), h.hit_count + 1);
        self.commit();

        Ok(Get::Value {
            value: value.unwrap_or_default(),
            sync_time,
        })
    }

    /// State of `key`'s dirty flag without touching any chain.
    pub fn check_dirty(&self, key: &[u8]) -> Result<DirtyState, MapError> {
        let Some(addr) = self.find(key)? else {
            return Ok(DirtyState::NoData);
        };
        let b = unsafe { block::head(&self.region, addr) };
        Ok(if b.only_key != 0 {
            DirtyState::OnlyKey
        } else if b.dirty != 0 {
            DirtyState::Dirty
        } else {
            DirtyState::Clean
        })
    }

    // -----------------------------------------------------------------
    // Insert / update / delete
    // -----------------------------------------------------------------

    /// Store `key -> value`, evicting old entries when chunks run out and
    /// `auto_evict` is on. Every sacrificed entry is appended to
    /// `evicted` — including when the call ultimately fails with
    /// [`MapError::NoMemory`]: the victims are already destroyed by then,
    /// and the caller must still learn what was lost (and flush the dirty
    /// ones).
    pub fn set(
        &mut self,
        key: &[u8],
        value: &[u8],
        dirty: bool,
        evicted: &mut Vec<EntryData>,
    ) -> Result<(), MapError> {
        self.set_impl(key, Some(value), dirty, evicted)
    }

    /// Record that `key` exists with no value (negative / pending-fetch
    /// marker). Key-only entries are never dirty. Evicted entries are
    /// appended to `evicted` as for [`ChunkMap::set`].
    pub fn set_only_key(
        &mut self,
        key: &[u8],
        evicted: &mut Vec<EntryData>,
    ) -> Result<(), MapError> {
        self.set_impl(key, None, false, evicted)
    }

    fn set_impl(
        &mut self,
        key: &[u8],
        value: Option<&[u8]>,
        dirty: bool,
        evicted: &mut Vec<EntryData>,
    ) -> Result<(), MapError> {
        if self.is_read_only() {
            return Err(MapError::ReadOnly);
        }
        let data = block::pack(key, value);
        let only_key = value.is_none();
        match self.find(key)? {
            Some(addr) => self.update_existing(addr, &data, only_key, dirty, evicted),
            None => self.insert_new(key, &data, only_key, dirty, evicted),
        }
    }

    fn insert_new(
        &mut self,
        key: &[u8],
        data: &[u8],
        only_key: bool,
        dirty: bool,
        evicted: &mut Vec<EntryData>,
    ) -> Result<(), MapError> {
        let (addr, conts) = self.allocate_chain(data.len() as u64, evicted)?;

        // The block is unreachable until the linking epoch commits; its
        // own fields are written directly.
        {
            let b = unsafe { block::head_mut(&self.region, addr) };
            b.sync_time = 0;
            b.dirty = dirty as u8;
            b.only_key = only_key as u8;
            b.has_next = 0;
            b.link = 0;
            b._pad = [0; 5];
        }
        block::write_chain_payload(&self.region, addr, &conts, data);
        block::bucket_link_new(&self.region, addr, self.bucket_index(key));
        block::set_push_head_new(&self.region, addr);
        block::get_push_head_new(&self.region, addr);

        let h = self.head();
        journal::j64(
            &self.region,
            field_off!(MapHead, element_count),
            h.element_count + 1,
        );
        if only_key {
            journal::j64(
                &self.region,
                field_off!(MapHead, only_key_count),
                h.only_key_count + 1,
            );
        }
        if dirty {
            journal::j64(
                &self.region,
                field_off!(MapHead, dirty_count),
                h.dirty_count + 1,
            );
            if h.dirty_tail == NIL {
                journal::j64(&self.region, field_off!(MapHead, dirty_tail), addr);
            }
        }
        self.commit();
        Ok(())
    }

    fn update_existing(
        &mut self,
        addr: u64,
        data: &[u8],
        only_key: bool,
        dirty: bool,
        evicted: &mut Vec<EntryData>,
    ) -> Result<(), MapError> {
        // Key-only entries carry no value and are never dirty.
        let dirty = dirty && !only_key;

        let (was_dirty, was_only) = {
            let b = unsafe { block::head(&self.region, addr) };
            (b.dirty != 0, b.only_key != 0)
        };
        let mut conts = block::cont_chunks(&self.region, addr);
        let need = data.len() as u64;

        // Grow or shrink the continuation chain to fit; the head block
        // keeps its identity and all its linkage.
        let reused = conts.len();
        if block::chain_capacity(&self.region, addr, &conts) < need {
            if let Err(e) = self.grow_chain(addr, &mut conts, need, evicted) {
                for &c in &conts[reused..] {
                    alloc::free_chunk(&self.region, c);
                }
                self.head_mut().used_chunks -= (conts.len() - reused) as u64;
                return Err(e);
            }
        }
        let mut surplus = Vec::new();
        while !conts.is_empty() {
            let without = block::chain_capacity(&self.region, addr, &conts[..conts.len() - 1]);
            if without >= need {
                surplus.push(conts.pop().unwrap());
            } else {
                break;
            }
        }

        block::write_chain_payload(&self.region, addr, &conts, data);

        let h = self.head();
        if was_dirty != dirty {
            journal::j8(&self.region, addr + field_off!(BlockHead, dirty), dirty as u8);
            let new_count = if dirty {
                h.dirty_count + 1
            } else {
                h.dirty_count - 1
            };
            journal::j64(&self.region, field_off!(MapHead, dirty_count), new_count);
            if dirty && h.dirty_tail == NIL {
                journal::j64(&self.region, field_off!(MapHead, dirty_tail), addr);
            }
        }
        if was_only != only_key {
            journal::j8(
                &self.region,
                addr + field_off!(BlockHead, only_key),
                only_key as u8,
            );
            let new_count = if only_key {
                h.only_key_count + 1
            } else {
                h.only_key_count - 1
            };
            journal::j64(&self.region, field_off!(MapHead, only_key_count), new_count);
        }
        block::set_move_to_head(&self.region, addr);
        self.commit();

        for c in surplus {
            alloc::free_chunk(&self.region, c);
            self.head_mut().used_chunks -= 1;
        }
        Ok(())
    }

    /// Pop a head chunk (and continuation chunks for oversized payloads)
    /// for a new entry of `payload_len` packed bytes.
    fn allocate_chain(
        &mut self,
        payload_len: u64,
        evicted: &mut Vec<EntryData>,
    ) -> Result<(u64, Vec<u64>), MapError> {
        let largest = alloc::largest_class(&self.region);
        let max_size = alloc::class_size(&self.region, largest);
        let need = BLOCK_HEAD_SIZE as u64 + payload_len;

        let head_class = alloc::pick_class(&self.region, need).unwrap_or(largest);
        let head = self.pop_with_evict(head_class, NIL, evicted)?;
        let head_size = alloc::class_size(&self.region, head_class);
        unsafe { block::head_mut(&self.region, head) }.capacity = head_size as u32;

        let mut conts = Vec::new();
        let mut remaining = payload_len.saturating_sub(block::block_payload_cap(head_size));
        while remaining > 0 {
            let class = alloc::pick_class(&self.region, CHUNK_HEAD_SIZE as u64 + remaining)
                .unwrap_or(largest);
            let chunk = match self.pop_with_evict(class, NIL, evicted) {
                Ok(c) => c,
                Err(e) => {
                    alloc::free_chunk(&self.region, head);
                    for &c in &conts {
                        alloc::free_chunk(&self.region, c);
                    }
                    self.head_mut().used_chunks -= 1 + conts.len() as u64;
                    return Err(e);
                }
            };
            let size = alloc::class_size(&self.region, class);
            self.init_cont_chunk(chunk, size);
            conts.push(chunk);
            remaining = remaining.saturating_sub(block::chunk_payload_cap(size));
        }
        debug_assert!(max_size >= need || !conts.is_empty());
        Ok((head, conts))
    }

    /// Extend an existing chain until it holds `need` payload bytes,
    /// never evicting the block being grown.
    fn grow_chain(
        &mut self,
        addr: u64,
        conts: &mut Vec<u64>,
        need: u64,
        evicted: &mut Vec<EntryData>,
    ) -> Result<(), MapError> {
        let largest = alloc::largest_class(&self.region);
        let mut have = block::chain_capacity(&self.region, addr, conts);
        while have < need {
            let missing = need - have;
            let class = alloc::pick_class(&self.region, CHUNK_HEAD_SIZE as u64 + missing)
                .unwrap_or(largest);
            let chunk = self.pop_with_evict(class, addr, evicted)?;
            let size = alloc::class_size(&self.region, class);
            self.init_cont_chunk(chunk, size);
            conts.push(chunk);
            have += block::chunk_payload_cap(size);
        }
        Ok(())
    }

    fn init_cont_chunk(&self, chunk: u64, size: u64) {
        let c: &mut crate::layout::ChunkHead = unsafe { region::at_mut(&self.region, chunk) };
        c.capacity = size as u32;
        c.has_next = 0;
        c._pad = [0; 3];
        c.link = 0;
    }

    /// Pop from `class`, evicting per policy on exhaustion. `exclude` is
    /// the one block the eviction sweep must never sacrifice (the block
    /// whose chain is being grown).
    fn pop_with_evict(
        &mut self,
        class: u64,
        exclude: u64,
        evicted: &mut Vec<EntryData>,
    ) -> Result<u64, MapError> {
        loop {
            if let Some(chunk) = alloc::pop_class(&self.region, class) {
                self.head_mut().used_chunks += 1;
                return Ok(chunk);
            }
            if self.head().auto_evict == 0 {
                return Err(MapError::NoMemory);
            }
            if self.evict_batch(exclude, evicted)? == 0 {
                return Err(MapError::NoMemory);
            }
        }
    }

    /// Evict up to `erase_batch` entries from the policy chain tail.
    /// Returns how many were destroyed.
    fn evict_batch(
        &mut self,
        exclude: u64,
        evicted: &mut Vec<EntryData>,
    ) -> Result<usize, MapError> {
        let batch = self.head().erase_batch.max(1);
        let mut freed = 0;
        for _ in 0..batch {
            let by_get = self.evict_policy() == EvictPolicy::ByGet;
            let h = self.head();
            let mut victim = if by_get { h.get_tail } else { h.set_tail };
            if victim == exclude && victim != NIL {
                let b = unsafe { block::head(&self.region, victim) };
                victim = if by_get { b.get_prev } else { b.set_prev };
            }
            if victim == NIL {
                break;
            }
            evicted.push(self.entry(victim)?);
            self.destroy_block(victim);
            freed += 1;
        }
        Ok(freed)
    }

    /// Unlink a block from every chain, commit, then return its chunks to
    /// their pools.
    fn destroy_block(&mut self, addr: u64) {
        let conts = block::cont_chunks(&self.region, addr);
        let (was_dirty, was_only) = {
            let b = unsafe { block::head(&self.region, addr) };
            (b.dirty != 0, b.only_key != 0)
        };

        block::bucket_unlink(&self.region, addr);
        block::set_unlink(&self.region, addr);
        block::get_unlink(&self.region, addr);

        let h = self.head();
        journal::j64(
            &self.region,
            field_off!(MapHead, element_count),
            h.element_count - 1,
        );
        if was_dirty {
            journal::j64(
                &self.region,
                field_off!(MapHead, dirty_count),
                h.dirty_count - 1,
            );
        }
        if was_only {
            journal::j64(
                &self.region,
                field_off!(MapHead, only_key_count),
                h.only_key_count - 1,
            );
        }
        self.commit();

        alloc::free_chunk(&self.region, addr);
        for &c in &conts {
            alloc::free_chunk(&self.region, c);
        }
        self.head_mut().used_chunks -= 1 + conts.len() as u64;
    }

    /// Remove `key`. Returns the removed entry, or `None` when absent.
    pub fn del(&mut self, key: &[u8]) -> Result<Option<EntryData>, MapError> {
        if self.is_read_only() {
            return Err(MapError::ReadOnly);
        }
        let Some(addr) = self.find(key)? else {
            return Ok(None);
        };
        let entry = self.entry(addr)?;
        self.destroy_block(addr);
        Ok(Some(entry))
    }

    // -----------------------------------------------------------------
    // Eviction loop
    // -----------------------------------------------------------------

    /// One step of the owner's eviction loop: delete the policy-chain
    /// tail until chunk usage falls below `target_load_pct` percent.
    pub fn erase(&mut self, target_load_pct: u32, check_dirty: bool) -> Result<EraseStep, MapError> {
        if self.is_read_only() {
            return Err(MapError::ReadOnly);
        }
        let h = self.head();
        let total = alloc::total_chunks(&self.region);
        if total == 0 || h.used_chunks * 100 / total < target_load_pct as u64 {
            return Ok(EraseStep::Done);
        }
        let victim = match self.evict_policy() {
            EvictPolicy::ByGet => h.get_tail,
            EvictPolicy::BySet => h.set_tail,
        };
        if victim == NIL {
            return Ok(EraseStep::Done);
        }
        let entry = self.entry(victim)?;
        if check_dirty && entry.dirty {
            return Ok(EraseStep::DirtyData(entry));
        }
        self.destroy_block(victim);
        Ok(EraseStep::Erased(entry))
    }

    // -----------------------------------------------------------------
    // Write-behind sweep
    // -----------------------------------------------------------------

    /// Snapshot the dirty tail as the writeback sweep cursor.
    pub fn sync_start(&mut self) {
        let h = self.head();
        journal::j64(&self.region, field_off!(MapHead, sync_tail), h.dirty_tail);
        self.commit();
    }

    /// Advance the writeback sweep one entry toward the SET head.
    ///
    /// An entry is due when `sync_time + writeback_age <= now`; it is
    /// marked clean and stamped with `now` before being handed out, so a
    /// failed flush must be followed by
    /// [`ChunkMap::set_dirty_after_sync`]. Works on read-only maps.
    pub fn sync_step(&mut self, now: u64) -> Result<SyncStep, MapError> {
        let h = self.head();
        let addr = h.sync_tail;
        if addr == NIL {
            return Ok(SyncStep::Done);
        }
        let b = unsafe { block::head(&self.region, addr) };
        journal::j64(&self.region, field_off!(MapHead, sync_tail), b.set_prev);

        if b.only_key != 0 {
            self.commit();
            return Ok(SyncStep::OnlyKey);
        }
        if b.dirty != 0 && b.sync_time + h.writeback_age <= now {
            let entry = self.entry(addr)?;
            journal::j8(&self.region, addr + field_off!(BlockHead, dirty), 0);
            journal::j64(
                &self.region,
                field_off!(MapHead, dirty_count),
                h.dirty_count - 1,
            );
            journal::j64(&self.region, addr + field_off!(BlockHead, sync_time), now);
            if h.dirty_tail == addr {
                journal::j64(&self.region, field_off!(MapHead, dirty_tail), b.set_prev);
            }
            self.commit();
            return Ok(SyncStep::NeedSync(entry));
        }
        self.commit();
        Ok(SyncStep::NoNeedSync)
    }

    // -----------------------------------------------------------------
    // Backup sweep
    // -----------------------------------------------------------------

    /// Pin the backup cursor to the GET tail, starting a fresh sweep when
    /// forced or when no sweep is in progress.
    pub fn backup_start(&mut self, force_from_start: bool) {
        let h = self.head();
        if force_from_start || h.backup_tail == NIL {
            journal::j64(&self.region, field_off!(MapHead, backup_tail), h.get_tail);
            self.commit();
        }
    }

    /// Yield the next entry of the backup sweep, walking the GET chain
    /// from tail to head; each live entry is returned exactly once per
    /// sweep.
    pub fn backup_step(&mut self) -> Result<BackupStep, MapError> {
        let h = self.head();
        let addr = h.backup_tail;
        if addr == NIL {
            return Ok(BackupStep::Done);
        }
        let b = unsafe { block::head(&self.region, addr) };
        journal::j64(&self.region, field_off!(MapHead, backup_tail), b.get_prev);

        if b.only_key != 0 {
            self.commit();
            return Ok(BackupStep::OnlyKey);
        }
        let entry = self.entry(addr)?;
        self.commit();
        Ok(BackupStep::NeedBackup(entry))
    }

    // -----------------------------------------------------------------
    // Dirty-flag mutators
    // -----------------------------------------------------------------

    /// Mark `key` dirty and move it to the SET head, scheduling it for
    /// writeback.
    pub fn set_dirty(&mut self, key: &[u8]) -> Result<Mark, MapError> {
        if self.is_read_only() {
            return Err(MapError::ReadOnly);
        }
        let Some(addr) = self.find(key)? else {
            return Ok(Mark::NoData);
        };
        let b = unsafe { block::head(&self.region, addr) };
        if b.only_key != 0 {
            return Ok(Mark::OnlyKey);
        }
        let h = self.head();
        if b.dirty == 0 {
            journal::j8(&self.region, addr + field_off!(BlockHead, dirty), 1);
            journal::j64(
                &self.region,
                field_off!(MapHead, dirty_count),
                h.dirty_count + 1,
            );
            if h.dirty_tail == NIL {
                journal::j64(&self.region, field_off!(MapHead, dirty_tail), addr);
            }
        }
        block::set_move_to_head(&self.region, addr);
        self.commit();
        Ok(Mark::Done)
    }

    /// Mark `key` clean and move it to the SET head; it will not be
    /// written back.
    pub fn set_clean(&mut self, key: &[u8]) -> Result<Mark, MapError> {
        if self.is_read_only() {
            return Err(MapError::ReadOnly);
        }
        let Some(addr) = self.find(key)? else {
            return Ok(Mark::NoData);
        };
        let b = unsafe { block::head(&self.region, addr) };
        if b.only_key != 0 {
            return Ok(Mark::OnlyKey);
        }
        let h = self.head();
        if b.dirty != 0 {
            journal::j8(&self.region, addr + field_off!(BlockHead, dirty), 0);
            journal::j64(
                &self.region,
                field_off!(MapHead, dirty_count),
                h.dirty_count - 1,
            );
            // `set_move_to_head` advances the dirty cursor off this block
            // unless it is already the head, where the move is a no-op.
            if h.set_head == addr && h.dirty_tail == addr {
                journal::j64(&self.region, field_off!(MapHead, dirty_tail), b.set_prev);
            }
        }
        block::set_move_to_head(&self.region, addr);
        self.commit();
        Ok(Mark::Done)
    }

    /// Re-dirty `key` after a failed writeback, leaving it in place near
    /// the chain tail so it rejoins the back of the flush queue.
    pub fn set_dirty_after_sync(&mut self, key: &[u8]) -> Result<Mark, MapError> {
        if self.is_read_only() {
            return Err(MapError::ReadOnly);
        }
        let Some(addr) = self.find(key)? else {
            return Ok(Mark::NoData);
        };
        let b = unsafe { block::head(&self.region, addr) };
        if b.only_key != 0 {
            return Ok(Mark::OnlyKey);
        }
        let h = self.head();
        if b.dirty == 0 {
            journal::j8(&self.region, addr + field_off!(BlockHead, dirty), 1);
            journal::j64(
                &self.region,
                field_off!(MapHead, dirty_count),
                h.dirty_count + 1,
            );
        }
        if h.dirty_tail == NIL {
            journal::j64(&self.region, field_off!(MapHead, dirty_tail), addr);
        }
        self.commit();
        Ok(Mark::Done)
    }

    /// Mark every entry of one bucket dirty (key-only entries excepted).
    /// Returns how many entries were newly marked.
    pub fn set_bucket_dirty(&mut self, bucket_index: u64) -> Result<usize, MapError> {
        if self.is_read_only() {
            return Err(MapError::ReadOnly);
        }
        if bucket_index >= self.head().bucket_count {
            return Err(MapError::Config("bucket index out of range"));
        }
        let mut marked = 0;
        let mut addr = self.bucket(bucket_index).head;
        while addr != NIL {
            let b = unsafe { block::head(&self.region, addr) };
            let next = b.bucket_next;
            if b.only_key == 0 && b.dirty == 0 {
                let h = self.head();
                journal::j8(&self.region, addr + field_off!(BlockHead, dirty), 1);
                journal::j64(
                    &self.region,
                    field_off!(MapHead, dirty_count),
                    h.dirty_count + 1,
                );
                if h.dirty_tail == NIL {
                    journal::j64(&self.region, field_off!(MapHead, dirty_tail), addr);
                }
                self.commit();
                marked += 1;
            }
            addr = next;
        }
        Ok(marked)
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    /// Write the region to `path`: 4-byte magic, 4-byte version word,
    /// then the raw region bytes. The journal is committed first so the
    /// dump carries an idle journal.
    pub fn dump<P: AsRef<Path>>(&mut self, path: P) -> Result<(), MapError> {
        journal::commit(&self.region);
        let file = File::create(path).map_err(MapError::DumpFile)?;
        let mut w = BufWriter::new(file);
        w.write_all(&DUMP_MAGIC).map_err(MapError::DumpFile)?;
        w.write_u32::<NativeEndian>(version_word())
            .map_err(MapError::DumpFile)?;
        w.write_all(self.region.as_slice())
            .map_err(MapError::DumpFile)?;
        let file = w.into_inner().map_err(|e| MapError::DumpFile(e.into_error()))?;
        file.sync_all().map_err(MapError::DumpFile)?;
        Ok(())
    }

    /// Replace the region contents with a dump previously written by
    /// [`ChunkMap::dump`], then rebuild the allocator free lists.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), MapError> {
        let mut file = File::open(path).map_err(MapError::LoadFile)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).map_err(MapError::LoadFile)?;
        if magic != DUMP_MAGIC {
            return Err(MapError::Corrupt("dump file magic"));
        }
        let vword = file.read_u32::<NativeEndian>().map_err(MapError::LoadFile)?;
        if vword != version_word() {
            return Err(MapError::VersionMismatch {
                found_major: (vword & 0xff) as u8,
                found_minor: ((vword >> 8) & 0xff) as u8,
                expect_major: VERSION_MAJOR,
                expect_minor: VERSION_MINOR,
            });
        }

        let body = file
            .metadata()
            .map_err(MapError::LoadFile)?
            .len()
            .saturating_sub(8) as usize;
        if body != self.region.len() {
            return Err(MapError::SizeMismatch {
                file: body,
                region: self.region.len(),
            });
        }

        file.read_exact(self.region.bytes_mut(0, body))
            .map_err(MapError::LoadFile)?;

        self.validate_header()?;
        // A well-formed dump has an idle journal; replay defensively.
        if !journal::is_idle(&self.region) {
            log::warn!("loaded dump with a non-idle journal; replaying");
            journal::replay(&self.region)?;
        }
        alloc::rebuild(&self.region)?;
        Ok(())
    }

    /// Re-derive every allocator free list from the live chains. Part of
    /// `load`, and the recovery step after a writer died between an
    /// allocation and the commit that would have rooted it.
    pub fn rebuild(&mut self) -> Result<(), MapError> {
        alloc::rebuild(&self.region)
    }

    // -----------------------------------------------------------------
    // Repair and verification
    // -----------------------------------------------------------------

    /// Re-walk one bucket, validating block headers and the chain length.
    /// With `repair`, blocks whose own bucket index disagrees are spliced
    /// out and the stored length and element count are corrected. Returns
    /// the number of problems found.
    pub fn recover(&mut self, bucket_index: u64, repair: bool) -> Result<usize, MapError> {
        let h = self.head();
        if bucket_index >= h.bucket_count {
            return Err(MapError::Config("bucket index out of range"));
        }
        let boff = bucket_off(bucket_index);
        let limit = alloc::total_chunks(&self.region) + 1;

        let mut bad = 0usize;
        let mut len = 0u32;
        let mut steps = 0u64;
        let mut prev = NIL;
        let mut addr = self.bucket(bucket_index).head;
        while addr != NIL {
            steps += 1;
            if steps > limit {
                return Err(MapError::Corrupt("bucket chain cycle"));
            }
            if !alloc::is_chunk(&self.region, addr) {
                return Err(MapError::Corrupt("bucket chain leaves chunk area"));
            }
            let b = unsafe { block::head(&self.region, addr) };
            let next = b.bucket_next;
            if b.bucket as u64 != bucket_index {
                bad += 1;
                if repair {
                    if prev == NIL {
                        journal::j64(&self.region, boff + field_off!(Bucket, head), next);
                    } else {
                        journal::j64(
                            &self.region,
                            prev + field_off!(BlockHead, bucket_next),
                            next,
                        );
                    }
                    if next != NIL {
                        journal::j64(
                            &self.region,
                            next + field_off!(BlockHead, bucket_prev),
                            prev,
                        );
                    }
                    self.commit();
                    addr = next;
                    continue;
                }
            } else {
                len += 1;
            }
            prev = addr;
            addr = next;
        }

        let stored = self.bucket(bucket_index).len;
        if stored != len {
            if !repair {
                return Ok(bad + 1);
            }
            let h = self.head();
            let corrected = (h.element_count + len as u64).saturating_sub(stored as u64);
            journal::j32(&self.region, boff + field_off!(Bucket, len), len);
            journal::j64(&self.region, field_off!(MapHead, element_count), corrected);
            self.commit();
            bad += 1;
            log::warn!("recover: bucket {bucket_index} length {stored} corrected to {len}");
        }
        Ok(bad)
    }

    /// Verify the structural invariants: bucket chains against stored
    /// lengths and the element count, SET/GET chain well-formedness,
    /// dirty and key-only accounting, cursor liveness, journal idleness,
    /// and chunk accounting against the pool free lists.
    pub fn check_integrity(&self) -> Result<(), MapError> {
        use std::collections::HashSet;

        if !journal::is_idle(&self.region) {
            return Err(MapError::Corrupt("journal not idle"));
        }

        let h = self.head();
        let limit = alloc::total_chunks(&self.region) + 1;

        // Bucket sweep: chain lengths, bucket indices, back links.
        let mut blocks: HashSet<u64> = HashSet::new();
        let mut live_chunks = 0u64;
        let mut dirty = 0u64;
        let mut only_key = 0u64;
        for i in 0..h.bucket_count {
            let bucket = self.bucket(i);
            let mut addr = bucket.head;
            let mut prev = NIL;
            let mut count = 0u32;
            let mut steps = 0u64;
            while addr != NIL {
                steps += 1;
                if steps > limit {
                    return Err(MapError::Corrupt("bucket chain cycle"));
                }
                if !alloc::is_chunk(&self.region, addr) {
                    return Err(MapError::Corrupt("bucket chain leaves chunk area"));
                }
                let b = unsafe { block::head(&self.region, addr) };
                if b.bucket as u64 != i {
                    return Err(MapError::Corrupt("block bucket index"));
                }
                if b.bucket_prev != prev {
                    return Err(MapError::Corrupt("bucket back link"));
                }
                if !blocks.insert(addr) {
                    return Err(MapError::Corrupt("block on two bucket chains"));
                }
                if b.dirty != 0 {
                    if b.only_key != 0 {
                        return Err(MapError::Corrupt("key-only block marked dirty"));
                    }
                    dirty += 1;
                }
                if b.only_key != 0 {
                    only_key += 1;
                }
                live_chunks += 1 + block::cont_chunks(&self.region, addr).len() as u64;
                count += 1;
                prev = addr;
                addr = b.bucket_next;
            }
            if count != bucket.len {
                return Err(MapError::Corrupt("bucket chain length"));
            }
        }
        if blocks.len() as u64 != h.element_count {
            return Err(MapError::Corrupt("element count"));
        }
        if dirty != h.dirty_count {
            return Err(MapError::Corrupt("dirty count"));
        }
        if only_key != h.only_key_count {
            return Err(MapError::Corrupt("key-only count"));
        }

        // SET and GET chains must thread every block exactly once.
        for (name, head, tail, next_of, prev_of) in [
            (
                "set",
                h.set_head,
                h.set_tail,
                field_off!(BlockHead, set_next),
                field_off!(BlockHead, set_prev),
            ),
            (
                "get",
                h.get_head,
                h.get_tail,
                field_off!(BlockHead, get_next),
                field_off!(BlockHead, get_prev),
            ),
        ] {
            let mut addr = head;
            let mut prev = NIL;
            let mut count = 0u64;
            while addr != NIL {
                count += 1;
                if count > limit {
                    return Err(MapError::Corrupt("recency chain cycle"));
                }
                if !blocks.contains(&addr) {
                    return Err(MapError::Corrupt("recency chain references dead block"));
                }
                let link_prev =
                    u64::from_ne_bytes(self.region.bytes(addr + prev_of, 8).try_into().unwrap());
                if link_prev != prev {
                    return Err(MapError::Corrupt("recency back link"));
                }
                prev = addr;
                addr = u64::from_ne_bytes(self.region.bytes(addr + next_of, 8).try_into().unwrap());
            }
            if prev != tail || count != h.element_count {
                log::debug!("{name} chain holds {count} of {} entries", h.element_count);
                return Err(MapError::Corrupt("recency chain incomplete"));
            }
        }

        // Cursors must be nil or live.
        for cursor in [h.dirty_tail, h.sync_tail, h.backup_tail] {
            if cursor != NIL && !blocks.contains(&cursor) {
                return Err(MapError::Corrupt("cursor references dead block"));
            }
        }

        // Chunk accounting: live chains plus free lists cover every pool.
        if live_chunks != h.used_chunks {
            return Err(MapError::Corrupt("used chunk count"));
        }
        for i in 0..alloc::pool_count(&self.region) {
            let desc_off = alloc::desc_off(&self.region, i);
            let (count, used) = {
                let d = unsafe { crate::pool::desc(&self.region, desc_off) };
                (d.chunk_count, d.used)
            };
            let mut free = 0u64;
            let mut cur = unsafe { crate::pool::desc(&self.region, desc_off) }.free_head;
            while cur != NIL {
                free += 1;
                if free > count {
                    return Err(MapError::Corrupt("free list cycle"));
                }
                cur = u64::from_ne_bytes(self.region.bytes(cur, 8).try_into().unwrap());
            }
            if free + used != count {
                return Err(MapError::Corrupt("pool accounting"));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Reset
    // -----------------------------------------------------------------

    /// Drop every entry and restore the freshly-created state, keeping
    /// the configured geometry.
    pub fn clear(&mut self) -> Result<(), MapError> {
        if self.is_read_only() {
            return Err(MapError::ReadOnly);
        }
        journal::reset(&self.region);

        let h = self.head_mut();
        h.element_count = 0;
        h.dirty_count = 0;
        h.only_key_count = 0;
        h.set_head = NIL;
        h.set_tail = NIL;
        h.get_head = NIL;
        h.get_tail = NIL;
        h.dirty_tail = NIL;
        h.sync_tail = NIL;
        h.backup_tail = NIL;
        h.used_chunks = 0;
        h.get_count = 0;
        h.hit_count = 0;

        let bucket_count = self.head().bucket_count;
        for b in 0..bucket_count {
            let bucket: &mut Bucket = unsafe { region::at_mut(&self.region, bucket_off(b)) };
            *bucket = Bucket {
                head: NIL,
                len: 0,
                _pad: 0,
            };
        }
        for i in 0..alloc::pool_count(&self.region) {
            let desc_off = alloc::desc_off(&self.region, i);
            let (size, count, base) = {
                let d = unsafe { crate::pool::desc(&self.region, desc_off) };
                (d.chunk_size, d.chunk_count, d.base)
            };
            crate::pool::init(&self.region, desc_off, size, count, base);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Iteration
    // -----------------------------------------------------------------

    /// All entries in bucket order. Read-only; mutating calls require
    /// `&mut self` and therefore cannot overlap with an iterator.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            map: self,
            bucket: 0,
            addr: NIL,
        }
    }

    /// Entries of one bucket, in chain order.
    pub fn iter_bucket(&self, bucket_index: u64) -> ChainIter<'_> {
        let addr = if bucket_index < self.head().bucket_count {
            self.bucket(bucket_index).head
        } else {
            NIL
        };
        ChainIter {
            map: self,
            addr,
            follow: Follow::Bucket,
        }
    }

    /// Entries by SET time, newest first.
    pub fn iter_set(&self) -> ChainIter<'_> {
        ChainIter {
            map: self,
            addr: self.head().set_head,
            follow: Follow::SetNext,
        }
    }

    /// Entries by GET time, newest first.
    pub fn iter_get(&self) -> ChainIter<'_> {
        ChainIter {
            map: self,
            addr: self.head().get_head,
            follow: Follow::GetNext,
        }
    }

    /// Dirty entries from the dirty tail toward the SET head, i.e. in
    /// writeback order (oldest candidate first).
    pub fn iter_dirty(&self) -> ChainIter<'_> {
        ChainIter {
            map: self,
            addr: self.head().dirty_tail,
            follow: Follow::DirtyPrev,
        }
    }

    // -----------------------------------------------------------------
    // Counters, knobs and statistics
    // -----------------------------------------------------------------

    /// Number of entries, key-only included.
    pub fn len(&self) -> u64 {
        self.head().element_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dirty_count(&self) -> u64 {
        self.head().dirty_count
    }

    pub fn only_key_count(&self) -> u64 {
        self.head().only_key_count
    }

    pub fn bucket_count(&self) -> u64 {
        self.head().bucket_count
    }

    pub fn used_chunks(&self) -> u64 {
        self.head().used_chunks
    }

    pub fn total_chunks(&self) -> u64 {
        alloc::total_chunks(&self.region)
    }

    pub fn get_count(&self) -> u64 {
        self.head().get_count
    }

    pub fn hit_count(&self) -> u64 {
        self.head().hit_count
    }

    pub fn is_read_only(&self) -> bool {
        self.head().read_only != 0
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.head_mut().read_only = read_only as u8;
    }

    pub fn is_auto_evict(&self) -> bool {
        self.head().auto_evict != 0
    }

    pub fn set_auto_evict(&mut self, auto_evict: bool) {
        self.head_mut().auto_evict = auto_evict as u8;
    }

    pub fn evict_policy(&self) -> EvictPolicy {
        EvictPolicy::from_u8(self.head().evict_policy)
    }

    pub fn set_evict_policy(&mut self, policy: EvictPolicy) {
        self.head_mut().evict_policy = policy.as_u8();
    }

    pub fn writeback_age(&self) -> u64 {
        self.head().writeback_age
    }

    pub fn set_writeback_age(&mut self, seconds: u64) {
        self.head_mut().writeback_age = seconds;
    }

    pub fn erase_batch(&self) -> u64 {
        self.head().erase_batch
    }

    pub fn set_erase_batch(&mut self, batch: u64) {
        self.head_mut().erase_batch = batch.max(1);
    }

    /// Statistics snapshot, including bucket fill figures.
    pub fn info(&self) -> MapInfo {
        let h = self.head();
        let mut min_chain = u32::MAX;
        let mut max_chain = 0u32;
        for i in 0..h.bucket_count {
            let len = self.bucket(i).len;
            min_chain = min_chain.min(len);
            max_chain = max_chain.max(len);
        }
        MapInfo {
            mem_size: h.mem_size,
            element_count: h.element_count,
            dirty_count: h.dirty_count,
            only_key_count: h.only_key_count,
            used_chunks: h.used_chunks,
            total_chunks: alloc::total_chunks(&self.region),
            bucket_count: h.bucket_count,
            get_count: h.get_count,
            hit_count: h.hit_count,
            hit_rate: if h.get_count == 0 {
                0.0
            } else {
                h.hit_count as f64 / h.get_count as f64
            },
            min_chain: if min_chain == u32::MAX { 0 } else { min_chain },
            max_chain,
            avg_chain: h.element_count as f32 / h.bucket_count as f32,
        }
    }

    /// Human-readable statistics report.
    pub fn desc(&self) -> String {
        let i = self.info();
        let mut s = String::new();
        let _ = writeln!(s, "region bytes      : {}", i.mem_size);
        let _ = writeln!(s, "elements          : {}", i.element_count);
        let _ = writeln!(s, "dirty / key-only  : {} / {}", i.dirty_count, i.only_key_count);
        let _ = writeln!(s, "chunks used/total : {} / {}", i.used_chunks, i.total_chunks);
        let _ = writeln!(s, "buckets           : {}", i.bucket_count);
        let _ = writeln!(
            s,
            "chain min/max/avg : {} / {} / {:.2}",
            i.min_chain, i.max_chain, i.avg_chain
        );
        let _ = writeln!(
            s,
            "gets / hits       : {} / {} ({:.1}%)",
            i.get_count,
            i.hit_count,
            i.hit_rate * 100.0
        );
        s
    }
}

fn version_word() -> u32 {
    VERSION_MAJOR as u32 | (VERSION_MINOR as u32) << 8
}

enum Follow {
    Bucket,
    SetNext,
    GetNext,
    DirtyPrev,
}

/// Iterator over one chain. Yields decode results; a corrupt payload
/// surfaces as an `Err` item and ends the iteration.
pub struct ChainIter<'a> {
    map: &'a ChunkMap,
    addr: u64,
    follow: Follow,
}

impl Iterator for ChainIter<'_> {
    type Item = Result<EntryData, MapError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.addr == NIL {
                return None;
            }
            let addr = self.addr;
            let b = unsafe { block::head(&self.map.region, addr) };
            self.addr = match self.follow {
                Follow::Bucket => b.bucket_next,
                Follow::SetNext => b.set_next,
                Follow::GetNext => b.get_next,
                Follow::DirtyPrev => b.set_prev,
            };
            // The dirty walk shares the SET chain and skips clean blocks
            // the cursor happens to pass.
            if matches!(self.follow, Follow::DirtyPrev) && b.dirty == 0 {
                continue;
            }
            let item = self.map.entry(addr);
            if item.is_err() {
                self.addr = NIL;
            }
            return Some(item);
        }
    }
}

/// Iterator over every entry, bucket by bucket.
pub struct Iter<'a> {
    map: &'a ChunkMap,
    bucket: u64,
    addr: u64,
}

impl Iterator for Iter<'_> {
    type Item = Result<EntryData, MapError>;

    fn next(&mut self) -> Option<Self::Item> {
        let bucket_count = self.map.head().bucket_count;
        while self.addr == NIL {
            if self.bucket >= bucket_count {
                return None;
            }
            self.addr = self.map.bucket(self.bucket).head;
            self.bucket += 1;
        }
        let addr = self.addr;
        self.addr = unsafe { block::head(&self.map.region, addr) }.bucket_next;
        let item = self.map.entry(addr);
        if item.is_err() {
            self.addr = NIL;
            self.bucket = bucket_count;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn small_opts() -> Options {
        Options {
            min_chunk_size: 64,
            max_chunk_size: 512,
            growth_factor: 2.0,
            bucket_ratio: 2.0,
            ..Options::default()
        }
    }

    fn new_map() -> ChunkMap {
        ChunkMap::create(MemRegion::heap(64 * 1024), &small_opts()).unwrap()
    }

    fn value_of(map: &mut ChunkMap, key: &[u8]) -> Vec<u8> {
        match map.get(key).unwrap() {
            Get::Value { value, .. } => value,
            other => panic!("expected a value for {key:?}, got {other:?}"),
        }
    }

    fn snapshot(map: &ChunkMap) -> Vec<u8> {
        map.region.as_slice().to_vec()
    }

    fn region_from(bytes: &[u8]) -> MemRegion {
        let r = MemRegion::heap(bytes.len());
        r.bytes_mut(0, bytes.len()).copy_from_slice(bytes);
        r
    }

    #[test]
    fn create_empty_map_has_sane_geometry() {
        let map = new_map();
        assert_eq!(map.len(), 0);
        assert_eq!(map.used_chunks(), 0);
        assert!(map.total_chunks() > 0);
        assert!(map.bucket_count() >= map.total_chunks() / 2);
        map.check_integrity().unwrap();
    }

    #[test]
    fn set_get_round_trip() {
        let mut map = new_map();
        let mut evicted = Vec::new();
        map.set(b"hello", b"world", true, &mut evicted).unwrap();
        assert!(evicted.is_empty());

        assert_eq!(map.len(), 1);
        assert_eq!(map.dirty_count(), 1);
        assert_eq!(
            map.get(b"hello").unwrap(),
            Get::Value {
                value: b"world".to_vec(),
                sync_time: 0
            }
        );
        assert_eq!(map.check_dirty(b"hello").unwrap(), DirtyState::Dirty);
        assert_eq!(map.get(b"missing").unwrap(), Get::NoData);
        assert_eq!(map.get_count(), 2);
        assert_eq!(map.hit_count(), 1);
        map.check_integrity().unwrap();
    }

    #[test]
    fn writeback_flow() {
        let mut map = new_map();
        let age = map.writeback_age();
        map.set(b"hello", b"world", true, &mut Vec::new()).unwrap();

        assert_eq!(map.set_clean(b"hello").unwrap(), Mark::Done);
        assert_eq!(map.dirty_count(), 0);
        map.sync_start();
        assert_eq!(map.sync_step(1000).unwrap(), SyncStep::Done);

        assert_eq!(map.set_dirty(b"hello").unwrap(), Mark::Done);
        assert_eq!(map.dirty_count(), 1);
        map.sync_start();
        // Not old enough yet.
        assert_eq!(map.sync_step(age - 1).unwrap(), SyncStep::NoNeedSync);

        map.sync_start();
        match map.sync_step(1000 + age).unwrap() {
            SyncStep::NeedSync(entry) => {
                assert_eq!(entry.key, b"hello");
                assert_eq!(entry.value, b"world");
                assert!(entry.dirty);
            }
            other => panic!("expected NeedSync, got {other:?}"),
        }
        assert_eq!(map.check_dirty(b"hello").unwrap(), DirtyState::Clean);
        assert_eq!(map.dirty_count(), 0);
        assert_eq!(map.sync_step(1000 + age).unwrap(), SyncStep::Done);

        // A failed flush rejoins the queue via set_dirty_after_sync.
        assert_eq!(map.set_dirty_after_sync(b"hello").unwrap(), Mark::Done);
        assert_eq!(map.check_dirty(b"hello").unwrap(), DirtyState::Dirty);
        assert_eq!(map.dirty_count(), 1);
        map.check_integrity().unwrap();
    }

    #[test]
    fn overwrite_grows_and_shrinks_the_chain() {
        let mut map = new_map();
        map.set(b"key", b"small", false, &mut Vec::new()).unwrap();
        let baseline = map.used_chunks();

        let big = vec![0x5au8; 900];
        map.set(b"key", &big, false, &mut Vec::new()).unwrap();
        assert_eq!(value_of(&mut map, b"key"), big);
        assert!(map.used_chunks() > baseline);
        assert_eq!(map.len(), 1);
        map.check_integrity().unwrap();

        map.set(b"key", b"tiny", false, &mut Vec::new()).unwrap();
        assert_eq!(value_of(&mut map, b"key"), b"tiny");
        assert_eq!(map.used_chunks(), baseline);
        map.check_integrity().unwrap();
    }

    #[test]
    fn del_removes_entries() {
        let mut map = new_map();
        map.set(b"a", b"1", true, &mut Vec::new()).unwrap();
        map.set(b"b", b"2", false, &mut Vec::new()).unwrap();

        let gone = map.del(b"a").unwrap().unwrap();
        assert_eq!(gone.key, b"a");
        assert_eq!(gone.value, b"1");
        assert!(gone.dirty);

        assert_eq!(map.get(b"a").unwrap(), Get::NoData);
        assert_eq!(map.len(), 1);
        assert_eq!(map.dirty_count(), 0);
        assert!(map.del(b"a").unwrap().is_none());
        map.check_integrity().unwrap();
    }

    #[test]
    fn only_key_entries() {
        let mut map = new_map();
        map.set_only_key(b"pending", &mut Vec::new()).unwrap();
        assert_eq!(map.only_key_count(), 1);
        assert_eq!(map.get(b"pending").unwrap(), Get::OnlyKey);
        assert_eq!(map.check_dirty(b"pending").unwrap(), DirtyState::OnlyKey);
        assert_eq!(map.set_dirty(b"pending").unwrap(), Mark::OnlyKey);

        // Upgrading to a real value clears the marker.
        map.set(b"pending", b"arrived", true, &mut Vec::new()).unwrap();
        assert_eq!(map.only_key_count(), 0);
        assert_eq!(map.dirty_count(), 1);
        assert_eq!(value_of(&mut map, b"pending"), b"arrived");

        // And a key-only overwrite restores it, dropping the dirty flag.
        map.set_only_key(b"pending", &mut Vec::new()).unwrap();
        assert_eq!(map.only_key_count(), 1);
        assert_eq!(map.dirty_count(), 0);
        assert_eq!(map.get(b"pending").unwrap(), Get::OnlyKey);

        let gone = map.del(b"pending").unwrap().unwrap();
        assert!(gone.only_key);
        assert!(gone.value.is_empty());
        map.check_integrity().unwrap();
    }

    #[test]
    fn eviction_returns_least_recently_got_victims() {
        let mut map = new_map();
        let value = vec![1u8; 200];
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut evicted = Vec::new();
        for i in 0..10_000 {
            let key = format!("fill-{i:05}").into_bytes();
            map.set(&key, &value, false, &mut evicted).unwrap();
            keys.push(key);
            if !evicted.is_empty() {
                break;
            }
        }
        assert!(!evicted.is_empty(), "map never filled up");
        // Nothing was ever got, so LRU-by-get is insertion order.
        assert_eq!(evicted[0].key, keys[0]);
        map.check_integrity().unwrap();
    }

    #[test]
    fn erase_picks_the_get_tail() {
        let mut map = new_map();
        map.set(b"a", b"1", false, &mut Vec::new()).unwrap();
        map.set(b"b", b"2", false, &mut Vec::new()).unwrap();
        map.set(b"c", b"3", false, &mut Vec::new()).unwrap();
        value_of(&mut map, b"a");

        match map.erase(0, false).unwrap() {
            EraseStep::Erased(entry) => assert_eq!(entry.key, b"b"),
            other => panic!("expected an eviction, got {other:?}"),
        }
        assert_eq!(value_of(&mut map, b"a"), b"1");
        assert_eq!(value_of(&mut map, b"c"), b"3");
        map.check_integrity().unwrap();
    }

    #[test]
    fn erase_by_set_picks_the_set_tail() {
        let mut map = new_map();
        map.set_evict_policy(EvictPolicy::BySet);
        map.set(b"a", b"1", false, &mut Vec::new()).unwrap();
        map.set(b"b", b"2", false, &mut Vec::new()).unwrap();
        // Re-setting `a` makes `b` the oldest-set entry.
        map.set(b"a", b"1!", false, &mut Vec::new()).unwrap();

        match map.erase(0, false).unwrap() {
            EraseStep::Erased(entry) => assert_eq!(entry.key, b"b"),
            other => panic!("expected an eviction, got {other:?}"),
        }
        map.check_integrity().unwrap();
    }

    #[test]
    fn erase_drains_the_map_monotonically() {
        let mut map = new_map();
        for i in 0..40 {
            map.set(format!("k{i}").as_bytes(), &[i as u8; 100], false, &mut Vec::new())
                .unwrap();
        }
        let mut last = map.used_chunks();
        assert!(last > 0);
        loop {
            match map.erase(0, false).unwrap() {
                EraseStep::Erased(_) => {
                    assert!(map.used_chunks() < last, "used chunks must shrink");
                    last = map.used_chunks();
                }
                EraseStep::Done => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(map.len(), 0);
        assert_eq!(map.used_chunks(), 0);
        map.check_integrity().unwrap();
    }

    #[test]
    fn erase_stops_below_target_load() {
        let mut map = new_map();
        for i in 0..20 {
            map.set(format!("k{i}").as_bytes(), &[0u8; 64], false, &mut Vec::new()).unwrap();
        }
        // Usage is far below 90%, so nothing must be evicted.
        assert_eq!(map.erase(90, false).unwrap(), EraseStep::Done);
        assert_eq!(map.len(), 20);
    }

    #[test]
    fn erase_reports_dirty_victims() {
        let mut map = new_map();
        map.set(b"clean", b"1", false, &mut Vec::new()).unwrap();
        map.set(b"dirty", b"2", true, &mut Vec::new()).unwrap();
        value_of(&mut map, b"clean"); // dirty entry becomes the GET tail

        match map.erase(0, true).unwrap() {
            EraseStep::DirtyData(entry) => assert_eq!(entry.key, b"dirty"),
            other => panic!("expected DirtyData, got {other:?}"),
        }
        assert_eq!(map.len(), 2, "dirty victim must survive");

        map.set_clean(b"dirty").unwrap();
        match map.erase(0, true).unwrap() {
            EraseStep::Erased(entry) => assert_eq!(entry.key, b"dirty"),
            other => panic!("expected an eviction, got {other:?}"),
        }
        map.check_integrity().unwrap();
    }

    #[test]
    fn bucket_neighbours_are_independent() {
        let mut map = new_map();
        let first = b"col-0".to_vec();
        let bucket = map.bucket_index(&first);
        let second = (1..10_000)
            .map(|i| format!("col-{i}").into_bytes())
            .find(|k| map.bucket_index(k) == bucket)
            .expect("no colliding key found");

        map.set(&first, b"one", false, &mut Vec::new()).unwrap();
        map.set(&second, b"two", true, &mut Vec::new()).unwrap();
        assert_eq!(map.bucket(bucket).len, 2);

        assert_eq!(value_of(&mut map, &first), b"one");
        assert_eq!(value_of(&mut map, &second), b"two");

        map.del(&first).unwrap().unwrap();
        assert_eq!(value_of(&mut map, &second), b"two");
        assert_eq!(map.check_dirty(&second).unwrap(), DirtyState::Dirty);

        map.set(&second, b"two!", false, &mut Vec::new()).unwrap();
        assert_eq!(map.get(&first).unwrap(), Get::NoData);
        assert_eq!(value_of(&mut map, &second), b"two!");
        map.check_integrity().unwrap();
    }

    #[test]
    fn dump_load_round_trip_is_bytewise() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.dump");

        let mut map = new_map();
        map.set(b"a", b"1", false, &mut Vec::new()).unwrap();
        map.set(b"b", b"2", true, &mut Vec::new()).unwrap();
        map.set_only_key(b"c", &mut Vec::new()).unwrap();
        map.dump(&path).unwrap();
        let want = snapshot(&map);

        let mut fresh = new_map();
        fresh.load(&path).unwrap();
        assert_eq!(snapshot(&fresh), want);
        fresh.check_integrity().unwrap();
    }

    #[test]
    fn dump_load_preserves_dirty_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.dump");

        let mut map = new_map();
        map.set(b"k", b"v1", false, &mut Vec::new()).unwrap();
        map.set_dirty(b"k").unwrap();
        map.dump(&path).unwrap();
        drop(map); // the writer dies here

        let mut map = new_map();
        map.load(&path).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.dirty_count(), 1);
        assert_eq!(value_of(&mut map, b"k"), b"v1");
        assert_eq!(map.check_dirty(b"k").unwrap(), DirtyState::Dirty);
        map.check_integrity().unwrap();
    }

    #[test]
    fn load_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.dump");
        let mut map = new_map();
        map.set(b"k", b"v", false, &mut Vec::new()).unwrap();
        map.dump(&path).unwrap();

        // Wrong magic.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(map.load(&path), Err(MapError::Corrupt(_))));

        // Wrong version.
        bytes[0] ^= 0xff;
        bytes[4] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            map.load(&path),
            Err(MapError::VersionMismatch { .. })
        ));

        // Wrong size.
        bytes[4] ^= 0xff;
        bytes.truncate(bytes.len() - 1);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(map.load(&path), Err(MapError::SizeMismatch { .. })));
    }

    /// At every journal slot boundary, a crash plus reattach yields
    /// either the full pre-operation or the full post-operation region,
    /// never a hybrid.
    #[test]
    fn crash_at_every_journal_step_is_atomic() {
        type Op = (&'static str, fn(&mut ChunkMap));
        let ops: [Op; 5] = [
            ("set-new", |m| {
                m.set(b"gamma", b"three", true, &mut Vec::new()).unwrap();
            }),
            // Same-length overwrite: no chunks move, pure journal batch.
            ("set-existing", |m| {
                m.set(b"alpha", b"ONE", false, &mut Vec::new()).unwrap();
            }),
            // `alpha` sits at the GET tail, so this hit splices the chain.
            ("get", |m| {
                m.get(b"alpha").unwrap();
            }),
            ("set-dirty", |m| {
                m.set_dirty(b"beta").unwrap();
            }),
            ("set-clean", |m| {
                m.set_clean(b"alpha").unwrap();
            }),
        ];

        for (name, op) in ops {
            let mut map = new_map();
            map.set(b"alpha", b"one", true, &mut Vec::new()).unwrap();
            map.set(b"beta", b"two", false, &mut Vec::new()).unwrap();

            map.defer_commit = true;
            op(&mut map);
            map.defer_commit = false;

            let staged = snapshot(&map);
            let slots = journal::cursor(&map.region);
            assert!(slots > 0, "{name} staged nothing");

            // Reference: the fully committed post state.
            let post = region_from(&staged);
            journal::commit(&post);
            let want = post.as_slice().to_vec();

            // Crash after `prepared` plus k applied slots.
            for k in 0..=slots {
                let r = region_from(&staged);
                journal::mark_prepared(&r);
                journal::apply_slots(&r, k);

                let mut revived = ChunkMap::connect(r).unwrap();
                assert_eq!(snapshot(&revived), want, "{name} crash at slot {k}");
                revived.rebuild().unwrap();
                revived.check_integrity().unwrap();
            }

            // Crash before `prepared`: the index is the pre-op state.
            let mut revived = ChunkMap::connect(region_from(&staged)).unwrap();
            revived.rebuild().unwrap();
            revived.check_integrity().unwrap();
            if name == "set-new" {
                assert_eq!(revived.get(b"gamma").unwrap(), Get::NoData);
            }
            if name == "set-existing" {
                // Value bytes are written in place and may carry the new
                // payload, but the journaled index fields must be
                // pre-operation: the entry is still dirty.
                assert_eq!(revived.check_dirty(b"alpha").unwrap(), DirtyState::Dirty);
            }
        }
    }

    #[test]
    fn connect_replays_an_interrupted_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.map");
        {
            let region = MemRegion::create_file(&path, 64 * 1024).unwrap();
            let mut map = ChunkMap::create(region, &small_opts()).unwrap();
            map.set(b"a", b"1", false, &mut Vec::new()).unwrap();

            map.defer_commit = true;
            map.set(b"b", b"2", true, &mut Vec::new()).unwrap();
            map.defer_commit = false;
            journal::mark_prepared(&map.region);
            map.region.flush().unwrap();
            // Writer dies before applying its epoch.
        }

        let mut map = ChunkMap::connect(MemRegion::open_file(&path).unwrap()).unwrap();
        assert_eq!(value_of(&mut map, b"b"), b"2");
        assert_eq!(map.len(), 2);
        assert_eq!(map.dirty_count(), 1);
        map.rebuild().unwrap();
        map.check_integrity().unwrap();
    }

    #[test]
    fn iterators_follow_their_chains() {
        let mut map = new_map();
        map.set(b"a", b"1", false, &mut Vec::new()).unwrap();
        map.set(b"b", b"2", true, &mut Vec::new()).unwrap();
        map.set(b"c", b"3", false, &mut Vec::new()).unwrap();
        map.set(b"d", b"4", true, &mut Vec::new()).unwrap();
        value_of(&mut map, b"a");

        assert_eq!(map.iter().count(), 4);
        let mut all: Vec<Vec<u8>> = map.iter().map(|e| e.unwrap().key).collect();
        all.sort();
        assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        // Newest set first.
        let by_set: Vec<Vec<u8>> = map.iter_set().map(|e| e.unwrap().key).collect();
        assert_eq!(by_set[0], b"d");
        assert_eq!(*by_set.last().unwrap(), b"a");

        // `a` was got last.
        let by_get: Vec<Vec<u8>> = map.iter_get().map(|e| e.unwrap().key).collect();
        assert_eq!(by_get[0], b"a");

        // Only dirty entries, oldest candidate first.
        let dirty: Vec<Vec<u8>> = map.iter_dirty().map(|e| e.unwrap().key).collect();
        assert_eq!(dirty, vec![b"b".to_vec(), b"d".to_vec()]);

        let in_bucket: usize = (0..map.bucket_count())
            .map(|b| map.iter_bucket(b).count())
            .sum();
        assert_eq!(in_bucket, 4);
    }

    #[test]
    fn backup_sweeps_every_entry_once() {
        let mut map = new_map();
        map.set(b"a", b"1", false, &mut Vec::new()).unwrap();
        map.set(b"b", b"2", false, &mut Vec::new()).unwrap();
        map.set(b"c", b"3", true, &mut Vec::new()).unwrap();
        map.set_only_key(b"marker", &mut Vec::new()).unwrap();

        map.backup_start(true);
        let mut keys = Vec::new();
        let mut only_key = 0;
        loop {
            match map.backup_step().unwrap() {
                BackupStep::NeedBackup(entry) => keys.push(entry.key),
                BackupStep::OnlyKey => only_key += 1,
                BackupStep::Done => break,
            }
        }
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(only_key, 1);
        assert_eq!(map.backup_step().unwrap(), BackupStep::Done);
        map.check_integrity().unwrap();
    }

    #[test]
    fn recover_finds_and_repairs_a_mislinked_block() {
        let mut map = new_map();
        for i in 0..8 {
            map.set(format!("r{i}").as_bytes(), b"x", false, &mut Vec::new()).unwrap();
        }
        for b in 0..map.bucket_count() {
            assert_eq!(map.recover(b, false).unwrap(), 0);
        }

        // Corrupt one block's bucket index.
        let bucket = map.bucket_index(b"r3");
        let addr = map.find(b"r3").unwrap().unwrap();
        let wrong = (bucket + 1) % map.bucket_count();
        unsafe { block::head_mut(&map.region, addr) }.bucket = wrong as u32;

        assert!(map.recover(bucket, false).unwrap() > 0);
        assert!(map.recover(bucket, true).unwrap() > 0);
        assert_eq!(map.recover(bucket, false).unwrap(), 0);
        assert_eq!(map.get(b"r3").unwrap(), Get::NoData);
    }

    #[test]
    fn clear_resets_to_the_created_state() {
        let mut map = new_map();
        for i in 0..10 {
            map.set(format!("k{i}").as_bytes(), &[i as u8; 100], i % 2 == 0, &mut Vec::new())
                .unwrap();
        }
        map.clear().unwrap();

        assert_eq!(map.len(), 0);
        assert_eq!(map.dirty_count(), 0);
        assert_eq!(map.used_chunks(), 0);
        assert_eq!(map.get(b"k1").unwrap(), Get::NoData);
        map.check_integrity().unwrap();

        map.set(b"fresh", b"start", false, &mut Vec::new()).unwrap();
        assert_eq!(value_of(&mut map, b"fresh"), b"start");
        map.check_integrity().unwrap();
    }

    #[test]
    fn no_memory_without_auto_evict() {
        let opts = Options {
            auto_evict: false,
            ..small_opts()
        };
        let mut map = ChunkMap::create(MemRegion::heap(8 * 1024), &opts).unwrap();

        let value = vec![7u8; 120];
        let mut stored = 0;
        let err = loop {
            match map.set(format!("k{stored}").as_bytes(), &value, false, &mut Vec::new()) {
                Ok(()) => stored += 1,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, MapError::NoMemory));
        assert!(stored > 0);

        // Freeing one entry makes room again.
        match map.erase(0, false).unwrap() {
            EraseStep::Erased(_) => {}
            other => panic!("unexpected {other:?}"),
        }
        map.set(b"retry", &value, false, &mut Vec::new()).unwrap();
        map.check_integrity().unwrap();
    }

    #[test]
    fn failed_set_still_reports_evicted_entries() {
        let mut map = ChunkMap::create(MemRegion::heap(8 * 1024), &small_opts()).unwrap();
        map.set(b"a", b"1", false, &mut Vec::new()).unwrap();
        map.set(b"b", b"2", true, &mut Vec::new()).unwrap();
        map.set(b"c", b"3", false, &mut Vec::new()).unwrap();

        // Larger than the whole region: eviction drains the map and the
        // allocation still fails.
        let huge = vec![0u8; 16 * 1024];
        let mut evicted = Vec::new();
        let err = map.set(b"huge", &huge, false, &mut evicted).unwrap_err();
        assert!(matches!(err, MapError::NoMemory));

        // The entries destroyed making room are reported, not lost.
        let mut keys: Vec<Vec<u8>> = evicted.iter().map(|e| e.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(evicted.iter().any(|e| e.dirty), "dirty victim must be flushable");

        assert_eq!(map.len(), 0);
        assert_eq!(map.used_chunks(), 0);
        map.check_integrity().unwrap();

        // The drained map is still usable.
        map.set(b"after", b"ok", false, &mut Vec::new()).unwrap();
        assert_eq!(value_of(&mut map, b"after"), b"ok");
    }

    #[test]
    fn read_only_rejects_mutation_but_allows_sync() {
        let mut map = new_map();
        map.set(b"k", b"v", true, &mut Vec::new()).unwrap();
        map.set_read_only(true);

        assert!(matches!(
            map.set(b"x", b"y", false, &mut Vec::new()),
            Err(MapError::ReadOnly)
        ));
        assert!(matches!(map.del(b"k"), Err(MapError::ReadOnly)));
        assert!(matches!(map.erase(0, false), Err(MapError::ReadOnly)));
        assert!(matches!(map.set_dirty(b"k"), Err(MapError::ReadOnly)));

        // Lookups and writeback still work on a read-only map.
        assert_eq!(value_of(&mut map, b"k"), b"v");
        map.sync_start();
        let age = map.writeback_age();
        match map.sync_step(age + 1).unwrap() {
            SyncStep::NeedSync(entry) => assert_eq!(entry.key, b"k"),
            other => panic!("expected NeedSync, got {other:?}"),
        }
    }

    #[test]
    fn set_bucket_dirty_marks_whole_bucket() {
        let mut map = new_map();
        map.set(b"m1", b"1", false, &mut Vec::new()).unwrap();
        map.set(b"m2", b"2", false, &mut Vec::new()).unwrap();

        let bucket = map.bucket_index(b"m1");
        let marked = map.set_bucket_dirty(bucket).unwrap();
        assert!(marked >= 1);
        assert_eq!(map.check_dirty(b"m1").unwrap(), DirtyState::Dirty);
        assert_eq!(map.dirty_count(), marked as u64);
        map.check_integrity().unwrap();
    }

    #[test]
    fn large_values_chain_chunks() {
        let mut map = new_map();
        let value: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        map.set(b"big", &value, false, &mut Vec::new()).unwrap();

        // 3 KiB cannot fit one 512-byte chunk.
        assert!(map.used_chunks() >= 6);
        assert_eq!(value_of(&mut map, b"big"), value);
        map.check_integrity().unwrap();

        map.del(b"big").unwrap().unwrap();
        assert_eq!(map.used_chunks(), 0);
        map.check_integrity().unwrap();
    }

    #[test]
    fn random_operations_keep_every_invariant() {
        let mut rng = StdRng::seed_from_u64(0x1cec0ffe);
        let mut map = new_map();

        for round in 0..400 {
            let key = format!("key-{}", rng.gen_range(0..40)).into_bytes();
            match rng.gen_range(0..10) {
                0..=3 => {
                    let len = rng.gen_range(0..300);
                    let value = vec![rng.gen::<u8>(); len];
                    map.set(&key, &value, rng.gen_bool(0.3), &mut Vec::new()).unwrap();
                }
                4..=5 => {
                    map.get(&key).unwrap();
                }
                6 => {
                    map.del(&key).unwrap();
                }
                7 => match map.erase(50, rng.gen_bool(0.5)) {
                    Ok(_) => {}
                    Err(e) => panic!("erase failed: {e}"),
                },
                8 => {
                    map.sync_start();
                    while let SyncStep::NeedSync(_) | SyncStep::NoNeedSync | SyncStep::OnlyKey =
                        map.sync_step(round as u64 * 10).unwrap()
                    {}
                }
                _ => {
                    map.set_dirty(&key).unwrap();
                }
            }
            if round % 25 == 0 {
                map.check_integrity().unwrap();
            }
        }
        map.check_integrity().unwrap();
    }

    #[test]
    fn info_and_desc_report_counters() {
        let mut map = new_map();
        map.set(b"a", b"1", true, &mut Vec::new()).unwrap();
        map.set(b"b", b"2", false, &mut Vec::new()).unwrap();
        value_of(&mut map, b"a");
        map.get(b"missing").unwrap();

        let info = map.info();
        assert_eq!(info.element_count, 2);
        assert_eq!(info.dirty_count, 1);
        assert_eq!(info.get_count, 2);
        assert_eq!(info.hit_count, 1);
        assert!((info.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(info.used_chunks, map.used_chunks());
        assert!(info.max_chain >= 1);

        let desc = map.desc();
        assert!(desc.contains("elements"));
        assert!(desc.contains("buckets"));
    }
}
