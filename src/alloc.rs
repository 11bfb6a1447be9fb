//! Multi-size-class chunk allocator.
//!
//! The region tail is carved into a geometric series of pools
//! (`min_size`, `min_size * factor`, …, `max_size`), every pool holding the
//! same chunk count `n`, solved so that `n * sum(sizes)` fills the bytes
//! left after the fixed structures. An allocation takes the smallest chunk
//! that fits; payloads larger than the biggest chunk chain additional
//! chunks greedily. Eviction on exhaustion is driven by the map layer,
//! which owns the victim policy.

use std::collections::HashSet;

use crate::error::MapError;
use crate::hash;
use crate::layout::{
    self, alloc_off, chunks_off, pool_desc_off, AllocHead, BlockHead, Bucket, ChunkHead, MapHead,
    ALLOC_HEAD_SIZE, BLOCK_HEAD_SIZE, JOURNAL_SIZE, MAP_HEAD_SIZE, NIL, POOL_DESC_SIZE,
};
use crate::pool;
use crate::region::{self, MemRegion};

/// Smallest workable chunk: a block header plus a little inline payload.
const MIN_CHUNK_FLOOR: u64 = (BLOCK_HEAD_SIZE + 24) as u64;

/// Solved region geometry, computed once at `create`.
#[derive(Debug)]
pub(crate) struct Geometry {
    pub classes: Vec<u64>,
    pub bucket_count: u64,
    pub chunks_per_class: u64,
    pub total_chunks: u64,
}

/// The geometric size-class series. Sizes are 8-byte aligned and the
/// configured maximum is always the last class.
pub(crate) fn size_classes(min: u64, max: u64, factor: f32) -> Result<Vec<u64>, MapError> {
    if max < min {
        return Err(MapError::Config("max_chunk_size below min_chunk_size"));
    }
    let min = align8(min.max(MIN_CHUNK_FLOOR));
    let max = align8(max).max(min);
    if min != max && factor <= 1.0 {
        return Err(MapError::Config("growth_factor must exceed 1.0"));
    }

    let mut classes = Vec::new();
    let mut s = min;
    while s < max {
        classes.push(s);
        let next = align8((s as f64 * factor as f64).ceil() as u64);
        if next <= s || next >= max {
            break;
        }
        s = next;
    }
    classes.push(max);
    Ok(classes)
}

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Solve the chunk count per class and the bucket count for a region of
/// `region_len` bytes. The bucket table is sized from an estimate of the
/// chunk count, then the chunk count is recomputed from what remains.
pub(crate) fn solve(
    region_len: usize,
    min: u64,
    max: u64,
    factor: f32,
    bucket_ratio: f32,
) -> Result<Geometry, MapError> {
    if bucket_ratio <= 0.0 {
        return Err(MapError::Config("bucket_ratio must be positive"));
    }
    let classes = size_classes(min, max, factor)?;
    let k = classes.len() as u64;
    let sum: u64 = classes.iter().sum();

    let fixed = (MAP_HEAD_SIZE + JOURNAL_SIZE + ALLOC_HEAD_SIZE) as u64 + k * POOL_DESC_SIZE as u64;
    let too_small = || MapError::RegionTooSmall {
        needed: (fixed + sum + Bucket::SIZE as u64) as usize,
        have: region_len,
    };

    let avail_est = (region_len as u64).checked_sub(fixed).ok_or_else(too_small)?;
    let total_est = (avail_est / sum) * k;
    if total_est == 0 {
        return Err(too_small());
    }

    let bucket_count = hash::min_prime_ge(((total_est as f64 / bucket_ratio as f64) as u64).max(1));
    let avail = (region_len as u64)
        .checked_sub(fixed + bucket_count * Bucket::SIZE as u64)
        .ok_or_else(too_small)?;
    let chunks_per_class = avail / sum;
    if chunks_per_class == 0 {
        return Err(too_small());
    }

    Ok(Geometry {
        bucket_count,
        chunks_per_class,
        total_chunks: chunks_per_class * k,
        classes,
    })
}

/// Write the allocator header, pool descriptors and free lists.
pub(crate) fn init(region: &MemRegion, geo: &Geometry) {
    let head: &mut AllocHead = unsafe { region::at_mut(region, alloc_off(geo.bucket_count)) };
    head.pool_count = geo.classes.len() as u64;
    head.total_chunks = geo.total_chunks;

    let mut base = chunks_off(geo.bucket_count, geo.classes.len() as u64);
    for (i, &size) in geo.classes.iter().enumerate() {
        let desc_off = pool_desc_off(geo.bucket_count, i as u64);
        pool::init(region, desc_off, size, geo.chunks_per_class, base);
        base += geo.chunks_per_class * size;
    }
}

fn map_head(region: &MemRegion) -> &MapHead {
    unsafe { region::at(region, 0) }
}

fn alloc_head(region: &MemRegion) -> &AllocHead {
    unsafe { region::at(region, alloc_off(map_head(region).bucket_count)) }
}

/// Number of size classes.
pub(crate) fn pool_count(region: &MemRegion) -> u64 {
    alloc_head(region).pool_count
}

/// Total chunks across every pool.
pub(crate) fn total_chunks(region: &MemRegion) -> u64 {
    alloc_head(region).total_chunks
}

/// Descriptor offset of pool `idx`.
pub(crate) fn desc_off(region: &MemRegion, idx: u64) -> u64 {
    pool_desc_off(map_head(region).bucket_count, idx)
}

/// Chunk size of pool `idx`.
pub(crate) fn class_size(region: &MemRegion, idx: u64) -> u64 {
    unsafe { pool::desc(region, desc_off(region, idx)) }.chunk_size
}

/// Smallest class whose chunks hold `need` bytes (header included), or
/// `None` when only chaining can satisfy the request.
pub(crate) fn pick_class(region: &MemRegion, need: u64) -> Option<u64> {
    let k = pool_count(region);
    (0..k).find(|&i| class_size(region, i) >= need)
}

/// Index of the largest class.
pub(crate) fn largest_class(region: &MemRegion) -> u64 {
    pool_count(region) - 1
}

/// Pop one chunk from pool `idx`.
pub(crate) fn pop_class(region: &MemRegion, idx: u64) -> Option<u64> {
    pool::pop(region, desc_off(region, idx))
}

/// The pool a chunk offset belongs to.
pub(crate) fn pool_of(region: &MemRegion, chunk: u64) -> Option<u64> {
    let k = pool_count(region);
    (0..k).find(|&i| pool::contains(region, desc_off(region, i), chunk))
}

/// Full size in bytes of the chunk at `chunk`.
pub(crate) fn chunk_size_of(region: &MemRegion, chunk: u64) -> Option<u64> {
    pool_of(region, chunk).map(|i| class_size(region, i))
}

/// Return a chunk to its owning pool.
pub(crate) fn free_chunk(region: &MemRegion, chunk: u64) {
    let idx = pool_of(region, chunk).expect("freed offset is not a chunk");
    pool::push(region, desc_off(region, idx), chunk);
}

/// True when `off` is a valid chunk boundary.
pub(crate) fn is_chunk(region: &MemRegion, off: u64) -> bool {
    pool_of(region, off).is_some()
}

/// Re-derive every free list by scanning the live structure: walk each
/// bucket's block chain and each block's chunk chain to mark live chunks,
/// then thread the unused chunks of every pool back onto its free list.
/// Also recomputes `used_chunks`. Called after `load`.
pub(crate) fn rebuild(region: &MemRegion) -> Result<(), MapError> {
    let bucket_count = map_head(region).bucket_count;
    let limit = total_chunks(region) + 1;
    let mut live: HashSet<u64> = HashSet::new();

    for b in 0..bucket_count {
        let bucket: &Bucket = unsafe { region::at(region, layout::bucket_off(b)) };
        let mut addr = bucket.head;
        let mut steps = 0u64;
        while addr != NIL {
            steps += 1;
            if steps > limit || !is_chunk(region, addr) {
                return Err(MapError::Corrupt("bucket chain walk"));
            }
            let block: &BlockHead = unsafe { region::at(region, addr) };
            live.insert(addr);

            // Continuation chunks.
            let mut has_next = block.has_next != 0;
            let mut link = block.link;
            while has_next {
                if !is_chunk(region, link) || !live.insert(link) {
                    return Err(MapError::Corrupt("chunk chain walk"));
                }
                let chunk: &ChunkHead = unsafe { region::at(region, link) };
                has_next = chunk.has_next != 0;
                link = chunk.link;
            }

            addr = block.bucket_next;
        }
    }

    let k = pool_count(region);
    for i in 0..k {
        pool::rebuild_free(region, desc_off(region, i), &live);
    }

    let head: &mut MapHead = unsafe { region::at_mut(region, 0) };
    head.used_chunks = live.len() as u64;
    log::debug!(
        "rebuilt free lists: {} live chunks of {}",
        live.len(),
        total_chunks(region)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_geometric_and_capped() {
        let c = size_classes(104, 512, 2.0).unwrap();
        assert_eq!(c, vec![104, 208, 416, 512]);

        // Floor kicks in for tiny minimums.
        let c = size_classes(64, 512, 2.0).unwrap();
        assert_eq!(*c.first().unwrap(), MIN_CHUNK_FLOOR);
        assert_eq!(*c.last().unwrap(), 512);

        // Degenerate single class.
        let c = size_classes(256, 256, 1.0).unwrap();
        assert_eq!(c, vec![256]);
    }

    #[test]
    fn bad_config_is_rejected() {
        assert!(matches!(
            size_classes(512, 128, 2.0),
            Err(MapError::Config(_))
        ));
        assert!(matches!(
            size_classes(128, 512, 1.0),
            Err(MapError::Config(_))
        ));
        assert!(matches!(
            solve(1 << 16, 128, 512, 2.0, 0.0),
            Err(MapError::Config(_))
        ));
    }

    #[test]
    fn solve_fills_the_region() {
        let geo = solve(1 << 16, 64, 512, 2.0, 2.0).unwrap();
        assert_eq!(geo.classes.len(), 4);
        assert!(geo.chunks_per_class > 0);
        assert_eq!(geo.total_chunks, geo.chunks_per_class * 4);

        // Everything must fit.
        let sum: u64 = geo.classes.iter().sum();
        let used = chunks_off(geo.bucket_count, 4) + geo.chunks_per_class * sum;
        assert!(used <= 1 << 16);

        // Bucket count tracks chunks / ratio, prime.
        assert!(geo.bucket_count >= geo.total_chunks / 2);
    }

    #[test]
    fn tiny_region_is_rejected() {
        assert!(matches!(
            solve(1024, 64, 512, 2.0, 2.0),
            Err(MapError::RegionTooSmall { .. })
        ));
    }

    #[test]
    fn pools_pop_and_locate() {
        let r = MemRegion::heap(1 << 16);
        let geo = solve(1 << 16, 64, 512, 2.0, 2.0).unwrap();
        // Minimal map head so the accessors can find the bucket count.
        unsafe { region::at_mut::<MapHead>(&r, 0) }.bucket_count = geo.bucket_count;
        init(&r, &geo);

        assert_eq!(pool_count(&r), 4);
        let small = pop_class(&r, 0).unwrap();
        assert_eq!(pool_of(&r, small), Some(0));
        assert_eq!(chunk_size_of(&r, small), Some(class_size(&r, 0)));

        // Best fit picks the smallest class that holds the request.
        let idx = pick_class(&r, class_size(&r, 0) + 1).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(pick_class(&r, class_size(&r, 3) + 1), None);

        free_chunk(&r, small);
        assert_eq!(unsafe { pool::desc(&r, desc_off(&r, 0)) }.used, 0);
    }
}
