//! Byte region ownership and offset/pointer translation.
//!
//! A [`MemRegion`] is the single contiguous buffer the whole map lives in:
//! a memory-mapped file shared between processes, an anonymous heap buffer
//! for in-process use and tests, or a raw segment the caller obtained
//! elsewhere (SysV/POSIX shared memory). The region owns no semantics
//! beyond translating between region-relative offsets and pointers.

use std::fs;
use std::io;
use std::path::Path;

use memmap2::MmapMut;

enum Storage {
    /// Heap buffer, allocated and freed by the region.
    Heap { ptr: *mut u8, len: usize, cap: usize },
    /// Memory-mapped file; the mapping keeps the file open.
    Mmap(MmapMut),
    /// Caller-owned memory; the caller guarantees it outlives the region.
    Raw { ptr: *mut u8, len: usize },
}

/// The byte region backing a map.
pub struct MemRegion {
    storage: Storage,
}

// Mutations are serialised by the owning map (single writer); the region
// itself is just a window onto bytes.
unsafe impl Send for MemRegion {}

impl MemRegion {
    /// Allocate a zeroed heap-backed region of `len` bytes.
    pub fn heap(len: usize) -> Self {
        let mut buf = vec![0u8; len];
        let ptr = buf.as_mut_ptr();
        let cap = buf.capacity();
        std::mem::forget(buf);
        MemRegion {
            storage: Storage::Heap { ptr, len, cap },
        }
    }

    /// Create (or truncate) a file of `len` bytes and map it writable.
    pub fn create_file<P: AsRef<Path>>(path: P, len: usize) -> io::Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;

        // Safety: we just created and truncated the file and hold it open
        // for the lifetime of the mapping.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap.fill(0);
        Ok(MemRegion {
            storage: Storage::Mmap(mmap),
        })
    }

    /// Map an existing file writable, preserving its contents.
    pub fn open_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        // Safety: mapping stays valid while the region holds it.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(MemRegion {
            storage: Storage::Mmap(mmap),
        })
    }

    /// Wrap caller-owned memory.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for the
    /// lifetime of the region, and no other writer may touch it while a
    /// map attached to this region is mutating.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        MemRegion {
            storage: Storage::Raw { ptr, len },
        }
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Heap { len, .. } => *len,
            Storage::Mmap(m) => m.len(),
            Storage::Raw { len, .. } => *len,
        }
    }

    /// True if the region holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn base(&self) -> *mut u8 {
        match &self.storage {
            Storage::Heap { ptr, .. } => *ptr,
            Storage::Mmap(m) => m.as_ptr() as *mut u8,
            Storage::Raw { ptr, .. } => *ptr,
        }
    }

    /// Translate a region-relative offset to a pointer.
    #[inline]
    pub(crate) fn absolute(&self, off: u64) -> *mut u8 {
        debug_assert!((off as usize) < self.len(), "offset {off} out of region");
        unsafe { self.base().add(off as usize) }
    }

    /// Translate a pointer inside the region back to an offset.
    #[inline]
    #[allow(dead_code)]
    pub(crate) fn relative(&self, ptr: *const u8) -> u64 {
        let base = self.base() as usize;
        let p = ptr as usize;
        debug_assert!(p >= base && p < base + self.len());
        (p - base) as u64
    }

    /// Shared view of `len` bytes at `off`.
    #[inline]
    pub(crate) fn bytes(&self, off: u64, len: usize) -> &[u8] {
        debug_assert!(off as usize + len <= self.len());
        unsafe { std::slice::from_raw_parts(self.absolute(off), len) }
    }

    /// Mutable view of `len` bytes at `off`.
    ///
    /// Takes `&self` because distinct structures inside the region are
    /// borrowed independently; the single-writer rule makes this sound.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn bytes_mut(&self, off: u64, len: usize) -> &mut [u8] {
        debug_assert!(off as usize + len <= self.len());
        unsafe { std::slice::from_raw_parts_mut(self.absolute(off), len) }
    }

    /// The whole region as a byte slice (dump path).
    pub(crate) fn as_slice(&self) -> &[u8] {
        self.bytes(0, self.len())
    }

    /// Flush a file-backed region to disk. No-op for other storage.
    pub fn flush(&self) -> io::Result<()> {
        match &self.storage {
            Storage::Mmap(m) => m.flush(),
            _ => Ok(()),
        }
    }
}

impl Drop for MemRegion {
    fn drop(&mut self) {
        if let Storage::Heap { ptr, len, cap } = self.storage {
            // Safety: ptr/len/cap came from a forgotten Vec in `heap`.
            unsafe { drop(Vec::from_raw_parts(ptr, len, cap)) };
        }
    }
}

/// Typed shared reference to a region structure at `off`.
///
/// # Safety
/// `off` must point at a properly initialised `T` within the region.
#[inline]
pub(crate) unsafe fn at<T>(region: &MemRegion, off: u64) -> &T {
    debug_assert!(off as usize + std::mem::size_of::<T>() <= region.len());
    &*(region.absolute(off) as *const T)
}

/// Typed mutable reference to a region structure at `off`.
///
/// # Safety
/// Same as [`at`]; additionally the caller must not hold another mutable
/// reference to overlapping bytes.
#[inline]
#[allow(clippy::mut_from_ref)]
pub(crate) unsafe fn at_mut<T>(region: &MemRegion, off: u64) -> &mut T {
    debug_assert!(off as usize + std::mem::size_of::<T>() <= region.len());
    &mut *(region.absolute(off) as *mut T)
}
