//! Mapped region — a fixed-size file mapped read-write into the process.
//!
//! Every other component sees the index file, the cache file, and the bus
//! file through this type: a flat byte range addressed by absolute offsets,
//! with unaligned primitive access for format fields and atomic access for
//! the three coordination words and the bus `limit`.
//!
//! # Sharing
//! The files live on tmpfs and are mapped by several processes at once. All
//! accessors take `&self`; the mapping is `MmapRaw`, so reads and writes go
//! through raw pointers rather than a `&mut [u8]` view that would claim
//! exclusivity the kernel does not enforce. Concurrent writes to overlapping
//! ranges are the caller's responsibility; the writer/reader protocol in
//! `writer`/`reader` is what makes the races benign.
//!
//! # "Volatile" stores
//! Where the protocol needs a store that publishes all prior writes (the
//! rw-flag flip, the bus status byte), use the `*_release` stores here and
//! pair them with `*_acquire` loads on the observer side.
//!
//! # Errors
//! `OutOfBounds` when `offset + len` exceeds the mapped size, `ClosedRegion`
//! after [`MappedRegion::unmap`]. There are no partial writes.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use memmap2::{MmapOptions, MmapRaw};

use crate::error::CacheError;

pub struct MappedRegion {
    path: PathBuf,
    map:  Option<MmapRaw>,
    len:  usize,
}

impl MappedRegion {
    /// Create (or reopen) the file at `path`, size it to exactly `len`
    /// bytes, and map it read-write.
    ///
    /// An existing file keeps its contents; `set_len` only extends or
    /// truncates. Validating what those contents mean (magic, header words)
    /// is the caller's job.
    pub fn new<P: AsRef<Path>>(path: P, len: u64) -> Result<Self, CacheError> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(len)?;
        let map = MmapOptions::new().map_raw(&file)?;
        Ok(Self { path, map: Some(map), len: len as usize })
    }

    /// Mapped size in bytes. Fixed at construction.
    #[inline]
    pub fn len(&self) -> usize { self.len }

    #[inline]
    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn path(&self) -> &Path { &self.path }

    /// Release the mapping. Every operation afterwards fails with
    /// [`CacheError::ClosedRegion`].
    pub fn unmap(&mut self) {
        self.map = None;
    }

    /// Flush dirty pages back to the backing file.
    pub fn flush(&self) -> Result<(), CacheError> {
        match &self.map {
            Some(m) => {
                m.flush()?;
                Ok(())
            }
            None => Err(CacheError::ClosedRegion),
        }
    }

    /// Bounds-checked pointer to `off..off+len`.
    #[inline]
    fn ptr(&self, off: usize, len: usize) -> Result<*mut u8, CacheError> {
        let map = self.map.as_ref().ok_or(CacheError::ClosedRegion)?;
        if off.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(CacheError::OutOfBounds { offset: off, len, size: self.len });
        }
        Ok(unsafe { map.as_mut_ptr().add(off) })
    }

    // ── Unaligned primitive access (host byte order) ─────────────────────────

    pub fn get_u8(&self, off: usize) -> Result<u8, CacheError> {
        Ok(unsafe { ptr::read(self.ptr(off, 1)?) })
    }

    pub fn get_u16(&self, off: usize) -> Result<u16, CacheError> {
        Ok(unsafe { ptr::read_unaligned(self.ptr(off, 2)? as *const u16) })
    }

    pub fn get_u32(&self, off: usize) -> Result<u32, CacheError> {
        Ok(unsafe { ptr::read_unaligned(self.ptr(off, 4)? as *const u32) })
    }

    pub fn get_u64(&self, off: usize) -> Result<u64, CacheError> {
        Ok(unsafe { ptr::read_unaligned(self.ptr(off, 8)? as *const u64) })
    }

    pub fn put_u8(&self, off: usize, v: u8) -> Result<(), CacheError> {
        unsafe { ptr::write(self.ptr(off, 1)?, v) };
        Ok(())
    }

    pub fn put_u16(&self, off: usize, v: u16) -> Result<(), CacheError> {
        unsafe { ptr::write_unaligned(self.ptr(off, 2)? as *mut u16, v) };
        Ok(())
    }

    pub fn put_u32(&self, off: usize, v: u32) -> Result<(), CacheError> {
        unsafe { ptr::write_unaligned(self.ptr(off, 4)? as *mut u32, v) };
        Ok(())
    }

    pub fn put_u64(&self, off: usize, v: u64) -> Result<(), CacheError> {
        unsafe { ptr::write_unaligned(self.ptr(off, 8)? as *mut u64, v) };
        Ok(())
    }

    // ── Bulk copy ────────────────────────────────────────────────────────────

    /// Zero-copy view of `off..off+len`. Valid while the region stays mapped;
    /// callers must not hold it across [`MappedRegion::unmap`] (the borrow
    /// checker enforces this for in-process users).
    pub fn get_bytes(&self, off: usize, len: usize) -> Result<&[u8], CacheError> {
        let p = self.ptr(off, len)?;
        Ok(unsafe { std::slice::from_raw_parts(p, len) })
    }

    pub fn put_bytes(&self, off: usize, src: &[u8]) -> Result<(), CacheError> {
        let p = self.ptr(off, src.len())?;
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), p, src.len()) };
        Ok(())
    }

    // ── Atomic words ─────────────────────────────────────────────────────────
    //
    // The mapping is page-aligned, so an offset aligned to the access width
    // yields an aligned pointer. The 64-bit ops are used only for the bus
    // `limit` word at offset 0; the 8/16/32-bit ops serve the bus status
    // byte and the index header words at offsets 6, 8, and 12.

    #[inline]
    fn atomic_u8(&self, off: usize) -> Result<&AtomicU8, CacheError> {
        let p = self.ptr(off, 1)?;
        Ok(unsafe { &*(p as *const AtomicU8) })
    }

    #[inline]
    fn atomic_u16(&self, off: usize) -> Result<&AtomicU16, CacheError> {
        let p = self.ptr(off, 2)?;
        debug_assert_eq!(p as usize % 2, 0, "u16 atomic at unaligned offset {off}");
        Ok(unsafe { &*(p as *const AtomicU16) })
    }

    #[inline]
    fn atomic_u32(&self, off: usize) -> Result<&AtomicU32, CacheError> {
        let p = self.ptr(off, 4)?;
        debug_assert_eq!(p as usize % 4, 0, "u32 atomic at unaligned offset {off}");
        Ok(unsafe { &*(p as *const AtomicU32) })
    }

    #[inline]
    fn atomic_u64(&self, off: usize) -> Result<&AtomicU64, CacheError> {
        let p = self.ptr(off, 8)?;
        debug_assert_eq!(p as usize % 8, 0, "u64 atomic at unaligned offset {off}");
        Ok(unsafe { &*(p as *const AtomicU64) })
    }

    pub fn cas_u64(&self, off: usize, expected: u64, new: u64) -> Result<bool, CacheError> {
        Ok(self
            .atomic_u64(off)?
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Relaxed fetch-add; returns the previous value. The bus relies on the
    /// status-byte release store, not this, to publish payload bytes.
    pub fn fetch_add_u64(&self, off: usize, delta: u64) -> Result<u64, CacheError> {
        Ok(self.atomic_u64(off)?.fetch_add(delta, Ordering::Relaxed))
    }

    pub fn fetch_add_u32(&self, off: usize, delta: u32) -> Result<u32, CacheError> {
        Ok(self.atomic_u32(off)?.fetch_add(delta, Ordering::AcqRel))
    }

    pub fn fetch_sub_u32(&self, off: usize, delta: u32) -> Result<u32, CacheError> {
        Ok(self.atomic_u32(off)?.fetch_sub(delta, Ordering::AcqRel))
    }

    pub fn load_u8_acquire(&self, off: usize) -> Result<u8, CacheError> {
        Ok(self.atomic_u8(off)?.load(Ordering::Acquire))
    }

    /// Release store of one byte; all prior writes to the region are visible
    /// to an observer that acquires this byte.
    pub fn store_u8_release(&self, off: usize, v: u8) -> Result<(), CacheError> {
        self.atomic_u8(off)?.store(v, Ordering::Release);
        Ok(())
    }

    pub fn load_u16_acquire(&self, off: usize) -> Result<u16, CacheError> {
        Ok(self.atomic_u16(off)?.load(Ordering::Acquire))
    }

    pub fn store_u16_release(&self, off: usize, v: u16) -> Result<(), CacheError> {
        self.atomic_u16(off)?.store(v, Ordering::Release);
        Ok(())
    }

    pub fn load_u32_acquire(&self, off: usize) -> Result<u32, CacheError> {
        Ok(self.atomic_u32(off)?.load(Ordering::Acquire))
    }

    pub fn store_u32_release(&self, off: usize, v: u32) -> Result<(), CacheError> {
        self.atomic_u32(off)?.store(v, Ordering::Release);
        Ok(())
    }

    pub fn load_u64_acquire(&self, off: usize) -> Result<u64, CacheError> {
        Ok(self.atomic_u64(off)?.load(Ordering::Acquire))
    }

    pub fn store_u64_release(&self, off: usize, v: u64) -> Result<(), CacheError> {
        self.atomic_u64(off)?.store(v, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("mapped", &self.map.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn region(len: u64) -> (TempDir, MappedRegion) {
        let dir = TempDir::new().unwrap();
        let r = MappedRegion::new(dir.path().join("region"), len).unwrap();
        (dir, r)
    }

    #[test]
    fn primitives_round_trip_unaligned() {
        let (_d, r) = region(64);
        r.put_u8(0, 0xAB).unwrap();
        r.put_u16(1, 0xBEEF).unwrap();
        r.put_u32(3, 0xDEAD_BEEF).unwrap();
        r.put_u64(7, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(r.get_u8(0).unwrap(), 0xAB);
        assert_eq!(r.get_u16(1).unwrap(), 0xBEEF);
        assert_eq!(r.get_u32(3).unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.get_u64(7).unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn bytes_round_trip_and_bounds() {
        let (_d, r) = region(16);
        r.put_bytes(4, b"PIXELS").unwrap();
        assert_eq!(r.get_bytes(4, 6).unwrap(), b"PIXELS");
        assert!(matches!(
            r.get_bytes(12, 5),
            Err(CacheError::OutOfBounds { .. })
        ));
        assert!(matches!(
            r.put_u64(9, 0),
            Err(CacheError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn atomics_and_close() {
        let (_d, mut r) = region(32);
        assert_eq!(r.fetch_add_u64(0, 5).unwrap(), 0);
        assert_eq!(r.fetch_add_u64(0, 5).unwrap(), 5);
        assert!(r.cas_u64(0, 10, 42).unwrap());
        assert!(!r.cas_u64(0, 10, 0).unwrap());
        assert_eq!(r.load_u64_acquire(0).unwrap(), 42);

        assert_eq!(r.fetch_add_u32(8, 1).unwrap(), 0);
        assert_eq!(r.fetch_sub_u32(8, 1).unwrap(), 1);
        assert_eq!(r.load_u32_acquire(8).unwrap(), 0);

        r.unmap();
        assert!(matches!(r.get_u8(0), Err(CacheError::ClosedRegion)));
        assert!(matches!(r.flush(), Err(CacheError::ClosedRegion)));
    }
}
