use crate::error::{Error, Result};
use libc::{
    c_void, close, ftruncate, mmap, munmap, open, MAP_FAILED, MAP_SHARED, O_CREAT, O_RDWR,
    PROT_READ, PROT_WRITE,
};
use std::ffi::CString;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// A fixed-size file mapping shared between processes on one host.
///
/// The region gives the cache a flat byte view of the index, cache and bus
/// files, which typically live on tmpfs. Primitive access is unaligned and
/// in host byte order; callers that need a specific wire order convert at
/// the call site. Atomic accessors require naturally aligned offsets and
/// back the rw-flag/reader-count/version words and the bus limit.
///
/// Concurrent writes to overlapping byte ranges are the caller's
/// responsibility, same as any shared mapping.
pub struct MappedRegion {
    ptr: *mut u8,
    size: usize,
    closed: bool,
}

unsafe impl Send for MappedRegion {}

unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map the file at `path` with the given fixed size, creating it if it
    /// does not exist. An existing file keeps its contents; it is truncated
    /// or extended to exactly `size` bytes.
    #[inline]
    pub fn map(path: impl AsRef<str>, size: usize) -> Result<MappedRegion> {
        if size == 0 {
            return Err(Error::InvalidArgument("region size must be positive"));
        }
        unsafe {
            let c_string = CString::new(path.as_ref())
                .map_err(|_| Error::InvalidArgument("region path contains nul byte"))?;
            let fd = open(c_string.as_ptr(), O_CREAT | O_RDWR, 0o644);
            if fd < 0 {
                return Err(Error::Io(format!("failed to open {}", path.as_ref())));
            }
            let ret = ftruncate(fd, size as i64);
            if ret < 0 {
                let _ = close(fd); // close file descriptor if truncate fail.
                return Err(Error::Io(format!("failed to truncate {}", path.as_ref())));
            }
            let ptr = mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            );
            // the mapping keeps the file open; the descriptor is not needed.
            let _ = close(fd);
            if ptr == MAP_FAILED {
                return Err(Error::Io(format!("failed to map {}", path.as_ref())));
            }
            Ok(MappedRegion {
                ptr: ptr as *mut u8,
                size,
                closed: false,
            })
        }
    }

    /// Returns the fixed byte size of the mapping.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Release the mapping. All subsequent operations fail with
    /// [`Error::ClosedRegion`]. Idempotent; also runs on drop.
    #[inline]
    pub fn unmap(&mut self) {
        if !self.closed {
            unsafe {
                munmap(self.ptr as *mut c_void, self.size);
            }
            self.closed = true;
        }
    }

    #[inline]
    fn addr(&self, offset: usize, len: usize) -> Result<*mut u8> {
        if self.closed {
            return Err(Error::ClosedRegion);
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(unsafe { self.ptr.add(offset) }),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    #[inline]
    pub fn get_u8(&self, offset: usize) -> Result<u8> {
        let p = self.addr(offset, 1)?;
        Ok(unsafe { *p })
    }

    #[inline]
    pub fn put_u8(&self, offset: usize, val: u8) -> Result<()> {
        let p = self.addr(offset, 1)?;
        unsafe { *p = val };
        Ok(())
    }

    #[inline]
    pub fn get_u16(&self, offset: usize) -> Result<u16> {
        let p = self.addr(offset, 2)?;
        Ok(unsafe { (p as *const u16).read_unaligned() })
    }

    #[inline]
    pub fn put_u16(&self, offset: usize, val: u16) -> Result<()> {
        let p = self.addr(offset, 2)?;
        unsafe { (p as *mut u16).write_unaligned(val) };
        Ok(())
    }

    #[inline]
    pub fn get_u32(&self, offset: usize) -> Result<u32> {
        let p = self.addr(offset, 4)?;
        Ok(unsafe { (p as *const u32).read_unaligned() })
    }

    #[inline]
    pub fn put_u32(&self, offset: usize, val: u32) -> Result<()> {
        let p = self.addr(offset, 4)?;
        unsafe { (p as *mut u32).write_unaligned(val) };
        Ok(())
    }

    #[inline]
    pub fn get_u64(&self, offset: usize) -> Result<u64> {
        let p = self.addr(offset, 8)?;
        Ok(unsafe { (p as *const u64).read_unaligned() })
    }

    #[inline]
    pub fn put_u64(&self, offset: usize, val: u64) -> Result<()> {
        let p = self.addr(offset, 8)?;
        unsafe { (p as *mut u64).write_unaligned(val) };
        Ok(())
    }

    /// Borrow `len` bytes of the mapping starting at `offset`.
    ///
    /// The slice is valid only while the mapping is alive; callers must not
    /// retain it across [`MappedRegion::unmap`].
    #[inline]
    pub fn get_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let p = self.addr(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts(p, len) })
    }

    #[inline]
    pub fn put_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        let p = self.addr(offset, src.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), p, src.len()) };
        Ok(())
    }

    #[inline]
    fn atomic_u8(&self, offset: usize) -> Result<&AtomicU8> {
        let p = self.addr(offset, 1)?;
        Ok(unsafe { &*(p as *const AtomicU8) })
    }

    #[inline]
    fn atomic_u16(&self, offset: usize) -> Result<&AtomicU16> {
        debug_assert!(offset % 2 == 0, "atomic u16 offset must be 2-aligned");
        let p = self.addr(offset, 2)?;
        Ok(unsafe { &*(p as *const AtomicU16) })
    }

    #[inline]
    fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        debug_assert!(offset % 4 == 0, "atomic u32 offset must be 4-aligned");
        let p = self.addr(offset, 4)?;
        Ok(unsafe { &*(p as *const AtomicU32) })
    }

    #[inline]
    fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64> {
        debug_assert!(offset % 8 == 0, "atomic u64 offset must be 8-aligned");
        let p = self.addr(offset, 8)?;
        Ok(unsafe { &*(p as *const AtomicU64) })
    }

    /// Compare-and-swap on an aligned 64-bit word. Returns whether the swap
    /// took place.
    #[inline]
    pub fn cas_u64(&self, offset: usize, expected: u64, new: u64) -> Result<bool> {
        let a = self.atomic_u64(offset)?;
        Ok(a
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Compare-and-swap on a status byte. Returns whether the swap took place.
    #[inline]
    pub fn cas_u8(&self, offset: usize, expected: u8, new: u8) -> Result<bool> {
        let a = self.atomic_u8(offset)?;
        Ok(a
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Relaxed fetch-add on an aligned 64-bit word. Returns the previous
    /// value. Payload visibility is synchronized by the status-byte release
    /// store, not by this counter.
    #[inline]
    pub fn fetch_add_u64(&self, offset: usize, delta: u64) -> Result<u64> {
        let a = self.atomic_u64(offset)?;
        Ok(a.fetch_add(delta, Ordering::Relaxed))
    }

    #[inline]
    pub fn fetch_add_u32(&self, offset: usize, delta: u32) -> Result<u32> {
        let a = self.atomic_u32(offset)?;
        Ok(a.fetch_add(delta, Ordering::SeqCst))
    }

    #[inline]
    pub fn fetch_sub_u32(&self, offset: usize, delta: u32) -> Result<u32> {
        let a = self.atomic_u32(offset)?;
        Ok(a.fetch_sub(delta, Ordering::SeqCst))
    }

    #[inline]
    pub fn get_u8_volatile(&self, offset: usize) -> Result<u8> {
        let a = self.atomic_u8(offset)?;
        Ok(a.load(Ordering::Acquire))
    }

    #[inline]
    pub fn put_u8_volatile(&self, offset: usize, val: u8) -> Result<()> {
        let a = self.atomic_u8(offset)?;
        a.store(val, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn get_u16_volatile(&self, offset: usize) -> Result<u16> {
        let a = self.atomic_u16(offset)?;
        Ok(a.load(Ordering::Acquire))
    }

    #[inline]
    pub fn put_u16_volatile(&self, offset: usize, val: u16) -> Result<()> {
        let a = self.atomic_u16(offset)?;
        a.store(val, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn get_u32_volatile(&self, offset: usize) -> Result<u32> {
        let a = self.atomic_u32(offset)?;
        Ok(a.load(Ordering::Acquire))
    }

    #[inline]
    pub fn put_u32_volatile(&self, offset: usize, val: u32) -> Result<()> {
        let a = self.atomic_u32(offset)?;
        a.store(val, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn get_u64_volatile(&self, offset: usize) -> Result<u64> {
        let a = self.atomic_u64(offset)?;
        Ok(a.load(Ordering::Acquire))
    }

    #[inline]
    pub fn put_u64_volatile(&self, offset: usize, val: u64) -> Result<()> {
        let a = self.atomic_u64(offset)?;
        a.store(val, Ordering::Release);
        Ok(())
    }
}

impl Drop for MappedRegion {
    #[inline]
    fn drop(&mut self) {
        self.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn region(dir: &TempDir, name: &str, size: usize) -> MappedRegion {
        let path = dir.path().join(name);
        MappedRegion::map(path.to_str().unwrap(), size).unwrap()
    }

    #[test]
    fn test_region_primitives() {
        let dir = TempDir::new().unwrap();
        let r = region(&dir, "prim", 64);
        r.put_u8(0, 0xAB).unwrap();
        assert_eq!(r.get_u8(0).unwrap(), 0xAB);
        // unaligned access is permitted.
        r.put_u16(1, 0xBEEF).unwrap();
        assert_eq!(r.get_u16(1).unwrap(), 0xBEEF);
        r.put_u32(3, 0xDEAD_BEEF).unwrap();
        assert_eq!(r.get_u32(3).unwrap(), 0xDEAD_BEEF);
        r.put_u64(7, u64::MAX - 1).unwrap();
        assert_eq!(r.get_u64(7).unwrap(), u64::MAX - 1);
        r.put_bytes(20, b"PIXELS").unwrap();
        assert_eq!(r.get_bytes(20, 6).unwrap(), b"PIXELS");
    }

    #[test]
    fn test_region_bounds() {
        let dir = TempDir::new().unwrap();
        let r = region(&dir, "bounds", 16);
        assert!(matches!(
            r.get_u64(9),
            Err(Error::OutOfBounds {
                offset: 9,
                len: 8,
                size: 16
            })
        ));
        assert!(r.put_bytes(10, &[0u8; 7]).is_err());
        assert!(r.put_bytes(10, &[0u8; 6]).is_ok());
    }

    #[test]
    fn test_region_atomics() {
        let dir = TempDir::new().unwrap();
        let r = region(&dir, "atomics", 32);
        assert_eq!(r.fetch_add_u64(0, 5).unwrap(), 0);
        assert_eq!(r.fetch_add_u64(0, 5).unwrap(), 5);
        assert!(r.cas_u64(0, 10, 42).unwrap());
        assert!(!r.cas_u64(0, 10, 43).unwrap());
        assert_eq!(r.get_u64_volatile(0).unwrap(), 42);
        assert_eq!(r.fetch_add_u32(8, 1).unwrap(), 0);
        assert_eq!(r.fetch_sub_u32(8, 1).unwrap(), 1);
        assert_eq!(r.get_u32_volatile(8).unwrap(), 0);
        assert!(r.cas_u8(16, 0, 1).unwrap());
        assert_eq!(r.get_u8_volatile(16).unwrap(), 1);
    }

    #[test]
    fn test_region_closed() {
        let dir = TempDir::new().unwrap();
        let mut r = region(&dir, "closed", 16);
        r.put_u8(0, 1).unwrap();
        r.unmap();
        r.unmap(); // idempotent
        assert!(matches!(r.get_u8(0), Err(Error::ClosedRegion)));
        assert!(matches!(r.put_u64(0, 1), Err(Error::ClosedRegion)));
    }

    #[test]
    fn test_region_reopen_keeps_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reuse");
        let path = path.to_str().unwrap();
        {
            let r = MappedRegion::map(path, 32).unwrap();
            r.put_bytes(0, b"PIXELS").unwrap();
        }
        let r = MappedRegion::map(path, 32).unwrap();
        assert_eq!(r.get_bytes(0, 6).unwrap(), b"PIXELS");
    }
}
