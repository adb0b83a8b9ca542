//! Shared memory region accessor
//!
//! All shared indices and payload bytes are accessed through [`SharedRegion`]
//! so that memory ordering and cache maintenance stay in one place. Callers
//! never see raw addresses.

use crate::error::{ChannelError, Result};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// Cache maintenance hooks for targets without hardware coherency.
///
/// On coherent hosts (and for in-memory test regions) [`NoCacheOps`] is used.
/// A real cross-core port supplies an implementation backed by the platform's
/// data-cache flush/invalidate operations.
pub trait CacheOps: Send + Sync {
    /// Write back the given byte range from the local cache to memory
    fn flush(&self, offset: usize, len: usize);
    /// Drop the given byte range from the local cache
    fn invalidate(&self, offset: usize, len: usize);
}

/// No-op cache maintenance for coherent memory
pub struct NoCacheOps;

impl CacheOps for NoCacheOps {
    fn flush(&self, _offset: usize, _len: usize) {}
    fn invalidate(&self, _offset: usize, _len: usize) {}
}

struct RegionInner {
    ptr: NonNull<u8>,
    len: usize,
    cache: Arc<dyn CacheOps>,
    // Keeps heap-backed test regions alive; raw regions own nothing.
    // Backed by u64 words so the base is aligned for the index/header cells.
    _owned: Option<Box<[u64]>>,
}

// Safety: access is mediated by atomics, fences and the single-writer
// contract documented on the ring and block layers.
unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}

/// Handle to a fixed shared memory region (or a sub-view of one).
///
/// Cloning is cheap and shares the underlying mapping, which is how the two
/// halves of an in-process loopback link see the same bytes.
#[derive(Clone)]
pub struct SharedRegion {
    inner: Arc<RegionInner>,
    offset: usize,
    len: usize,
}

impl SharedRegion {
    /// Create a zero-filled heap-backed region.
    ///
    /// This is the in-memory double used by tests and same-process links.
    pub fn new_in_memory(len: usize) -> Self {
        let mut owned = vec![0u64; (len + 7) / 8].into_boxed_slice();
        let ptr = NonNull::new(owned.as_mut_ptr() as *mut u8)
            .expect("boxed slice pointer is never null");
        Self {
            inner: Arc::new(RegionInner {
                ptr,
                len,
                cache: Arc::new(NoCacheOps),
                _owned: Some(owned),
            }),
            offset: 0,
            len,
        }
    }

    /// Wrap a fixed memory region resolved by the host configuration.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable and writable bytes that stay valid
    /// for the lifetime of the returned handle and all its clones, and the
    /// region must not be accessed except through `SharedRegion` handles.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize, cache: Arc<dyn CacheOps>) -> Result<Self> {
        // The atomic index cells and u64 header cells need an aligned base.
        if ptr as usize % 8 != 0 {
            return Err(ChannelError::InvalidArgument(format!(
                "region base {:p} is not 8-byte aligned",
                ptr
            )));
        }
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| ChannelError::InvalidArgument("null region pointer".to_string()))?;
        Ok(Self {
            inner: Arc::new(RegionInner {
                ptr,
                len,
                cache,
                _owned: None,
            }),
            offset: 0,
            len,
        })
    }

    /// Length of this view in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether this view is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Narrow to a sub-view of this region
    pub fn view(&self, offset: usize, len: usize) -> Result<SharedRegion> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(ChannelError::InvalidArgument(format!(
                "view {}+{} exceeds region of {} bytes",
                offset, len, self.len
            )));
        }
        Ok(SharedRegion {
            inner: Arc::clone(&self.inner),
            offset: self.offset + offset,
            len,
        })
    }

    fn byte_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        debug_assert!(self.offset + offset <= self.inner.len);
        unsafe { self.inner.ptr.as_ptr().add(self.offset + offset) }
    }

    /// Atomic view of a 4-byte index cell at `offset`
    pub fn index_cell(&self, offset: usize) -> &AtomicU32 {
        assert!(offset + 4 <= self.len, "index cell out of range");
        assert_eq!((self.offset + offset) % 4, 0, "index cell misaligned");
        unsafe { &*(self.byte_ptr(offset) as *const AtomicU32) }
    }

    /// Read a naturally aligned u64 field (block header)
    pub fn read_u64(&self, offset: usize) -> u64 {
        assert!(offset + 8 <= self.len, "u64 read out of range");
        assert_eq!((self.offset + offset) % 8, 0, "u64 cell misaligned");
        unsafe { (self.byte_ptr(offset) as *const u64).read_volatile() }
    }

    /// Write a naturally aligned u64 field (block header)
    pub fn write_u64(&self, offset: usize, value: u64) {
        assert!(offset + 8 <= self.len, "u64 write out of range");
        assert_eq!((self.offset + offset) % 8, 0, "u64 cell misaligned");
        unsafe { (self.byte_ptr(offset) as *mut u64).write_volatile(value) }
    }

    /// Copy bytes out of the region
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len, "read out of range");
        unsafe {
            std::ptr::copy_nonoverlapping(self.byte_ptr(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Copy bytes into the region
    pub fn write_at(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len, "write out of range");
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.byte_ptr(offset), src.len());
        }
    }

    /// Borrow a byte range directly (zero-copy receive path).
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the peer does not reuse the range for
    /// the lifetime of the slice (i.e. the backing block run is still owned).
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len, "byte view out of range");
        std::slice::from_raw_parts(self.byte_ptr(offset), len)
    }

    /// Borrow a byte range mutably (zero-copy transmit path).
    ///
    /// # Safety
    ///
    /// The caller must hold an exclusive grant over the backing block run.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.len, "byte view out of range");
        std::slice::from_raw_parts_mut(self.byte_ptr(offset), len)
    }

    /// Write back a byte range of this view from the local cache
    pub fn flush(&self, offset: usize, len: usize) {
        self.inner.cache.flush(self.offset + offset, len);
    }

    /// Drop a byte range of this view from the local cache
    pub fn invalidate(&self, offset: usize, len: usize) {
        self.inner.cache.invalidate(self.offset + offset, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_in_memory_region_roundtrip() {
        let region = SharedRegion::new_in_memory(64);
        region.write_at(8, b"hello");
        let mut buf = [0u8; 5];
        region.read_at(8, &mut buf);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_views_share_backing_memory() {
        let region = SharedRegion::new_in_memory(64);
        let a = region.view(16, 16).unwrap();
        let b = region.view(16, 16).unwrap();
        a.write_at(0, &[7; 4]);
        let mut buf = [0u8; 4];
        b.read_at(0, &mut buf);
        assert_eq!(buf, [7; 4]);
    }

    #[test]
    fn test_view_bounds_are_checked() {
        let region = SharedRegion::new_in_memory(32);
        assert!(region.view(16, 17).is_err());
        assert!(region.view(33, 0).is_err());
        assert!(region.view(0, 32).is_ok());
    }

    #[test]
    fn test_index_cell_is_atomic_view() {
        let region = SharedRegion::new_in_memory(16);
        region.index_cell(4).store(0xDEAD_BEEF, Ordering::Release);
        let mut buf = [0u8; 4];
        region.read_at(4, &mut buf);
        assert_eq!(u32::from_ne_bytes(buf), 0xDEAD_BEEF);
    }

    #[test]
    fn test_from_raw_requires_aligned_base() {
        let mut backing = vec![0u64; 8];
        let base = backing.as_mut_ptr() as *mut u8;
        let cache: Arc<dyn CacheOps> = Arc::new(NoCacheOps);

        let aligned = unsafe { SharedRegion::from_raw(base, 64, Arc::clone(&cache)) };
        assert!(aligned.is_ok());

        let misaligned = unsafe { SharedRegion::from_raw(base.add(1), 32, cache) };
        assert!(matches!(misaligned, Err(ChannelError::InvalidArgument(_))));
    }

    #[test]
    fn test_u64_header_cell() {
        let region = SharedRegion::new_in_memory(32);
        region.write_u64(16, 1234);
        assert_eq!(region.read_u64(16), 1234);
    }
}
