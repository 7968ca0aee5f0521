//! Shareable byte slices carved from a common allocation.
//!
//! A `BytesMut` is the unique writable window into one heap allocation.
//! Splitting the front of the window off with `extract_to` produces a
//! `Bytes`: a cheaply clonable, read-only view that keeps the allocation
//! alive. Once every extracted view has dropped, the `BytesMut` can
//! `try_regenerate` to recover the whole allocation for reuse.
//!
//! # Examples
//!
//! ```
//! use millrace_bytes::BytesMut;
//!
//! let mut slab = BytesMut::zeroed(1024);
//!
//! slab[..4].copy_from_slice(b"abcd");
//! let head = slab.extract_to(4);
//! assert_eq!(&head[..], b"abcd");
//! assert_eq!(slab.len(), 1020);
//!
//! // Adjacent views of the same allocation merge without copying.
//! slab[..4].copy_from_slice(b"efgh");
//! let mut merged = head;
//! merged.try_merge(slab.extract_to(4)).ok().unwrap();
//! assert_eq!(&merged[..], b"abcdefgh");
//!
//! // Dropping the last view makes the allocation recoverable.
//! drop(merged);
//! assert!(slab.try_regenerate());
//! assert_eq!(slab.len(), 1024);
//! ```
#![forbid(missing_docs)]

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// The unique writable window into a shared allocation.
///
/// The window initially spans the whole allocation and shrinks from the
/// front as views are extracted. The allocation itself is freed when the
/// `BytesMut` and every extracted `Bytes` have dropped.
pub struct BytesMut {
    /// Start of the writable window (not the allocation).
    ptr: *mut u8,
    /// Length of the writable window.
    len: usize,
    /// Shared ownership of the underlying allocation.
    sequestered: Arc<Box<[u8]>>,
}

// The allocation is plain memory, and the window is disjoint from every
// extracted view by construction.
unsafe impl Send for BytesMut {}

impl BytesMut {
    /// Sequesters an allocation and opens a window over all of it.
    pub fn from(mut bytes: Box<[u8]>) -> Self {
        Self {
            ptr: bytes.as_mut_ptr(),
            len: bytes.len(),
            sequestered: Arc::new(bytes),
        }
    }

    /// Allocates `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from(vec![0u8; len].into_boxed_slice())
    }

    /// The length of the remaining writable window.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the writable window is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The length of the underlying allocation.
    pub fn capacity(&self) -> usize {
        self.sequestered.len()
    }

    /// Splits `[0, index)` off the front of the window as a shared view.
    ///
    /// The window advances past the extracted bytes. Panics if `index`
    /// exceeds the window length.
    pub fn extract_to(&mut self, index: usize) -> Bytes {
        assert!(index <= self.len);
        let result = Bytes {
            ptr: self.ptr,
            len: index,
            sequestered: Arc::clone(&self.sequestered),
        };
        unsafe {
            self.ptr = self.ptr.add(index);
        }
        self.len -= index;
        result
    }

    /// Attempts to recover the full allocation as the writable window.
    ///
    /// Succeeds exactly when no extracted view is still alive. On success
    /// the window is reset to span the whole allocation.
    pub fn try_regenerate(&mut self) -> bool {
        if let Some(bytes) = Arc::get_mut(&mut self.sequestered) {
            self.ptr = bytes.as_mut_ptr();
            self.len = bytes.len();
            true
        } else {
            false
        }
    }

    /// A shared read view of `[offset, offset + len)` of the *allocation*.
    ///
    /// # Safety
    ///
    /// The range must lie within the allocation, and the caller must
    /// guarantee that no write to the range happens while the view (or any
    /// clone of it) is alive. Ring-style allocators use this to hand out
    /// views behind their write cursor.
    pub unsafe fn view(&self, offset: usize, len: usize) -> Bytes {
        assert!(offset + len <= self.sequestered.len());
        Bytes {
            ptr: self.sequestered.as_ptr().add(offset) as *mut u8,
            len,
            sequestered: Arc::clone(&self.sequestered),
        }
    }

    /// The offset of the writable window within the allocation.
    pub fn offset(&self) -> usize {
        (self.ptr as usize) - (self.sequestered.as_ptr() as usize)
    }
}

impl Deref for BytesMut {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for BytesMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// A shared, read-only view into an allocation owned jointly with its
/// `BytesMut` and every other view.
pub struct Bytes {
    ptr: *mut u8,
    len: usize,
    sequestered: Arc<Box<[u8]>>,
}

// Views never overlap the writable window, and the bytes they cover are
// not written again until the allocation regenerates.
unsafe impl Send for Bytes {}
unsafe impl Sync for Bytes {}

impl Bytes {
    /// The length of this view.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when this view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Splits `[0, index)` off the front as its own view.
    pub fn extract_to(&mut self, index: usize) -> Bytes {
        assert!(index <= self.len);
        let result = Bytes {
            ptr: self.ptr,
            len: index,
            sequestered: Arc::clone(&self.sequestered),
        };
        unsafe {
            self.ptr = self.ptr.add(index);
        }
        self.len -= index;
        result
    }

    /// Drops `n` bytes from the front of the view.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len);
        unsafe {
            self.ptr = self.ptr.add(n);
        }
        self.len -= n;
    }

    /// Shortens the view to its first `n` bytes.
    pub fn truncate(&mut self, n: usize) {
        assert!(n <= self.len);
        self.len = n;
    }

    /// Absorbs `other` if it continues this view in the same allocation.
    ///
    /// Returns `other` unchanged when the two views are not physically
    /// adjacent slices of one allocation.
    pub fn try_merge(&mut self, other: Bytes) -> Result<(), Bytes> {
        let adjacent = Arc::ptr_eq(&self.sequestered, &other.sequestered)
            && unsafe { self.ptr.add(self.len) } == other.ptr;
        if adjacent {
            self.len += other.len;
            Ok(())
        } else {
            Err(other)
        }
    }

    /// True when both views share one allocation.
    pub fn same_allocation(&self, other: &Bytes) -> bool {
        Arc::ptr_eq(&self.sequestered, &other.sequestered)
    }

    /// The offset of this view within its allocation.
    pub fn offset(&self) -> usize {
        (self.ptr as usize) - (self.sequestered.as_ptr() as usize)
    }

    /// Grows the view backwards over `n` bytes that precede it.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the `n` bytes immediately before the
    /// view lie within the allocation, hold valid data, and are not written
    /// while the grown view is alive.
    pub unsafe fn expand_front(&mut self, n: usize) {
        assert!(n <= self.offset());
        self.ptr = self.ptr.sub(n);
        self.len += n;
    }
}

impl Clone for Bytes {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr,
            len: self.len,
            sequestered: Arc::clone(&self.sequestered),
        }
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl std::fmt::Debug for Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bytes").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_and_regenerate() {
        let mut slab = BytesMut::zeroed(64);
        let a = slab.extract_to(16);
        let b = slab.extract_to(16);
        assert_eq!(slab.len(), 32);
        assert!(!slab.try_regenerate());
        drop(a);
        drop(b);
        assert!(slab.try_regenerate());
        assert_eq!(slab.len(), 64);
    }

    #[test]
    fn merge_requires_adjacency() {
        let mut slab = BytesMut::zeroed(64);
        let mut a = slab.extract_to(8);
        let _gap = slab.extract_to(8);
        let c = slab.extract_to(8);
        // `c` does not continue `a`; the merge hands it back.
        let c = a.try_merge(c).unwrap_err();
        assert_eq!(c.len(), 8);

        let mut other = BytesMut::zeroed(64);
        let d = other.extract_to(8);
        assert!(a.try_merge(d).is_err());
    }

    #[test]
    fn merge_joins_adjacent_views() {
        let mut slab = BytesMut::zeroed(64);
        slab[..4].copy_from_slice(b"wxyz");
        let mut a = slab.extract_to(2);
        let b = slab.extract_to(2);
        a.try_merge(b).ok().unwrap();
        assert_eq!(&a[..], b"wxyz");
    }

    #[test]
    fn advance_and_truncate() {
        let mut slab = BytesMut::zeroed(16);
        slab.copy_from_slice(b"0123456789abcdef");
        let mut v = slab.extract_to(16);
        v.advance(4);
        v.truncate(8);
        assert_eq!(&v[..], b"456789ab");
    }

    #[test]
    fn ring_views_alias_the_allocation() {
        let mut arena = BytesMut::zeroed(32);
        arena[4..8].copy_from_slice(b"ring");
        let v = unsafe { arena.view(4, 4) };
        assert_eq!(&v[..], b"ring");
        // The writable window is unaffected by carved views.
        assert_eq!(arena.len(), 32);
        assert!(!arena.try_regenerate());
        drop(v);
        assert!(arena.try_regenerate());
    }
}
