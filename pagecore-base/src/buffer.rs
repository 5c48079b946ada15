//! Copy-on-write shared byte buffer
//!
//! Cache payloads move between layers as [`SharedBuffer`] values: a
//! ref-counted backing store plus a per-handle view (`skip`, `len`).
//! Trimming either end of the view is O(1) and never disturbs other
//! handles over the same storage; mutation clones the backing store
//! first unless this handle is the only owner.

use std::sync::Arc;

use crate::{Error, Result};

/// A reference-counted, copy-on-write sequence of octets.
///
/// Cloning a `SharedBuffer` is cheap: both clones share the backing
/// store until one of them mutates. `remove_prefix`/`remove_suffix`
/// only adjust the view and are always cheap.
#[derive(Clone, Debug)]
pub struct SharedBuffer {
    storage: Arc<Vec<u8>>,
    skip: usize,
    len: usize,
}

impl SharedBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            storage: Arc::new(Vec::new()),
            skip: 0,
            len: 0,
        }
    }

    /// Create a buffer holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            storage: Arc::new(bytes.to_vec()),
            skip: 0,
            len: bytes.len(),
        }
    }

    /// The bytes visible through this handle's view.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.skip..self.skip + self.len]
    }

    /// Length of the visible view.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True iff no other handle shares the backing store.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.storage) == 1
    }

    /// Ensure this handle exclusively owns storage that exactly matches
    /// its view, cloning if shared or trimmed.
    fn make_unique(&mut self) {
        let trimmed = self.skip != 0 || self.len != self.storage.len();
        if !self.is_unique() || trimmed {
            let copy = self.as_slice().to_vec();
            self.len = copy.len();
            self.skip = 0;
            self.storage = Arc::new(copy);
        }
    }

    /// Grow the view by `n` zero bytes and return a mutable slice over
    /// the new region.
    pub fn extend(&mut self, n: usize) -> &mut [u8] {
        self.make_unique();
        let storage = Arc::get_mut(&mut self.storage)
            .unwrap_or_else(|| unreachable!("storage is unique after make_unique"));
        let old_len = storage.len();
        storage.resize(old_len + n, 0);
        self.len += n;
        &mut storage[old_len..]
    }

    /// Append `bytes` to the view, cloning the backing store first if
    /// it is shared.
    pub fn append(&mut self, bytes: &[u8]) {
        self.make_unique();
        let storage = Arc::get_mut(&mut self.storage)
            .unwrap_or_else(|| unreachable!("storage is unique after make_unique"));
        storage.extend_from_slice(bytes);
        self.len += bytes.len();
    }

    /// Overwrite `bytes` at `offset` within the current view.
    ///
    /// The write must fit inside the view; this does not grow it.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.len {
            return Err(Error::BufferRange {
                offset,
                len: self.len,
            });
        }
        self.make_unique();
        let storage = Arc::get_mut(&mut self.storage)
            .unwrap_or_else(|| unreachable!("storage is unique after make_unique"));
        storage[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Drop `n` bytes from the front of the view. View-local and O(1).
    pub fn remove_prefix(&mut self, n: usize) {
        let n = n.min(self.len);
        self.skip += n;
        self.len -= n;
    }

    /// Drop `n` bytes from the back of the view. View-local and O(1);
    /// other handles whose views extend further are unaffected.
    pub fn remove_suffix(&mut self, n: usize) {
        self.len -= n.min(self.len);
    }

    /// Stop sharing: after this call, `is_unique()` holds and the view
    /// spans the whole backing store.
    pub fn detach(&mut self) {
        self.make_unique();
    }
}

impl Default for SharedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for SharedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for SharedBuffer {}

impl From<Vec<u8>> for SharedBuffer {
    fn from(v: Vec<u8>) -> Self {
        let len = v.len();
        Self {
            storage: Arc::new(v),
            skip: 0,
            len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_view() {
        let mut buf = SharedBuffer::new();
        assert!(buf.is_empty());
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.as_slice(), b"hello world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn test_clone_shares_storage() {
        let buf = SharedBuffer::from_bytes(b"shared");
        let clone = buf.clone();
        assert!(!buf.is_unique());
        assert!(!clone.is_unique());
        drop(clone);
        assert!(buf.is_unique());
    }

    #[test]
    fn test_append_copies_when_shared() {
        let mut a = SharedBuffer::from_bytes(b"base");
        let b = a.clone();
        a.append(b"-more");
        assert_eq!(a.as_slice(), b"base-more");
        assert_eq!(b.as_slice(), b"base");
    }

    #[test]
    fn test_remove_suffix_is_view_local() {
        let full = SharedBuffer::from_bytes(b"payloadS");
        let mut trimmed = full.clone();
        trimmed.remove_suffix(1);
        assert_eq!(trimmed.as_slice(), b"payload");
        assert_eq!(full.as_slice(), b"payloadS");
    }

    #[test]
    fn test_remove_prefix() {
        let mut buf = SharedBuffer::from_bytes(b"PCACHE/key");
        buf.remove_prefix(7);
        assert_eq!(buf.as_slice(), b"key");
        buf.remove_prefix(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_write_at() {
        let mut buf = SharedBuffer::from_bytes(b"B\0\0\0\0body");
        buf.write_at(1, &4u32.to_le_bytes()).unwrap();
        assert_eq!(&buf.as_slice()[1..5], &4u32.to_le_bytes());
        assert!(buf.write_at(6, b"overrun").is_err());
    }

    #[test]
    fn test_append_after_trim_reclaims_view() {
        let mut buf = SharedBuffer::from_bytes(b"abcdef");
        buf.remove_prefix(2);
        buf.remove_suffix(1);
        buf.append(b"!");
        assert_eq!(buf.as_slice(), b"cde!");
    }

    #[test]
    fn test_extend_zero_fills() {
        let mut buf = SharedBuffer::from_bytes(b"x");
        let region = buf.extend(3);
        region.copy_from_slice(b"yzw");
        assert_eq!(buf.as_slice(), b"xyzw");
    }

    #[test]
    fn test_detach() {
        let mut buf = SharedBuffer::from_bytes(b"data");
        let other = buf.clone();
        buf.detach();
        assert!(buf.is_unique());
        assert_eq!(buf.as_slice(), other.as_slice());
    }
}
