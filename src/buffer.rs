//! Byte buffer with an explicit logical size and a consumer-controlled offset.
//!
//! Every asynchronous I/O task owns one of these: receives append at
//! `offset`, protocol readers walk `offset` forward while parsing, and the
//! stdin line assembler uses it as a scan cursor. The shrink policy decides
//! whether lowering the logical size may release capacity.

/// What `realloc` may do with spare capacity when the buffer shrinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkPolicy {
    /// Capacity may be released when the logical size drops.
    Shrinkable,
    /// Capacity only ever grows; shrinking keeps the allocation.
    NonShrinkable,
}

/// Growable byte region with `user_size` (logical length), a parse/append
/// `offset` clamped to `[0, user_size]`, and a shrink policy.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    offset: usize,
    policy: ShrinkPolicy,
}

impl Buffer {
    pub fn new(cap: usize, policy: ShrinkPolicy) -> Self {
        Self {
            data: vec![0u8; cap],
            offset: 0,
            policy,
        }
    }

    /// Logical size in bytes.
    pub fn user_size(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Sets the offset, clamping to `user_size`.
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset.min(self.data.len());
    }

    /// Resizes the logical region to `new_size`.
    ///
    /// Bytes in `[0, min(old, new))` are preserved; grown space is zeroed;
    /// `offset` is clamped to the new size. A non-shrinkable buffer never
    /// releases capacity; a shrinkable one returns spare capacity to the
    /// allocator when shrinking.
    pub fn realloc(&mut self, new_size: usize) {
        self.data.resize(new_size, 0);

        if self.policy == ShrinkPolicy::Shrinkable {
            self.data.shrink_to_fit();
        }

        self.offset = self.offset.min(new_size);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realloc_preserves_prefix() {
        let mut b = Buffer::new(4, ShrinkPolicy::NonShrinkable);
        b.bytes_mut().copy_from_slice(&[1, 2, 3, 4]);

        b.realloc(8);
        assert_eq!(&b.bytes()[..4], &[1, 2, 3, 4]);
        assert_eq!(&b.bytes()[4..], &[0, 0, 0, 0]);

        b.realloc(2);
        assert_eq!(b.bytes(), &[1, 2]);

        b.realloc(6);
        assert_eq!(&b.bytes()[..2], &[1, 2]);
    }

    #[test]
    fn test_non_shrinkable_capacity_is_monotonic() {
        let mut b = Buffer::new(64, ShrinkPolicy::NonShrinkable);
        let cap = b.capacity();

        b.realloc(0);
        assert_eq!(b.user_size(), 0);
        assert!(b.capacity() >= cap);

        b.realloc(32);
        assert!(b.capacity() >= cap);
    }

    #[test]
    fn test_shrinkable_releases_payload() {
        let mut b = Buffer::new(64, ShrinkPolicy::Shrinkable);
        b.realloc(0);
        assert_eq!(b.user_size(), 0);
        assert_eq!(b.capacity(), 0);
    }

    #[test]
    fn test_offset_clamped_by_realloc() {
        let mut b = Buffer::new(10, ShrinkPolicy::NonShrinkable);
        b.set_offset(7);
        assert_eq!(b.offset(), 7);

        b.realloc(4);
        assert_eq!(b.offset(), 4);

        b.set_offset(100);
        assert_eq!(b.offset(), 4);
    }
}
