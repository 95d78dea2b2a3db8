//! Growable byte buffer used to accumulate outgoing and incoming frames.
//!
//! Capacity grows in whole multiples of the configured increment, so a
//! buffer created with `Buffer::new(1024, 1024)` only ever holds 1024, 2048,
//! 3072, ... bytes of storage. Every mutating call may move the storage;
//! slices obtained before a mutation must not be kept across it.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    capacity: usize,
    increment: usize,
}

impl Buffer {
    /// Allocate an empty buffer with `capacity` bytes of room.
    pub fn new(capacity: usize, increment: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            increment,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn increment(&self) -> usize {
        self.increment
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replace the contents with `bytes`.
    pub fn copy(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.ensure(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Append `bytes`, preserving the existing contents.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure(self.data.len() + bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Overwrite bytes already present at `offset`.
    ///
    /// Returns `false` and leaves the buffer untouched when the range is not
    /// fully inside the current contents.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> bool {
        match offset.checked_add(bytes.len()) {
            Some(end) if end <= self.data.len() => {
                self.data[offset..end].copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    /// Grow (zero filled) or shrink the contents to exactly `len` bytes.
    pub fn resize(&mut self, len: usize) {
        self.ensure(len);
        self.data.resize(len, 0);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Release the storage and reset every field. Safe to call repeatedly.
    pub fn free(&mut self) {
        self.data = Vec::new();
        self.capacity = 0;
        self.increment = 0;
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    fn ensure(&mut self, required: usize) {
        if required <= self.capacity {
            return;
        }
        let new_capacity = if self.increment == 0 {
            required
        } else {
            required.div_ceil(self.increment) * self.increment
        };
        self.data.reserve_exact(new_capacity - self.data.len());
        self.capacity = new_capacity;
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        let capacity = data.len();
        Self {
            data,
            capacity,
            increment: 0,
        }
    }
}
