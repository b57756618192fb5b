//! Fixed-capacity transfer buffers.

use std::fmt;

/// Zero-initialized memory handed to the OS for one transfer.
///
/// The capacity never changes, so the memory does not move while an
/// operation is in flight. `len` is the number of meaningful bytes: the
/// payload of a write, or what a completed read delivered.
pub struct NativeBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl NativeBuffer {
    /// Allocates `capacity` zeroed bytes.
    pub fn new(capacity: usize) -> NativeBuffer {
        NativeBuffer {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// A buffer holding a copy of `bytes`, sized exactly.
    pub fn from_slice(bytes: &[u8]) -> NativeBuffer {
        NativeBuffer {
            data: bytes.to_vec().into_boxed_slice(),
            len: bytes.len(),
        }
    }

    /// Size of the allocation.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of meaningful bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no bytes are meaningful.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the meaningful length.
    ///
    /// # Panics
    ///
    /// If `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.capacity(),
            "length {} exceeds buffer capacity {}",
            len,
            self.capacity()
        );
        self.len = len;
    }

    /// Clears the contents and the length.
    pub fn zero(&mut self) {
        for b in self.data.iter_mut() {
            *b = 0;
        }
        self.len = 0;
    }

    /// The meaningful bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole allocation, for filling before a write.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    /// Copies the meaningful bytes out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .finish()
    }
}
