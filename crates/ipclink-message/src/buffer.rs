use bytes::Bytes;

/// Bytes held inline before spilling to the heap.
pub const INLINE_CAPACITY: usize = 512;

const MIN_OUT_OF_LINE_CAPACITY: usize = 2 * INLINE_CAPACITY;

enum Storage {
    Inline([u8; INLINE_CAPACITY]),
    OutOfLine(Vec<u8>),
}

/// Small-buffer-optimized byte buffer backing an [`Encoder`](crate::Encoder).
///
/// Small messages live in an inline array; the first write that does not
/// fit promotes the contents to a heap allocation. Either way
/// [`as_slice`](Self::as_slice) exposes exactly `len()` bytes.
pub struct MessageBuffer {
    storage: Storage,
    len: usize,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self {
            storage: Storage::Inline([0u8; INLINE_CAPACITY]),
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buffer = Self::new();
        buffer.reserve(capacity);
        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.storage, Storage::Inline(_))
    }

    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Inline(_) => INLINE_CAPACITY,
            Storage::OutOfLine(vec) => vec.capacity(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Inline(array) => &array[..self.len],
            Storage::OutOfLine(vec) => &vec[..self.len],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Inline(array) => &mut array[..self.len],
            Storage::OutOfLine(vec) => &mut vec[..self.len],
        }
    }

    /// Make room for at least `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        let needed = self.len.saturating_add(additional);
        match &mut self.storage {
            Storage::Inline(array) => {
                if needed > INLINE_CAPACITY {
                    let mut vec = Vec::with_capacity(needed.max(MIN_OUT_OF_LINE_CAPACITY));
                    vec.extend_from_slice(&array[..self.len]);
                    self.storage = Storage::OutOfLine(vec);
                }
            }
            Storage::OutOfLine(vec) => {
                vec.reserve(needed.saturating_sub(vec.len()));
            }
        }
    }

    /// Append `size` zeroed bytes starting at the next multiple of
    /// `alignment`, and return them for writing.
    ///
    /// Padding inserted to reach the aligned offset is zeroed too.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn grow(&mut self, alignment: usize, size: usize) -> &mut [u8] {
        assert!(
            alignment.is_power_of_two(),
            "alignment must be a power of two, got {alignment}"
        );
        let start = (self.len + alignment - 1) & !(alignment - 1);
        let end = start + size;
        self.reserve(end - self.len);

        match &mut self.storage {
            Storage::Inline(array) => array[self.len..end].fill(0),
            Storage::OutOfLine(vec) => {
                vec.truncate(self.len);
                vec.resize(end, 0);
            }
        }
        self.len = end;
        &mut self.as_mut_slice()[start..end]
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.grow(1, bytes.len()).copy_from_slice(bytes);
    }

    /// Hand the contents over as an immutable, shareable buffer.
    pub fn into_bytes(self) -> Bytes {
        match self.storage {
            Storage::Inline(array) => Bytes::copy_from_slice(&array[..self.len]),
            Storage::OutOfLine(mut vec) => {
                vec.truncate(self.len);
                Bytes::from(vec)
            }
        }
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("len", &self.len)
            .field("inline", &self.is_inline())
            .finish()
    }
}
