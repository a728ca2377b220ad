//! Linear byte accumulator between the feed path and the drain task

/// Fixed-capacity buffer of not-yet-written source-format audio
///
/// Valid bytes always occupy `[0, len)`. Appends land at `len`, consumption
/// pops from the front and shifts the remainder down. The type is not
/// synchronized; the render session only touches it while holding its gate.
pub struct RingBuffer {
    buffer: Box<[u8]>,
    len: usize,
}

impl RingBuffer {
    /// Create an empty buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Create a buffer already filled with silence
    pub fn silent(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            len: capacity,
        }
    }

    /// Get the buffer capacity
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of valid bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buffer.len()
    }

    /// Bytes that can still be appended
    pub fn free(&self) -> usize {
        self.buffer.len() - self.len
    }

    /// Valid content
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Append as much of `data` as fits
    ///
    /// Returns the number of bytes accepted. Callers keep the rest and
    /// resubmit it once space has been freed.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let copied = data.len().min(self.free());
        self.buffer[self.len..self.len + copied].copy_from_slice(&data[..copied]);
        self.len += copied;
        copied
    }

    /// Zero-fill up to `to_len` bytes of valid content
    ///
    /// Does nothing unless `len < to_len <= capacity`.
    pub fn pad_with_silence(&mut self, to_len: usize) {
        if self.len < to_len && to_len <= self.buffer.len() {
            self.buffer[self.len..to_len].fill(0);
            self.len = to_len;
        }
    }

    /// Drop `n` bytes from the front, shifting the rest down
    pub fn pop_front(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if n >= self.len {
            self.len = 0;
            return;
        }
        self.buffer.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// Move the valid content to the tail and fill the head with silence
    ///
    /// Afterwards the buffer is full, so one buffer's worth of latency sits in
    /// front of the content.
    pub fn shift_to_tail(&mut self) {
        let capacity = self.buffer.len();
        let silence = capacity - self.len;
        if silence == 0 {
            return;
        }
        self.buffer.copy_within(0..self.len, silence);
        self.buffer[..silence].fill(0);
        self.len = capacity;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .finish()
    }
}
