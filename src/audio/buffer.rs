//! Fixed-capacity byte FIFO for outgoing audio
//!
//! A circular buffer with read/write positions taken modulo the capacity, so
//! draining a chunk never shifts the remaining data. The buffer itself is not
//! synchronized; the streaming engine keeps it behind its session mutex.

/// Circular byte buffer
pub struct RingBuffer {
    data: Box<[u8]>,
    /// Index of the oldest byte
    head: usize,
    /// Number of stored bytes
    len: usize,
}

impl RingBuffer {
    /// Create a new ring buffer with the specified capacity in bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    /// Append as much of `bytes` as fits, returning the number stored
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.free());
        if count == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let tail = (self.head + self.len) % capacity;
        let first = count.min(capacity - tail);
        self.data[tail..tail + first].copy_from_slice(&bytes[..first]);
        self.data[..count - first].copy_from_slice(&bytes[first..count]);

        self.len += count;
        count
    }

    /// Copy the oldest bytes into `out` without removing them
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.len);
        if count == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let first = count.min(capacity - self.head);
        out[..first].copy_from_slice(&self.data[self.head..self.head + first]);
        out[first..count].copy_from_slice(&self.data[..count - first]);
        count
    }

    /// Drop up to `count` of the oldest bytes
    pub fn consume(&mut self, count: usize) -> usize {
        let count = count.min(self.len);
        if count == 0 {
            return 0;
        }
        self.head = (self.head + count) % self.capacity();
        self.len -= count;
        if self.len == 0 {
            self.head = 0;
        }
        count
    }

    /// Discard all stored bytes
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Get current fill level in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get buffer capacity
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Space left before the buffer is full
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ring_buffer_basic() {
        let mut buffer = RingBuffer::new(8);

        assert_eq!(buffer.push(&[1, 2, 3]), 3);
        assert_eq!(buffer.push(&[4, 5]), 2);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.free(), 3);

        let mut out = [0u8; 4];
        assert_eq!(buffer.peek(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.consume(4), 4);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_wraparound() {
        let mut buffer = RingBuffer::new(6);
        buffer.push(&[0, 1, 2, 3]);
        buffer.consume(3);

        // Tail wraps past the end of storage.
        assert_eq!(buffer.push(&[4, 5, 6, 7, 8]), 5);
        assert_eq!(buffer.free(), 0);

        let mut out = [0u8; 6];
        assert_eq!(buffer.peek(&mut out), 6);
        assert_eq!(out, [3, 4, 5, 6, 7, 8]);
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn test_short_push_and_drain() {
        let mut buffer = RingBuffer::new(4);
        assert_eq!(buffer.push(&[9; 6]), 4);
        assert_eq!(buffer.push(&[1]), 0);

        let mut out = [0u8; 8];
        assert_eq!(buffer.peek(&mut out), 4);
        assert_eq!(buffer.consume(8), 4);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_capacity() {
        let mut buffer = RingBuffer::default();
        assert_eq!(buffer.push(&[1]), 0);
        assert_eq!(buffer.consume(1), 0);
        assert_eq!(buffer.free(), 0);
    }

    proptest! {
        // Interleaved pushes and drains keep the fill level in range and
        // deliver bytes in the order they were pushed.
        #[test]
        fn prop_fifo_within_capacity(
            capacity in 1usize..64,
            ops in proptest::collection::vec((any::<bool>(), 0usize..40), 1..200),
        ) {
            let mut buffer = RingBuffer::new(capacity);
            let mut next = 0u8;
            let mut expected = std::collections::VecDeque::new();
            let mut drained = Vec::new();

            for (is_push, n) in ops {
                if is_push {
                    let bytes: Vec<u8> = (0..n).map(|_| { next = next.wrapping_add(1); next }).collect();
                    let stored = buffer.push(&bytes);
                    expected.extend(bytes[..stored].iter().copied());
                } else {
                    let mut out = vec![0u8; n];
                    let got = buffer.peek(&mut out);
                    prop_assert_eq!(buffer.consume(got), got);
                    drained.extend_from_slice(&out[..got]);
                }
                prop_assert!(buffer.len() <= buffer.capacity());
            }

            let want: Vec<u8> = expected.iter().take(drained.len()).copied().collect();
            prop_assert_eq!(drained, want);
        }
    }
}
