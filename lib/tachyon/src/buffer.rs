use std::collections::VecDeque;

/// A fixed-capacity FIFO byte queue. Data is appended at the tail and read
/// from the head; writes beyond the remaining capacity are truncated.
pub struct RingBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    #[inline]
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.capacity - self.data.len()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Appends as much of `bytes` as fits, returning the number of bytes
    /// written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.free_capacity());
        self.data.extend(&bytes[..count]);

        count
    }

    /// Moves up to `out.len()` bytes from the front of the buffer into
    /// `out`, returning the number of bytes read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.data.len());

        for slot in out.iter_mut().take(count) {
            *slot = self.data.pop_front().unwrap();
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut buffer = RingBuffer::new(8);

        assert_eq!(buffer.write(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.free_capacity(), 3);

        let mut out = [0u8; 3];
        assert_eq!(buffer.read(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_write_truncates_at_capacity() {
        let mut buffer = RingBuffer::new(4);

        assert_eq!(buffer.write(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(buffer.free_capacity(), 0);
        assert_eq!(buffer.write(&[7]), 0);

        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_read_from_empty() {
        let mut buffer = RingBuffer::new(4);
        let mut out = [0u8; 2];

        assert_eq!(buffer.read(&mut out), 0);
    }

    #[test]
    fn test_interleaved_wraparound() {
        let mut buffer = RingBuffer::new(4);
        let mut out = [0u8; 2];

        for round in 0..16u8 {
            assert_eq!(buffer.write(&[round, round]), 2);
            assert_eq!(buffer.read(&mut out), 2);
            assert_eq!(out, [round, round]);
        }

        assert!(buffer.is_empty());
    }
}
