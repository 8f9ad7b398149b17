//! # Ring Buffer
//!
//! Fixed-capacity byte FIFO used as the transmit and receive buffer of every
//! connection.
//!
//! ## Design
//!
//! 1. **Static Allocation**: storage is an inline `[u8; SIZE]`, so a buffer
//!    never touches the heap and can live in a `static`.
//!
//! 2. **Peek/Flush**: data can be copied out without advancing the read
//!    cursor and released later. The connection layer peeks a chunk for
//!    transmission and only flushes it once the peer has stored it, so a
//!    retry resends the identical window.
//!
//! 3. **One Reserved Slot**: a buffer of `SIZE` bytes holds at most
//!    `SIZE - 1` bytes so that `r == w` always means empty.
//!
//! ## Memory Layout
//!
//! ```text
//! ┌──────────┬───────────────────────┬──────────────────────────┐
//! │ consumed │    readable data      │        writable          │
//! │  region  │  (peek / read/ flush) │        region            │
//! └──────────┴───────────────────────┴──────────────────────────┘
//!            ▲                       ▲
//!            r                       w
//! ```
//!
//! Cursors are atomics loaded with `Acquire` and stored with `Release`, so a
//! receive interrupt acting as the single producer and the main loop acting
//! as the single consumer always observe a consistent cursor pair.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-capacity single-producer single-consumer byte queue.
///
/// # Example
///
/// ```rust
/// use comms::buffer::RingBuffer;
///
/// let mut buffer = RingBuffer::<16>::new();
/// assert_eq!(buffer.write(b"hello"), 5);
///
/// let mut chunk = [0u8; 3];
/// assert_eq!(buffer.peek(&mut chunk), 3);
/// assert_eq!(&chunk, b"hel");
/// assert_eq!(buffer.flush(3), 3);
/// assert_eq!(buffer.can_read(), 2);
/// ```
pub struct RingBuffer<const SIZE: usize> {
    data: [u8; SIZE],
    /// Read cursor, always `< SIZE`
    r: AtomicUsize,
    /// Write cursor, always `< SIZE`
    w: AtomicUsize,
}

impl<const SIZE: usize> RingBuffer<SIZE> {
    const VALID_SIZE: () = assert!(SIZE >= 2, "ring buffer needs at least two slots");

    /// Create a new empty buffer
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_SIZE;
        Self {
            data: [0u8; SIZE],
            r: AtomicUsize::new(0),
            w: AtomicUsize::new(0),
        }
    }

    /// Number of bytes the buffer can hold at once
    #[inline]
    pub const fn capacity(&self) -> usize {
        SIZE - 1
    }

    #[inline]
    fn cursors(&self) -> (usize, usize) {
        (self.r.load(Ordering::Acquire), self.w.load(Ordering::Acquire))
    }

    /// Number of bytes that can be read without blocking
    #[inline]
    pub fn can_read(&self) -> usize {
        let (r, w) = self.cursors();
        if w >= r {
            w - r
        } else {
            w + SIZE - r
        }
    }

    /// Number of readable bytes stored contiguously, i.e. up to the write
    /// cursor or the physical end of the storage, whichever comes first.
    #[inline]
    pub fn can_read_continuous(&self) -> usize {
        let (r, w) = self.cursors();
        if w >= r {
            w - r
        } else {
            SIZE - r
        }
    }

    /// Number of bytes that can be written without overwriting unread data
    #[inline]
    pub fn can_write(&self) -> usize {
        SIZE - 1 - self.can_read()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.can_read() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.can_write() == 0
    }

    /// Contiguous readable prefix, `can_read_continuous()` bytes long.
    ///
    /// Pair with [`RingBuffer::flush`] to consume data without copying.
    pub fn read_buffer(&self) -> &[u8] {
        let r = self.r.load(Ordering::Acquire);
        &self.data[r..r + self.can_read_continuous()]
    }

    /// Write a single byte. Returns `false` and leaves the buffer untouched
    /// when it is full.
    pub fn write_byte(&mut self, value: u8) -> bool {
        if self.is_full() {
            return false;
        }
        let w = self.w.load(Ordering::Acquire);
        self.data[w] = value;
        self.w.store((w + 1) % SIZE, Ordering::Release);
        true
    }

    /// Write as much of `data` as fits.
    ///
    /// Returns the number of bytes actually stored, excess bytes are dropped.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.can_write());
        if len == 0 {
            return 0;
        }
        let w = self.w.load(Ordering::Acquire);

        if w + len <= SIZE {
            self.data[w..w + len].copy_from_slice(&data[..len]);
        } else {
            let first_len = SIZE - w;
            self.data[w..SIZE].copy_from_slice(&data[..first_len]);
            self.data[..len - first_len].copy_from_slice(&data[first_len..len]);
        }

        self.w.store((w + len) % SIZE, Ordering::Release);
        len
    }

    /// Read a single byte, `None` when empty
    pub fn read_byte(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let r = self.r.load(Ordering::Acquire);
        let value = self.data[r];
        self.r.store((r + 1) % SIZE, Ordering::Release);
        Some(value)
    }

    /// Read up to `buf.len()` bytes, returning the number transferred
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let len = self.peek(buf);
        self.flush(len)
    }

    /// Copy up to `buf.len()` bytes without advancing the read cursor.
    ///
    /// Returns the number of bytes copied.
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.can_read());
        if len == 0 {
            return 0;
        }
        let r = self.r.load(Ordering::Acquire);

        if r + len <= SIZE {
            buf[..len].copy_from_slice(&self.data[r..r + len]);
        } else {
            let first_len = SIZE - r;
            buf[..first_len].copy_from_slice(&self.data[r..SIZE]);
            buf[first_len..len].copy_from_slice(&self.data[..len - first_len]);
        }
        len
    }

    /// Byte `offset` positions past the read cursor, if it has been written
    pub fn peek_at(&self, offset: usize) -> Option<u8> {
        if offset >= self.can_read() {
            return None;
        }
        let r = self.r.load(Ordering::Acquire);
        Some(self.data[(r + offset) % SIZE])
    }

    /// Advance the read cursor by up to `len` bytes, typically after a
    /// matching [`RingBuffer::peek`].
    ///
    /// Returns the number of bytes actually released.
    pub fn flush(&mut self, len: usize) -> usize {
        let len = len.min(self.can_read());
        let r = self.r.load(Ordering::Acquire);
        self.r.store((r + len) % SIZE, Ordering::Release);
        len
    }

    /// Discard everything, resetting both cursors
    pub fn clear(&mut self) {
        self.r.store(0, Ordering::Release);
        self.w.store(0, Ordering::Release);
    }
}

impl<const SIZE: usize> Default for RingBuffer<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize> core::fmt::Debug for RingBuffer<SIZE> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("size", &SIZE)
            .field("can_read", &self.can_read())
            .field("can_write", &self.can_write())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_buffer_is_empty() {
        let buffer = RingBuffer::<512>::new();
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());
        assert_eq!(buffer.can_read(), 0);
        assert_eq!(buffer.can_write(), 511);
        assert_eq!(buffer.capacity(), 511);
    }

    #[test]
    fn test_write_and_read() {
        let mut buffer = RingBuffer::<64>::new();

        let data = b"Hello, World!";
        assert_eq!(buffer.write(data), data.len());
        assert_eq!(buffer.can_read(), data.len());

        let mut read_buf = [0u8; 20];
        let read_len = buffer.read(&mut read_buf);
        assert_eq!(read_len, data.len());
        assert_eq!(&read_buf[..read_len], data);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_write_caps_at_free_space() {
        let mut buffer = RingBuffer::<8>::new();
        assert_eq!(buffer.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9]), 7);
        assert!(buffer.is_full());
        assert!(!buffer.write_byte(10));
        assert_eq!(buffer.write(&[10]), 0);

        let mut out = [0u8; 16];
        assert_eq!(buffer.read(&mut out), 7);
        assert_eq!(&out[..7], &[1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_wrap_around() {
        let mut buffer = RingBuffer::<8>::new();
        buffer.write(&[0xAB; 6]);
        let mut sink = [0u8; 5];
        assert_eq!(buffer.read(&mut sink), 5);

        // write wraps past the physical end of the storage
        assert_eq!(buffer.write(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(buffer.can_read(), 6);
        assert_eq!(buffer.can_read_continuous(), 2);
        assert_eq!(buffer.read_buffer(), &[0xAB, 1]);

        let mut out = [0u8; 6];
        assert_eq!(buffer.read(&mut out), 6);
        assert_eq!(out, [0xAB, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_byte_access() {
        let mut buffer = RingBuffer::<4>::new();
        assert_eq!(buffer.read_byte(), None);
        assert!(buffer.write_byte(7));
        assert!(buffer.write_byte(8));
        assert_eq!(buffer.peek_at(0), Some(7));
        assert_eq!(buffer.peek_at(1), Some(8));
        assert_eq!(buffer.peek_at(2), None);
        assert_eq!(buffer.read_byte(), Some(7));
        assert_eq!(buffer.read_byte(), Some(8));
        assert_eq!(buffer.read_byte(), None);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buffer = RingBuffer::<32>::new();
        buffer.write(b"abcdef");

        let mut chunk = [0u8; 4];
        assert_eq!(buffer.peek(&mut chunk), 4);
        assert_eq!(buffer.peek(&mut chunk), 4);
        assert_eq!(&chunk, b"abcd");
        assert_eq!(buffer.can_read(), 6);

        assert_eq!(buffer.flush(4), 4);
        assert_eq!(buffer.flush(10), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut buffer = RingBuffer::<16>::new();
        buffer.write(b"discard me");
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.can_write(), 15);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(Vec<u8>),
        Read(usize),
        PeekFlush(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..24).prop_map(Op::Write),
            (0usize..24).prop_map(Op::Read),
            (0usize..24).prop_map(Op::PeekFlush),
        ]
    }

    proptest! {
        #[test]
        fn prop_capacity_and_fifo_order(ops in proptest::collection::vec(op(), 0..64)) {
            let mut buffer = RingBuffer::<17>::new();
            let mut model = std::collections::VecDeque::new();

            for op in ops {
                match op {
                    Op::Write(data) => {
                        let written = buffer.write(&data);
                        prop_assert_eq!(written, data.len().min(16 - model.len()));
                        model.extend(&data[..written]);
                    }
                    Op::Read(n) => {
                        let mut out = vec![0u8; n];
                        let read = buffer.read(&mut out);
                        let expected: Vec<u8> = model.drain(..n.min(model.len())).collect();
                        prop_assert_eq!(&out[..read], &expected[..]);
                    }
                    Op::PeekFlush(n) => {
                        let mut out = vec![0u8; n];
                        let peeked = buffer.peek(&mut out);
                        prop_assert_eq!(buffer.flush(peeked), peeked);
                        let expected: Vec<u8> = model.drain(..peeked).collect();
                        prop_assert_eq!(&out[..peeked], &expected[..]);
                    }
                }
                prop_assert_eq!(buffer.can_read() + buffer.can_write(), 16);
                prop_assert_eq!(buffer.can_read(), model.len());
            }
        }
    }
}
