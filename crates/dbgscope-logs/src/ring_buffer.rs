use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Widest value accepted by `write_value` / `read_value`
const MAX_VALUE_SIZE: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("unable to allocate a {0} byte ring buffer")]
    Allocation(usize),

    #[error("a {size} byte write can never fit in a {capacity} byte ring buffer")]
    ValueTooLarge { size: usize, capacity: usize },
}

/// Fixed-width value with an explicit little-endian byte layout
pub trait RingValue: Copy {
    const SIZE: usize;

    fn encode(self, out: &mut [u8]);

    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_ring_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl RingValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn encode(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_ring_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Cursor state, only touched with the lock held
struct RingState {
    storage: Box<[u8]>,
    read: usize,
    write: usize,
    /// Unread byte count; disambiguates `read == write`
    used: usize,
}

/// Fixed-capacity byte ring shared by one producer and one consumer.
///
/// Capacity is always a power of two so cursors wrap with a bitmask.
/// Writers block until the consumer has freed enough space; unread bytes are
/// never overwritten. Multi-byte values may straddle the end of storage.
pub struct RingBuffer {
    capacity: usize,
    state: Mutex<RingState>,
    /// Signaled by writes
    readable: Condvar,
    /// Signaled by reads
    writable: Condvar,
}

impl RingBuffer {
    /// Create a ring with capacity rounded up to the next power of two (minimum 1)
    pub fn new(requested: usize) -> Result<Self, RingBufferError> {
        let capacity = requested
            .max(1)
            .checked_next_power_of_two()
            .ok_or(RingBufferError::Allocation(requested))?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| RingBufferError::Allocation(capacity))?;
        storage.resize(capacity, 0u8);

        Ok(Self {
            capacity,
            state: Mutex::new(RingState {
                storage: storage.into_boxed_slice(),
                read: 0,
                write: 0,
                used: 0,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        })
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Advance a cursor by `n` bytes, wrapping at capacity
    #[inline]
    pub fn advance(&self, cursor: usize, n: usize) -> usize {
        cursor.wrapping_add(n) & (self.capacity - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().used == 0
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().used == self.capacity
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used
    }

    pub fn free_bytes(&self) -> usize {
        self.capacity - self.state.lock().used
    }

    /// Write a fixed-width value, blocking until the consumer frees space
    pub fn write_value<T: RingValue>(&self, value: T) -> Result<(), RingBufferError> {
        if T::SIZE > self.capacity || T::SIZE > MAX_VALUE_SIZE {
            return Err(RingBufferError::ValueTooLarge {
                size: T::SIZE,
                capacity: self.capacity,
            });
        }

        let mut scratch = [0u8; MAX_VALUE_SIZE];
        value.encode(&mut scratch[..T::SIZE]);

        let mut state = self.state.lock();
        while self.capacity - state.used < T::SIZE {
            self.writable.wait(&mut state);
        }
        self.put_bytes(&mut state, &scratch[..T::SIZE]);
        drop(state);

        self.readable.notify_one();
        Ok(())
    }

    /// Read a fixed-width value, or None if fewer than `T::SIZE` bytes are unread
    pub fn read_value<T: RingValue>(&self) -> Option<T> {
        let mut state = self.state.lock();
        let value = self.peek_locked::<T>(&state)?;
        state.read = self.advance(state.read, T::SIZE);
        state.used -= T::SIZE;
        drop(state);

        self.writable.notify_one();
        Some(value)
    }

    /// Read a fixed-width value without consuming it
    pub fn peek_value<T: RingValue>(&self) -> Option<T> {
        let state = self.state.lock();
        self.peek_locked::<T>(&state)
    }

    /// Write text followed by a zero byte.
    ///
    /// Behaves like one blocking byte write per byte. Text longer than the
    /// ring only goes through if the consumer drains it with
    /// `read_value::<u8>`; `read_message` never sees a terminator that does
    /// not fit. Text after an interior NUL is not written.
    pub fn write_message(&self, message: &str) {
        let text = message.as_bytes();
        let text = match text.iter().position(|&b| b == 0) {
            Some(nul) => &text[..nul],
            None => text,
        };

        let mut state = self.state.lock();
        for &byte in text.iter().chain(std::iter::once(&0u8)) {
            while state.used == self.capacity {
                self.readable.notify_one();
                self.writable.wait(&mut state);
            }
            self.put_bytes(&mut state, &[byte]);
        }
        drop(state);

        self.readable.notify_one();
    }

    /// Read text up to and including the next zero byte.
    ///
    /// Returns the text without its terminator, or None (consuming nothing)
    /// if no terminator has been written yet. A message is only readable this
    /// way when it fits in the ring together with its terminator.
    pub fn read_message(&self) -> Option<String> {
        let mut state = self.state.lock();

        let len = (0..state.used).position(|i| state.storage[self.advance(state.read, i)] == 0)?;
        let mut bytes = Vec::with_capacity(len);
        for i in 0..len {
            bytes.push(state.storage[self.advance(state.read, i)]);
        }

        state.read = self.advance(state.read, len + 1);
        state.used -= len + 1;
        drop(state);

        self.writable.notify_one();
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Block the producer until at least `bytes` are free.
    ///
    /// With a timeout, returns whether the space became available in time.
    /// Requests larger than the capacity return false immediately.
    pub fn wait_for_consumer(&self, bytes: usize, timeout: Option<Duration>) -> bool {
        if bytes > self.capacity {
            return false;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while self.capacity - state.used < bytes {
            match deadline {
                Some(deadline) => {
                    if self.writable.wait_until(&mut state, deadline).timed_out() {
                        return self.capacity - state.used >= bytes;
                    }
                }
                None => self.writable.wait(&mut state),
            }
        }
        true
    }

    /// Block the consumer until any byte is unread or the timeout elapses
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.used == 0 {
            if self.readable.wait_until(&mut state, deadline).timed_out() {
                return state.used > 0;
            }
        }
        true
    }

    fn peek_locked<T: RingValue>(&self, state: &RingState) -> Option<T> {
        if T::SIZE > MAX_VALUE_SIZE || state.used < T::SIZE {
            return None;
        }
        let mut scratch = [0u8; MAX_VALUE_SIZE];
        for (i, slot) in scratch[..T::SIZE].iter_mut().enumerate() {
            *slot = state.storage[self.advance(state.read, i)];
        }
        Some(T::decode(&scratch[..T::SIZE]))
    }

    /// Caller has already checked free space
    fn put_bytes(&self, state: &mut RingState, bytes: &[u8]) {
        for &byte in bytes {
            let at = state.write;
            state.storage[at] = byte;
            state.write = self.advance(at, 1);
        }
        state.used += bytes.len();
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("read", &state.read)
            .field("write", &state.write)
            .field("used", &state.used)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_is_smallest_power_of_two() {
        for requested in 1..=1025usize {
            let ring = RingBuffer::new(requested).unwrap();
            let cap = ring.capacity();
            assert!(cap.is_power_of_two());
            assert!(cap >= requested);
            assert!(cap / 2 < requested, "{cap} is not minimal for {requested}");
        }
    }

    #[test]
    fn test_zero_request_yields_usable_ring() {
        let ring = RingBuffer::new(0).unwrap();
        assert_eq!(ring.capacity(), 1);
        ring.write_value(7u8).unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.read_value::<u8>(), Some(7));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_advance_wraps() {
        let ring = RingBuffer::new(64).unwrap();
        let c = ring.capacity();
        assert_eq!(ring.advance(c - 4, 8), 4);
        assert_eq!(ring.advance(0, c), 0);
        assert_eq!(ring.advance(3, 5), 8);
    }

    #[test]
    fn test_interleaved_values_round_trip() {
        let ring = RingBuffer::new(16).unwrap();

        // Enough passes that the cursors wrap several times
        for round in 0..10u32 {
            ring.write_value(round).unwrap();
            ring.write_value(-(round as i64) * 1_000_000_007).unwrap();
            ring.write_value(0xABu8).unwrap();
            assert_eq!(ring.read_value::<u32>(), Some(round));
            assert_eq!(ring.read_value::<i64>(), Some(-(round as i64) * 1_000_000_007));
            ring.write_value(round as f64 + 0.25).unwrap();
            assert_eq!(ring.read_value::<u8>(), Some(0xAB));
            assert_eq!(ring.read_value::<f64>(), Some(round as f64 + 0.25));
            assert!(ring.is_empty());
        }
    }

    #[test]
    fn test_value_straddles_end_of_storage() {
        let ring = RingBuffer::new(8).unwrap();
        ring.write_value(0u32).unwrap();
        ring.write_value(0u16).unwrap();
        ring.read_value::<u32>().unwrap();
        ring.read_value::<u16>().unwrap();

        // write cursor sits at 6, so the u64 wraps after two bytes
        ring.write_value(0x0102_0304_0506_0708u64).unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.free_bytes(), 0);
        assert_eq!(ring.read_value::<u64>(), Some(0x0102_0304_0506_0708));
    }

    #[test]
    fn test_message_round_trip() {
        let ring = RingBuffer::new(32).unwrap();
        ring.write_message("hello");
        assert_eq!(ring.used_bytes(), 6);
        assert_eq!(ring.read_message().as_deref(), Some("hello"));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_message_interior_nul_truncates() {
        let ring = RingBuffer::new(32).unwrap();
        ring.write_message("abc\0def");
        assert_eq!(ring.used_bytes(), 4);
        assert_eq!(ring.read_message().as_deref(), Some("abc"));
    }

    #[test]
    fn test_read_without_data_consumes_nothing() {
        let ring = RingBuffer::new(8).unwrap();
        assert_eq!(ring.read_value::<u32>(), None);
        ring.write_value(0x0101u16).unwrap();
        assert_eq!(ring.read_value::<u32>(), None);
        assert_eq!(ring.read_message(), None);
        assert_eq!(ring.used_bytes(), 2);
        assert_eq!(ring.peek_value::<u16>(), Some(0x0101));
        assert_eq!(ring.used_bytes(), 2);
    }

    #[test]
    fn test_unterminated_full_ring_is_not_a_message() {
        let ring = RingBuffer::new(8).unwrap();
        ring.write_value(0x6161_6161_6161_6161u64).unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.read_message(), None);
        assert_eq!(ring.used_bytes(), 8);
        assert_eq!(ring.read_value::<u8>(), Some(b'a'));
    }

    #[test]
    fn test_value_larger_than_capacity_is_rejected() {
        let ring = RingBuffer::new(4).unwrap();
        assert_eq!(
            ring.write_value(1u64),
            Err(RingBufferError::ValueTooLarge { size: 8, capacity: 4 })
        );
        assert!(!ring.wait_for_consumer(5, None));
    }

    #[test]
    fn test_full_is_based_on_used_bytes() {
        let ring = RingBuffer::new(4).unwrap();
        ring.write_value(0xDEAD_BEEFu32).unwrap();
        // both cursors are back at 0 but the ring is full, not empty
        assert!(ring.is_full());
        assert!(!ring.is_empty());
    }

    #[test]
    fn test_wait_for_consumer_times_out() {
        let ring = RingBuffer::new(4).unwrap();
        ring.write_value(1u32).unwrap();
        assert!(!ring.wait_for_consumer(1, Some(Duration::from_millis(20))));
        assert!(ring.wait_for_consumer(0, Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_writer_blocks_until_consumer_reads() {
        let ring = Arc::new(RingBuffer::new(8).unwrap());
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..100u32 {
                    ring.write_value(i).unwrap();
                }
                ring.write_message("a message longer than the ring itself");
            })
        };

        let mut received = Vec::new();
        while received.len() < 100 {
            ring.wait_for_data(Duration::from_millis(500));
            if let Some(v) = ring.read_value::<u32>() {
                received.push(v);
            }
        }
        assert_eq!(received, (0..100).collect::<Vec<_>>());

        // Drain the long message byte by byte as the producer pushes it
        let mut text = Vec::new();
        loop {
            ring.wait_for_data(Duration::from_millis(500));
            match ring.read_value::<u8>() {
                Some(0) => break,
                Some(b) => text.push(b),
                None => {}
            }
        }
        producer.join().unwrap();
        assert_eq!(text, b"a message longer than the ring itself");
    }
}
