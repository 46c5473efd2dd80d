use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use dbgscope_types::{FileTime, LogRecord};

use crate::ring_buffer::{RingBuffer, RingBufferError};
use crate::sink::LogSink;

/// Fixed part of an encoded record: timestamp, file time, pid
const RECORD_HEADER_SIZE: usize = 8 + 8 + 4;

/// Length prefix in front of every encoded record
const LENGTH_PREFIX_SIZE: usize = 4;

/// Log sink that stages records in a [`RingBuffer`].
///
/// The reader task is the only producer and a single consumer drains
/// complete records with [`LineBuffer::take_lines`]. Each record is stored as
/// `u32 length | f64 timestamp | u64 file time | u32 pid | source | owner | message`
/// with the strings NUL-terminated.
pub struct LineBuffer {
    ring: RingBuffer,

    /// How long a producer waits for the consumer to free space
    producer_timeout: Duration,

    /// Bumped by `signal` so waiting consumers can tell a wake-up happened
    generation: Mutex<u64>,
    wake: Condvar,

    stop_requested: AtomicBool,

    /// Records dropped because the consumer fell behind
    dropped: AtomicU64,
}

impl LineBuffer {
    /// Create a line buffer backed by a ring of at least `capacity` bytes
    pub fn new(capacity: usize, producer_timeout: Duration) -> Result<Self, RingBufferError> {
        Ok(Self {
            ring: RingBuffer::new(capacity)?,
            producer_timeout,
            generation: Mutex::new(0),
            wake: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        })
    }

    /// Capacity of the underlying ring in bytes
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of records dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the producing reader to stop after its current frame
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.signal();
    }

    /// Block until records are buffered, a signal arrives or the timeout elapses.
    ///
    /// Returns whether any bytes are waiting to be read.
    pub fn wait_for_lines(&self, timeout: Duration) -> bool {
        if !self.ring.is_empty() {
            return true;
        }

        let mut generation = self.generation.lock();
        let seen = *generation;
        // Re-check under the lock so a signal between the two checks is not lost
        if self.ring.is_empty() {
            let _ = self
                .wake
                .wait_while_for(&mut generation, |g| *g == seen, timeout);
        }
        drop(generation);

        !self.ring.is_empty()
    }

    /// Drain every complete record currently buffered
    pub fn take_lines(&self) -> Vec<LogRecord> {
        let mut lines = Vec::new();
        while let Some(record) = self.read_record() {
            lines.push(record);
        }
        lines
    }

    fn read_record(&self) -> Option<LogRecord> {
        let body_len = self.ring.peek_value::<u32>()? as usize;
        if self.ring.used_bytes() < LENGTH_PREFIX_SIZE + body_len {
            return None;
        }
        self.ring.read_value::<u32>()?;

        let timestamp = self.ring.read_value::<f64>()?;
        let file_time = FileTime(self.ring.read_value::<u64>()?);
        let pid = self.ring.read_value::<u32>()?;
        let source = self.ring.read_message()?;
        let owner = self.ring.read_message()?;
        let message = self.ring.read_message()?;

        Some(LogRecord {
            timestamp,
            file_time,
            pid,
            source,
            owner,
            message,
        })
    }

    fn write_record(&self, record: &LogRecord, body_len: u32) -> Result<(), RingBufferError> {
        self.ring.write_value(body_len)?;
        self.ring.write_value(record.timestamp)?;
        self.ring.write_value(record.file_time.ticks())?;
        self.ring.write_value(record.pid)?;
        self.ring.write_message(&record.source);
        self.ring.write_message(&record.owner);
        self.ring.write_message(&record.message);
        Ok(())
    }
}

impl LogSink for LineBuffer {
    fn add(&self, record: LogRecord) {
        let body_len = encoded_body_len(&record);
        let total = LENGTH_PREFIX_SIZE + body_len;

        if total > self.ring.capacity() {
            warn!(
                size = total,
                capacity = self.ring.capacity(),
                "record larger than line buffer, dropping"
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !self.ring.wait_for_consumer(total, Some(self.producer_timeout)) {
            warn!(
                timeout_ms = self.producer_timeout.as_millis() as u64,
                "line buffer consumer stalled, dropping record"
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // total <= capacity, so the length fits in u32 for any sane ring size
        let Ok(body_len) = u32::try_from(body_len) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if let Err(e) = self.write_record(&record, body_len) {
            warn!(error = %e, "failed to buffer record");
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn signal(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.wake.notify_all();
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Bytes `write_message` will store for `text`, terminator included
fn c_string_len(text: &str) -> usize {
    text.bytes().position(|b| b == 0).unwrap_or(text.len()) + 1
}

fn encoded_body_len(record: &LogRecord) -> usize {
    RECORD_HEADER_SIZE
        + c_string_len(&record.source)
        + c_string_len(&record.owner)
        + c_string_len(&record.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbgscope_types::{AGENT_SOURCE, INTERNAL_SOURCE};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn record(pid: u32, message: &str) -> LogRecord {
        LogRecord::new(1.25, FileTime(42), pid, AGENT_SOURCE, message, "agent")
    }

    #[test]
    fn test_records_round_trip_in_order() {
        let buffer = LineBuffer::new(1024, Duration::from_millis(10)).unwrap();
        buffer.add(record(1, "first\n"));
        buffer.add(record(2, "second\n"));
        buffer.add_message(0.0, INTERNAL_SOURCE, "Connected to agent", "agent");

        let lines = buffer.take_lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], record(1, "first\n"));
        assert_eq!(lines[1], record(2, "second\n"));
        assert!(lines[2].is_internal());
        assert_eq!(lines[2].message, "Connected to agent");
        assert!(buffer.take_lines().is_empty());
    }

    #[test]
    fn test_oversized_record_is_dropped() {
        let buffer = LineBuffer::new(64, Duration::from_millis(10)).unwrap();
        buffer.add(record(1, &"x".repeat(100)));
        assert_eq!(buffer.dropped(), 1);
        assert!(buffer.take_lines().is_empty());
    }

    #[test]
    fn test_stalled_consumer_drops_after_timeout() {
        let buffer = LineBuffer::new(64, Duration::from_millis(20)).unwrap();
        // each record is 4 + 20 + 12 + 6 + 4 = 46 bytes, so the second cannot fit
        buffer.add(record(1, "hi\n"));
        let start = Instant::now();
        buffer.add(record(2, "hi\n"));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(buffer.take_lines().len(), 1);
    }

    #[test]
    fn test_signal_wakes_waiting_consumer() {
        let buffer = Arc::new(LineBuffer::new(256, Duration::from_millis(10)).unwrap());
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buffer.add(record(7, "late\n"));
                buffer.signal();
            })
        };

        assert!(buffer.wait_for_lines(Duration::from_secs(5)));
        producer.join().unwrap();
        assert_eq!(buffer.take_lines()[0].pid, 7);
    }

    #[test]
    fn test_wait_for_lines_times_out_when_idle() {
        let buffer = LineBuffer::new(256, Duration::from_millis(10)).unwrap();
        assert!(!buffer.wait_for_lines(Duration::from_millis(10)));
    }

    #[test]
    fn test_request_stop_is_visible_to_producer() {
        let buffer = LineBuffer::new(256, Duration::from_millis(10)).unwrap();
        assert!(!buffer.is_stop_requested());
        buffer.request_stop();
        assert!(buffer.is_stop_requested());
    }

    #[test]
    fn test_consumer_keeps_up_with_producer() {
        let buffer = Arc::new(LineBuffer::new(128, Duration::from_secs(5)).unwrap());
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for pid in 0..200 {
                    buffer.add(record(pid, "msg\n"));
                }
                buffer.signal();
            })
        };

        let mut pids = Vec::new();
        while pids.len() < 200 {
            buffer.wait_for_lines(Duration::from_millis(100));
            pids.extend(buffer.take_lines().into_iter().map(|r| r.pid));
        }
        producer.join().unwrap();
        assert_eq!(pids, (0..200).collect::<Vec<_>>());
        assert_eq!(buffer.dropped(), 0);
    }
}
