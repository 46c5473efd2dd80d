//! Shared types for dbgscope
//!
//! This crate contains data structures used across multiple dbgscope crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Source Tags
// ============================================================================

/// Source tag for records synthesized by the client itself
pub const INTERNAL_SOURCE: &str = "[internal]";

/// Source tag for records decoded from the agent stream
pub const AGENT_SOURCE: &str = "dbgview.exe";

// ============================================================================
// Time Types
// ============================================================================

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

/// 100ns ticks per second
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// Absolute wall-clock time as 100ns ticks since 1601-01-01 UTC
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTime(pub u64);

impl FileTime {
    /// Current wall-clock time
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert a UTC datetime; times before 1601 clamp to zero
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let secs = dt.timestamp() + FILETIME_UNIX_OFFSET_SECS;
        if secs < 0 {
            return Self(0);
        }
        let ticks = secs as u64 * FILETIME_TICKS_PER_SEC + u64::from(dt.timestamp_subsec_nanos() / 100);
        Self(ticks)
    }

    /// Convert to a UTC datetime (None if out of chrono's range)
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = (self.0 / FILETIME_TICKS_PER_SEC) as i64 - FILETIME_UNIX_OFFSET_SECS;
        let nanos = ((self.0 % FILETIME_TICKS_PER_SEC) * 100) as u32;
        DateTime::from_timestamp(secs, nanos)
    }

    /// Raw tick count
    pub fn ticks(self) -> u64 {
        self.0
    }
}

impl From<u64> for FileTime {
    fn from(ticks: u64) -> Self {
        Self(ticks)
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// A single decoded debug-output record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Seconds since the session's first counter value
    pub timestamp: f64,

    /// Absolute time reported by the agent
    pub file_time: FileTime,

    /// Originating process id (0 for internal records)
    pub pid: u32,

    /// Source tag, `[internal]` or `dbgview.exe`
    pub source: String,

    /// Description of the log source that produced this record
    pub owner: String,

    /// Message text, newline-terminated for agent records
    pub message: String,
}

impl LogRecord {
    /// Create a record decoded from the agent stream
    pub fn new(
        timestamp: f64,
        file_time: FileTime,
        pid: u32,
        source: impl Into<String>,
        message: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            file_time,
            pid,
            source: source.into(),
            owner: owner.into(),
            message: message.into(),
        }
    }

    /// Create a record without agent-provided file time or pid.
    /// The file time is taken from the local clock.
    pub fn synthetic(
        timestamp: f64,
        source: impl Into<String>,
        message: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self::new(timestamp, FileTime::now(), 0, source, message, owner)
    }

    /// Whether this record was produced by the client rather than the agent
    pub fn is_internal(&self) -> bool {
        self.source == INTERNAL_SOURCE
    }

    /// Message without its trailing line terminator
    pub fn text(&self) -> &str {
        self.message.trim_end_matches(['\r', '\n'])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_filetime_unix_epoch() {
        let ft = FileTime(116_444_736_000_000_000);
        let dt = ft.to_datetime().unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_filetime_from_datetime_keeps_sub_second_ticks() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
            + chrono::Duration::microseconds(1234);
        let ft = FileTime::from_datetime(dt);
        assert_eq!(ft.ticks() % FILETIME_TICKS_PER_SEC, 12_340);
        assert_eq!(ft.to_datetime().unwrap(), dt);
    }

    #[test]
    fn test_filetime_zero_is_1601() {
        let dt = FileTime(0).to_datetime().unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_record_text_strips_newline() {
        let record = LogRecord::new(0.0, FileTime(0), 42, AGENT_SOURCE, "hello\n", "agent");
        assert_eq!(record.text(), "hello");
        assert!(!record.is_internal());
    }

    #[test]
    fn test_synthetic_record_is_internal() {
        let record = LogRecord::synthetic(0.0, INTERNAL_SOURCE, "Connected to x", "x");
        assert!(record.is_internal());
        assert_eq!(record.pid, 0);
        assert!(record.file_time.ticks() > 0);
    }

    #[test]
    fn test_record_serializes_filetime_as_ticks() {
        let record = LogRecord::new(1.5, FileTime(7), 3, AGENT_SOURCE, "m\n", "o");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["file_time"], 7);
        assert_eq!(json["pid"], 3);
    }
}
