//! Record printing for the consumer side of the line buffer

use std::io::{self, Write};
use std::time::Duration;

use chrono::Local;

use dbgscope_logs::{LineBuffer, LogRecord, LogSink, RecordFilter};

/// Formats records that pass the filter
pub struct RecordPrinter {
    filter: RecordFilter,
    json: bool,
}

impl RecordPrinter {
    pub fn new(filter: RecordFilter, json: bool) -> Self {
        Self { filter, json }
    }

    /// Render one record, or None if it is filtered out
    pub fn format(&self, record: &LogRecord) -> Option<String> {
        if !self.filter.matches(record) {
            return None;
        }

        if self.json {
            return serde_json::to_string(record).ok();
        }

        let wall = record
            .file_time
            .to_datetime()
            .map(|dt| dt.with_timezone(&Local).format("%H:%M:%S%.3f").to_string())
            .unwrap_or_default();

        let origin = if record.is_internal() {
            record.source.clone()
        } else {
            format!("[{}]", record.pid)
        };

        Some(format!(
            "{:>12.6} {} {} {}",
            record.timestamp,
            wall,
            origin,
            record.text()
        ))
    }
}

/// Print lines until the buffer's stop flag is set and everything is drained.
///
/// A write failure (for example a closed pipe) requests a stop so the
/// reader winds down too.
pub fn drain(
    lines: &LineBuffer,
    printer: &RecordPrinter,
    poll_interval: Duration,
    out: &mut impl Write,
) -> io::Result<()> {
    loop {
        let stopping = lines.is_stop_requested();
        lines.wait_for_lines(poll_interval);

        let result = lines
            .take_lines()
            .iter()
            .filter_map(|record| printer.format(record))
            .try_for_each(|line| writeln!(out, "{}", line))
            .and_then(|()| out.flush());

        if let Err(e) = result {
            lines.request_stop();
            return Err(e);
        }

        if stopping && !lines.wait_for_lines(Duration::ZERO) {
            return Ok(());
        }
    }
}
