use std::sync::Arc;

use dbgscope_types::LogRecord;

/// Consumer side of a log source.
///
/// A reader pushes decoded records through `add`, calls `signal` once a batch
/// is complete, and polls `is_stop_requested` between batches. `add` and
/// `signal` run on a dedicated blocking thread and may wait on the consumer;
/// `is_stop_requested` is called from async code and must not block.
pub trait LogSink: Send + Sync {
    /// Accept one record
    fn add(&self, record: LogRecord);

    /// Accept a record that has no agent file time or pid
    fn add_message(&self, timestamp: f64, source: &str, message: &str, owner: &str) {
        self.add(LogRecord::synthetic(timestamp, source, message, owner));
    }

    /// Wake any consumer waiting for new records
    fn signal(&self);

    /// Whether the consumer wants the source to stop
    fn is_stop_requested(&self) -> bool;
}

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn add(&self, record: LogRecord) {
        (**self).add(record);
    }

    fn add_message(&self, timestamp: f64, source: &str, message: &str, owner: &str) {
        (**self).add_message(timestamp, source, message, owner);
    }

    fn signal(&self) {
        (**self).signal();
    }

    fn is_stop_requested(&self) -> bool {
        (**self).is_stop_requested()
    }
}
