//! Delivery of decoded records to a sink from a blocking thread.
//!
//! `LogSink::add` may wait on the consumer, so the reader task never calls
//! the sink directly. It queues records on a bounded channel and a
//! `spawn_blocking` thread feeds them to the sink in order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dbgscope_logs::LogSink;
use dbgscope_types::LogRecord;

/// Records queued between the reader task and the delivery thread
const QUEUE_DEPTH: usize = 256;

enum Delivery {
    Record(LogRecord),
    Signal,
}

/// Async front of the delivery thread
pub(crate) struct Emitter {
    tx: mpsc::Sender<Delivery>,
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
}

impl Emitter {
    /// Start the delivery thread. Records still queued once `cancel` fires
    /// are discarded.
    pub(crate) fn spawn(sink: Arc<dyn LogSink>, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(QUEUE_DEPTH);

        let handle = {
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                let mut discarded = 0usize;
                while let Some(delivery) = rx.blocking_recv() {
                    if cancel.is_cancelled() {
                        discarded += 1;
                        continue;
                    }
                    match delivery {
                        Delivery::Record(record) => sink.add(record),
                        Delivery::Signal => sink.signal(),
                    }
                }
                if discarded > 0 {
                    debug!(discarded, "queued deliveries discarded after stop");
                }
            })
        };

        (Self { tx, sink, cancel }, handle)
    }

    pub(crate) async fn add(&self, record: LogRecord) {
        self.send(Delivery::Record(record)).await;
    }

    pub(crate) async fn add_message(&self, timestamp: f64, source: &str, message: &str, owner: &str) {
        self.add(LogRecord::synthetic(timestamp, source, message, owner)).await;
    }

    pub(crate) async fn signal(&self) {
        self.send(Delivery::Signal).await;
    }

    /// Reads the sink's flag directly, it never blocks
    pub(crate) fn is_stop_requested(&self) -> bool {
        self.sink.is_stop_requested()
    }

    async fn send(&self, delivery: Delivery) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            sent = self.tx.send(delivery) => {
                if sent.is_err() {
                    debug!("delivery thread has exited");
                }
            }
        }
    }
}
