use std::future::Future;
use std::io;
use std::num::NonZeroU32;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use dbgscope_logs::LogSink;
use dbgscope_types::{AGENT_SOURCE, INTERNAL_SOURCE, LogRecord};

use crate::clock::ClockConverter;
use crate::emitter::Emitter;
use crate::error::{ReaderError, Result};
use crate::protocol::{AGENT_PORT, FrameDecoder, INIT_COMMAND, check_frame_length};

/// Lifecycle of a reader session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    Connecting,
    Handshaking,
    Streaming,
    /// A connection or protocol error ended the session
    ErrorStop,
    /// The sink or owner asked the session to end
    RequestedStop,
    /// Background task finished
    Closed,
}

/// Why a reader session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Failed(ReaderError),
    /// The background task panicked or was aborted
    Aborted,
}

/// Where and how to connect
#[derive(Clone, Debug)]
pub struct ReaderOptions {
    pub host: String,
    pub port: u16,
    /// Label used in records, defaults to "Dbgview Agent at <host>"
    pub description: Option<String>,
}

impl ReaderOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: AGENT_PORT,
            description: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// State visible to both the owner and the background task
struct Shared {
    description: RwLock<String>,
    state: RwLock<ReaderState>,
}

/// Reads the live log stream of one DebugView agent.
///
/// A single background task connects, performs the handshake and decodes
/// frames into the sink until the stream fails or a stop is requested.
/// Stopping cancels any in-flight transport operation, which closes the
/// connection, and then joins the task.
pub struct DbgviewReader {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<StopReason>>,
}

impl DbgviewReader {
    /// Start reading. Must be called from within a tokio runtime.
    pub fn spawn(options: ReaderOptions, sink: Arc<dyn LogSink>) -> Self {
        let description = options
            .description
            .clone()
            .unwrap_or_else(|| format!("Dbgview Agent at {}", options.host));

        let shared = Arc::new(Shared {
            description: RwLock::new(description),
            state: RwLock::new(ReaderState::Connecting),
        });
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Session::start(
            Arc::clone(&shared),
            sink,
            cancel.clone(),
            options.host,
            options.port,
        ));

        Self {
            shared,
            cancel,
            task: Some(task),
        }
    }

    /// Human-readable label of this source
    pub fn description(&self) -> String {
        self.shared.description.read().clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        *self.shared.description.write() = description.into();
    }

    pub fn state(&self) -> ReaderState {
        *self.shared.state.read()
    }

    /// Whether the background task has finished
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Signal the background task to stop without waiting for it
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the session and wait for the background task to end
    pub async fn stop(mut self) -> StopReason {
        self.cancel.cancel();
        self.wait().await
    }

    /// Wait for the session to end on its own
    pub async fn join(mut self) -> StopReason {
        self.wait().await
    }

    /// Wait for the background task without consuming the reader.
    ///
    /// Cancel-safe: dropping the future keeps the task attached.
    pub async fn wait(&mut self) -> StopReason {
        let Some(task) = self.task.as_mut() else {
            return StopReason::Aborted;
        };
        let result = task.await;
        self.task = None;

        result.unwrap_or_else(|e| {
            warn!(error = %e, "reader task did not complete");
            *self.shared.state.write() = ReaderState::Closed;
            StopReason::Aborted
        })
    }
}

impl Drop for DbgviewReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Background half of a reader
struct Session {
    shared: Arc<Shared>,
    emitter: Emitter,
    cancel: CancellationToken,
}

impl Session {
    /// Body of the background task: run the session, then let queued
    /// records reach the sink before reporting Closed
    async fn start(
        shared: Arc<Shared>,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
        host: String,
        port: u16,
    ) -> StopReason {
        let (emitter, delivery) = Emitter::spawn(sink, cancel.clone());
        let session = Session {
            shared: Arc::clone(&shared),
            emitter,
            cancel,
        };
        let reason = session.run(host, port).await;

        // The session owned the only sender, so the thread exits once drained
        if let Err(e) = delivery.await {
            warn!(error = %e, "record delivery thread failed");
        }
        *shared.state.write() = ReaderState::Closed;
        reason
    }

    async fn run(self, host: String, port: u16) -> StopReason {
        match self.stream(&host, port).await {
            Ok(()) => {
                debug!(host = %host, "reader stopped on request");
                self.set_state(ReaderState::RequestedStop);
                StopReason::Requested
            }
            Err(e) => {
                warn!(host = %host, error = %e, "reader stopped");
                self.set_state(ReaderState::ErrorStop);
                self.report(&e).await;
                self.emitter.signal().await;
                StopReason::Failed(e)
            }
        }
    }

    /// Runs until the stream fails (Err) or a stop is requested (Ok)
    async fn stream(&self, host: &str, port: u16) -> Result<()> {
        self.set_state(ReaderState::Connecting);
        let mut stream = match self.guard(TcpStream::connect((host, port))).await {
            None => return Ok(()),
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                return Err(ReaderError::Connect {
                    description: self.description(),
                    cause: e.to_string(),
                });
            }
        };

        self.set_state(ReaderState::Handshaking);
        let Some(mut clock) = self.handshake(&mut stream).await? else {
            return Ok(());
        };

        let description = self.description();
        info!(agent = %description, frequency = clock.frequency(), "connected");
        self.emitter
            .add_message(
                0.0,
                INTERNAL_SOURCE,
                &format!("Connected to {}", description),
                &description,
            )
            .await;
        self.emitter.signal().await;
        self.set_state(ReaderState::Streaming);

        loop {
            let length = match self.guard(stream.read_u32_le()).await {
                None => return Ok(()),
                Some(Ok(length)) => check_frame_length(length)?,
                Some(Err(e)) => {
                    debug!(error = %e, "frame length read failed");
                    return Err(ReaderError::InvalidFrameLength { length: None });
                }
            };

            if length == 0 {
                trace!("keepalive");
                continue;
            }

            // Grows with the bytes received, not with the advertised length
            let mut payload = Vec::new();
            let mut limited = (&mut stream).take(u64::from(length));
            match self.guard(limited.read_to_end(&mut payload)).await {
                None => return Ok(()),
                Some(Ok(received)) if received == length as usize => {}
                Some(Ok(received)) => {
                    debug!(received, expected = length, "frame payload cut short");
                    return Err(ReaderError::ShortPayload { expected: length });
                }
                Some(Err(e)) => {
                    debug!(error = %e, expected = length, "frame payload read failed");
                    return Err(ReaderError::ShortPayload { expected: length });
                }
            }

            self.emit_frame(&payload, &mut clock, &description).await;
            self.emitter.signal().await;

            if self.emitter.is_stop_requested() {
                return Ok(());
            }
        }
    }

    /// Send the init command and read the reply.
    /// Returns None if cancelled.
    async fn handshake(&self, stream: &mut TcpStream) -> Result<Option<ClockConverter>> {
        match self.guard(stream.write_all(&INIT_COMMAND)).await {
            None => return Ok(None),
            Some(Ok(())) => {}
            Some(Err(e)) => {
                return Err(ReaderError::InitCommand {
                    cause: e.to_string(),
                });
            }
        }

        let reply = async {
            let code = stream.read_u32_le().await?;
            let frequency = stream.read_u32_le().await?;
            Ok::<_, io::Error>((code, frequency))
        };

        let (code, frequency) = match self.guard(reply).await {
            None => return Ok(None),
            Some(Ok(reply)) => reply,
            Some(Err(e)) => {
                return Err(ReaderError::Handshake {
                    description: self.description(),
                    cause: e.to_string(),
                });
            }
        };
        debug!(code, frequency, "handshake reply");

        match NonZeroU32::new(frequency) {
            Some(frequency) => Ok(Some(ClockConverter::new(frequency))),
            None => Err(ReaderError::InvalidCalibration {
                description: self.description(),
            }),
        }
    }

    /// Push every record of one frame to the sink, in wire order
    async fn emit_frame(&self, payload: &[u8], clock: &mut ClockConverter, owner: &str) {
        for record in FrameDecoder::new(payload) {
            match record {
                Ok(record) => {
                    let timestamp = clock.get(record.counter);
                    self.emitter
                        .add(LogRecord::new(
                            timestamp,
                            record.file_time,
                            record.pid,
                            AGENT_SOURCE,
                            record.message,
                            owner,
                        ))
                        .await;
                }
                Err(e) => {
                    warn!(error = %e, frame_len = payload.len(), "discarding rest of frame");
                    self.report(&e).await;
                }
            }
        }
    }

    /// Emit the single record describing an error
    async fn report(&self, error: &ReaderError) {
        self.emitter
            .add_message(
                0.0,
                error.source_tag(),
                &error.record_message(),
                &self.description(),
            )
            .await;
    }

    /// Race a transport operation against cancellation; None if cancelled
    async fn guard<T>(&self, op: impl Future<Output = io::Result<T>>) -> Option<io::Result<T>> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = op => Some(result),
        }
    }

    fn description(&self) -> String {
        self.shared.description.read().clone()
    }

    fn set_state(&self, state: ReaderState) {
        *self.shared.state.write() = state;
    }
}
