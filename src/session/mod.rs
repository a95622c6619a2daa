pub mod handle;
pub mod sequencer;

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::config;
use crate::dispatch::Dispatcher;
use crate::logging::{LogLevel, Logger};
use crate::registry::{RegistryError, SessionRegistry};
use crate::wire::decoder::{EventDecoder, DEFAULT_PREVIEW_BYTES};
use crate::wire::frame::{Frame, FrameError, FrameReader, DEFAULT_MAX_FRAME_BYTES};
use crate::wire::ConnectionId;

use self::handle::{ConnectionCloser, SessionHandle, SessionState};
use self::sequencer::EventSequencer;

pub const DEFAULT_READ_BUFFER_BYTES: usize = 16 * 1024;

const LOG_CONTEXT: &str = "ingest::session";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub max_frame_bytes: usize,
    pub read_buffer_bytes: usize,
    pub decode_preview_bytes: usize,
    /// Payload field holding a producer counter; empty disables observation.
    pub producer_sequence_field: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            read_buffer_bytes: DEFAULT_READ_BUFFER_BYTES,
            decode_preview_bytes: DEFAULT_PREVIEW_BYTES,
            producer_sequence_field: String::new(),
        }
    }
}

impl From<&config::IngestConfig> for SessionSettings {
    fn from(value: &config::IngestConfig) -> Self {
        Self {
            max_frame_bytes: value.max_frame_bytes,
            read_buffer_bytes: value.read_buffer_bytes,
            decode_preview_bytes: value.decode_preview_bytes,
            producer_sequence_field: value.producer_sequence_field.trim().to_owned(),
        }
    }
}

/// Collaborators shared by every session of the process.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub logger: Arc<Logger>,
    pub settings: SessionSettings,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Drained,
    ForceClosed,
    FrameTooLarge { size: usize, limit: usize },
    Transport { kind: io::ErrorKind, message: String },
}

impl CloseReason {
    fn is_failure(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. } | Self::Transport { .. })
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed the connection"),
            Self::Drained => f.write_str("drained for shutdown"),
            Self::ForceClosed => f.write_str("force-closed"),
            Self::FrameTooLarge { size, limit } => {
                write!(f, "frame of {size} bytes exceeded limit of {limit} bytes")
            }
            Self::Transport { kind, message } => write!(f, "transport error ({kind:?}): {message}"),
        }
    }
}

impl From<FrameError> for CloseReason {
    fn from(error: FrameError) -> Self {
        match error {
            FrameError::FrameTooLarge { size, limit } => Self::FrameTooLarge { size, limit },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub connection_id: ConnectionId,
    pub close_reason: CloseReason,
    pub events_dispatched: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    pub last_sequence: Option<u64>,
}

impl SessionSummary {
    pub fn log_payload(&self) -> Value {
        json!({
            "connection_id": self.connection_id,
            "close_reason": self.close_reason.to_string(),
            "events_dispatched": self.events_dispatched,
            "decode_failures": self.decode_failures,
            "handler_failures": self.handler_failures,
            "last_sequence": self.last_sequence,
        })
    }
}

/// Keeps the session registered for as long as it lives.
///
/// Dropping it, on any exit path including unwinding, marks the session
/// closed, releases the connection and unregisters it.
struct Registration {
    registry: Arc<SessionRegistry>,
    handle: SessionHandle,
    logger: Arc<Logger>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.handle.advance(SessionState::Closed);
        if let Err(error) = self.handle.release_connection() {
            self.logger.debug(
                Some(LOG_CONTEXT),
                &format!(
                    "releasing connection {} reported: {error}",
                    self.handle.connection_id()
                ),
            );
        }
        self.registry.unregister(self.handle.connection_id());
    }
}

/// One producer connection: read loop, decode, sequence, dispatch.
pub struct ConnectionSession<R> {
    reader: R,
    frames: FrameReader,
    decoder: EventDecoder,
    sequencer: EventSequencer,
    dispatcher: Arc<Dispatcher>,
    logger: Arc<Logger>,
    read_buffer_bytes: usize,
    events_dispatched: u64,
    decode_failures: u64,
    handler_failures: u64,
    registration: Registration,
}

impl<R: Read> ConnectionSession<R> {
    /// Registers a new session for an accepted connection.
    pub fn open(
        context: &SessionContext,
        connection_id: ConnectionId,
        peer: impl Into<String>,
        reader: R,
        closer: Arc<dyn ConnectionCloser>,
    ) -> Result<Self, RegistryError> {
        let handle = SessionHandle::new(connection_id, peer, closer);
        context.registry.register(handle.clone())?;

        let settings = &context.settings;
        context.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            &format!("Session {connection_id} opened"),
            Some(json!({
                "connection_id": connection_id,
                "peer": handle.peer(),
            })),
        );

        Ok(Self {
            reader,
            frames: FrameReader::new(settings.max_frame_bytes),
            decoder: EventDecoder::new(settings.decode_preview_bytes),
            sequencer: EventSequencer::new(connection_id)
                .with_producer_field(settings.producer_sequence_field.clone()),
            dispatcher: Arc::clone(&context.dispatcher),
            logger: Arc::clone(&context.logger),
            read_buffer_bytes: settings.read_buffer_bytes.max(1),
            events_dispatched: 0,
            decode_failures: 0,
            handler_failures: 0,
            registration: Registration {
                registry: Arc::clone(&context.registry),
                handle,
                logger: Arc::clone(&context.logger),
            },
        })
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.registration.handle
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.registration.handle.connection_id()
    }

    /// Runs the read loop to completion and closes the session.
    pub fn run(mut self) -> SessionSummary {
        let mut buffer = vec![0_u8; self.read_buffer_bytes];

        let close_reason = loop {
            if self.handle().was_force_closed() {
                break CloseReason::ForceClosed;
            }
            if self.handle().drain_requested() {
                self.discard_partial_frame();
                break CloseReason::Drained;
            }

            match self.reader.read(&mut buffer) {
                Ok(0) if self.handle().was_force_closed() => break CloseReason::ForceClosed,
                Ok(0) => {
                    self.handle().advance(SessionState::Draining);
                    break match self.frames.finish() {
                        Ok(Some(frame)) => {
                            self.process_frame(frame);
                            CloseReason::PeerClosed
                        }
                        Ok(None) => CloseReason::PeerClosed,
                        Err(error) => error.into(),
                    };
                }
                Ok(size) => {
                    self.frames.feed(&buffer[..size]);
                    if let Err(error) = self.process_complete_frames() {
                        break error.into();
                    }
                }
                Err(error) if is_idle_read(&error) => {}
                Err(_) if self.handle().was_force_closed() => break CloseReason::ForceClosed,
                Err(error) => {
                    break CloseReason::Transport {
                        kind: error.kind(),
                        message: error.to_string(),
                    }
                }
            }
        };

        self.close(close_reason)
    }

    /// Dispatches buffered frames until none is complete or the session was
    /// force-closed; a closed session dispatches nothing more.
    fn process_complete_frames(&mut self) -> Result<(), FrameError> {
        while !self.handle().was_force_closed() {
            let Some(frame) = self.frames.next_frame()? else {
                break;
            };
            self.process_frame(frame);
        }
        Ok(())
    }

    fn process_frame(&mut self, frame: Frame) {
        let connection_id = self.connection_id();
        let payload = match self.decoder.decode(connection_id, &frame) {
            Ok(payload) => payload,
            Err(error) => {
                self.decode_failures += 1;
                self.logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    &format!("Dropped undecodable frame on connection {connection_id}: {error}"),
                    Some(error.log_payload()),
                );
                return;
            }
        };

        let sequenced = self.sequencer.sequence(payload, frame.completed_at());
        let event = sequenced.event;
        if let Some(anomaly) = sequenced.anomaly {
            self.logger.log(
                LogLevel::Warn,
                Some(LOG_CONTEXT),
                &format!(
                    "Producer sequence anomaly on event {connection_id}#{}: {anomaly}",
                    event.sequence()
                ),
                Some(anomaly.log_payload()),
            );
        }

        self.registration.handle.record_sequence(event.sequence());
        let result = self.dispatcher.dispatch(&event);
        self.events_dispatched += 1;
        self.handler_failures += result.failure_count() as u64;
    }

    fn discard_partial_frame(&mut self) {
        let pending = self.frames.buffered_len();
        if pending > 0 {
            self.logger.debug(
                Some(LOG_CONTEXT),
                &format!(
                    "Discarding {pending} byte(s) of unterminated frame on connection {} during drain",
                    self.connection_id()
                ),
            );
        }
    }

    fn close(self, close_reason: CloseReason) -> SessionSummary {
        let summary = SessionSummary {
            connection_id: self.connection_id(),
            close_reason,
            events_dispatched: self.events_dispatched,
            decode_failures: self.decode_failures,
            handler_failures: self.handler_failures,
            last_sequence: self.sequencer.last_sequence(),
        };

        let level = if summary.close_reason.is_failure() {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        self.logger.log(
            level,
            Some(LOG_CONTEXT),
            &format!(
                "Session {} closed: {}",
                summary.connection_id, summary.close_reason
            ),
            Some(summary.log_payload()),
        );

        summary
    }
}

fn is_idle_read(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
