//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::dispatch::{Handler, HandlerError};
use crate::events::Event;
use crate::logging::{LogLevel, LogSink, Logger, LoggerConfig};
use crate::session::handle::ConnectionCloser;

#[derive(Default)]
pub(crate) struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_owned());
    }
}

pub(crate) fn memory_logger(min_level: LogLevel) -> (Arc<Logger>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let logger = Logger::with_sink(
        LoggerConfig {
            min_level,
            human_friendly: false,
        },
        sink.clone(),
    );
    (Arc::new(logger), sink)
}

pub(crate) struct RecordingHandler {
    name: String,
    seen: Mutex<Vec<(u64, Value)>>,
    journal: Option<Arc<Mutex<Vec<String>>>>,
}

impl RecordingHandler {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            seen: Mutex::new(Vec::new()),
            journal: None,
        }
    }

    pub(crate) fn with_journal(name: &str, journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new(name)
        }
    }

    pub(crate) fn sequences(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .map(|(sequence, _)| sequence)
            .collect()
    }

    /// Sequence and payload of every handled event, in handling order.
    pub(crate) fn events(&self) -> Vec<(u64, Value)> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Handler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event.sequence(), Value::Object(event.payload().clone())));
        if let Some(journal) = &self.journal {
            journal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(format!("{}#{}", self.name, event.sequence()));
        }
        Ok(())
    }
}

/// Fails every event, or only the event with the given sequence.
pub(crate) struct FailingHandler {
    name: String,
    fail_on: Option<u64>,
    seen: Mutex<Vec<u64>>,
}

impl FailingHandler {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            fail_on: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_on(name: &str, sequence: u64) -> Self {
        Self {
            fail_on: Some(sequence),
            ..Self::new(name)
        }
    }

    pub(crate) fn seen(&self) -> Vec<u64> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Handler for FailingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.sequence());
        match self.fail_on {
            Some(sequence) if sequence != event.sequence() => Ok(()),
            _ => Err(HandlerError::failed(format!(
                "{} rejected sequence {}",
                self.name,
                event.sequence()
            ))),
        }
    }
}

pub(crate) struct PanickingHandler {
    name: String,
}

impl PanickingHandler {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

impl Handler for PanickingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
        panic!("handler {} exploded", self.name);
    }
}

pub(crate) struct SlowHandler {
    name: String,
    delay: Duration,
}

impl SlowHandler {
    pub(crate) fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_owned(),
            delay,
        }
    }
}

impl Handler for SlowHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
        thread::sleep(self.delay);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingCloser {
    closes: AtomicUsize,
}

impl RecordingCloser {
    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ConnectionCloser for RecordingCloser {
    fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Closer whose transport refuses to shut down.
pub(crate) struct FailingCloser;

impl ConnectionCloser for FailingCloser {
    fn close(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport already gone"))
    }
}

pub(crate) enum ReadStep {
    Data(Vec<u8>),
    Idle,
    Fail(io::ErrorKind),
}

/// Replays a fixed script of reads, then reports end of stream.
pub(crate) struct ScriptedReader {
    steps: VecDeque<ReadStep>,
}

impl ScriptedReader {
    pub(crate) fn new(steps: Vec<ReadStep>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    pub(crate) fn from_chunks(chunks: &[&[u8]]) -> Self {
        Self::new(
            chunks
                .iter()
                .map(|chunk| ReadStep::Data(chunk.to_vec()))
                .collect(),
        )
    }
}

impl Read for ScriptedReader {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.steps.pop_front() {
            None => Ok(0),
            Some(ReadStep::Idle) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Some(ReadStep::Fail(kind)) => Err(io::Error::new(kind, "scripted failure")),
            Some(ReadStep::Data(mut chunk)) => {
                let taken = chunk.len().min(buffer.len());
                buffer[..taken].copy_from_slice(&chunk[..taken]);
                if taken < chunk.len() {
                    self.steps.push_front(ReadStep::Data(chunk.split_off(taken)));
                }
                Ok(taken)
            }
        }
    }
}

/// Reads chunks sent by the test thread; times out like a socket with a read
/// timeout and reports end of stream once the sender is dropped.
pub(crate) struct ChannelReader {
    chunks: Receiver<Vec<u8>>,
    poll: Duration,
}

impl ChannelReader {
    pub(crate) fn new(chunks: Receiver<Vec<u8>>) -> Self {
        Self {
            chunks,
            poll: Duration::from_millis(5),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.chunks.recv_timeout(self.poll) {
            Ok(chunk) => {
                let taken = chunk.len().min(buffer.len());
                buffer[..taken].copy_from_slice(&chunk[..taken]);
                Ok(taken)
            }
            Err(RecvTimeoutError::Timeout) => Err(io::Error::from(io::ErrorKind::TimedOut)),
            Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }
}

pub(crate) struct PanickingReader;

impl Read for PanickingReader {
    fn read(&mut self, _buffer: &mut [u8]) -> io::Result<usize> {
        panic!("transport exploded");
    }
}
