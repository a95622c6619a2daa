use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::config;

pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 3_600_000;
pub const DEFAULT_INTERVAL_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

impl From<config::HeartbeatConfig> for HeartbeatConfig {
    fn from(value: config::HeartbeatConfig) -> Self {
        Self {
            interval_ms: value.interval_ms,
        }
    }
}

#[derive(Debug)]
pub enum HeartbeatError {
    InvalidInterval { provided_ms: u64 },
    AlreadyRunning,
    Spawn(std::io::Error),
    JoinFailed,
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "heartbeat interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::AlreadyRunning => write!(f, "heartbeat is already running"),
            Self::Spawn(source) => write!(f, "failed to spawn heartbeat thread: {source}"),
            Self::JoinFailed => write!(f, "heartbeat worker thread join failed"),
        }
    }
}

impl std::error::Error for HeartbeatError {}

pub fn validate_interval(interval_ms: u64) -> Result<(), HeartbeatError> {
    if (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
        Ok(())
    } else {
        Err(HeartbeatError::InvalidInterval {
            provided_ms: interval_ms,
        })
    }
}

/// Called on every beat with the beat metadata.
pub type BeatCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Periodic worker driving status reports.
///
/// Beats are spaced by the interval; stopping interrupts the wait at once.
pub struct Heartbeat {
    pub initiated_at: DateTime<Utc>,
    interval_ms: u64,
    on_beat: BeatCallback,
    stop_signal: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig, on_beat: BeatCallback) -> Result<Self, HeartbeatError> {
        validate_interval(config.interval_ms)?;

        Ok(Self {
            initiated_at: Utc::now(),
            interval_ms: config.interval_ms,
            on_beat,
            stop_signal: None,
            worker: None,
        })
    }

    pub fn start(&mut self) -> Result<(), HeartbeatError> {
        if self.worker.is_some() {
            return Err(HeartbeatError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let on_beat = Arc::clone(&self.on_beat);
        let initiated_at = self.initiated_at;
        let interval_ms = self.interval_ms;

        let worker = thread::Builder::new()
            .name("hotcue-heartbeat".to_owned())
            .spawn(move || {
                let mut beat: u64 = 0;
                loop {
                    match stop_rx.recv_timeout(Duration::from_millis(interval_ms)) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    beat += 1;
                    on_beat(json!({
                        "beat": beat,
                        "initiated_at": initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                        "emitted_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                        "interval_ms": interval_ms,
                    }));
                }
            })
            .map_err(HeartbeatError::Spawn)?;

        self.stop_signal = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), HeartbeatError> {
        self.stop_signal.take();

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| HeartbeatError::JoinFailed);
        }

        Ok(())
    }

    pub fn initial_metadata_payload(&self) -> Value {
        json!({
            "initiated_at": self.initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "interval_ms": self.interval_ms
        })
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop_signal.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
