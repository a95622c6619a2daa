use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::wire::ConnectionId;

/// Releases the transport behind a session, unblocking any pending read.
pub trait ConnectionCloser: Send + Sync {
    fn close(&self) -> io::Result<()>;
}

/// Lifecycle position of a session. States only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Open,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connection_id: ConnectionId,
    pub peer: String,
    pub state: SessionState,
    pub last_sequence: Option<u64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn to_json(&self) -> Value {
        json!({
            "connection_id": self.connection_id,
            "peer": self.peer,
            "state": self.state.as_str(),
            "last_sequence": self.last_sequence,
            "opened_at": self.opened_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "closed_at": self
                .closed_at
                .map(|closed_at| closed_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        })
    }
}

struct SessionStatus {
    state: SessionState,
    last_sequence: Option<u64>,
    closed_at: Option<DateTime<Utc>>,
}

struct SessionShared {
    connection_id: ConnectionId,
    peer: String,
    opened_at: DateTime<Utc>,
    status: Mutex<SessionStatus>,
    drain_requested: AtomicBool,
    force_closed: AtomicBool,
    closer: Arc<dyn ConnectionCloser>,
}

/// Shared view of one session.
///
/// The read loop owns the session and is the only writer of its sequence
/// progress; the registry keeps a clone to request drain or force closure.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn new(
        connection_id: ConnectionId,
        peer: impl Into<String>,
        closer: Arc<dyn ConnectionCloser>,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                connection_id,
                peer: peer.into(),
                opened_at: Utc::now(),
                status: Mutex::new(SessionStatus {
                    state: SessionState::Open,
                    last_sequence: None,
                    closed_at: None,
                }),
                drain_requested: AtomicBool::new(false),
                force_closed: AtomicBool::new(false),
                closer,
            }),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status();
        SessionSnapshot {
            connection_id: self.shared.connection_id,
            peer: self.shared.peer.clone(),
            state: status.state,
            last_sequence: status.last_sequence,
            opened_at: self.shared.opened_at,
            closed_at: status.closed_at,
        }
    }

    /// Asks the read loop to stop taking new bytes. Returns `false` if drain
    /// had already been requested.
    pub fn request_drain(&self) -> bool {
        let first = !self.shared.drain_requested.swap(true, Ordering::SeqCst);
        self.advance(SessionState::Draining);
        first
    }

    pub fn drain_requested(&self) -> bool {
        self.shared.drain_requested.load(Ordering::SeqCst)
    }

    /// Closes the session without waiting for the read loop.
    pub fn force_close(&self) -> io::Result<()> {
        self.shared.force_closed.store(true, Ordering::SeqCst);
        self.shared.drain_requested.store(true, Ordering::SeqCst);
        self.advance(SessionState::Closed);
        self.shared.closer.close()
    }

    pub fn was_force_closed(&self) -> bool {
        self.shared.force_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn record_sequence(&self, sequence: u64) {
        self.status().last_sequence = Some(sequence);
    }

    pub(crate) fn advance(&self, next: SessionState) -> bool {
        let mut status = self.status();
        if next <= status.state {
            return false;
        }
        status.state = next;
        if next == SessionState::Closed {
            status.closed_at = Some(Utc::now());
        }
        true
    }

    pub(crate) fn release_connection(&self) -> io::Result<()> {
        self.shared.closer.close()
    }

    fn status(&self) -> MutexGuard<'_, SessionStatus> {
        self.shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection_id", &self.shared.connection_id)
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .finish()
    }
}
