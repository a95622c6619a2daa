use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::session::handle::{SessionHandle, SessionSnapshot};
use crate::wire::ConnectionId;

pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateConnection { connection_id: ConnectionId },
    ShuttingDown { connection_id: ConnectionId },
    ShutdownTimeout { stragglers: usize, timeout: Duration },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateConnection { connection_id } => {
                write!(f, "connection {connection_id} is already registered")
            }
            Self::ShuttingDown { connection_id } => write!(
                f,
                "registry is shutting down; connection {connection_id} was not registered"
            ),
            Self::ShutdownTimeout {
                stragglers,
                timeout,
            } => write!(
                f,
                "{stragglers} session(s) did not close within {}ms and were force-closed",
                timeout.as_millis()
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// A straggler whose transport could not be closed cleanly.
#[derive(Debug, PartialEq, Eq)]
pub struct CloseFailure {
    pub connection_id: ConnectionId,
    pub kind: io::ErrorKind,
    pub message: String,
}

impl fmt::Display for CloseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "closing connection {} failed ({:?}): {}",
            self.connection_id, self.kind, self.message
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: Vec<ConnectionId>,
    pub forced: Vec<ConnectionId>,
    pub close_failures: Vec<CloseFailure>,
    pub timeout: Duration,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn timeout_error(&self) -> Option<RegistryError> {
        (!self.forced.is_empty()).then(|| RegistryError::ShutdownTimeout {
            stragglers: self.forced.len(),
            timeout: self.timeout,
        })
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: BTreeMap<ConnectionId, SessionHandle>,
    shutting_down: bool,
}

/// Process-wide table of live sessions.
///
/// Every mutation goes through one mutex; unregistration signals the
/// condition variable that `shutdown` waits on.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    changed: Condvar,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: SessionHandle) -> Result<(), RegistryError> {
        let connection_id = handle.connection_id();
        let mut inner = self.lock();
        if inner.shutting_down {
            return Err(RegistryError::ShuttingDown { connection_id });
        }
        if inner.sessions.contains_key(&connection_id) {
            return Err(RegistryError::DuplicateConnection { connection_id });
        }
        inner.sessions.insert(connection_id, handle);
        Ok(())
    }

    pub fn unregister(&self, connection_id: ConnectionId) -> Option<SessionHandle> {
        let removed = self.lock().sessions.remove(&connection_id);
        self.changed.notify_all();
        removed
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Visits every registered session in connection order.
    ///
    /// The visitor runs on a consistent copy of the table taken under the lock,
    /// so it may call back into the registry.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&SessionHandle),
    {
        let handles: Vec<SessionHandle> = self.lock().sessions.values().cloned().collect();
        for handle in &handles {
            visit(handle);
        }
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snapshots = Vec::new();
        self.for_each(|handle| snapshots.push(handle.snapshot()));
        snapshots
    }

    /// Drains every session, waiting at most `timeout` before force-closing
    /// the rest. New registrations are refused from the first call onwards.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started_at = Instant::now();
        let deadline = started_at + timeout;

        let targets: Vec<SessionHandle> = {
            let mut inner = self.lock();
            inner.shutting_down = true;
            inner.sessions.values().cloned().collect()
        };
        for handle in &targets {
            handle.request_drain();
        }

        let mut inner = self.lock();
        while !inner.sessions.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            inner = self
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let stragglers: Vec<SessionHandle> =
            std::mem::take(&mut inner.sessions).into_values().collect();
        drop(inner);
        self.changed.notify_all();

        let close_failures = stragglers
            .iter()
            .filter_map(|handle| {
                handle.force_close().err().map(|error| CloseFailure {
                    connection_id: handle.connection_id(),
                    kind: error.kind(),
                    message: error.to_string(),
                })
            })
            .collect();

        let forced: Vec<ConnectionId> = stragglers.iter().map(SessionHandle::connection_id).collect();
        let drained = targets
            .iter()
            .map(SessionHandle::connection_id)
            .filter(|connection_id| !forced.contains(connection_id))
            .collect();

        ShutdownReport {
            drained,
            forced,
            close_failures,
            timeout,
            elapsed: started_at.elapsed(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::session::handle::{SessionHandle, SessionState};
    use crate::test_support::{FailingCloser, RecordingCloser};

    use super::{CloseFailure, RegistryError, SessionRegistry};

    fn handle(connection_id: u64) -> (SessionHandle, Arc<RecordingCloser>) {
        let closer = Arc::new(RecordingCloser::default());
        (
            SessionHandle::new(connection_id, format!("peer-{connection_id}"), closer.clone()),
            closer,
        )
    }

    #[test]
    fn registers_visits_and_unregisters_sessions() {
        let registry = SessionRegistry::new();
        let (first, _) = handle(2);
        let (second, _) = handle(1);

        registry.register(first).expect("first registration");
        registry.register(second).expect("second registration");

        let mut visited = Vec::new();
        registry.for_each(|session| visited.push(session.connection_id()));
        assert_eq!(visited, vec![1, 2]);

        assert!(registry.unregister(1).is_some());
        assert!(registry.unregister(1).is_none());
        let remaining = registry.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].peer, "peer-2");
    }

    #[test]
    fn rejects_duplicate_connection_ids() {
        let registry = SessionRegistry::new();
        let (first, _) = handle(1);
        let (again, _) = handle(1);

        registry.register(first).expect("first registration");
        assert_eq!(
            registry.register(again),
            Err(RegistryError::DuplicateConnection { connection_id: 1 })
        );
    }

    #[test]
    fn visitor_may_call_back_into_registry() {
        let registry = SessionRegistry::new();
        let (first, _) = handle(1);
        registry.register(first).expect("registration");

        registry.for_each(|session| {
            registry.unregister(session.connection_id());
        });

        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn shutdown_with_no_sessions_returns_immediately() {
        let registry = SessionRegistry::new();
        let report = registry.shutdown(Duration::from_secs(5));

        assert!(report.drained.is_empty());
        assert!(report.forced.is_empty());
        assert!(report.elapsed < Duration::from_secs(1));
        assert!(report.timeout_error().is_none());
    }

    #[test]
    fn shutdown_waits_for_cooperative_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let mut workers = Vec::new();

        for connection_id in 1..=3 {
            let (session, closer) = handle(connection_id);
            registry.register(session.clone()).expect("registration");
            let registry = Arc::clone(&registry);
            workers.push(thread::spawn(move || {
                while !session.drain_requested() {
                    thread::sleep(Duration::from_millis(5));
                }
                session.advance(SessionState::Closed);
                registry.unregister(session.connection_id());
                closer.close_count()
            }));
        }

        let report = registry.shutdown(Duration::from_secs(5));

        assert_eq!(report.drained, vec![1, 2, 3]);
        assert!(report.forced.is_empty());
        registry.for_each(|_| panic!("no session should remain"));
        for worker in workers {
            assert_eq!(worker.join().expect("worker thread"), 0);
        }
    }

    #[test]
    fn shutdown_force_closes_stragglers_at_timeout() {
        let registry = SessionRegistry::new();
        let (stuck, stuck_closer) = handle(7);
        let stuck_view = stuck.clone();
        registry.register(stuck).expect("registration");

        let report = registry.shutdown(Duration::from_millis(50));

        assert_eq!(report.forced, vec![7]);
        assert!(report.drained.is_empty());
        assert!(report.elapsed >= Duration::from_millis(50));
        assert_eq!(stuck_closer.close_count(), 1);
        assert_eq!(stuck_view.state(), SessionState::Closed);
        assert!(stuck_view.was_force_closed());
        assert!(matches!(
            report.timeout_error(),
            Some(RegistryError::ShutdownTimeout { stragglers: 1, .. })
        ));

        let mut remaining = 0;
        registry.for_each(|_| remaining += 1);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn shutdown_reports_transport_close_failures() {
        let registry = SessionRegistry::new();
        let (closable, _) = handle(1);
        registry.register(closable).expect("registration");
        registry
            .register(SessionHandle::new(2, "peer-2", Arc::new(FailingCloser)))
            .expect("registration");

        let report = registry.shutdown(Duration::from_millis(10));

        assert_eq!(report.forced, vec![1, 2]);
        assert_eq!(
            report.close_failures,
            vec![CloseFailure {
                connection_id: 2,
                kind: io::ErrorKind::BrokenPipe,
                message: "transport already gone".to_owned(),
            }]
        );
        assert_eq!(
            report.close_failures[0].to_string(),
            "closing connection 2 failed (BrokenPipe): transport already gone"
        );
    }

    #[test]
    fn refuses_registration_after_shutdown_started() {
        let registry = SessionRegistry::new();
        registry.shutdown(Duration::from_millis(1));

        let (late, _) = handle(3);
        assert_eq!(
            registry.register(late),
            Err(RegistryError::ShuttingDown { connection_id: 3 })
        );
        assert!(registry.is_shutting_down());
    }
}
