pub mod handlers;

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::events::Event;
use crate::logging::{LogLevel, Logger};
use crate::utils::timing::{format_duration_human_friendly, timed};
use crate::wire::ConnectionId;

pub const DEFAULT_SLOW_HANDLER_WARN_MS: u64 = 250;

const LOG_CONTEXT: &str = "ingest::dispatch";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerError {
    Failed { message: String },
    Panicked { message: String },
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { message } => write!(f, "handler failed: {message}"),
            Self::Panicked { message } => write!(f, "handler panicked: {message}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Downstream consumer of dispatched events.
///
/// Handlers run inline on the producing connection's read loop and must
/// return in bounded time.
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

#[derive(Clone, Debug)]
pub struct HandlerOutcome {
    pub handler: String,
    pub result: Result<(), HandlerError>,
    pub elapsed: Duration,
}

/// Per-handler results for one event. Retry policy is left to the caller.
#[derive(Clone, Debug)]
pub struct DispatchResult {
    pub connection_id: ConnectionId,
    pub sequence: u64,
    pub outcomes: Vec<HandlerOutcome>,
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &HandlerError)> {
        self.outcomes.iter().filter_map(|outcome| {
            outcome
                .result
                .as_ref()
                .err()
                .map(|error| (outcome.handler.as_str(), error))
        })
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }
}

/// Fixed, ordered set of handlers shared by every session.
pub struct Dispatcher {
    handlers: Vec<Arc<dyn Handler>>,
    logger: Arc<Logger>,
    slow_handler_threshold: Duration,
}

impl Dispatcher {
    pub fn new(handlers: Vec<Arc<dyn Handler>>, logger: Arc<Logger>) -> Self {
        Self {
            handlers,
            logger,
            slow_handler_threshold: Duration::from_millis(DEFAULT_SLOW_HANDLER_WARN_MS),
        }
    }

    pub fn with_slow_handler_threshold(mut self, threshold: Duration) -> Self {
        self.slow_handler_threshold = threshold;
        self
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }

    pub fn dispatch(&self, event: &Event) -> DispatchResult {
        let mut outcomes = Vec::with_capacity(self.handlers.len());

        for handler in &self.handlers {
            let (caught, elapsed) =
                timed(|| catch_unwind(AssertUnwindSafe(|| handler.handle(event))));
            let result = match caught {
                Ok(result) => result,
                Err(panic) => Err(HandlerError::Panicked {
                    message: panic_message(panic.as_ref()),
                }),
            };

            if let Err(error) = &result {
                self.logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    &format!(
                        "handler '{}' failed for event {}#{}: {error}",
                        handler.name(),
                        event.connection_id(),
                        event.sequence()
                    ),
                    Some(event.log_payload()),
                );
            }
            if elapsed > self.slow_handler_threshold {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!(
                        "handler '{}' took {} for event {}#{}",
                        handler.name(),
                        format_duration_human_friendly(elapsed),
                        event.connection_id(),
                        event.sequence()
                    ),
                );
            }

            outcomes.push(HandlerOutcome {
                handler: handler.name().to_owned(),
                result,
                elapsed,
            });
        }

        let dispatched = DispatchResult {
            connection_id: event.connection_id(),
            sequence: event.sequence(),
            outcomes,
        };

        if self.logger.enabled(LogLevel::Debug) {
            self.logger.log(
                LogLevel::Debug,
                Some(LOG_CONTEXT),
                "Event dispatched",
                Some(json!({
                    "connection_id": dispatched.connection_id,
                    "sequence": dispatched.sequence,
                    "success": dispatched.is_success(),
                    "failed": dispatched.failure_count(),
                    "handler_elapsed_ms": dispatched
                        .outcomes
                        .iter()
                        .map(|outcome| json!({
                            "handler": outcome.handler,
                            "elapsed_ms": outcome.elapsed.as_millis() as u64,
                        }))
                        .collect::<Vec<_>>(),
                })),
            );
        }

        dispatched
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use crate::events::Event;
    use crate::logging::{LogLevel, Logger, LoggerConfig};
    use crate::test_support::{FailingHandler, MemorySink, PanickingHandler, RecordingHandler, SlowHandler};

    use super::{Dispatcher, Handler, HandlerError};

    fn event(sequence: u64) -> Event {
        let payload = json!({"hotcue": sequence})
            .as_object()
            .expect("object literal")
            .clone();
        Event::new(1, sequence, payload, Utc::now())
    }

    fn logger_with(sink: Arc<MemorySink>) -> Arc<Logger> {
        Arc::new(Logger::with_sink(
            LoggerConfig {
                min_level: LogLevel::Debug,
                human_friendly: false,
            },
            sink,
        ))
    }

    #[test]
    fn invokes_handlers_in_registration_order() {
        let journal = Arc::new(std::sync::Mutex::new(Vec::new()));
        let first = Arc::new(RecordingHandler::with_journal("first", Arc::clone(&journal)));
        let second = Arc::new(RecordingHandler::with_journal("second", Arc::clone(&journal)));
        let handlers: Vec<Arc<dyn Handler>> = vec![first, second];
        let dispatcher = Dispatcher::new(handlers, logger_with(Arc::new(MemorySink::default())));

        let result = dispatcher.dispatch(&event(1));

        assert!(result.is_success());
        assert_eq!(dispatcher.handler_names(), vec!["first", "second"]);
        assert_eq!(
            *journal.lock().expect("journal lock"),
            vec!["first#1".to_owned(), "second#1".to_owned()]
        );
    }

    #[test]
    fn failing_handler_does_not_stop_other_handlers() {
        let sink = Arc::new(MemorySink::default());
        let recorder = Arc::new(RecordingHandler::new("recorder"));
        let handlers: Vec<Arc<dyn Handler>> =
            vec![Arc::new(FailingHandler::new("flaky")), recorder.clone()];
        let dispatcher = Dispatcher::new(handlers, logger_with(sink.clone()));

        let result = dispatcher.dispatch(&event(1));

        assert!(!result.is_success());
        assert_eq!(result.failure_count(), 1);
        let failures: Vec<_> = result.failures().collect();
        assert_eq!(failures[0].0, "flaky");
        assert_eq!(recorder.sequences(), vec![1]);
        assert!(sink.contains("handler 'flaky' failed for event 1#1"));
    }

    #[test]
    fn handler_failure_for_one_event_does_not_block_the_next() {
        let failing_once = Arc::new(FailingHandler::failing_on("picky", 1));
        let handlers: Vec<Arc<dyn Handler>> = vec![failing_once.clone()];
        let dispatcher = Dispatcher::new(handlers, logger_with(Arc::new(MemorySink::default())));

        let first = dispatcher.dispatch(&event(1));
        let second = dispatcher.dispatch(&event(2));

        assert!(!first.is_success());
        assert!(second.is_success());
        assert_eq!(failing_once.seen(), vec![1, 2]);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let recorder = Arc::new(RecordingHandler::new("recorder"));
        let handlers: Vec<Arc<dyn Handler>> =
            vec![Arc::new(PanickingHandler::new("boom")), recorder.clone()];
        let dispatcher = Dispatcher::new(handlers, logger_with(Arc::new(MemorySink::default())));

        let result = dispatcher.dispatch(&event(3));

        assert_eq!(
            result.outcomes[0].result,
            Err(HandlerError::Panicked {
                message: "handler boom exploded".to_owned()
            })
        );
        assert_eq!(recorder.sequences(), vec![3]);
    }

    #[test]
    fn slow_handlers_are_reported() {
        let sink = Arc::new(MemorySink::default());
        let handlers: Vec<Arc<dyn Handler>> =
            vec![Arc::new(SlowHandler::new("sluggish", Duration::from_millis(30)))];
        let dispatcher = Dispatcher::new(handlers, logger_with(sink.clone()))
            .with_slow_handler_threshold(Duration::from_millis(5));

        let result = dispatcher.dispatch(&event(1));

        assert!(result.is_success());
        assert!(result.outcomes[0].elapsed >= Duration::from_millis(30));
        assert!(sink.contains("handler 'sluggish' took"));
    }

    #[test]
    fn empty_dispatcher_reports_success() {
        let dispatcher = Dispatcher::new(Vec::new(), logger_with(Arc::new(MemorySink::default())));
        let result = dispatcher.dispatch(&event(1));

        assert!(result.is_success());
        assert!(result.outcomes.is_empty());
        assert_eq!(result.sequence, 1);
    }
}
