mod config;
mod diagnostics;
mod dispatch;
mod events;
mod heartbeat;
mod logging;
mod orchestrator;
mod registry;
mod server;
mod session;
mod shutdown;
#[cfg(test)]
mod test_support;
mod utils;
mod wire;

use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use config::{AppConfig, LoadedConfig};
use dispatch::handlers::build_handlers;
use dispatch::Dispatcher;
use heartbeat::{BeatCallback, Heartbeat, HeartbeatConfig};
use logging::{LogLevel, Logger, LoggerConfig};
use orchestrator::delivery::Router;
use orchestrator::triggers::TriggerSet;
use registry::SessionRegistry;
use server::TcpServer;
use session::{SessionContext, SessionSettings, SessionSummary};
use shutdown::ShutdownHooks;
use utils::startup_banner::print_startup_banner;
use utils::timing::ScopedExecutionTimer;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SESSION_JOIN_GRACE: Duration = Duration::from_millis(250);

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();
    let app_started_at = Utc::now();

    let LoadedConfig {
        config: app_config,
        source: config_source,
    } = load_config_or_exit();
    let log_level = app_config.logging.log_level().unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
            app_config.logging.level
        );
        process::exit(2);
    });

    let logger = Logger::with_optional_file(
        LoggerConfig {
            min_level: log_level,
            human_friendly: app_config.logging.human_friendly,
        },
        app_config.logging.file_path(),
    )
    .unwrap_or_else(|error| {
        eprintln!(
            "failed to open log file '{}': {error}",
            app_config.logging.file_path
        );
        process::exit(2);
    });
    let logger = Arc::new(logger);
    logger.log(
        LogLevel::Info,
        Some("main::config"),
        "Configuration loaded",
        Some(json!({
            "source": config_source.to_string(),
            "log_file": app_config.logging.file_path,
        })),
    );

    let handler_kinds = app_config.dispatch.handler_kinds().unwrap_or_else(|error| {
        eprintln!("dispatch configuration error: {error}");
        process::exit(2);
    });
    let triggers = TriggerSet::new(app_config.triggers.clone());
    let router = Arc::new(Router::new(app_config.targets.clone()).unwrap_or_else(|error| {
        eprintln!("delivery configuration error: {error}");
        process::exit(2);
    }));
    let dispatcher = Dispatcher::new(
        build_handlers(&handler_kinds, &triggers, &router, &logger),
        Arc::clone(&logger),
    )
    .with_slow_handler_threshold(Duration::from_millis(
        app_config.dispatch.slow_handler_warn_ms,
    ));
    logger.log(
        LogLevel::Info,
        Some("main::dispatch"),
        "Dispatcher initialized",
        Some(json!({
            "handlers": dispatcher.handler_names(),
            "triggers_count": triggers.len(),
            "delivery_targets": app_config.targets.keys().collect::<Vec<_>>(),
            "slow_handler_warn_ms": app_config.dispatch.slow_handler_warn_ms,
        })),
    );

    let registry = Arc::new(SessionRegistry::new());
    let context = SessionContext {
        registry: Arc::clone(&registry),
        dispatcher: Arc::new(dispatcher),
        logger: Arc::clone(&logger),
        settings: SessionSettings::from(&app_config.ingest),
    };

    let server = TcpServer::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} accepting producer connections",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "max_frame_bytes": context.settings.max_frame_bytes,
            "read_poll_interval_ms": app_config.ingest.read_poll_interval_ms,
            "producer_sequence_field": context.settings.producer_sequence_field,
        })),
    );

    let mut heartbeat = start_heartbeat_or_exit(&app_config, app_started_at, &registry, &logger);

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let mut session_threads: Vec<JoinHandle<SessionSummary>> = Vec::new();
    while !shutdown_hooks.is_triggered() {
        match server.try_accept() {
            Ok(Some(accepted)) => {
                let connection_id = accepted.id();
                logger.log(
                    LogLevel::Info,
                    Some("main::server"),
                    "Accepted producer connection",
                    Some(json!({
                        "connection_id": connection_id,
                        "peer_addr": accepted.peer_addr().to_string(),
                    })),
                );
                match accepted.spawn_session(&context) {
                    Ok(handle) => session_threads.push(handle),
                    Err(error) => logger.warn(
                        Some("main::server"),
                        &format!("connection {connection_id} dropped: {error}"),
                    ),
                }
                continue;
            }
            Ok(None) => {}
            Err(error) => logger.warn(Some("main::server"), &error.to_string()),
        }

        reap_finished_sessions(&mut session_threads, &logger);
        thread::sleep(ACCEPT_POLL_INTERVAL);
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    drop(server);
    if let Some(heartbeat) = heartbeat.as_mut() {
        if let Err(error) = heartbeat.stop() {
            logger.warn(Some("main::shutdown"), &error.to_string());
        }
    }

    let timeout = Duration::from_millis(app_config.shutdown.timeout_ms);
    let report = {
        let _timer = ScopedExecutionTimer::new("session drain", Some("main::shutdown"), &logger);
        registry.shutdown(timeout)
    };
    for failure in &report.close_failures {
        logger.warn(Some("main::shutdown"), &failure.to_string());
    }
    match report.timeout_error() {
        Some(error) => logger.log(
            LogLevel::Warn,
            Some("main::shutdown"),
            &error.to_string(),
            Some(json!({
                "drained": report.drained,
                "forced": report.forced,
            })),
        ),
        None => logger.log(
            LogLevel::Info,
            Some("main::shutdown"),
            "All sessions drained before timeout",
            Some(json!({ "drained": report.drained })),
        ),
    }

    join_sessions_within(session_threads, SESSION_JOIN_GRACE, &logger);

    logger.info(Some("main::shutdown"), "Shutdown completed");
}

fn load_config_or_exit() -> LoadedConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(loaded) => loaded,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: hotcue-orchestrator is intended for POSIX systems");
        process::exit(2);
    }
}

fn start_heartbeat_or_exit(
    app_config: &AppConfig,
    app_started_at: DateTime<Utc>,
    registry: &Arc<SessionRegistry>,
    logger: &Arc<Logger>,
) -> Option<Heartbeat> {
    if !app_config.heartbeat.enabled {
        logger.info(Some("main::heartbeat"), "Status reports disabled");
        return None;
    }

    let report_registry = Arc::clone(registry);
    let report_logger = Arc::clone(logger);
    let on_beat: BeatCallback = Arc::new(move |beat: Value| {
        let mut status = diagnostics::build_status_payload(app_started_at, &report_registry);
        status["heartbeat"] = beat;
        report_logger.log(
            LogLevel::Info,
            Some("main::heartbeat"),
            "Status report",
            Some(status),
        );
    });

    let mut heartbeat = Heartbeat::new(HeartbeatConfig::from(app_config.heartbeat), on_beat)
        .unwrap_or_else(|error| {
            eprintln!("heartbeat configuration error: {error}");
            process::exit(2);
        });
    heartbeat.start().unwrap_or_else(|error| {
        eprintln!("heartbeat startup error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::heartbeat"),
        "Heartbeat started",
        Some(heartbeat.initial_metadata_payload()),
    );
    Some(heartbeat)
}

fn reap_finished_sessions(threads: &mut Vec<JoinHandle<SessionSummary>>, logger: &Logger) {
    let mut index = 0;
    while index < threads.len() {
        if threads[index].is_finished() {
            join_session(threads.swap_remove(index), logger);
        } else {
            index += 1;
        }
    }
}

/// Joins session threads that finish within `grace`; the rest are detached so
/// a handler stuck in a force-closed session cannot hold up exit.
fn join_sessions_within(
    mut threads: Vec<JoinHandle<SessionSummary>>,
    grace: Duration,
    logger: &Logger,
) {
    let deadline = Instant::now() + grace;
    loop {
        reap_finished_sessions(&mut threads, logger);
        if threads.is_empty() || Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    if !threads.is_empty() {
        let names: Vec<String> = threads
            .iter()
            .map(|handle| handle.thread().name().unwrap_or("session").to_owned())
            .collect();
        logger.log(
            LogLevel::Warn,
            Some("main::shutdown"),
            &format!(
                "Detaching {} session thread(s) still busy after {}ms",
                names.len(),
                grace.as_millis()
            ),
            Some(json!({ "threads": names })),
        );
    }
}

fn join_session(handle: JoinHandle<SessionSummary>, logger: &Logger) {
    let name = handle.thread().name().unwrap_or("session").to_owned();
    if handle.join().is_err() {
        logger.error(
            Some("main::server"),
            &format!("session thread {name} panicked"),
        );
    }
}
