use std::fs;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::registry::SessionRegistry;
use crate::session::handle::SessionState;

/// Point-in-time status of the process and its sessions.
pub fn build_status_payload(app_started_at: DateTime<Utc>, registry: &SessionRegistry) -> Value {
    json!({
        "application": application_status(app_started_at, Utc::now()),
        "memory": memory_stats(),
        "sessions": session_stats(registry),
    })
}

pub fn application_status(app_started_at: DateTime<Utc>, now: DateTime<Utc>) -> Value {
    let uptime_seconds = (now - app_started_at).num_seconds().max(0);
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "build_date_utc": env!("HOTCUE_BUILD_DATE_UTC"),
        "build_revision": env!("HOTCUE_BUILD_REVISION"),
        "started_at": app_started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "now": now.to_rfc3339_opts(SecondsFormat::Millis, true),
        "uptime_seconds": uptime_seconds,
        "pid": std::process::id(),
    })
}

pub fn memory_stats() -> Value {
    match fs::read_to_string("/proc/self/status") {
        Ok(status) => memory_stats_from_status(&status),
        Err(_) => memory_stats_from_status(""),
    }
}

fn memory_stats_from_status(status: &str) -> Value {
    let mut vm_rss_kb: Option<i64> = None;
    let mut vm_size_kb: Option<i64> = None;
    let mut vm_peak_kb: Option<i64> = None;

    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            vm_rss_kb = parse_kb_field(line);
        } else if line.starts_with("VmSize:") {
            vm_size_kb = parse_kb_field(line);
        } else if line.starts_with("VmPeak:") {
            vm_peak_kb = parse_kb_field(line);
        }
    }

    json!({
        "source": "/proc/self/status",
        "available": vm_rss_kb.is_some() || vm_size_kb.is_some() || vm_peak_kb.is_some(),
        "vm_rss_kb": vm_rss_kb,
        "vm_size_kb": vm_size_kb,
        "vm_peak_kb": vm_peak_kb,
    })
}

pub fn session_stats(registry: &SessionRegistry) -> Value {
    let mut open = 0_usize;
    let mut draining = 0_usize;
    let mut closed = 0_usize;
    let mut sessions = Vec::new();

    for snapshot in registry.snapshot() {
        match snapshot.state {
            SessionState::Open => open += 1,
            SessionState::Draining => draining += 1,
            SessionState::Closed => closed += 1,
        }
        sessions.push(snapshot.to_json());
    }

    json!({
        "total": sessions.len(),
        "open": open,
        "draining": draining,
        "closed": closed,
        "shutting_down": registry.is_shutting_down(),
        "sessions": sessions,
    })
}

fn parse_kb_field(line: &str) -> Option<i64> {
    line.split_whitespace().nth(1)?.parse::<i64>().ok()
}
