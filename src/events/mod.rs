use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::wire::decoder::Payload;
use crate::wire::hotcue::HotcueEvent;
use crate::wire::ConnectionId;

/// A decoded, sequenced hotcue occurrence.
///
/// Only the sequencer builds events, so `sequence` is always the
/// server-assigned position on its connection, never a producer value.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    connection_id: ConnectionId,
    sequence: u64,
    payload: Payload,
    received_at: DateTime<Utc>,
}

impl Event {
    pub(crate) fn new(
        connection_id: ConnectionId,
        sequence: u64,
        payload: Payload,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            connection_id,
            sequence,
            payload,
            received_at,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn hotcue(&self) -> Result<HotcueEvent, serde_json::Error> {
        HotcueEvent::from_payload(self.payload())
    }

    pub fn log_payload(&self) -> Value {
        json!({
            "connection_id": self.connection_id,
            "sequence": self.sequence,
            "received_at": self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "payload": Value::Object(self.payload.clone()),
        })
    }
}
