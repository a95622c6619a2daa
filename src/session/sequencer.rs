use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::events::Event;
use crate::wire::decoder::Payload;
use crate::wire::ConnectionId;

/// Irregularity in a producer-embedded counter. Reported, never acted upon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceAnomaly {
    Gap { expected: u64, received: u64 },
    Duplicate { sequence: u64 },
    OutOfOrder { previous: u64, received: u64 },
}

impl SequenceAnomaly {
    pub fn log_payload(&self) -> Value {
        match self {
            Self::Gap { expected, received } => json!({
                "anomaly": "gap",
                "expected": expected,
                "received": received,
            }),
            Self::Duplicate { sequence } => json!({
                "anomaly": "duplicate",
                "received": sequence,
            }),
            Self::OutOfOrder { previous, received } => json!({
                "anomaly": "out_of_order",
                "previous": previous,
                "received": received,
            }),
        }
    }
}

impl fmt::Display for SequenceAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gap { expected, received } => {
                write!(f, "producer sequence gap: expected {expected}, received {received}")
            }
            Self::Duplicate { sequence } => {
                write!(f, "producer sequence {sequence} repeated")
            }
            Self::OutOfOrder { previous, received } => write!(
                f,
                "producer sequence went backwards from {previous} to {received}"
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sequenced {
    pub event: Event,
    pub anomaly: Option<SequenceAnomaly>,
}

/// Per-connection sequence authority.
///
/// Owned by exactly one read loop, so assignment needs no locking.
#[derive(Debug)]
pub struct EventSequencer {
    connection_id: ConnectionId,
    last_assigned: Option<u64>,
    producer_field: Option<String>,
    highest_producer_sequence: Option<u64>,
}

impl EventSequencer {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            last_assigned: None,
            producer_field: None,
            highest_producer_sequence: None,
        }
    }

    /// Watch `field` in every payload for producer-side counter irregularities.
    pub fn with_producer_field(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.producer_field = (!field.is_empty()).then_some(field);
        self
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_assigned
    }

    pub fn sequence(&mut self, payload: Payload, received_at: DateTime<Utc>) -> Sequenced {
        let anomaly = self.observe_producer_sequence(&payload);
        let sequence = self.last_assigned.map_or(1, |last| last + 1);
        self.last_assigned = Some(sequence);

        Sequenced {
            event: Event::new(self.connection_id, sequence, payload, received_at),
            anomaly,
        }
    }

    fn observe_producer_sequence(&mut self, payload: &Payload) -> Option<SequenceAnomaly> {
        let field = self.producer_field.as_deref()?;
        let received = payload.get(field).and_then(Value::as_u64)?;

        let Some(highest) = self.highest_producer_sequence else {
            self.highest_producer_sequence = Some(received);
            return None;
        };

        if received > highest {
            self.highest_producer_sequence = Some(received);
        }

        if received == highest {
            Some(SequenceAnomaly::Duplicate { sequence: received })
        } else if received < highest {
            Some(SequenceAnomaly::OutOfOrder {
                previous: highest,
                received,
            })
        } else if received > highest + 1 {
            Some(SequenceAnomaly::Gap {
                expected: highest + 1,
                received,
            })
        } else {
            None
        }
    }
}
