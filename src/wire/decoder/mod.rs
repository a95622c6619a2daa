use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::wire::frame::Frame;
use crate::wire::ConnectionId;

pub const DEFAULT_PREVIEW_BYTES: usize = 256;

/// Decoded event body: string keys to arbitrary JSON values.
pub type Payload = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeErrorKind {
    InvalidUtf8,
    MalformedJson,
    NotAnObject,
}

impl DecodeErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUtf8 => "invalid_utf8",
            Self::MalformedJson => "malformed_json",
            Self::NotAnObject => "not_an_object",
        }
    }
}

/// A frame that could not be turned into a payload.
///
/// `at` is the frame completion time, which keeps decoding a pure function of
/// the frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeError {
    pub connection_id: ConnectionId,
    pub kind: DecodeErrorKind,
    pub description: String,
    pub preview: String,
    pub preview_truncated: bool,
    pub frame_len: usize,
    pub at: DateTime<Utc>,
}

impl DecodeError {
    pub fn log_payload(&self) -> Value {
        json!({
            "connection_id": self.connection_id,
            "kind": self.kind.as_str(),
            "description": self.description,
            "preview": self.preview,
            "preview_truncated": self.preview_truncated,
            "frame_len": self.frame_len,
            "received_at": self.at.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame from connection {} rejected ({}): {}",
            self.connection_id,
            self.kind.as_str(),
            self.description
        )
    }
}

impl std::error::Error for DecodeError {}

/// Stateless frame decoder; safe to share between sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventDecoder {
    preview_bytes: usize,
}

impl EventDecoder {
    pub fn new(preview_bytes: usize) -> Self {
        Self { preview_bytes }
    }

    pub fn decode(&self, connection_id: ConnectionId, frame: &Frame) -> Result<Payload, DecodeError> {
        let text = std::str::from_utf8(frame.bytes()).map_err(|source| {
            self.reject(
                connection_id,
                frame,
                DecodeErrorKind::InvalidUtf8,
                source.to_string(),
            )
        })?;

        let value: Value = serde_json::from_str(text).map_err(|source| {
            self.reject(
                connection_id,
                frame,
                DecodeErrorKind::MalformedJson,
                source.to_string(),
            )
        })?;

        match value {
            Value::Object(payload) => Ok(payload),
            other => Err(self.reject(
                connection_id,
                frame,
                DecodeErrorKind::NotAnObject,
                format!("expected a JSON object, got {}", json_type_name(&other)),
            )),
        }
    }

    fn reject(
        &self,
        connection_id: ConnectionId,
        frame: &Frame,
        kind: DecodeErrorKind,
        description: String,
    ) -> DecodeError {
        let (preview, preview_truncated) = preview(frame.bytes(), self.preview_bytes);
        DecodeError {
            connection_id,
            kind,
            description,
            preview,
            preview_truncated,
            frame_len: frame.len(),
            at: frame.completed_at(),
        }
    }
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_BYTES)
    }
}

/// Lossy text preview of at most `limit` bytes, cut on a character boundary
/// when the prefix is valid UTF-8.
pub fn preview(bytes: &[u8], limit: usize) -> (String, bool) {
    if bytes.len() <= limit {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }

    let mut cut = limit;
    if let Ok(text) = std::str::from_utf8(bytes) {
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
    }

    (String::from_utf8_lossy(&bytes[..cut]).into_owned(), true)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
