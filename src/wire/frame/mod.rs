use std::fmt;

use chrono::{DateTime, Utc};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;
pub const LINE_DELIMITER: u8 = b'\n';

/// One delimiter-bounded record, without the delimiter or a trailing `\r`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
    completed_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(bytes: Vec<u8>, completed_at: DateTime<Utc>) -> Self {
        Self {
            bytes,
            completed_at,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    FrameTooLarge { size: usize, limit: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooLarge { size, limit } => write!(
                f,
                "frame of at least {size} bytes exceeds the {limit} byte limit"
            ),
        }
    }
}

impl std::error::Error for FrameError {}

/// Reassembles newline-delimited frames from arbitrarily split byte chunks.
///
/// Feed chunks as they arrive, then pull frames with [`FrameReader::next_frame`]
/// until it returns `Ok(None)`. Frames completed before an oversized one are
/// still yielded; once a frame exceeds the limit the reader stays failed.
#[derive(Debug)]
pub struct FrameReader {
    buffer: Vec<u8>,
    consumed: usize,
    scanned: usize,
    max_frame_bytes: usize,
    failure: Option<FrameError>,
}

impl FrameReader {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            consumed: 0,
            scanned: 0,
            max_frame_bytes,
            failure: None,
        }
    }

    /// Bytes held for frames that have not been yielded yet.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        if self.failure.is_some() || chunk.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(chunk);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            if let Some(failure) = &self.failure {
                return Err(failure.clone());
            }

            let search_from = self.scanned.max(self.consumed);
            let Some(offset) = self.buffer[search_from..]
                .iter()
                .position(|byte| *byte == LINE_DELIMITER)
            else {
                self.compact();
                let pending = strip_carriage_return(&self.buffer).len();
                if pending > self.max_frame_bytes {
                    return Err(self.fail(pending));
                }
                return Ok(None);
            };

            let end = search_from + offset;
            let start = self.consumed;
            self.consumed = end + 1;
            self.scanned = self.consumed;

            let line_len = strip_carriage_return(&self.buffer[start..end]).len();
            if line_len > self.max_frame_bytes {
                return Err(self.fail(line_len));
            }

            let line = strip_carriage_return(&self.buffer[start..end]);
            if is_blank(line) {
                continue;
            }

            return Ok(Some(Frame::new(line.to_vec(), Utc::now())));
        }
    }

    /// Yields whatever unterminated record remains once the stream has ended.
    pub fn finish(&mut self) -> Result<Option<Frame>, FrameError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }

        let line = strip_carriage_return(&self.buffer[self.consumed..]).to_vec();
        if line.len() > self.max_frame_bytes {
            return Err(self.fail(line.len()));
        }

        self.buffer.clear();
        self.consumed = 0;
        self.scanned = 0;

        if is_blank(&line) {
            return Ok(None);
        }
        Ok(Some(Frame::new(line, Utc::now())))
    }

    fn compact(&mut self) {
        if self.consumed == 0 {
            self.scanned = self.buffer.len();
            return;
        }
        self.buffer.drain(..self.consumed);
        self.consumed = 0;
        self.scanned = self.buffer.len();
    }

    fn fail(&mut self, size: usize) -> FrameError {
        let failure = FrameError::FrameTooLarge {
            size,
            limit: self.max_frame_bytes,
        };
        self.failure = Some(failure.clone());
        self.buffer = Vec::new();
        self.consumed = 0;
        self.scanned = 0;
        failure
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

fn strip_carriage_return(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}
