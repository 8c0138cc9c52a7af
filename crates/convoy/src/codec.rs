//! JSON-lines framing for the daemon socket.
//!
//! Wraps [`LinesCodec`] so that a malformed or oversized record surfaces as a
//! [`Record::Malformed`] item instead of a decode error. `FramedRead` stops
//! yielding after the first decoder error, so bad input from one client must
//! never reach it as an `Err`.

use crate::protocol::MAX_LINE_BYTES;
use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A well-formed JSON object.
    Json(Value),
    /// The line could not be parsed; the stream continues with the next line.
    Malformed(String),
}

#[derive(Debug)]
pub struct JsonLinesCodec {
    lines: LinesCodec,
}

impl JsonLinesCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn parse(line: &str) -> Record {
        match serde_json::from_str::<Value>(line) {
            Ok(value) if value.is_object() => Record::Json(value),
            Ok(_) => Record::Malformed("expected a JSON object".to_string()),
            Err(e) => Record::Malformed(format!("invalid JSON: {e}")),
        }
    }

    fn next_record(
        result: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Option<Record>>, LinesCodecError> {
        match result {
            Ok(Some(line)) if line.trim().is_empty() => Ok(Some(None)),
            Ok(Some(line)) => Ok(Some(Some(Self::parse(&line)))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Some(Record::Malformed(
                "frame exceeds maximum line length".to_string(),
            )))),
            // LinesCodec has already consumed the offending line.
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(Some(Record::Malformed(format!("invalid UTF-8: {e}")))))
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for JsonLinesCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonLinesCodec {
    type Item = Record;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, LinesCodecError> {
        loop {
            match Self::next_record(self.lines.decode(buf))? {
                Some(Some(record)) => return Ok(Some(record)),
                // blank line
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, LinesCodecError> {
        loop {
            match Self::next_record(self.lines.decode_eof(buf))? {
                Some(Some(record)) => return Ok(Some(record)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), LinesCodecError> {
        let line = serde_json::to_string(&item)
            .map_err(|e| LinesCodecError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        self.lines.encode(line, dst)
    }
}
