//! Core types for hourvault

use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;

/// Receipt time in seconds since Unix epoch
pub type Timestamp = i64;

/// One ingested datagram
///
/// Immutable once created: the listener stamps it, the writer persists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    received_at: Timestamp,
    source: String,
    payload: Bytes,
}

impl LogRecord {
    /// Create a new record
    pub fn new(received_at: Timestamp, source: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            received_at,
            source: source.into(),
            payload: payload.into(),
        }
    }

    /// Receipt time in seconds since epoch
    pub fn received_at(&self) -> Timestamp {
        self.received_at
    }

    /// Sender address in human-readable form
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as text; invalid UTF-8 sequences are replaced
    pub fn message(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Approximate in-memory size in bytes
    pub fn size(&self) -> usize {
        8 + self.source.len() + self.payload.len()
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.received_at, self.source, self.message())
    }
}
