// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Counter-based trigger deduplication.
//!
//! Producers stamp every trigger with a counter that only ever grows (a
//! part count, a capture timestamp). Broker redelivery after a reconnect, or
//! a producer publishing the same reading twice, shows up here as a counter
//! that does not exceed the last one acted upon, and is dropped.
//!
//! Payloads may be:
//! - a bare value (`42`, `2025-03-01T10:00:00Z`)
//! - a JSON scalar (`42`, `"42"`)
//! - a JSON object, when a counter field is configured (`{"count": 42}`)

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// How counters are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// Signed 64-bit integers.
    Integer,
    /// RFC 3339 timestamps, or integer milliseconds since the Unix epoch.
    Timestamp,
}

/// A parsed counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CounterValue {
    /// Integer counter.
    Integer(i64),
    /// Timestamp counter.
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterValue::Integer(v) => write!(f, "{}", v),
            CounterValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

/// A payload that does not carry a usable counter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Payload bytes are not UTF-8.
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    /// Payload is empty or whitespace.
    #[error("payload is empty")]
    Empty,
    /// Configured counter field is absent.
    #[error("payload has no counter field '{0}'")]
    MissingField(String),
    /// Counter is an object, array, boolean or null.
    #[error("counter is not a scalar: {0}")]
    NotScalar(String),
    /// Counter text is not an integer.
    #[error("counter '{0}' is not an integer")]
    InvalidInteger(String),
    /// Counter text is not a timestamp.
    #[error("counter '{0}' is not a timestamp")]
    InvalidTimestamp(String),
}

/// Suppresses triggers whose counter does not strictly exceed the last accepted one.
///
/// State starts below every legal value, so the first well-formed counter is
/// always accepted. Rejections, malformed payloads included, never touch the
/// state.
#[derive(Debug, Clone)]
pub struct TriggerDeduplicator {
    kind: CounterKind,
    field: Option<String>,
    last_accepted: Option<CounterValue>,
}

impl TriggerDeduplicator {
    /// Create a deduplicator for counters of the given kind.
    pub fn new(kind: CounterKind) -> Self {
        Self {
            kind,
            field: None,
            last_accepted: None,
        }
    }

    /// Read the counter from this field of a JSON object payload.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Counter kind.
    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    /// Last accepted counter, `None` before the first acceptance.
    pub fn last_accepted(&self) -> Option<CounterValue> {
        self.last_accepted
    }

    /// Accept `value` iff it is strictly greater than the last accepted value.
    pub fn accept(&mut self, value: CounterValue) -> bool {
        match self.last_accepted {
            Some(last) if value <= last => false,
            _ => {
                self.last_accepted = Some(value);
                true
            }
        }
    }

    /// Parse the counter from a raw payload and [`accept`](Self::accept) it.
    pub fn accept_payload(&mut self, payload: &[u8]) -> Result<bool, ParseError> {
        let value = self.parse(payload)?;
        Ok(self.accept(value))
    }

    /// Parse the counter carried by a raw payload.
    pub fn parse(&self, payload: &[u8]) -> Result<CounterValue, ParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| ParseError::NotUtf8)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ParseError::Empty);
        }

        let scalar = match &self.field {
            Some(field) => {
                let doc: Value = serde_json::from_str(text)
                    .map_err(|_| ParseError::MissingField(field.clone()))?;
                let value = doc
                    .get(field)
                    .ok_or_else(|| ParseError::MissingField(field.clone()))?;
                scalar_text(value)?
            }
            None => match serde_json::from_str::<Value>(text) {
                Ok(value) => scalar_text(&value)?,
                // Not JSON: the payload is the bare counter.
                Err(_) => text.to_string(),
            },
        };

        self.parse_scalar(scalar.trim())
    }

    fn parse_scalar(&self, text: &str) -> Result<CounterValue, ParseError> {
        match self.kind {
            CounterKind::Integer => text
                .parse::<i64>()
                .map(CounterValue::Integer)
                .map_err(|_| ParseError::InvalidInteger(text.to_string())),
            CounterKind::Timestamp => {
                if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
                    return Ok(CounterValue::Timestamp(ts.with_timezone(&Utc)));
                }
                text.parse::<i64>()
                    .ok()
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .map(CounterValue::Timestamp)
                    .ok_or_else(|| ParseError::InvalidTimestamp(text.to_string()))
            }
        }
    }
}

fn scalar_text(value: &Value) -> Result<String, ParseError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ParseError::NotScalar(other.to_string())),
    }
}
