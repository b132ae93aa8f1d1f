//! Event model, decoding and schema validation
//!
//! Raw records arrive as bytes. [`decode`] turns them into a JSON document and
//! [`validate`] checks that document against the required event shape. The two
//! steps fail differently on purpose: a decode failure is a transport problem
//! and is dropped, a validation failure is a schema problem and is dead-lettered.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::error::{AggregatorError, Result};

/// Event type that opens a session
pub const SESSION_START: &str = "session_start";
/// Event type that closes a session
pub const SESSION_END: &str = "session_end";
/// Payload field carrying the session identifier
pub const SESSION_ID_FIELD: &str = "session_id";

/// A validated, tenant-scoped event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Tenant owning the event
    pub tenant_id: String,
    /// Event type, e.g. `click`, `session_start`
    pub event_type: String,
    /// Event time in seconds since the epoch
    pub timestamp: f64,
    /// Free-form metadata
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// Classification of an event for the session tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// `session_start`
    SessionStart,
    /// `session_end`
    SessionEnd,
    /// Anything else
    Other,
}

impl Event {
    /// Create an event with an empty payload
    pub fn new(tenant_id: impl Into<String>, event_type: impl Into<String>, timestamp: f64) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            event_type: event_type.into(),
            timestamp,
            payload: Map::new(),
        }
    }

    /// Add a payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Set the session identifier
    pub fn with_session(self, session_id: impl Into<String>) -> Self {
        self.with_field(SESSION_ID_FIELD, session_id.into())
    }

    /// Session identifier from the payload, if it is a string
    pub fn session_id(&self) -> Option<&str> {
        self.payload.get(SESSION_ID_FIELD).and_then(Value::as_str)
    }

    /// Classify the event type
    pub fn kind(&self) -> EventKind {
        kind_of(&self.event_type)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn kind_of(event_type: &str) -> EventKind {
    match event_type {
        SESSION_START => EventKind::SessionStart,
        SESSION_END => EventKind::SessionEnd,
        _ => EventKind::Other,
    }
}

/// Why a decoded record failed validation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidReason {
    /// The document is not a JSON object
    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),
    /// A required field is absent or null
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    /// A field has the wrong JSON type
    #[error("field `{field}` must be {expected}, found {found}")]
    WrongType {
        /// Offending field
        field: &'static str,
        /// Expected JSON type
        expected: &'static str,
        /// Actual JSON type
        found: &'static str,
    },
    /// A string field is empty
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),
    /// Timestamp is NaN or infinite
    #[error("field `timestamp` must be a finite number")]
    NonFiniteTimestamp,
    /// Session event without a usable session identifier
    #[error("`{0}` event requires a non-empty string `payload.session_id`")]
    MissingSessionId(String),
}

/// Outcome of schema validation
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// The record is a well-formed event
    Valid(Event),
    /// The record failed a required-field or type check
    Invalid(InvalidReason),
}

impl Validation {
    /// Whether the record passed validation
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validation::Valid(event) => write!(
                f,
                "valid tenant={} type={} ts={}",
                event.tenant_id, event.event_type, event.timestamp
            ),
            Validation::Invalid(reason) => write!(f, "invalid: {}", reason),
        }
    }
}

/// Decode raw bytes into a JSON document
pub fn decode(raw: &[u8]) -> Result<Value> {
    serde_json::from_slice(raw).map_err(|e| AggregatorError::Decode(e.to_string()))
}

/// Check a decoded document against the event shape
///
/// Only presence and type checks are performed. Session events must also carry
/// a `payload.session_id` string, since their pairing key is derived from it.
pub fn validate(document: Value) -> Validation {
    match check(document) {
        Ok(event) => Validation::Valid(event),
        Err(reason) => Validation::Invalid(reason),
    }
}

fn check(document: Value) -> std::result::Result<Event, InvalidReason> {
    let mut fields = match document {
        Value::Object(map) => map,
        other => return Err(InvalidReason::NotAnObject(json_type(&other))),
    };

    let tenant_id = required_string(&mut fields, "tenant_id")?;
    let event_type = required_string(&mut fields, "event_type")?;

    let timestamp = match fields.get("timestamp") {
        None | Some(Value::Null) => return Err(InvalidReason::MissingField("timestamp")),
        Some(Value::Number(n)) => n.as_f64().ok_or(InvalidReason::NonFiniteTimestamp)?,
        Some(other) => {
            return Err(InvalidReason::WrongType {
                field: "timestamp",
                expected: "a number",
                found: json_type(other),
            })
        }
    };
    if !timestamp.is_finite() {
        return Err(InvalidReason::NonFiniteTimestamp);
    }

    let payload = match fields.remove("payload") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(InvalidReason::WrongType {
                field: "payload",
                expected: "an object",
                found: json_type(&other),
            })
        }
    };

    let event = Event {
        tenant_id,
        event_type,
        timestamp,
        payload,
    };

    if event.kind() != EventKind::Other && event.session_id().map_or(true, str::is_empty) {
        return Err(InvalidReason::MissingSessionId(event.event_type));
    }

    Ok(event)
}

fn required_string(
    fields: &mut Map<String, Value>,
    field: &'static str,
) -> std::result::Result<String, InvalidReason> {
    match fields.remove(field) {
        None | Some(Value::Null) => Err(InvalidReason::MissingField(field)),
        Some(Value::String(s)) if s.is_empty() => Err(InvalidReason::EmptyField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(InvalidReason::WrongType {
            field,
            expected: "a string",
            found: json_type(&other),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
