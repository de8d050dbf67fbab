//! Shared value types: messages, timestamps, and invocation results.
//!
//! A [`Message`] is immutable once received. An [`InvocationResult`] is
//! terminal: it is logged and counted, never stored.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{DeliveryId, InvocationId};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from whole seconds since the Unix epoch.
    ///
    /// Returns `None` if the value is out of the representable range.
    pub fn from_unix_seconds(secs: i64) -> Option<Self> {
        DateTime::from_timestamp(secs, 0).map(Self)
    }

    /// Parses an RFC 3339 string or an integer count of Unix seconds.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(secs) = value.parse::<i64>() {
            return Self::from_unix_seconds(secs);
        }
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc)))
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        self.0
            .signed_duration_since(earlier.0)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Returns `self + duration`, clamped to the latest representable time.
    pub fn saturating_add(self, duration: Duration) -> Self {
        TimeDelta::from_std(duration)
            .ok()
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map_or(Self(DateTime::<Utc>::MAX_UTC), Self)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A message consumed from the broker.
///
/// The payload is opaque; only the metadata (routing key, delivery id,
/// headers, timestamp) participates in trigger decisions. Header values are
/// normalised to strings by the listener that produced the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    routing_key: Option<String>,
    delivery_id: Option<DeliveryId>,
    timestamp: Timestamp,
    headers: BTreeMap<String, String>,
    payload: Vec<u8>,
    redelivered: bool,
}

impl Message {
    /// Creates a message with the given payload and no metadata.
    pub fn new(payload: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            routing_key: None,
            delivery_id: None,
            timestamp,
            headers: BTreeMap::new(),
            payload: payload.into(),
            redelivered: false,
        }
    }

    /// Sets the routing key. An empty key is treated as absent.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        let key = routing_key.into();
        self.routing_key = if key.is_empty() { None } else { Some(key) };
        self
    }

    /// Sets the delivery id.
    pub fn with_delivery_id(mut self, delivery_id: DeliveryId) -> Self {
        self.delivery_id = Some(delivery_id);
        self
    }

    /// Adds (or replaces) a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Marks the message as a broker redelivery.
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    pub fn delivery_id(&self) -> Option<&DeliveryId> {
        self.delivery_id.as_ref()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Looks up a header by exact name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// How a delivery is settled once its decision is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    /// The message has been consumed; the broker may forget it.
    Ack,
    /// Hand the message back to the broker, to be delivered again once
    /// `delay` has passed. The original delivery is released immediately.
    Defer { delay: Duration },
}

impl std::fmt::Display for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Settlement::Ack => f.write_str("ack"),
            Settlement::Defer { .. } => f.write_str("defer"),
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation results
// ---------------------------------------------------------------------------

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The process exited on its own with the given status code.
    Exited { code: i32 },
    /// The process was terminated by a signal it did not ask for.
    Signalled { signal: Option<i32> },
    /// The configured timeout elapsed and the process was killed.
    TimedOut,
}

impl InvocationOutcome {
    /// `true` only for a zero exit code.
    pub fn is_success(self) -> bool {
        matches!(self, InvocationOutcome::Exited { code: 0 })
    }

    /// The exit code, if the process exited normally.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            InvocationOutcome::Exited { code } => Some(code),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvocationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationOutcome::Exited { code } => write!(f, "exited with code {code}"),
            InvocationOutcome::Signalled { signal: Some(sig) } => {
                write!(f, "terminated by signal {sig}")
            }
            InvocationOutcome::Signalled { signal: None } => f.write_str("terminated by signal"),
            InvocationOutcome::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Output captured from one stream of a child process, up to a byte bound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CapturedOutput {
    /// Wraps captured bytes; `truncated` records whether output was dropped.
    pub fn new(bytes: Vec<u8>, truncated: bool) -> Self {
        Self { bytes, truncated }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The captured bytes as UTF-8, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The terminal record of one command execution.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub id: InvocationId,
    pub outcome: InvocationOutcome,
    /// Empty unless output capture is enabled.
    pub stdout: CapturedOutput,
    /// Empty unless output capture is enabled.
    pub stderr: CapturedOutput,
    pub duration: Duration,
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}
