//! Newline-delimited JSON messages, for running without a broker.
//!
//! Each non-empty line is one message:
//!
//! ```json
//! {"routing_key": "alerts.disk", "delivery_id": "m-1", "headers": {"host": "db1"}, "payload": {"pct": 97}}
//! ```
//!
//! A string `payload` is used verbatim; any other JSON value is re-encoded.
//! `timestamp` (RFC 3339 or Unix seconds) defaults to the time the line is read.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use trigger::{DeliveryId, Message, Timestamp};

use crate::memory::{memory_queue, MemoryPublisher, MemorySource};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireMessage {
    #[serde(default)]
    routing_key: Option<String>,
    #[serde(default)]
    delivery_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Why an input line could not be turned into a [`Message`].
#[derive(Debug, Error)]
pub enum LineError {
    #[error("invalid message JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp {raw:?}")]
    Timestamp { raw: String },
}

/// Parses one line into a [`Message`].
pub fn parse_line(line: &str) -> Result<Message, LineError> {
    let wire: WireMessage = serde_json::from_str(line)?;

    let timestamp = match wire.timestamp {
        Some(raw) => match Timestamp::parse(&raw) {
            Some(ts) => ts,
            None => return Err(LineError::Timestamp { raw }),
        },
        None => Timestamp::now(),
    };
    let payload = match wire.payload {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::String(s) => s.into_bytes(),
        other => other.to_string().into_bytes(),
    };

    let mut message = Message::new(payload, timestamp);
    if let Some(rk) = wire.routing_key {
        message = message.with_routing_key(rk);
    }
    if let Some(id) = wire.delivery_id.and_then(DeliveryId::new) {
        message = message.with_delivery_id(id);
    }
    for (name, value) in wire.headers {
        message = message.with_header(name, value);
    }
    Ok(message)
}

/// Starts a task that publishes each line of `reader` and returns the source
/// consuming them. The source ends after EOF once all deliveries are settled.
pub fn line_source<R>(reader: R) -> (MemorySource, JoinHandle<()>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (publisher, source) = memory_queue();
    let task = tokio::spawn(pump_lines(reader, publisher));
    (source, task)
}

/// Reads messages from the process's stdin.
pub fn stdin_source() -> (MemorySource, JoinHandle<()>) {
    line_source(tokio::io::BufReader::new(tokio::io::stdin()))
}

async fn pump_lines<R>(reader: R, publisher: MemoryPublisher)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0u64;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read input; stopping");
                break;
            }
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(message) => {
                if !publisher.publish(message) {
                    debug!("source dropped; stopping input reader");
                    break;
                }
            }
            Err(e) => warn!(line = line_no, error = %e, "skipping unparsable input line"),
        }
    }
    debug!(lines = line_no, "input exhausted");
}
