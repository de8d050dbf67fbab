//! Human-readable durations in configuration files.
//!
//! Accepts either an integer number of seconds (`30`) or a string with a unit
//! suffix (`"500ms"`, `"10s"`, `"5m"`, `"1h"`, `"1d"`). A bare numeric string is
//! read as seconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Why a duration string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("duration {input:?} has no numeric value")]
    MissingValue { input: String },

    #[error("duration {input:?} is out of range")]
    OutOfRange { input: String },

    #[error("duration {input:?} has unknown unit {unit:?}")]
    UnknownUnit { input: String, unit: String },
}

/// Parses a duration string such as `"10s"` or `"250ms"`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(DurationError::MissingValue {
            input: input.to_string(),
        });
    }
    // Only digits remain, so the sole failure is overflow.
    let value: u64 = digits.parse().map_err(|_| DurationError::OutOfRange {
        input: input.to_string(),
    })?;

    let duration = match unit.trim() {
        "" | "s" | "sec" | "secs" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" | "min" | "mins" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3_600)),
        "d" => Duration::from_secs(value.saturating_mul(86_400)),
        other => {
            return Err(DurationError::UnknownUnit {
                input: input.to_string(),
                unit: other.to_string(),
            })
        }
    };
    Ok(duration)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

/// `deserialize_with` helper for [`Duration`] fields.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
