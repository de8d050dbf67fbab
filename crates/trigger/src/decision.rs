//! The result of evaluating one message against the trigger policy.

use std::time::Duration;

use crate::CommandSpec;

/// Why a message did not fire the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressReason {
    /// A prior trigger for the same key is still inside its debounce window.
    Debounced,
    /// The key has used up its fire budget for the current rate-limit window.
    RateLimited,
    /// This delivery id has already fired once.
    Duplicate,
    /// Required metadata is missing or unusable.
    Malformed { detail: String },
}

impl SuppressReason {
    /// Short, stable label used in logs and counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::Debounced => "debounced",
            SuppressReason::RateLimited => "rate-limited",
            SuppressReason::Duplicate => "duplicate",
            SuppressReason::Malformed { .. } => "malformed",
        }
    }

    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        SuppressReason::Malformed {
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuppressReason::Malformed { detail } => write!(f, "malformed: {detail}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// What to do with a message.
///
/// Exactly one decision is produced per consumed message. Only `Fire` ever
/// reaches the command runner.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerDecision {
    /// Run the command once.
    Fire(CommandSpec),
    /// Drop the trigger; the message is still acknowledged.
    Suppress(SuppressReason),
    /// Hand the message back to the broker after the delay.
    Defer(Duration),
}

impl TriggerDecision {
    /// `"fire"`, `"suppress"` or `"defer"`.
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerDecision::Fire(_) => "fire",
            TriggerDecision::Suppress(_) => "suppress",
            TriggerDecision::Defer(_) => "defer",
        }
    }

    pub fn is_fire(&self) -> bool {
        matches!(self, TriggerDecision::Fire(_))
    }

    /// The suppress reason, if this is a `Suppress` decision.
    pub fn suppress_reason(&self) -> Option<&SuppressReason> {
        match self {
            TriggerDecision::Suppress(reason) => Some(reason),
            _ => None,
        }
    }
}
