//! Error types for mq-trigger.
//!
//! [`TriggerError`] covers the two conditions that terminate the process:
//! an unreachable broker (after retries) and invalid configuration.
//!
//! Everything else is scoped to a single message and never escapes the
//! dispatcher:
//!
//! - a malformed message becomes `Suppress(Malformed)` (see
//!   [`crate::SuppressReason`]), never an error value;
//! - [`LaunchError`] is returned when the command cannot be started;
//! - a timeout is a normal [`crate::InvocationOutcome::TimedOut`] result;
//! - [`AckError`] is logged and left to broker redelivery.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Fatal errors
// ---------------------------------------------------------------------------

/// Errors that stop the process.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The broker could not be reached, and reconnection attempts are exhausted.
    #[error("Broker connection failed after {attempts} attempt(s): {message}")]
    Connection {
        /// Number of connection attempts made before giving up.
        attempts: u32,
        /// Description of the last failure.
        message: String,
    },

    /// The configuration is invalid.
    ///
    /// Produced at load time; the listener never starts with an invalid config.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },
}

impl TriggerError {
    /// Shorthand for [`TriggerError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        TriggerError::Config {
            message: message.into(),
        }
    }

    /// Process exit code reported for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            TriggerError::Config { .. } => 2,
            TriggerError::Connection { .. } => 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-message errors
// ---------------------------------------------------------------------------

/// The configured command could not be started.
///
/// Reported against the triggering message; the listener keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("Command not found: {program}")]
    NotFound { program: String },

    #[error("Permission denied executing {program}")]
    PermissionDenied { program: String },

    #[error("Failed to start {program}: {message}")]
    Spawn { program: String, message: String },
}

impl LaunchError {
    /// Classifies a spawn failure by its I/O error kind.
    pub fn from_io(program: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => LaunchError::NotFound {
                program: program.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied {
                program: program.to_string(),
            },
            _ => LaunchError::Spawn {
                program: program.to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// An argument or environment template could not be compiled or rendered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// Template source is not valid; reported as a configuration error.
    #[error("Invalid template {template:?}: {message}")]
    Syntax { template: String, message: String },

    /// Rendering failed, usually because the message lacks a referenced field.
    #[error("Template {template:?} could not be rendered: {message}")]
    Render { template: String, message: String },
}

/// A delivery could not be settled with the broker.
///
/// Not fatal: an unsettled message is redelivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to {action} delivery: {message}")]
pub struct AckError {
    /// `"ack"` or `"defer"`.
    pub action: String,
    pub message: String,
}
