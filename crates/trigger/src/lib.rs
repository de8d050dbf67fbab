//! Core domain for mq-trigger.
//!
//! mq-trigger watches a message queue and runs a command when qualifying
//! messages arrive. This crate holds everything that decides *whether* and
//! *how* to run it: messages, trigger decisions, the debounce/rate-limit
//! policy, command templates, configuration, and the error taxonomy.
//! Infrastructure crates implement the port traits defined here; they never
//! add trigger rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`TriggerKey`, `DeliveryId`, `InvocationId`) |
//! | [`types`] | `Message`, `Timestamp`, `Settlement`, invocation results |
//! | [`decision`] | `TriggerDecision` and `SuppressReason` |
//! | [`command`] | `CommandTemplate` and the resolved `CommandSpec` |
//! | [`policy`] | `TriggerPolicy`: debounce, rate limit, dedupe, defer |
//! | [`config`] | TOML configuration model and validation |
//! | [`duration`] | `"10s"`-style duration parsing for config fields |
//! | [`ports`] | `MessageSource`, `Acknowledge`, `CommandRunner` |
//! | [`errors`] | Fatal and per-message error types |

pub mod command;
pub mod config;
pub mod decision;
pub mod duration;
pub mod errors;
pub mod identifiers;
pub mod policy;
pub mod ports;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use command::{CommandSpec, CommandTemplate, OutputCapture};
pub use config::{
    BrokerConfig, CommandConfig, Config, PolicyConfig, RateLimitConfig, ReconnectConfig,
    RuntimeConfig,
};
pub use decision::{SuppressReason, TriggerDecision};
pub use duration::DurationError;
pub use errors::{AckError, LaunchError, TemplateError, TriggerError};
pub use identifiers::{DeliveryId, InvocationId, TriggerKey};
pub use policy::{KeySource, TriggerPolicy, NOT_BEFORE_HEADER};
pub use ports::{Acknowledge, CommandRunner, Delivery, MessageSource};
pub use types::{
    CapturedOutput, InvocationOutcome, InvocationResult, Message, Settlement, Timestamp,
};
