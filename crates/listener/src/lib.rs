//! mq-trigger message source infrastructure.
//!
//! Implements the [`trigger::MessageSource`] trait with three backends:
//!
//! - [`AmqpListener`]: consumes from a durable queue bound to the configured
//!   topic patterns on an AMQP 0-9-1 broker. Reconnects with exponential
//!   back-off and reports a fatal [`trigger::TriggerError::Connection`] once
//!   the retry budget is spent. Deferred messages are parked in a companion
//!   delay queue and dead-lettered back when their delay expires.
//!
//! - [`MemorySource`]: an in-process queue fed by a [`MemoryPublisher`].
//!   Settlements are recorded and deferrals redelivered, so the dispatcher can
//!   be exercised end to end without a broker.
//!
//! - [`line_source`] / [`stdin_source`]: newline-delimited JSON messages read
//!   into a [`MemorySource`]. Used by `mq-trigger --stdin`.
//!
//! ## Deployment Scenarios
//!
//! | Scenario | Source | Notes |
//! |----------|--------|-------|
//! | Production | `AmqpListener` | RabbitMQ or any AMQP 0-9-1 broker |
//! | Local trial / replay | `stdin_source` | Pipe captured messages in |
//! | Tests | `memory_queue` | Deterministic, inspectable settlements |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Transport details, broker topology, and wire decoding
//! all live here. The [`trigger`] crate sees only [`trigger::MessageSource`]
//! and [`trigger::Message`].

mod amqp;
pub mod lines;
pub mod memory;

pub use amqp::{redact_url, AmqpListener};
pub use lines::{line_source, parse_line, stdin_source, LineError};
pub use memory::{memory_queue, MemoryPublisher, MemorySource, SettlementLog};
