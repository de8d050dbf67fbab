//! mq-trigger orchestration.
//!
//! The [`Dispatcher`] drives one subscription: it pulls deliveries from a
//! [`trigger::MessageSource`], asks the [`trigger::TriggerPolicy`] what to do
//! with each one, hands fired commands to a [`trigger::CommandRunner`], and
//! settles every delivery once its decision has been carried out.
//!
//! ## Concurrency Model
//!
//! | Task | Count | Role |
//! |------|-------|------|
//! | Receive loop | 1 | Owns the policy; decides each message on arrival; periodic sweep |
//! | Worker | `max_concurrency` | Runs commands and settles deliveries, one job per lane |
//!
//! Jobs for the same trigger key run in arrival order and never overlap;
//! jobs for different keys run in parallel up to the pool size. A deferred
//! message is handed back to its source with the remaining delay as soon as
//! it is decided; the source holds it, not the dispatcher.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** The dispatcher sequences calls between the
//! business logic in [`trigger`] and the infrastructure behind its port
//! traits. It contains no trigger rules of its own.

mod dispatcher;
mod queue;
mod stats;

pub use dispatcher::{Dispatcher, DispatcherSettings};
pub use stats::{DispatchStats, StatsSnapshot};
