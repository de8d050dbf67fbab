//! mq-trigger command invoker.
//!
//! Implements the [`trigger::CommandRunner`] trait by running each
//! [`trigger::CommandSpec`] as a `tokio::process` child:
//!
//! - arguments and environment overrides come straight from the `CommandSpec`;
//! - stdin is the message payload when configured, `/dev/null` otherwise;
//! - stdout/stderr are captured up to a byte bound (excess is drained and
//!   dropped, never an error);
//! - the timeout kills the child and reports
//!   [`trigger::InvocationOutcome::TimedOut`];
//! - a non-zero exit is an ordinary result; only a failure to start the
//!   program is a [`trigger::LaunchError`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Process spawning, pipe handling, and signal decoding
//! live here. The [`trigger`] crate sees only [`trigger::CommandRunner`].

mod capture;
mod process;

pub use process::ProcessInvoker;
