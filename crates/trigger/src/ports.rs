//! Port traits implemented by the infrastructure crates.
//!
//! | Trait | Implemented by |
//! |-------|----------------|
//! | [`MessageSource`] | `listener::AmqpListener`, `listener::MemorySource` |
//! | [`Acknowledge`] | the acker handed out with each [`Delivery`] |
//! | [`CommandRunner`] | `invoker::ProcessInvoker` |

use async_trait::async_trait;

use crate::{
    AckError, CommandSpec, InvocationResult, LaunchError, Message, Settlement, TriggerError,
};

/// Settles one delivery with the broker.
///
/// Consumed by value, so a delivery is settled at most once.
#[async_trait]
pub trait Acknowledge: Send {
    async fn settle(self: Box<Self>, settlement: Settlement) -> Result<(), AckError>;
}

/// A received message plus the handle that settles it.
pub struct Delivery {
    message: Message,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledge>) -> Self {
        Self { message, acker }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Settles the delivery, consuming it.
    pub async fn settle(self, settlement: Settlement) -> Result<(), AckError> {
        self.acker.settle(settlement).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// A subscription that yields messages one at a time.
///
/// Broker-backed sources never end on their own: they reconnect on failure
/// and return [`TriggerError::Connection`] once retries are exhausted.
/// `Ok(None)` means a finite source (a test channel, stdin) is drained.
#[async_trait]
pub trait MessageSource: Send {
    async fn next(&mut self) -> Result<Option<Delivery>, TriggerError>;

    /// Releases the subscription. Unsettled deliveries go back to the broker.
    async fn close(&mut self) {}
}

/// Runs a resolved command to completion.
///
/// A non-zero exit or a timeout is an `Ok` result; only failure to start
/// the process is an error.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<InvocationResult, LaunchError>;
}
