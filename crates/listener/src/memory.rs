//! In-process message source.
//!
//! [`memory_queue`] returns a publisher/source pair connected by an unbounded
//! channel. Settlements are recorded in a [`SettlementLog`]; a `Defer` puts
//! the message back onto the channel once its delay has passed, the way a
//! broker-side delay queue would.
//!
//! The source ends (`Ok(None)`) once every publisher is dropped and every
//! delivery handed out has been settled or dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use trigger::{
    AckError, Acknowledge, Delivery, DeliveryId, Message, MessageSource, Settlement, TriggerError,
};

enum Item {
    Message(Message),
    /// An outstanding delivery finished; re-check the end-of-stream condition.
    Wake,
    PublishersClosed,
}

/// Shared record of every settlement, in the order they happened.
#[derive(Debug, Clone, Default)]
pub struct SettlementLog {
    entries: Arc<Mutex<Vec<(Message, Settlement)>>>,
    changed: Arc<Notify>,
}

impl SettlementLog {
    fn record(&self, message: Message, settlement: Settlement) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((message, settlement));
        self.changed.notify_waiters();
    }

    /// Snapshot of all settlements so far.
    pub fn entries(&self) -> Vec<(Message, Settlement)> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Delivery ids settled with `settlement`, in order.
    pub fn ids_with(&self, settlement: Settlement) -> Vec<Option<DeliveryId>> {
        self.entries()
            .into_iter()
            .filter(|(_, s)| *s == settlement)
            .map(|(m, _)| m.delivery_id().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least `count` settlements are recorded.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

struct PublisherGuard {
    tx: mpsc::UnboundedSender<Item>,
}

impl Drop for PublisherGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Item::PublishersClosed);
    }
}

/// Publishing half of an in-process queue. Clones share one lifetime: the
/// queue is closed for publishing when the last clone is dropped.
#[derive(Clone)]
pub struct MemoryPublisher {
    guard: Arc<PublisherGuard>,
}

impl MemoryPublisher {
    /// Enqueues a message. Returns `false` if the source has been dropped.
    pub fn publish(&self, message: Message) -> bool {
        self.guard.tx.send(Item::Message(message)).is_ok()
    }
}

/// Consuming half of an in-process queue.
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Item>,
    tx: mpsc::UnboundedSender<Item>,
    outstanding: Arc<AtomicUsize>,
    publishers_closed: bool,
    log: SettlementLog,
}

impl MemorySource {
    /// The log every delivery from this source settles into.
    pub fn settlements(&self) -> SettlementLog {
        self.log.clone()
    }

    fn deliver(&self, message: Message) -> Delivery {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let acker = MemoryAcker {
            message: message.clone(),
            tx: self.tx.clone(),
            outstanding: Arc::clone(&self.outstanding),
            log: self.log.clone(),
        };
        Delivery::new(message, Box::new(acker))
    }
}

/// Creates a connected publisher/source pair.
pub fn memory_queue() -> (MemoryPublisher, MemorySource) {
    let (tx, rx) = mpsc::unbounded_channel();
    let publisher = MemoryPublisher {
        guard: Arc::new(PublisherGuard { tx: tx.clone() }),
    };
    let source = MemorySource {
        rx,
        tx,
        outstanding: Arc::new(AtomicUsize::new(0)),
        publishers_closed: false,
        log: SettlementLog::default(),
    };
    (publisher, source)
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next(&mut self) -> Result<Option<Delivery>, TriggerError> {
        loop {
            if self.publishers_closed && self.outstanding.load(Ordering::SeqCst) == 0 {
                // Nothing can arrive any more except what is already buffered.
                loop {
                    match self.rx.try_recv() {
                        Ok(Item::Message(message)) => return Ok(Some(self.deliver(message))),
                        Ok(_) => continue,
                        Err(_) => return Ok(None),
                    }
                }
            }
            match self.rx.recv().await {
                Some(Item::Message(message)) => return Ok(Some(self.deliver(message))),
                Some(Item::Wake) => continue,
                Some(Item::PublishersClosed) => self.publishers_closed = true,
                None => return Ok(None),
            }
        }
    }
}

struct MemoryAcker {
    message: Message,
    tx: mpsc::UnboundedSender<Item>,
    outstanding: Arc<AtomicUsize>,
    log: SettlementLog,
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        let _ = self.tx.send(Item::Wake);
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn settle(self: Box<Self>, settlement: Settlement) -> Result<(), AckError> {
        let Settlement::Defer { delay } = settlement else {
            self.log.record(self.message.clone(), settlement);
            return Ok(());
        };
        if self.tx.is_closed() {
            return Err(AckError {
                action: settlement.to_string(),
                message: "queue is closed".to_string(),
            });
        }
        self.log.record(self.message.clone(), settlement);

        // Counts as outstanding until it is back on the channel, so the
        // source does not report end-of-stream in between.
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let tx = self.tx.clone();
        let outstanding = Arc::clone(&self.outstanding);
        let message = self.message.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Item::Message(message));
            outstanding.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(Item::Wake);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trigger::Timestamp;

    fn msg(id: &str) -> Message {
        Message::new("", Timestamp::now())
            .with_routing_key("k")
            .with_delivery_id(DeliveryId::new(id).unwrap())
    }

    #[tokio::test]
    async fn delivers_in_order_and_records_acks() {
        let (publisher, mut source) = memory_queue();
        let log = source.settlements();
        publisher.publish(msg("a"));
        publisher.publish(msg("b"));
        drop(publisher);

        let first = source.next().await.unwrap().unwrap();
        assert_eq!(first.message().delivery_id().unwrap().as_str(), "a");
        first.settle(Settlement::Ack).await.unwrap();

        let second = source.next().await.unwrap().unwrap();
        second.settle(Settlement::Ack).await.unwrap();

        assert!(source.next().await.unwrap().is_none());
        assert_eq!(log.ids_with(Settlement::Ack).len(), 2);
    }

    #[tokio::test]
    async fn deferred_message_returns_after_its_delay() {
        let (publisher, mut source) = memory_queue();
        let log = source.settlements();
        publisher.publish(msg("a"));
        drop(publisher);

        let delivery = source.next().await.unwrap().unwrap();
        let delay = Duration::from_millis(100);
        let deferred_at = std::time::Instant::now();
        delivery.settle(Settlement::Defer { delay }).await.unwrap();
        assert_eq!(log.entries()[0].1, Settlement::Defer { delay });

        // Blocks until the delay has passed rather than reporting end-of-stream.
        let again = source.next().await.unwrap().unwrap();
        assert!(deferred_at.elapsed() >= delay);
        assert_eq!(again.message().delivery_id().unwrap().as_str(), "a");
        again.settle(Settlement::Ack).await.unwrap();

        assert!(source.next().await.unwrap().is_none());
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn source_waits_for_outstanding_deliveries() {
        let (publisher, mut source) = memory_queue();
        publisher.publish(msg("a"));
        drop(publisher);

        let delivery = source.next().await.unwrap().unwrap();
        let settle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            delivery
                .settle(Settlement::Defer {
                    delay: Duration::ZERO,
                })
                .await
                .unwrap();
        });

        let again = source.next().await.unwrap().unwrap();
        assert_eq!(again.message().delivery_id().unwrap().as_str(), "a");
        settle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_times_out_when_nothing_settles() {
        let (publisher, mut source) = memory_queue();
        let log = source.settlements();
        assert!(!log.wait_for(1, Duration::from_millis(20)).await);

        publisher.publish(msg("a"));
        let delivery = source.next().await.unwrap().unwrap();
        delivery.settle(Settlement::Ack).await.unwrap();
        assert!(log.wait_for(1, Duration::from_millis(20)).await);
    }
}
