use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use trigger::{
    CommandRunner, CommandSpec, CommandTemplate, Config, Delivery, MessageSource, Settlement,
    SuppressReason, Timestamp, TriggerDecision, TriggerError, TriggerKey, TriggerPolicy,
};

use crate::queue::KeyedQueue;
use crate::stats::{DispatchStats, StatsSnapshot};

/// Shortest interval between policy sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Runtime knobs for a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Number of worker tasks, i.e. commands that may run at once.
    pub max_concurrency: usize,
    /// How long in-flight invocations may run after shutdown begins.
    pub shutdown_grace: Duration,
    /// How often idle policy state is swept.
    pub sweep_interval: Duration,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrency: config.broker.max_concurrency,
            shutdown_grace: config.runtime.shutdown_grace,
            sweep_interval: (config.broker.retention_window / 2).max(MIN_SWEEP_INTERVAL),
        }
    }
}

/// Work lane. Invocations for one trigger key share a lane and run one at a
/// time in arrival order; every other job gets a lane of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Lane {
    Key(TriggerKey),
    Solo(u64),
}

enum Work {
    /// Run the command, then acknowledge.
    Run(CommandSpec),
    Settle(Settlement),
}

struct Job {
    delivery: Delivery,
    work: Work,
    span: Span,
}

/// Feeds messages from a [`MessageSource`] through a [`TriggerPolicy`] to a
/// [`CommandRunner`].
///
/// The receive loop owns the policy and decides every message as it
/// arrives; it never waits on an invocation. Fired commands and
/// acknowledgements are handed to a fixed pool of workers through a keyed
/// FIFO queue. Each delivery is settled only after its decision has been
/// carried out: acknowledged after the command finishes (whatever the
/// outcome) or after suppression. Deferred deliveries are handed straight
/// back to the source with their delay, so none is held while it waits.
pub struct Dispatcher {
    policy: TriggerPolicy,
    runner: Arc<dyn CommandRunner>,
    settings: DispatcherSettings,
    stats: Arc<DispatchStats>,
    next_solo_lane: u64,
}

impl Dispatcher {
    pub fn new(
        policy: TriggerPolicy,
        runner: Arc<dyn CommandRunner>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            policy,
            runner,
            settings,
            stats: Arc::new(DispatchStats::default()),
            next_solo_lane: 0,
        }
    }

    /// Builds the policy and settings from a validated configuration.
    pub fn from_config(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, TriggerError> {
        let template = CommandTemplate::from_config(&config.command)
            .map_err(|e| TriggerError::config(e.to_string()))?;
        let policy = TriggerPolicy::new(template, &config.policy, config.broker.retention_window);
        Ok(Self::new(policy, runner, DispatcherSettings::from_config(config)))
    }

    /// Live counters; stays readable after [`Dispatcher::run`] returns.
    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Consumes `source` until it is exhausted, fails fatally, or `cancel`
    /// fires, then shuts down gracefully and closes the source.
    ///
    /// On shutdown, queued jobs that have not started are abandoned
    /// unsettled (the broker redelivers them). In-flight
    /// invocations get `shutdown_grace` to finish before they are aborted,
    /// which kills their child processes.
    pub async fn run(
        mut self,
        source: &mut dyn MessageSource,
        cancel: CancellationToken,
    ) -> Result<StatsSnapshot, TriggerError> {
        let queue = Arc::new(KeyedQueue::<Lane, Job>::new());
        let mut workers = JoinSet::new();
        for id in 0..self.settings.max_concurrency.max(1) {
            let worker = Worker {
                id,
                queue: Arc::clone(&queue),
                runner: Arc::clone(&self.runner),
                stats: Arc::clone(&self.stats),
            };
            workers.spawn(worker.run());
        }

        let period = self.settings.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            max_concurrency = self.settings.max_concurrency,
            sweep_interval_secs = period.as_secs(),
            "dispatcher started"
        );

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("shutdown requested; no longer receiving");
                    break Ok(());
                }
                _ = sweep.tick() => {
                    let removed = self.policy.sweep(Timestamp::now());
                    debug!(
                        removed,
                        tracked_keys = self.policy.tracked_keys(),
                        "policy sweep"
                    );
                }
                received = source.next() => match received {
                    Ok(Some(delivery)) => self.accept(delivery, &queue),
                    Ok(None) => {
                        info!("message source exhausted");
                        break Ok(());
                    }
                    Err(e) => {
                        error!(error = %e, "message source failed");
                        break Err(e);
                    }
                },
            }
        };

        self.shutdown(&queue, workers).await;
        source.close().await;

        let stats = self.stats.snapshot();
        info!(
            received = stats.received,
            fired = stats.fired,
            suppressed = stats.suppressed(),
            deferred = stats.deferred,
            abandoned = stats.abandoned,
            "dispatcher stopped"
        );
        outcome.map(|()| stats)
    }

    /// Decides `delivery` and routes it to a worker lane.
    fn accept(&mut self, delivery: Delivery, queue: &KeyedQueue<Lane, Job>) {
        self.stats.record_received();
        let message = delivery.message();
        let key = self.policy.trigger_key(message);
        let span = info_span!(
            "message",
            routing_key = message.routing_key().unwrap_or_default(),
            delivery_id = message.delivery_id().map_or("", |id| id.as_str()),
            trigger_key = key.as_ref().map_or("", |k| k.as_str()),
            redelivered = message.redelivered()
        );

        let decision = self.policy.evaluate(message, Timestamp::now());
        span.in_scope(|| log_decision(&decision));

        let (lane, work) = match decision {
            TriggerDecision::Fire(spec) => {
                self.stats.record_fired();
                let lane = match key {
                    Some(key) => Lane::Key(key),
                    None => self.solo_lane(),
                };
                (lane, Work::Run(spec))
            }
            TriggerDecision::Suppress(reason) => {
                self.stats.record_suppressed(&reason);
                (self.solo_lane(), Work::Settle(Settlement::Ack))
            }
            TriggerDecision::Defer(delay) => {
                self.stats.record_deferred();
                (self.solo_lane(), Work::Settle(Settlement::Defer { delay }))
            }
        };

        let job = Job {
            delivery,
            work,
            span,
        };
        if queue.push(lane, job).is_err() {
            self.stats.record_abandoned(1);
        } else {
            debug!(queued = queue.pending(), "job queued");
        }
    }

    fn solo_lane(&mut self) -> Lane {
        self.next_solo_lane = self.next_solo_lane.wrapping_add(1);
        Lane::Solo(self.next_solo_lane)
    }

    async fn shutdown(&self, queue: &KeyedQueue<Lane, Job>, mut workers: JoinSet<()>) {
        // Closing also releases idle workers.
        let abandoned = queue.close().len();
        if abandoned > 0 {
            self.stats.record_abandoned(abandoned);
            info!(abandoned, "left unstarted work unsettled for redelivery");
        }

        let grace = self.settings.shutdown_grace;
        let drain = async {
            while let Some(result) = workers.join_next().await {
                log_worker_exit(result);
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                grace_secs = grace.as_secs_f64(),
                "in-flight invocations outlived the shutdown grace; aborting them"
            );
            workers.abort_all();
            while let Some(result) = workers.join_next().await {
                log_worker_exit(result);
            }
        }
    }
}

fn log_worker_exit(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "worker panicked");
        }
    }
}

fn log_decision(decision: &TriggerDecision) {
    match decision {
        TriggerDecision::Fire(spec) => info!(program = %spec.program, "trigger fired"),
        TriggerDecision::Suppress(SuppressReason::Malformed { detail }) => {
            warn!(detail = %detail, "malformed message suppressed")
        }
        TriggerDecision::Suppress(reason) => debug!(reason = reason.as_str(), "trigger suppressed"),
        TriggerDecision::Defer(delay) => {
            info!(delay_ms = delay.as_millis() as u64, "trigger deferred")
        }
    }
}

async fn settle(delivery: Delivery, settlement: Settlement, stats: &DispatchStats) {
    match delivery.settle(settlement).await {
        Ok(()) => {
            stats.record_settled(settlement);
            debug!(%settlement, "delivery settled");
        }
        Err(e) => {
            stats.record_settle_failure();
            warn!(error = %e, "failed to settle delivery; the broker will redeliver it");
        }
    }
}

struct Worker {
    id: usize,
    queue: Arc<KeyedQueue<Lane, Job>>,
    runner: Arc<dyn CommandRunner>,
    stats: Arc<DispatchStats>,
}

impl Worker {
    async fn run(self) {
        while let Some((lane, job)) = self.queue.pop().await {
            let Job {
                delivery,
                work,
                span,
            } = job;
            self.process(delivery, work).instrument(span).await;
            self.queue.complete(&lane);
        }
        debug!(worker = self.id, "worker stopped");
    }

    async fn process(&self, delivery: Delivery, work: Work) {
        let spec = match work {
            Work::Run(spec) => spec,
            Work::Settle(settlement) => return settle(delivery, settlement, &self.stats).await,
        };
        match self.runner.run(&spec).await {
            Ok(result) => {
                self.stats.record_outcome(result.outcome);
                debug!(
                    invocation_id = %result.id,
                    outcome = %result.outcome,
                    duration_ms = result.duration.as_millis() as u64,
                    "invocation finished"
                );
            }
            Err(e) => {
                self.stats.record_launch_failure();
                debug!(program = %spec.program, error = %e, "launch failure recorded");
            }
        }
        settle(delivery, Settlement::Ack, &self.stats).await;
    }
}
