use std::sync::atomic::{AtomicU64, Ordering};

use trigger::{InvocationOutcome, SuppressReason};

/// Running counters for one dispatcher. Shared between the receive loop and
/// the workers; read with [`DispatchStats::snapshot`].
#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    fired: AtomicU64,
    debounced: AtomicU64,
    rate_limited: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    deferred: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    launch_failures: AtomicU64,
    acked: AtomicU64,
    handed_back: AtomicU64,
    settle_failures: AtomicU64,
    abandoned: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub fired: u64,
    pub debounced: u64,
    pub rate_limited: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub deferred: u64,
    /// Invocations that exited with status zero.
    pub succeeded: u64,
    /// Invocations that exited non-zero or were killed by a signal.
    pub failed: u64,
    pub timed_out: u64,
    pub launch_failures: u64,
    pub acked: u64,
    /// Deferred deliveries handed back to the broker.
    pub handed_back: u64,
    pub settle_failures: u64,
    /// Deliveries dropped unsettled at shutdown.
    pub abandoned: u64,
}

impl StatsSnapshot {
    pub fn suppressed(&self) -> u64 {
        self.debounced + self.rate_limited + self.duplicates + self.malformed
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DispatchStats {
    pub(crate) fn record_received(&self) {
        bump(&self.received);
    }

    pub(crate) fn record_fired(&self) {
        bump(&self.fired);
    }

    pub(crate) fn record_suppressed(&self, reason: &SuppressReason) {
        bump(match reason {
            SuppressReason::Debounced => &self.debounced,
            SuppressReason::RateLimited => &self.rate_limited,
            SuppressReason::Duplicate => &self.duplicates,
            SuppressReason::Malformed { .. } => &self.malformed,
        });
    }

    pub(crate) fn record_deferred(&self) {
        bump(&self.deferred);
    }

    pub(crate) fn record_outcome(&self, outcome: InvocationOutcome) {
        bump(match outcome {
            InvocationOutcome::TimedOut => &self.timed_out,
            o if o.is_success() => &self.succeeded,
            _ => &self.failed,
        });
    }

    pub(crate) fn record_launch_failure(&self) {
        bump(&self.launch_failures);
    }

    pub(crate) fn record_settled(&self, settlement: trigger::Settlement) {
        bump(match settlement {
            trigger::Settlement::Ack => &self.acked,
            trigger::Settlement::Defer { .. } => &self.handed_back,
        });
    }

    pub(crate) fn record_settle_failure(&self) {
        bump(&self.settle_failures);
    }

    pub(crate) fn record_abandoned(&self, count: usize) {
        self.abandoned.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            received: load(&self.received),
            fired: load(&self.fired),
            debounced: load(&self.debounced),
            rate_limited: load(&self.rate_limited),
            duplicates: load(&self.duplicates),
            malformed: load(&self.malformed),
            deferred: load(&self.deferred),
            succeeded: load(&self.succeeded),
            failed: load(&self.failed),
            timed_out: load(&self.timed_out),
            launch_failures: load(&self.launch_failures),
            acked: load(&self.acked),
            handed_back: load(&self.handed_back),
            settle_failures: load(&self.settle_failures),
            abandoned: load(&self.abandoned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_land_in_distinct_counters() {
        let stats = DispatchStats::default();
        stats.record_outcome(InvocationOutcome::Exited { code: 0 });
        stats.record_outcome(InvocationOutcome::Exited { code: 3 });
        stats.record_outcome(InvocationOutcome::Signalled { signal: Some(9) });
        stats.record_outcome(InvocationOutcome::TimedOut);
        stats.record_suppressed(&SuppressReason::Debounced);
        stats.record_suppressed(&SuppressReason::Malformed {
            detail: "x".into(),
        });

        let snap = stats.snapshot();
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.failed, 2);
        assert_eq!(snap.timed_out, 1);
        assert_eq!(snap.suppressed(), 2);
    }
}
