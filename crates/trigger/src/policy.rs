//! Per-message trigger decisions.
//!
//! [`TriggerPolicy::evaluate`] is a pure function of the message, the
//! policy's own state, and the evaluation time. Rules apply in order:
//!
//! 1. no trigger key, unparsable schedule, or unrenderable template → `Suppress(Malformed)`
//! 2. delivery id already fired → `Suppress(Duplicate)`
//! 3. debounce (or defer) window for the key still open → `Suppress(Debounced)`
//! 4. key has used its rate-limit budget → `Suppress(RateLimited)`
//! 5. message scheduled for later (`x-not-before`) → `Defer(remaining)`
//! 6. otherwise → `Fire(spec)`
//!
//! State is keyed by [`TriggerKey`] and bounded by [`TriggerPolicy::sweep`],
//! which drops keys idle for longer than the retention window. At most
//! [`MAX_TRACKED_KEYS`] keys are held; a new key beyond that evicts the least
//! recently active one.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tracing::debug;

use crate::{
    CommandTemplate, DeliveryId, Message, PolicyConfig, RateLimitConfig, SuppressReason, Timestamp,
    TriggerDecision, TriggerKey,
};

/// Header naming the earliest time a message may fire (RFC 3339 or Unix seconds).
pub const NOT_BEFORE_HEADER: &str = "x-not-before";

/// Upper bound on keys with live state.
pub const MAX_TRACKED_KEYS: usize = 65_536;

/// Where the trigger key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    RoutingKey,
    Header(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct KeyState {
    /// End of the debounce window opened by the last fire.
    fire_window_until: Option<Timestamp>,
    /// End of the window held open by a deferred (scheduled) message.
    defer_until: Option<Timestamp>,
    /// Fire times still inside the rate-limit window, oldest first.
    fires: VecDeque<Timestamp>,
    last_activity: Option<Timestamp>,
}

impl KeyState {
    fn is_idle(&self, now: Timestamp, retention: Duration) -> bool {
        let open = |until: Option<Timestamp>| until.is_some_and(|t| t > now);
        if open(self.fire_window_until) || open(self.defer_until) {
            return false;
        }
        self.last_activity
            .map_or(true, |seen| now.saturating_since(seen) >= retention)
    }
}

/// Decides, per message, whether to run the command.
#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    template: CommandTemplate,
    key_source: KeySource,
    debounce_window: Duration,
    rate_limit: Option<RateLimitConfig>,
    retention_window: Duration,
    max_tracked_keys: usize,
    keys: HashMap<TriggerKey, KeyState>,
    fired: HashMap<DeliveryId, Timestamp>,
}

impl TriggerPolicy {
    pub fn new(
        template: CommandTemplate,
        config: &PolicyConfig,
        retention_window: Duration,
    ) -> Self {
        let key_source = match &config.key_header {
            Some(header) => KeySource::Header(header.clone()),
            None => KeySource::RoutingKey,
        };
        Self {
            template,
            key_source,
            debounce_window: config.debounce_window,
            rate_limit: config.rate_limit,
            retention_window,
            max_tracked_keys: MAX_TRACKED_KEYS,
            keys: HashMap::new(),
            fired: HashMap::new(),
        }
    }

    /// The trigger key for `message`, or `None` if the required metadata is missing.
    pub fn trigger_key(&self, message: &Message) -> Option<TriggerKey> {
        match &self.key_source {
            KeySource::RoutingKey => message.routing_key().and_then(TriggerKey::new),
            KeySource::Header(name) => message.header(name).and_then(TriggerKey::new),
        }
    }

    /// Produces exactly one decision for `message` as of `now`, updating state.
    pub fn evaluate(&mut self, message: &Message, now: Timestamp) -> TriggerDecision {
        let Some(key) = self.trigger_key(message) else {
            let missing = match &self.key_source {
                KeySource::RoutingKey => "routing key".to_string(),
                KeySource::Header(name) => format!("header {name:?}"),
            };
            return TriggerDecision::Suppress(SuppressReason::malformed(format!(
                "message has no {missing}"
            )));
        };

        let not_before = match message.header(NOT_BEFORE_HEADER) {
            None => None,
            Some(raw) => match Timestamp::parse(raw) {
                Some(ts) => Some(ts),
                None => {
                    return TriggerDecision::Suppress(SuppressReason::malformed(format!(
                        "unparsable {NOT_BEFORE_HEADER} header {raw:?}"
                    )))
                }
            },
        };

        if let Some(id) = message.delivery_id() {
            if self.fired.contains_key(id) {
                return TriggerDecision::Suppress(SuppressReason::Duplicate);
            }
        }

        if self.keys.len() >= self.max_tracked_keys && !self.keys.contains_key(&key) {
            self.make_room(now);
        }

        let debounce_window = self.debounce_window;
        let rate_limit = self.rate_limit;
        let state = self.keys.entry(key.clone()).or_default();
        state.last_activity = Some(now);

        if state.fire_window_until.is_some_and(|until| until > now) {
            return TriggerDecision::Suppress(SuppressReason::Debounced);
        }
        // A pending scheduled message holds the key; the scheduled message
        // itself re-defers instead of being debounced.
        let scheduled = not_before.is_some();
        if !scheduled && state.defer_until.is_some_and(|until| until > now) {
            return TriggerDecision::Suppress(SuppressReason::Debounced);
        }

        if let Some(limit) = rate_limit {
            while state
                .fires
                .front()
                .is_some_and(|fired| now.saturating_since(*fired) >= limit.window)
            {
                state.fires.pop_front();
            }
            if state.fires.len() >= limit.max as usize {
                return TriggerDecision::Suppress(SuppressReason::RateLimited);
            }
        }

        if let Some(due) = not_before.filter(|due| *due > now) {
            state.defer_until = Some(state.defer_until.map_or(due, |until| until.max(due)));
            return TriggerDecision::Defer(due.saturating_since(now));
        }

        let spec = match self.template.render(message, &key) {
            Ok(spec) => spec,
            Err(e) => {
                return TriggerDecision::Suppress(SuppressReason::malformed(e.to_string()))
            }
        };

        if !debounce_window.is_zero() {
            state.fire_window_until = Some(now.saturating_add(debounce_window));
        }
        if rate_limit.is_some() {
            state.fires.push_back(now);
        }
        if let Some(id) = message.delivery_id() {
            self.fired.insert(id.clone(), now);
        }

        TriggerDecision::Fire(spec)
    }

    /// Drops state for keys (and remembered delivery ids) idle for longer
    /// than the retention window. Returns the number of keys removed.
    pub fn sweep(&mut self, now: Timestamp) -> usize {
        let retention = self.retention_window;
        let before = self.keys.len();
        self.keys.retain(|_, state| !state.is_idle(now, retention));
        self.fired
            .retain(|_, fired_at| now.saturating_since(*fired_at) < retention);

        let removed = before - self.keys.len();
        if removed > 0 {
            debug!(
                removed,
                remaining = self.keys.len(),
                "swept idle trigger keys"
            );
        }
        removed
    }

    /// Sweeps, then evicts the least recently active key if still full.
    fn make_room(&mut self, now: Timestamp) {
        self.sweep(now);
        if self.keys.len() < self.max_tracked_keys {
            return;
        }
        let oldest = self
            .keys
            .iter()
            .min_by_key(|(_, state)| state.last_activity)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.keys.remove(&key);
            debug!(
                key = key.as_str(),
                capacity = self.max_tracked_keys,
                "key capacity reached; evicted least recently active key"
            );
        }
    }

    /// Number of keys with live state.
    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandConfig;

    fn at(secs: i64) -> Timestamp {
        Timestamp::from_unix_seconds(1_700_000_000 + secs).unwrap()
    }

    fn template() -> CommandTemplate {
        CommandTemplate::from_config(&CommandConfig {
            command: "/bin/echo".into(),
            args: vec!["{{ key }}".into()],
            env: Default::default(),
            timeout: Duration::from_secs(5),
            capture_output: false,
            max_output_bytes: 0,
            stdin_payload: false,
            export_message_env: false,
        })
        .unwrap()
    }

    fn policy(debounce_secs: u64, rate_limit: Option<(u32, u64)>) -> TriggerPolicy {
        let cfg = PolicyConfig {
            debounce_window: Duration::from_secs(debounce_secs),
            rate_limit: rate_limit.map(|(max, window)| RateLimitConfig {
                max,
                window: Duration::from_secs(window),
            }),
            key_header: None,
        };
        TriggerPolicy::new(template(), &cfg, Duration::from_secs(3_600))
    }

    fn msg(key: &str) -> Message {
        Message::new("", at(0)).with_routing_key(key)
    }

    fn msg_with_id(key: &str, id: &str) -> Message {
        msg(key).with_delivery_id(DeliveryId::new(id).unwrap())
    }

    #[test]
    fn debounces_within_window() {
        let mut p = policy(10, None);

        assert!(p.evaluate(&msg("alerts"), at(0)).is_fire());
        assert_eq!(
            p.evaluate(&msg("alerts"), at(5)),
            TriggerDecision::Suppress(SuppressReason::Debounced)
        );
        assert!(p.evaluate(&msg("alerts"), at(10)).is_fire());
    }

    #[test]
    fn debounce_is_per_key() {
        let mut p = policy(10, None);

        assert!(p.evaluate(&msg("alerts"), at(0)).is_fire());
        assert!(p.evaluate(&msg("deploys"), at(1)).is_fire());
    }

    #[test]
    fn exactly_one_fire_per_window() {
        let mut p = policy(10, None);
        let fires = (0..10)
            .filter(|t| p.evaluate(&msg("alerts"), at(*t)).is_fire())
            .count();
        assert_eq!(fires, 1);
    }

    #[test]
    fn rate_limit_slides() {
        let mut p = policy(0, Some((2, 60)));

        assert!(p.evaluate(&msg("k"), at(0)).is_fire());
        assert!(p.evaluate(&msg("k"), at(10)).is_fire());
        assert_eq!(
            p.evaluate(&msg("k"), at(20)),
            TriggerDecision::Suppress(SuppressReason::RateLimited)
        );
        // The t=0 fire leaves the window at t=60.
        assert!(p.evaluate(&msg("k"), at(60)).is_fire());
        assert_eq!(
            p.evaluate(&msg("k"), at(61)),
            TriggerDecision::Suppress(SuppressReason::RateLimited)
        );
    }

    #[test]
    fn missing_routing_key_is_malformed() {
        let mut p = policy(10, None);
        let decision = p.evaluate(&Message::new("", at(0)), at(0));
        assert_eq!(
            decision.suppress_reason().map(|r| r.as_str()),
            Some("malformed")
        );
        assert_eq!(p.tracked_keys(), 0);
    }

    #[test]
    fn key_header_overrides_routing_key() {
        let cfg = PolicyConfig {
            key_header: Some("x-service".into()),
            debounce_window: Duration::from_secs(10),
            ..PolicyConfig::default()
        };
        let mut p = TriggerPolicy::new(template(), &cfg, Duration::from_secs(60));

        let web = msg("events").with_header("x-service", "web");
        let db = msg("events").with_header("x-service", "db");
        assert!(p.evaluate(&web, at(0)).is_fire());
        assert!(p.evaluate(&db, at(1)).is_fire());
        assert_eq!(
            p.evaluate(&msg("events"), at(2))
                .suppress_reason()
                .map(|r| r.as_str()),
            Some("malformed")
        );
    }

    #[test]
    fn fired_delivery_ids_are_not_fired_twice() {
        let mut p = policy(0, None);

        assert!(p.evaluate(&msg_with_id("k", "m-1"), at(0)).is_fire());
        assert_eq!(
            p.evaluate(&msg_with_id("k", "m-1").with_redelivered(true), at(1)),
            TriggerDecision::Suppress(SuppressReason::Duplicate)
        );
        assert!(p.evaluate(&msg_with_id("k", "m-2"), at(2)).is_fire());
    }

    #[test]
    fn redelivery_against_same_state_yields_same_decision() {
        let mut original = policy(10, Some((3, 60)));
        original.evaluate(&msg("other"), at(0));
        let mut restarted = original.clone();

        let m = msg_with_id("alerts", "m-7");
        assert_eq!(original.evaluate(&m, at(3)), restarted.evaluate(&m, at(3)));
    }

    #[test]
    fn scheduled_messages_defer_and_hold_the_key() {
        let mut p = policy(0, None);
        let due = at(30).as_datetime().to_rfc3339();
        let scheduled = msg("k").with_header(NOT_BEFORE_HEADER, due);

        assert_eq!(
            p.evaluate(&scheduled, at(0)),
            TriggerDecision::Defer(Duration::from_secs(30))
        );
        assert_eq!(
            p.evaluate(&msg("k"), at(10)),
            TriggerDecision::Suppress(SuppressReason::Debounced)
        );
        // Redelivered early: defers again rather than being debounced.
        assert_eq!(
            p.evaluate(&scheduled, at(29)),
            TriggerDecision::Defer(Duration::from_secs(1))
        );
        assert!(p.evaluate(&scheduled, at(30)).is_fire());
    }

    #[test]
    fn bad_schedule_header_is_malformed() {
        let mut p = policy(0, None);
        let m = msg("k").with_header(NOT_BEFORE_HEADER, "soon");
        assert_eq!(
            p.evaluate(&m, at(0)).suppress_reason().map(|r| r.as_str()),
            Some("malformed")
        );
    }

    #[test]
    fn template_failure_is_malformed_and_does_not_open_window() {
        let tpl = CommandTemplate::from_config(&CommandConfig {
            command: "/bin/echo".into(),
            args: vec!["{{ headers.ticket }}".into()],
            env: Default::default(),
            timeout: Duration::from_secs(5),
            capture_output: false,
            max_output_bytes: 0,
            stdin_payload: false,
            export_message_env: false,
        })
        .unwrap();
        let cfg = PolicyConfig {
            debounce_window: Duration::from_secs(10),
            ..PolicyConfig::default()
        };
        let mut p = TriggerPolicy::new(tpl, &cfg, Duration::from_secs(60));

        let decision = p.evaluate(&msg("k"), at(0));
        assert_eq!(
            decision.suppress_reason().map(|r| r.as_str()),
            Some("malformed")
        );
        assert!(p.evaluate(&msg("k").with_header("ticket", "T-1"), at(1)).is_fire());
    }

    #[test]
    fn key_capacity_evicts_least_recently_active_key() {
        let mut p = policy(10, None);
        p.max_tracked_keys = 2;

        assert!(p.evaluate(&msg("a"), at(0)).is_fire());
        assert!(p.evaluate(&msg("b"), at(1)).is_fire());
        // Both windows are open, so nothing can be swept; "a" is evicted.
        assert!(p.evaluate(&msg("c"), at(2)).is_fire());
        assert_eq!(p.tracked_keys(), 2);

        assert_eq!(
            p.evaluate(&msg("b"), at(3)),
            TriggerDecision::Suppress(SuppressReason::Debounced)
        );
        // "c" (last seen at 2) is now the oldest; "a" starts fresh.
        assert!(p.evaluate(&msg("a"), at(4)).is_fire());
        assert_eq!(
            p.evaluate(&msg("b"), at(5)),
            TriggerDecision::Suppress(SuppressReason::Debounced)
        );
        assert_eq!(p.tracked_keys(), 2);
    }

    #[test]
    fn sweep_drops_idle_keys_only() {
        let cfg = PolicyConfig {
            debounce_window: Duration::from_secs(10),
            ..PolicyConfig::default()
        };
        let mut p = TriggerPolicy::new(template(), &cfg, Duration::from_secs(60));

        p.evaluate(&msg_with_id("old", "m-1"), at(0));
        p.evaluate(&msg("fresh"), at(50));
        assert_eq!(p.tracked_keys(), 2);

        assert_eq!(p.sweep(at(70)), 1);
        assert_eq!(p.tracked_keys(), 1);
        // The remembered delivery id aged out with it.
        assert!(p.evaluate(&msg_with_id("old", "m-1"), at(71)).is_fire());
    }
}
