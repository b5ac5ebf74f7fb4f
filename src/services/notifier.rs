use crate::models::{AlertConfig, AlertKind};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Decides whether a computed alert condition should actually be emitted.
///
/// Suppression is keyed by the exact (kind, message) pair: two distinct
/// messages of the same kind (say, two different minute-remaining counts)
/// are both legitimate and must not silence each other.
pub struct NotificationRateLimiter {
    records: HashMap<(AlertKind, String), DateTime<Utc>>,
    alerts: AlertConfig,
}

impl NotificationRateLimiter {
    pub fn new(alerts: AlertConfig) -> Self {
        Self {
            records: HashMap::new(),
            alerts,
        }
    }

    /// True when this (kind, message) pair is outside its cooldown window.
    /// A positive answer records the send.
    pub fn should_send(&mut self, kind: AlertKind, message: &str, now: DateTime<Utc>) -> bool {
        let key = (kind, message.to_string());
        if let Some(last_sent) = self.records.get(&key) {
            if now - *last_sent < self.alerts.cooldown_for(kind) {
                log::debug!("Suppressing alert [{kind}] within cooldown: {message}");
                return false;
            }
        }
        self.records.insert(key, now);
        true
    }

    /// Clear stored suppression for one exact key. Called on a genuine
    /// new-activity signal so a legitimately repeating alert can fire again
    /// instead of being silenced forever after its first occurrence.
    pub fn reset(&mut self, kind: AlertKind, message: &str) {
        self.records.remove(&(kind, message.to_string()));
    }

    /// Clear suppression for every message of `kind` matching the predicate.
    pub fn reset_where<F: Fn(&str) -> bool>(&mut self, kind: AlertKind, predicate: F) {
        self.records
            .retain(|(k, message), _| *k != kind || !predicate(message));
    }

    /// Drop records whose cooldown has expired; they suppress nothing and
    /// would otherwise accumulate without bound.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        let alerts = &self.alerts;
        self.records
            .retain(|(kind, _), last_sent| now - *last_sent < alerts.cooldown_for(*kind));
    }

    #[cfg(test)]
    fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn limiter() -> NotificationRateLimiter {
        NotificationRateLimiter::new(AlertConfig::default())
    }

    #[test]
    fn duplicate_within_cooldown_is_suppressed() {
        let mut limiter = limiter();
        let now = Utc::now();
        assert!(limiter.should_send(AlertKind::TokenThreshold, "90% of max", now));
        assert!(!limiter.should_send(
            AlertKind::TokenThreshold,
            "90% of max",
            now + Duration::minutes(5)
        ));
    }

    #[test]
    fn distinct_messages_of_one_kind_both_send() {
        let mut limiter = limiter();
        let now = Utc::now();
        assert!(limiter.should_send(AlertKind::TokenThreshold, "30 minutes left", now));
        assert!(limiter.should_send(AlertKind::TokenThreshold, "20 minutes left", now));
    }

    #[test]
    fn cooldown_expiry_allows_resend() {
        let mut limiter = limiter();
        let now = Utc::now();
        assert!(limiter.should_send(AlertKind::DegradedSource, "source down", now));
        let after = now + Duration::seconds(AlertConfig::default().cooldown_degraded_seconds as i64 + 1);
        assert!(limiter.should_send(AlertKind::DegradedSource, "source down", after));
    }

    #[test]
    fn reset_clears_suppression_regardless_of_cooldown() {
        let mut limiter = limiter();
        let now = Utc::now();
        assert!(limiter.should_send(AlertKind::LongSession, "session 'p' still running", now));
        limiter.reset(AlertKind::LongSession, "session 'p' still running");
        assert!(limiter.should_send(
            AlertKind::LongSession,
            "session 'p' still running",
            now + Duration::seconds(1)
        ));
    }

    #[test]
    fn reset_where_only_touches_matching_messages() {
        let mut limiter = limiter();
        let now = Utc::now();
        limiter.should_send(AlertKind::LongSession, "session 'p' still running", now);
        limiter.should_send(AlertKind::LongSession, "session 'q' still running", now);

        limiter.reset_where(AlertKind::LongSession, |m| m.contains("'p'"));

        let later = now + Duration::seconds(1);
        assert!(limiter.should_send(AlertKind::LongSession, "session 'p' still running", later));
        assert!(!limiter.should_send(AlertKind::LongSession, "session 'q' still running", later));
    }

    #[test]
    fn sweep_drops_only_expired_records() {
        let mut limiter = limiter();
        let now = Utc::now();
        limiter.should_send(AlertKind::DegradedSource, "a", now - Duration::hours(2));
        limiter.should_send(AlertKind::TokenThreshold, "b", now);
        assert_eq!(limiter.record_count(), 2);

        limiter.sweep(now);

        assert_eq!(limiter.record_count(), 1);
        // The fresh record still suppresses.
        assert!(!limiter.should_send(AlertKind::TokenThreshold, "b", now + Duration::minutes(1)));
    }
}
