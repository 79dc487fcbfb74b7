//! Per-sensor consecutive failure counting and ban bookkeeping.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Default number of consecutive failures tolerated before a ban.
pub const DEFAULT_THRESHOLD: u32 = 3;

/// Threshold and backoff curve for bans.
///
/// A failure whose consecutive count exceeds `threshold` bans the sensor for
/// `min(max_backoff, base_backoff * 2^(count - threshold - 1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    pub threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(600),
        }
    }
}

impl FailurePolicy {
    /// Whether `count` consecutive failures is past the threshold.
    pub fn exceeded(&self, count: u32) -> bool {
        count > self.threshold
    }

    /// Ban length after `count` consecutive failures.
    pub fn backoff(&self, count: u32) -> Duration {
        if !self.exceeded(count) {
            return Duration::ZERO;
        }
        let doublings = (count - self.threshold - 1).min(31);
        self.base_backoff
            .checked_mul(1u32 << doublings)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Snapshot of one sensor's failure state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub consecutive_failures: u32,
    pub banned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl FailureRecord {
    /// Banned and the retry time has not yet passed.
    pub fn is_banned_at(&self, now: DateTime<Utc>) -> bool {
        self.banned && self.retry_at.is_some_and(|at| now < at)
    }
}

/// Failure records keyed by sensor id.
#[derive(Debug, Default)]
pub struct FailureTracker {
    policy: FailurePolicy,
    records: Mutex<HashMap<String, FailureRecord>>,
}

impl FailureTracker {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    /// Record a failed exchange and return the updated record.
    pub fn record_failure(&self, sensor_id: &str) -> FailureRecord {
        self.record_failure_at(sensor_id, Utc::now())
    }

    pub fn record_failure_at(&self, sensor_id: &str, now: DateTime<Utc>) -> FailureRecord {
        let mut records = self.records.lock();
        let record = records.entry(sensor_id.to_string()).or_default();
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        if self.policy.exceeded(record.consecutive_failures) {
            self.ban_record(record, now);
        }
        record.clone()
    }

    /// Ban immediately, pushing the count past the threshold if needed.
    ///
    /// Used when a connectivity probe fails.
    pub fn ban(&self, sensor_id: &str) -> FailureRecord {
        self.ban_at(sensor_id, Utc::now())
    }

    pub fn ban_at(&self, sensor_id: &str, now: DateTime<Utc>) -> FailureRecord {
        let mut records = self.records.lock();
        let record = records.entry(sensor_id.to_string()).or_default();
        record.consecutive_failures = record
            .consecutive_failures
            .saturating_add(1)
            .max(self.policy.threshold.saturating_add(1));
        self.ban_record(record, now);
        record.clone()
    }

    fn ban_record(&self, record: &mut FailureRecord, now: DateTime<Utc>) {
        let backoff = self.policy.backoff(record.consecutive_failures);
        let millis = i64::try_from(backoff.as_millis()).unwrap_or(i64::MAX / 2);
        record.banned = true;
        record.retry_at = Some(now + chrono::Duration::milliseconds(millis));
    }

    /// Forget a sensor's failures. Returns whether there was anything to clear.
    pub fn clear(&self, sensor_id: &str) -> bool {
        self.records
            .lock()
            .remove(sensor_id)
            .is_some_and(|r| r.consecutive_failures > 0 || r.banned)
    }

    pub fn is_banned(&self, sensor_id: &str) -> bool {
        self.is_banned_at(sensor_id, Utc::now())
    }

    pub fn is_banned_at(&self, sensor_id: &str, now: DateTime<Utc>) -> bool {
        self.records
            .lock()
            .get(sensor_id)
            .is_some_and(|r| r.is_banned_at(now))
    }

    pub fn failure_count(&self, sensor_id: &str) -> u32 {
        self.records
            .lock()
            .get(sensor_id)
            .map_or(0, |r| r.consecutive_failures)
    }

    pub fn record(&self, sensor_id: &str) -> FailureRecord {
        self.records
            .lock()
            .get(sensor_id)
            .cloned()
            .unwrap_or_default()
    }
}
