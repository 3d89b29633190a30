//! Rolling health of remote conversion services
//!
//! Status rule: `unhealthy` once the consecutive failure count reaches the
//! threshold, else `degraded` while the success rate is below 0.7, else
//! `healthy`. Records are written only by the remote client; everyone else
//! gets snapshots.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEGRADED_SUCCESS_RATE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(label)
    }
}

pub fn classify(failure_count: usize, success_rate: f64, failure_threshold: usize) -> HealthStatus {
    if failure_count >= failure_threshold {
        HealthStatus::Unhealthy
    } else if success_rate < DEGRADED_SUCCESS_RATE {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service_id: String,
    pub status: HealthStatus,
    pub success_count: usize,
    /// Consecutive failures since the last success
    pub failure_count: usize,
    pub total_failures: usize,
    pub success_rate: f64,
    pub last_checked: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(skip)]
    checked_at: Option<Instant>,
}

impl ServiceHealth {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            status: HealthStatus::Healthy,
            success_count: 0,
            failure_count: 0,
            total_failures: 0,
            success_rate: 1.0,
            last_checked: None,
            error: None,
            checked_at: None,
        }
    }

    fn record_success(&mut self, failure_threshold: usize) {
        self.success_count += 1;
        self.failure_count = 0;
        self.error = None;
        self.touch(failure_threshold);
    }

    fn record_failure(&mut self, error: String, failure_threshold: usize) {
        self.failure_count += 1;
        self.total_failures += 1;
        self.error = Some(error);
        self.touch(failure_threshold);
    }

    fn touch(&mut self, failure_threshold: usize) {
        let attempts = self.success_count + self.total_failures;
        self.success_rate = if attempts == 0 {
            1.0
        } else {
            self.success_count as f64 / attempts as f64
        };
        self.status = classify(self.failure_count, self.success_rate, failure_threshold);
        self.last_checked = Some(Utc::now());
        self.checked_at = Some(Instant::now());
    }

    /// Whether the last verdict is older than `ttl` (or there is none).
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.checked_at
            .map(|at| at.elapsed() >= ttl)
            .unwrap_or(true)
    }

    /// Unhealthy services are skipped until their verdict expires.
    pub fn is_selectable(&self, ttl: Duration) -> bool {
        self.status != HealthStatus::Unhealthy || self.is_expired(ttl)
    }
}

/// Health records keyed by service id.
#[derive(Debug)]
pub struct HealthTracker {
    records: DashMap<String, ServiceHealth>,
    failure_threshold: usize,
    ttl: Duration,
}

impl HealthTracker {
    pub fn new(failure_threshold: usize, ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
            ttl,
        }
    }

    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub(crate) fn register(&self, service_id: &str) {
        self.records
            .entry(service_id.to_string())
            .or_insert_with(|| ServiceHealth::new(service_id));
    }

    pub(crate) fn record_success(&self, service_id: &str) {
        let mut record = self
            .records
            .entry(service_id.to_string())
            .or_insert_with(|| ServiceHealth::new(service_id));
        let previous = record.status;
        record.record_success(self.failure_threshold);
        if previous != record.status {
            info!("Service '{}' is now {}", service_id, record.status);
        }
    }

    pub(crate) fn record_failure(&self, service_id: &str, error: impl Into<String>) {
        let mut record = self
            .records
            .entry(service_id.to_string())
            .or_insert_with(|| ServiceHealth::new(service_id));
        let previous = record.status;
        record.record_failure(error.into(), self.failure_threshold);
        if previous != record.status {
            warn!(
                "Service '{}' is now {} ({} consecutive failures)",
                service_id, record.status, record.failure_count
            );
        }
    }

    pub fn get(&self, service_id: &str) -> Option<ServiceHealth> {
        self.records.get(service_id).map(|r| r.clone())
    }

    pub fn is_selectable(&self, service_id: &str) -> bool {
        self.records
            .get(service_id)
            .map(|r| r.is_selectable(self.ttl))
            .unwrap_or(true)
    }

    pub fn snapshot(&self) -> Vec<ServiceHealth> {
        let mut records: Vec<ServiceHealth> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_rules() {
        assert_eq!(classify(3, 0.9, 3), HealthStatus::Unhealthy);
        assert_eq!(classify(1, 0.5, 3), HealthStatus::Degraded);
        assert_eq!(classify(0, 0.7, 3), HealthStatus::Healthy);
    }

    #[test]
    fn consecutive_failures_mark_unhealthy() {
        let tracker = HealthTracker::new(3, Duration::from_secs(60));
        tracker.register("a");
        for _ in 0..2 {
            tracker.record_failure("a", "503");
        }
        assert_ne!(tracker.get("a").map(|h| h.status), Some(HealthStatus::Unhealthy));
        tracker.record_failure("a", "503");

        let health = tracker.get("a").expect("record");
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.failure_count, 3);
        assert_eq!(health.success_rate, 0.0);
        assert_eq!(health.error.as_deref(), Some("503"));
        assert!(!tracker.is_selectable("a"));
    }

    #[test]
    fn success_resets_consecutive_count_but_not_rate() {
        let tracker = HealthTracker::new(3, Duration::from_secs(60));
        tracker.record_failure("a", "timeout");
        tracker.record_failure("a", "timeout");
        tracker.record_success("a");

        let health = tracker.get("a").expect("record");
        assert_eq!(health.failure_count, 0);
        assert_eq!(health.total_failures, 2);
        assert!((health.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_verdict_expires_after_ttl() {
        let tracker = HealthTracker::new(1, Duration::from_secs(60));
        tracker.record_failure("a", "down");
        assert!(!tracker.is_selectable("a"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(tracker.is_selectable("a"));
    }

    #[test]
    fn unknown_services_are_selectable() {
        let tracker = HealthTracker::new(3, Duration::from_secs(60));
        assert!(tracker.is_selectable("never-seen"));
        assert!(tracker.get("never-seen").is_none());
    }
}
