use crate::PressureMonitor;
use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Metric handles shared by the pool, the remote client and the orchestrator.
///
/// Handles are bound to whatever recorder is installed when `new` runs, so
/// install the Prometheus exporter first. Without a recorder every handle is
/// a no-op.
pub struct Metrics {
    pub conversions_succeeded: Counter,
    pub conversions_failed: Counter,
    pub conversion_duration: Histogram,
    pub fallbacks: Counter,
    pub validation_failures: Counter,
    pub pool_launches: Counter,
    pub pool_launch_failures: Counter,
    pub pool_evictions: Counter,
    pub pool_active: Gauge,
    pub pool_size: Gauge,
    pub remote_requests: Counter,
    pub remote_failures: Counter,
    pub remote_retries: Counter,
    pub remote_rate_limited: Counter,
    pub memory_usage: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            conversions_succeeded: register_counter!("render_tiers_conversions_succeeded_total"),
            conversions_failed: register_counter!("render_tiers_conversions_failed_total"),
            conversion_duration: register_histogram!("render_tiers_conversion_duration_seconds"),
            fallbacks: register_counter!("render_tiers_fallbacks_total"),
            validation_failures: register_counter!("render_tiers_validation_failures_total"),
            pool_launches: register_counter!("render_tiers_pool_launches_total"),
            pool_launch_failures: register_counter!("render_tiers_pool_launch_failures_total"),
            pool_evictions: register_counter!("render_tiers_pool_evictions_total"),
            pool_active: register_gauge!("render_tiers_pool_active_instances"),
            pool_size: register_gauge!("render_tiers_pool_instances"),
            remote_requests: register_counter!("render_tiers_remote_requests_total"),
            remote_failures: register_counter!("render_tiers_remote_failures_total"),
            remote_retries: register_counter!("render_tiers_remote_retries_total"),
            remote_rate_limited: register_counter!("render_tiers_remote_rate_limited_total"),
            memory_usage: register_gauge!("render_tiers_memory_usage_bytes"),
        }
    }

    pub fn record_conversion(&self, tier: &str, duration: Duration, success: bool) {
        if success {
            self.conversions_succeeded.increment(1);
            metrics::increment_counter!("render_tiers_tier_success_total", "tier" => tier.to_string());
        } else {
            self.conversions_failed.increment(1);
        }
        self.conversion_duration.record(duration.as_secs_f64());
    }

    pub fn record_fallback(&self, from_tier: &str) {
        self.fallbacks.increment(1);
        metrics::increment_counter!("render_tiers_tier_fallback_total", "tier" => from_tier.to_string());
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.increment(1);
    }

    pub fn record_pool_launch(&self, success: bool) {
        if success {
            self.pool_launches.increment(1);
        } else {
            self.pool_launch_failures.increment(1);
        }
    }

    pub fn record_pool_evictions(&self, count: usize) {
        self.pool_evictions.increment(count as u64);
    }

    pub fn record_pool_usage(&self, active_instances: usize, total_instances: usize) {
        self.pool_active.set(active_instances as f64);
        self.pool_size.set(total_instances as f64);
    }

    pub fn record_remote_request(&self, service_id: &str, success: bool) {
        self.remote_requests.increment(1);
        if !success {
            self.remote_failures.increment(1);
            metrics::increment_counter!("render_tiers_service_failures_total", "service" => service_id.to_string());
        }
    }

    pub fn record_retry(&self) {
        self.remote_retries.increment(1);
    }

    pub fn record_rate_limited(&self) {
        self.remote_rate_limited.increment(1);
    }

    pub fn record_memory_usage(&self, bytes: usize) {
        self.memory_usage.set(bytes as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically samples process memory into the pressure monitor and the
/// memory gauge.
pub struct MetricsCollector {
    metrics: Arc<Metrics>,
    pressure: Arc<PressureMonitor>,
    start_time: Instant,
    collection_interval: Duration,
}

impl MetricsCollector {
    pub fn new(metrics: Arc<Metrics>, pressure: Arc<PressureMonitor>) -> Self {
        Self {
            metrics,
            pressure,
            start_time: Instant::now(),
            collection_interval: Duration::from_secs(10),
        }
    }

    pub fn start_collection(&self) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let pressure = self.pressure.clone();
        let interval = self.collection_interval;

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                interval_timer.tick().await;
                let level = pressure.refresh();
                metrics.record_memory_usage(pressure.get_usage());
                debug!(
                    "Memory sample: {} ({:.1}%, {:?})",
                    crate::format_bytes(pressure.get_usage()),
                    pressure.get_usage_percentage(),
                    level
                );
            }
        })
    }

    pub fn get_uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Install the Prometheus recorder and serve `/metrics` on `port`.
pub fn install_prometheus_exporter(port: u16) -> Result<(), crate::ConvertError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| crate::ConvertError::ConfigurationError(e.to_string()))?;
    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_noop_without_recorder() {
        let metrics = Metrics::new();
        metrics.record_conversion("markup", Duration::from_millis(3), true);
        metrics.record_fallback("engine");
        metrics.record_pool_usage(1, 3);
        metrics.record_remote_request("gotenberg-pdf", false);
    }

    #[tokio::test]
    async fn collector_samples_memory() {
        let pressure = Arc::new(PressureMonitor::new(usize::MAX));
        let collector = MetricsCollector::new(Arc::new(Metrics::new()), pressure.clone());
        let task = collector.start_collection();
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        if crate::read_process_rss().is_some() {
            assert!(pressure.get_usage() > 0);
        }
    }
}
