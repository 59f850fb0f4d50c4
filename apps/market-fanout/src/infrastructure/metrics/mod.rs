//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ingest**: Ticks applied to the cache, evictions
//! - **Cache**: Read hits and misses, cached instrument count
//! - **Sessions**: Logins, removals by reason, active count
//! - **Delivery**: Push outcomes by delivery path
//! - **Background tasks**: Run duration and failures per task
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::application::ports::{DeliveryPath, RemovalReason, ServiceMetrics};
use crate::domain::cache::CacheStats;
use crate::domain::session::SessionStats;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_fanout_ticks_ingested_total",
        "Total ticks applied to the snapshot cache"
    );
    describe_counter!(
        "market_fanout_cache_reads_total",
        "Snapshot reads by result (hit or miss)"
    );
    describe_counter!(
        "market_fanout_snapshots_evicted_total",
        "Snapshots removed by the staleness sweep"
    );
    describe_counter!(
        "market_fanout_sessions_created_total",
        "Sessions created by login"
    );
    describe_counter!(
        "market_fanout_sessions_removed_total",
        "Sessions removed by reason"
    );
    describe_counter!(
        "market_fanout_deliveries_total",
        "Push deliveries by path and result"
    );
    describe_counter!(
        "market_fanout_group_failures_total",
        "Fan-out groups abandoned by path"
    );
    describe_counter!(
        "market_fanout_cycle_failures_total",
        "Background task runs that failed or panicked"
    );

    describe_gauge!(
        "market_fanout_cached_instruments",
        "Instruments currently held in the snapshot cache"
    );
    describe_gauge!(
        "market_fanout_active_sessions",
        "Sessions currently marked active"
    );

    describe_histogram!(
        "market_fanout_cycle_seconds",
        "Background task run duration"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

const fn path_label(path: DeliveryPath) -> &'static str {
    match path {
        DeliveryPath::Exchange => "exchange",
        DeliveryPath::Instrument => "instrument",
        DeliveryPath::OnDemand => "on_demand",
    }
}

const fn reason_label(reason: RemovalReason) -> &'static str {
    match reason {
        RemovalReason::Logout => "logout",
        RemovalReason::Superseded => "superseded",
        RemovalReason::Expired => "expired",
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record ticks applied to the cache.
pub fn record_ticks_ingested(count: u64) {
    counter!("market_fanout_ticks_ingested_total").increment(count);
}

/// Record snapshots evicted by a sweep.
pub fn record_snapshots_evicted(count: u64) {
    counter!("market_fanout_snapshots_evicted_total").increment(count);
}

/// Record a login.
pub fn record_session_created() {
    counter!("market_fanout_sessions_created_total").increment(1);
}

/// Record session removals.
pub fn record_sessions_removed(reason: RemovalReason, count: u64) {
    counter!(
        "market_fanout_sessions_removed_total",
        "reason" => reason_label(reason)
    )
    .increment(count);
}

/// Record one delivery attempt.
pub fn record_delivery(path: DeliveryPath, success: bool) {
    counter!(
        "market_fanout_deliveries_total",
        "path" => path_label(path),
        "result" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Record an abandoned fan-out group.
pub fn record_group_failure(path: DeliveryPath) {
    counter!("market_fanout_group_failures_total", "path" => path_label(path)).increment(1);
}

/// Record a failed or panicked background task run.
pub fn record_cycle_failure(task: &'static str) {
    counter!("market_fanout_cycle_failures_total", "task" => task).increment(1);
}

/// Record a background task run duration.
pub fn record_cycle_duration(task: &'static str, duration: Duration) {
    histogram!("market_fanout_cycle_seconds", "task" => task).record(duration.as_secs_f64());
}

/// Publish cache statistics as gauges and read counters.
#[allow(clippy::cast_precision_loss)]
pub fn publish_cache_stats(stats: &CacheStats) {
    gauge!("market_fanout_cached_instruments").set(stats.total_instruments as f64);
    counter!("market_fanout_cache_reads_total", "result" => "hit").absolute(stats.cache_hits);
    counter!("market_fanout_cache_reads_total", "result" => "miss").absolute(stats.cache_misses);
}

/// Publish session statistics as gauges.
#[allow(clippy::cast_precision_loss)]
pub fn publish_session_stats(stats: &SessionStats) {
    gauge!("market_fanout_active_sessions").set(stats.active_sessions as f64);
}

// =============================================================================
// Service Metrics Adapter
// =============================================================================

/// Reports engine and session counters to the global recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl ServiceMetrics for PrometheusMetrics {
    fn delivery(&self, path: DeliveryPath, success: bool) {
        record_delivery(path, success);
    }

    fn group_failed(&self, path: DeliveryPath) {
        record_group_failure(path);
    }

    fn session_created(&self) {
        record_session_created();
    }

    fn sessions_removed(&self, reason: RemovalReason, count: u64) {
        record_sessions_removed(reason, count);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_path_labels() {
        assert_eq!(path_label(DeliveryPath::Exchange), "exchange");
        assert_eq!(path_label(DeliveryPath::Instrument), "instrument");
        assert_eq!(path_label(DeliveryPath::OnDemand), "on_demand");
    }

    #[test]
    fn removal_reason_labels() {
        assert_eq!(reason_label(RemovalReason::Logout), "logout");
        assert_eq!(reason_label(RemovalReason::Superseded), "superseded");
        assert_eq!(reason_label(RemovalReason::Expired), "expired");
    }

    #[test]
    fn prometheus_adapter_records_through_the_port() {
        let metrics: &dyn ServiceMetrics = &PrometheusMetrics;
        metrics.delivery(DeliveryPath::Exchange, true);
        metrics.group_failed(DeliveryPath::Instrument);
        metrics.session_created();
        metrics.sessions_removed(RemovalReason::Expired, 3);
    }

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_delivery(DeliveryPath::OnDemand, false);
        record_cycle_duration("test", Duration::from_millis(3));
        publish_cache_stats(&CacheStats::default());
    }
}
