//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Records**: Telemetry received, published, deduplicated and discarded
//! - **Subscribers**: Live-data subscriber count and evictions
//! - **Sessions**: Active sessions and credentials, errors, reconnects
//! - **Persistence**: Failed measurement writes
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

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
    // Record counters
    describe_counter!(
        "tibber_proxy_records_received_total",
        "Total telemetry records decoded from live sessions"
    );
    describe_counter!(
        "tibber_proxy_records_published_total",
        "Total telemetry records fanned out to subscribers"
    );
    describe_counter!(
        "tibber_proxy_records_duplicate_total",
        "Total records skipped because the timestamp was already published"
    );
    describe_counter!(
        "tibber_proxy_records_discarded_total",
        "Total next payloads dropped before reaching the pipeline"
    );

    // Subscribers
    describe_gauge!(
        "tibber_proxy_subscribers",
        "Number of registered live-data subscribers"
    );
    describe_counter!(
        "tibber_proxy_subscribers_evicted_total",
        "Total subscribers evicted because their queue was full or closed"
    );

    // Sessions
    describe_gauge!(
        "tibber_proxy_active_sessions",
        "Number of running protocol sessions"
    );
    describe_gauge!(
        "tibber_proxy_active_credentials",
        "Number of credentials with registered sessions"
    );
    describe_counter!(
        "tibber_proxy_session_errors_total",
        "Total protocol sessions closed by an error, by kind"
    );
    describe_counter!(
        "tibber_proxy_reconnects_total",
        "Total session restarts after an unexpected end"
    );

    // Persistence
    describe_counter!(
        "tibber_proxy_persist_failures_total",
        "Total measurement writes that failed"
    );

    // Latency
    describe_histogram!(
        "tibber_proxy_record_processing_seconds",
        "Time to publish and persist one record"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a `next` payload never became a record.
#[derive(Debug, Clone, Copy)]
pub enum DiscardReason {
    /// Timestamp missing or zero.
    UnsetTimestamp,
    /// Payload did not decode.
    Malformed,
}

impl DiscardReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::UnsetTimestamp => "unset_timestamp",
            Self::Malformed => "malformed",
        }
    }
}

/// Record a telemetry record decoded from a session.
pub fn record_received() {
    counter!("tibber_proxy_records_received_total").increment(1);
}

/// Record a record that passed deduplication and was fanned out.
pub fn record_published() {
    counter!("tibber_proxy_records_published_total").increment(1);
}

/// Record a duplicate record skipped by deduplication.
pub fn record_duplicate() {
    counter!("tibber_proxy_records_duplicate_total").increment(1);
}

/// Record a payload dropped during decoding.
pub fn record_discarded(reason: DiscardReason) {
    counter!(
        "tibber_proxy_records_discarded_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record subscribers evicted during a publish.
pub fn record_evicted(count: u64) {
    counter!("tibber_proxy_subscribers_evicted_total").increment(count);
}

/// Update the live-data subscriber count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribers(count: usize) {
    gauge!("tibber_proxy_subscribers").set(count as f64);
}

/// Adjust the running session count.
pub fn session_started() {
    gauge!("tibber_proxy_active_sessions").increment(1.0);
}

/// Adjust the running session count.
pub fn session_stopped() {
    gauge!("tibber_proxy_active_sessions").decrement(1.0);
}

/// Update the number of credentials with registered sessions.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_credentials(count: usize) {
    gauge!("tibber_proxy_active_credentials").set(count as f64);
}

/// Record a session closed by an error.
pub fn record_session_error(kind: &'static str) {
    counter!(
        "tibber_proxy_session_errors_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record a session restart.
pub fn record_reconnect() {
    counter!("tibber_proxy_reconnects_total").increment(1);
}

/// Record a failed measurement write.
pub fn record_persist_failure() {
    counter!("tibber_proxy_persist_failures_total").increment(1);
}

/// Record the time spent handling one record.
pub fn record_processing_duration(duration: Duration) {
    histogram!("tibber_proxy_record_processing_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discard_reason_as_str() {
        assert_eq!(DiscardReason::UnsetTimestamp.as_str(), "unset_timestamp");
        assert_eq!(DiscardReason::Malformed.as_str(), "malformed");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_received();
        record_published();
        record_evicted(2);
        set_subscribers(3);
        record_session_error("connect");
        record_processing_duration(Duration::from_millis(1));
    }
}
