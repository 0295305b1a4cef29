//! Telemetry Pipeline
//!
//! The [`RecordHandler`] every session feeds. Each record is fanned out to
//! live subscribers first and persisted second, so a slow store never delays
//! delivery. Records the broadcaster rejects as duplicates are not persisted.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::application::ports::{MeasurementSink, RecordHandler};
use crate::domain::telemetry::{DeviceId, LiveUpdate, TelemetryRecord};
use crate::infrastructure::broadcast::{BroadcastHub, PublishOutcome};
use crate::infrastructure::metrics;

/// Publishes and persists decoded records.
pub struct TelemetryPipeline {
    hub: Arc<BroadcastHub>,
    sink: Arc<dyn MeasurementSink>,
}

impl TelemetryPipeline {
    /// Create a pipeline over a hub and a sink.
    #[must_use]
    pub fn new(hub: Arc<BroadcastHub>, sink: Arc<dyn MeasurementSink>) -> Self {
        Self { hub, sink }
    }
}

#[async_trait]
impl RecordHandler for TelemetryPipeline {
    async fn handle(&self, device: &DeviceId, record: TelemetryRecord) {
        let started = Instant::now();
        let update = LiveUpdate::new(device.clone(), record);

        if matches!(self.hub.publish_update(update.clone()), PublishOutcome::Duplicate) {
            return;
        }

        if let Err(e) = self.sink.store(device, &update.record).await {
            metrics::record_persist_failure();
            tracing::warn!(home_id = %device, error = %e, "Failed to persist measurement");
        }

        metrics::record_processing_duration(started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::application::ports::{MockMeasurementSink, StoreError};
    use crate::infrastructure::broadcast::SubscriberKey;

    fn record(secs: i64) -> TelemetryRecord {
        TelemetryRecord::new(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(), 500.0, 0.0)
    }

    #[tokio::test]
    async fn publishes_then_persists() {
        let hub = Arc::new(BroadcastHub::with_defaults());
        let mut sub = hub.subscribe(SubscriberKey::firehose("c1"));
        let mut sink = MockMeasurementSink::new();
        sink.expect_store()
            .withf(|device, record| device.as_str() == "home" && record.power > 499.0)
            .times(1)
            .returning(|_, _| Ok(()));
        let pipeline = TelemetryPipeline::new(Arc::clone(&hub), Arc::new(sink));

        pipeline.handle(&DeviceId::new("home"), record(0)).await;

        let update = sub.try_recv().unwrap();
        assert_eq!(update.home_id.as_str(), "home");
    }

    #[tokio::test]
    async fn duplicates_are_not_persisted() {
        let hub = Arc::new(BroadcastHub::with_defaults());
        let mut sink = MockMeasurementSink::new();
        sink.expect_store().times(1).returning(|_, _| Ok(()));
        let pipeline = TelemetryPipeline::new(hub, Arc::new(sink));
        let home = DeviceId::new("home");

        pipeline.handle(&home, record(0)).await;
        pipeline.handle(&home, record(0)).await;
    }

    #[tokio::test]
    async fn persistence_failure_does_not_block_delivery() {
        let hub = Arc::new(BroadcastHub::with_defaults());
        let mut sub = hub.subscribe(SubscriberKey::for_device_client(&DeviceId::new("home"), "c1"));
        let mut sink = MockMeasurementSink::new();
        sink.expect_store().returning(|_, _| {
            Err(StoreError::Database {
                message: "disk full".to_string(),
            })
        });
        let pipeline = TelemetryPipeline::new(Arc::clone(&hub), Arc::new(sink));

        pipeline.handle(&DeviceId::new("home"), record(0)).await;
        pipeline.handle(&DeviceId::new("home"), record(1)).await;

        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_some());
    }
}
