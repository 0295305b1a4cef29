//! Measurement Sink Port (Driven Port)
//!
//! Interface for persisting live telemetry. Stores are keyed by
//! (device, timestamp) so writing the same sample twice is harmless.

use async_trait::async_trait;

use super::StoreError;
use crate::domain::telemetry::{DeviceId, TelemetryRecord};

/// Port for persisting telemetry records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    /// Upsert one record.
    async fn store(&self, device: &DeviceId, record: &TelemetryRecord) -> Result<(), StoreError>;
}

/// Sink that discards everything.
#[derive(Debug, Clone, Default)]
pub struct NoOpMeasurementSink;

#[async_trait]
impl MeasurementSink for NoOpMeasurementSink {
    async fn store(&self, _device: &DeviceId, _record: &TelemetryRecord) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[tokio::test]
    async fn no_op_sink_succeeds() {
        let sink = NoOpMeasurementSink;
        let record = TelemetryRecord::new(Utc::now(), 1.0, 0.0);

        let result = sink.store(&DeviceId::new("home"), &record).await;
        assert!(result.is_ok());
    }
}
