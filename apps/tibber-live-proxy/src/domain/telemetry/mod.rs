//! Live Telemetry Types
//!
//! Core domain types for real-time power measurements. A [`TelemetryRecord`]
//! is one decoded sample for one device (home); a [`LiveUpdate`] pairs the
//! record with its device and is what subscribers receive.
//!
//! Records are immutable once produced. Two records for the same device with
//! the same timestamp describe the same physical sample.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Device Identity
// =============================================================================

/// Stable identifier of a metering point (a "home" at the provider).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// Telemetry Record
// =============================================================================

/// One real-time power sample.
///
/// Power values are in watts, accumulated counters in kWh since midnight,
/// meter readings in kWh, currents in amperes and voltages in volts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    /// Sample time as reported by the meter.
    pub timestamp: DateTime<Utc>,
    /// Instantaneous consumption.
    pub power: f64,
    /// Instantaneous production.
    pub power_production: f64,
    /// Consumption accumulated since midnight.
    pub accumulated_consumption: f64,
    /// Production accumulated since midnight.
    pub accumulated_production: f64,
    /// Lowest consumption since the previous record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_power: Option<f64>,
    /// Average consumption since the previous record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_power: Option<f64>,
    /// Highest consumption since the previous record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_power: Option<f64>,
    /// Highest production since the previous record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_power_production: Option<f64>,
    /// Last meter register reading for consumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_meter_consumption: Option<f64>,
    /// Last meter register reading for production.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_meter_production: Option<f64>,
    /// Current on phase L1.
    #[serde(default, rename = "currentL1", skip_serializing_if = "Option::is_none")]
    pub current_l1: Option<f64>,
    /// Current on phase L2.
    #[serde(default, rename = "currentL2", skip_serializing_if = "Option::is_none")]
    pub current_l2: Option<f64>,
    /// Current on phase L3.
    #[serde(default, rename = "currentL3", skip_serializing_if = "Option::is_none")]
    pub current_l3: Option<f64>,
    /// Voltage on phase 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_phase1: Option<f64>,
    /// Voltage on phase 2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_phase2: Option<f64>,
    /// Voltage on phase 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_phase3: Option<f64>,
}

impl TelemetryRecord {
    /// Create a record with the mandatory fields and no optional readings.
    #[must_use]
    pub const fn new(timestamp: DateTime<Utc>, power: f64, power_production: f64) -> Self {
        Self {
            timestamp,
            power,
            power_production,
            accumulated_consumption: 0.0,
            accumulated_production: 0.0,
            min_power: None,
            average_power: None,
            max_power: None,
            max_power_production: None,
            last_meter_consumption: None,
            last_meter_production: None,
            current_l1: None,
            current_l2: None,
            current_l3: None,
            voltage_phase1: None,
            voltage_phase2: None,
            voltage_phase3: None,
        }
    }

    /// Set the accumulated counters.
    #[must_use]
    pub const fn with_accumulated(mut self, consumption: f64, production: f64) -> Self {
        self.accumulated_consumption = consumption;
        self.accumulated_production = production;
        self
    }

    /// Net power drawn from the grid (negative when exporting).
    #[must_use]
    pub fn net_power(&self) -> f64 {
        self.power - self.power_production
    }
}

// =============================================================================
// Live Update
// =============================================================================

/// Snapshot delivered to live-data subscribers.
///
/// Serializes as a flat JSON object: `{"homeId": "...", "timestamp": ..., "power": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveUpdate {
    /// Device the record belongs to.
    pub home_id: DeviceId,
    /// The decoded sample.
    #[serde(flatten)]
    pub record: TelemetryRecord,
}

impl LiveUpdate {
    /// Pair a record with its device.
    #[must_use]
    pub const fn new(home_id: DeviceId, record: TelemetryRecord) -> Self {
        Self { home_id, record }
    }

    /// Sample timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.record.timestamp
    }
}
