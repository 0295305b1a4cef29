//! Subscription Protocol Envelopes
//!
//! JSON envelopes of the `graphql-transport-ws` subprotocol, one per text
//! frame:
//!
//! ```json
//! {"type": "next", "id": "1", "payload": {"data": {"liveMeasurement": {...}}}}
//! ```
//!
//! Envelopes decode into the closed [`Envelope`] enum. Kinds the client does
//! not act on decode to [`Envelope::Unknown`] instead of failing.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::telemetry::{DeviceId, TelemetryRecord};

/// Subscription id used for the single live-measurement subscription.
pub const SUBSCRIPTION_ID: &str = "1";

/// WebSocket subprotocol negotiated with the provider.
pub const SUBPROTOCOL: &str = "graphql-transport-ws";

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// A timestamp was not RFC 3339.
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    /// The `next` payload has no `data.liveMeasurement` object.
    #[error("next payload has no liveMeasurement: {0}")]
    MissingMeasurement(String),
}

// =============================================================================
// Envelope
// =============================================================================

/// Body of a `subscribe` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    /// GraphQL subscription document.
    pub query: String,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Client opens the protocol.
    ConnectionInit {
        /// Always `{}` for this client.
        payload: Value,
    },
    /// Server accepts the connection.
    ConnectionAck {
        /// Optional server metadata.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Client starts a subscription.
    Subscribe {
        /// Subscription id.
        id: String,
        /// Query document.
        payload: SubscribePayload,
    },
    /// Server delivers a subscription result.
    Next {
        /// Subscription id.
        #[serde(default)]
        id: String,
        /// GraphQL execution result.
        #[serde(default)]
        payload: Value,
    },
    /// Server reports errors for a subscription.
    Error {
        /// Subscription id.
        #[serde(default)]
        id: String,
        /// GraphQL errors.
        #[serde(default)]
        payload: Value,
    },
    /// Either side ends a subscription.
    Complete {
        /// Subscription id.
        #[serde(default)]
        id: String,
    },
    /// Protocol-level keepalive request.
    Ping {
        /// Optional payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Protocol-level keepalive reply.
    Pong {
        /// Optional payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Client closes the protocol.
    ConnectionTerminate,
    /// Any kind this client does not handle.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// `connection_init` with an empty payload.
    #[must_use]
    pub fn connection_init() -> Self {
        Self::ConnectionInit {
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// `subscribe` for the live measurements of `device`.
    #[must_use]
    pub fn subscribe_live_measurement(device: &DeviceId) -> Self {
        Self::Subscribe {
            id: SUBSCRIPTION_ID.to_string(),
            payload: SubscribePayload {
                query: live_measurement_query(device),
            },
        }
    }

    /// Protocol name of this envelope's kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionInit { .. } => "connection_init",
            Self::ConnectionAck { .. } => "connection_ack",
            Self::Subscribe { .. } => "subscribe",
            Self::Next { .. } => "next",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::ConnectionTerminate => "connection_terminate",
            Self::Unknown => "unknown",
        }
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object with a string `type`.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode for a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// GraphQL subscription document for one home.
#[must_use]
pub fn live_measurement_query(device: &DeviceId) -> String {
    format!(
        "subscription {{ liveMeasurement(homeId: \"{device}\") {{ \
         timestamp power powerProduction minPower averagePower maxPower maxPowerProduction \
         accumulatedConsumption accumulatedProduction lastMeterConsumption lastMeterProduction \
         currentL1 currentL2 currentL3 voltagePhase1 voltagePhase2 voltagePhase3 }} }}"
    )
}

// =============================================================================
// Live Measurement Payload
// =============================================================================

#[derive(Debug, Deserialize)]
struct NextPayload {
    #[serde(default)]
    data: Option<NextData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextData {
    #[serde(default)]
    live_measurement: Option<LiveMeasurementWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveMeasurementWire {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    power: Option<f64>,
    #[serde(default)]
    power_production: Option<f64>,
    #[serde(default)]
    min_power: Option<f64>,
    #[serde(default)]
    average_power: Option<f64>,
    #[serde(default)]
    max_power: Option<f64>,
    #[serde(default)]
    max_power_production: Option<f64>,
    #[serde(default)]
    accumulated_consumption: Option<f64>,
    #[serde(default)]
    accumulated_production: Option<f64>,
    #[serde(default)]
    last_meter_consumption: Option<f64>,
    #[serde(default)]
    last_meter_production: Option<f64>,
    #[serde(default, rename = "currentL1")]
    current_l1: Option<f64>,
    #[serde(default, rename = "currentL2")]
    current_l2: Option<f64>,
    #[serde(default, rename = "currentL3")]
    current_l3: Option<f64>,
    #[serde(default)]
    voltage_phase1: Option<f64>,
    #[serde(default)]
    voltage_phase2: Option<f64>,
    #[serde(default)]
    voltage_phase3: Option<f64>,
}

/// Parse a provider timestamp, treating missing and zero values as unset.
///
/// Zero means the Unix epoch or `0001-01-01T00:00:00Z`.
fn parse_timestamp(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, EnvelopeError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let parsed = DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc);
    if parsed.timestamp() == 0 || parsed.year() <= 1 {
        return Ok(None);
    }
    Ok(Some(parsed))
}

/// Decode the payload of a `next` envelope.
///
/// Returns `Ok(None)` when the record has no usable timestamp; such records
/// are dropped without being treated as errors.
///
/// # Errors
///
/// Returns an error if the payload is malformed or has no measurement.
pub fn decode_live_measurement(payload: &Value) -> Result<Option<TelemetryRecord>, EnvelopeError> {
    let next = NextPayload::deserialize(payload)?;
    let wire = next
        .data
        .and_then(|data| data.live_measurement)
        .ok_or_else(|| EnvelopeError::MissingMeasurement(payload.to_string()))?;

    let Some(timestamp) = parse_timestamp(wire.timestamp.as_deref())? else {
        return Ok(None);
    };

    Ok(Some(TelemetryRecord {
        timestamp,
        power: wire.power.unwrap_or_default(),
        power_production: wire.power_production.unwrap_or_default(),
        accumulated_consumption: wire.accumulated_consumption.unwrap_or_default(),
        accumulated_production: wire.accumulated_production.unwrap_or_default(),
        min_power: wire.min_power,
        average_power: wire.average_power,
        max_power: wire.max_power,
        max_power_production: wire.max_power_production,
        last_meter_consumption: wire.last_meter_consumption,
        last_meter_production: wire.last_meter_production,
        current_l1: wire.current_l1,
        current_l2: wire.current_l2,
        current_l3: wire.current_l3,
        voltage_phase1: wire.voltage_phase1,
        voltage_phase2: wire.voltage_phase2,
        voltage_phase3: wire.voltage_phase3,
    }))
}

/// Human-readable summary of an `error` payload.
#[must_use]
pub fn describe_errors(payload: &Value) -> String {
    payload.as_array().map_or_else(
        || payload.to_string(),
        |errors| {
            errors
                .iter()
                .map(|e| {
                    e.get("message")
                        .and_then(Value::as_str)
                        .map_or_else(|| e.to_string(), str::to_string)
                })
                .collect::<Vec<_>>()
                .join("; ")
        },
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test]
    fn connection_init_has_empty_payload() {
        let json = Envelope::connection_init().encode().unwrap();
        assert_eq!(json, r#"{"type":"connection_init","payload":{}}"#);
    }

    #[test]
    fn subscribe_uses_fixed_id_and_device_query() {
        let envelope = Envelope::subscribe_live_measurement(&DeviceId::new("home-9"));
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["id"], "1");
        let query = value["payload"]["query"].as_str().unwrap();
        assert!(query.contains(r#"liveMeasurement(homeId: "home-9")"#));
        assert!(query.contains("voltagePhase3"));
        assert!(query.contains("lastMeterProduction"));
    }

    #[test]
    fn terminate_encodes_type_only() {
        let json = Envelope::ConnectionTerminate.encode().unwrap();
        assert_eq!(json, r#"{"type":"connection_terminate"}"#);
    }

    #[test_case(r#"{"type":"connection_ack"}"#, "connection_ack" ; "ack without payload")]
    #[test_case(r#"{"type":"connection_ack","payload":{"x":1}}"#, "connection_ack" ; "ack payload")]
    #[test_case(r#"{"type":"next","id":"1","payload":{}}"#, "next" ; "next")]
    #[test_case(r#"{"type":"error","id":"1","payload":[{"message":"boom"}]}"#, "error" ; "error")]
    #[test_case(r#"{"type":"complete","id":"1"}"#, "complete" ; "complete")]
    #[test_case(r#"{"type":"ping"}"#, "ping" ; "ping")]
    #[test_case(r#"{"type":"ka"}"#, "unknown" ; "keepalive from legacy protocol")]
    fn decodes_kind(text: &str, kind: &str) {
        assert_eq!(Envelope::decode(text).unwrap().kind(), kind);
    }

    #[test_case("not json" ; "garbage")]
    #[test_case(r#"{"id":"1"}"# ; "missing type")]
    fn rejects_malformed(text: &str) {
        assert!(Envelope::decode(text).is_err());
    }

    #[test]
    fn decodes_full_measurement() {
        let payload = json!({"data": {"liveMeasurement": {
            "timestamp": "2024-03-01T13:00:05.000+01:00",
            "power": 1520.0,
            "powerProduction": 0.0,
            "minPower": 300.0,
            "averagePower": 900.5,
            "maxPower": 4100.0,
            "accumulatedConsumption": 12.5,
            "accumulatedProduction": 0.0,
            "lastMeterConsumption": 45123.2,
            "currentL1": 3.1,
            "currentL2": null,
            "voltagePhase1": 231.0
        }}});

        let record = decode_live_measurement(&payload).unwrap().unwrap();

        assert_eq!(record.timestamp, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap());
        assert_eq!(record.power, 1520.0);
        assert_eq!(record.accumulated_consumption, 12.5);
        assert_eq!(record.average_power, Some(900.5));
        assert_eq!(record.last_meter_consumption, Some(45123.2));
        assert_eq!(record.current_l1, Some(3.1));
        assert_eq!(record.current_l2, None);
        assert_eq!(record.voltage_phase1, Some(231.0));
    }

    #[test_case(json!({"power": 1.0}) ; "missing")]
    #[test_case(json!({"timestamp": null, "power": 1.0}) ; "null")]
    #[test_case(json!({"timestamp": "", "power": 1.0}) ; "empty")]
    #[test_case(json!({"timestamp": "0001-01-01T00:00:00Z", "power": 1.0}) ; "zero time")]
    #[test_case(json!({"timestamp": "1970-01-01T00:00:00Z", "power": 1.0}) ; "epoch")]
    fn unset_timestamp_is_dropped(measurement: Value) {
        let payload = json!({"data": {"liveMeasurement": measurement}});
        assert!(decode_live_measurement(&payload).unwrap().is_none());
    }

    #[test]
    fn missing_measurement_is_an_error() {
        let payload = json!({"data": null, "errors": [{"message": "denied"}]});
        assert!(matches!(
            decode_live_measurement(&payload),
            Err(EnvelopeError::MissingMeasurement(_))
        ));
    }

    #[test]
    fn wrongly_typed_field_is_an_error() {
        let payload = json!({
            "data": {"liveMeasurement": {"timestamp": "2024-01-01T00:00:00Z", "power": "lots"}}
        });
        assert!(decode_live_measurement(&payload).is_err());
    }

    #[test]
    fn describe_errors_joins_messages() {
        let payload = json!([{"message": "a"}, {"message": "b"}]);
        assert_eq!(describe_errors(&payload), "a; b");
        assert_eq!(describe_errors(&json!({"x": 1})), r#"{"x":1}"#);
    }
}
