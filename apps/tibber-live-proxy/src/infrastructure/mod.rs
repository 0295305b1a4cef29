//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Provider adapters: GraphQL API client and live measurement sessions.
pub mod tibber;

/// Fan-out of live updates to downstream subscribers.
pub mod broadcast;

/// Configuration loading.
pub mod config;

/// HTTP server: health, metrics and live-data event streams.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// SQLite persistence for credentials and measurements.
pub mod store;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
