//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the streaming core interacts with external systems.

/// Port interfaces for credential storage, device discovery, streaming and persistence.
pub mod ports;

/// Application services: session supervision and the telemetry pipeline.
pub mod services;
