//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `CredentialStore`: Source of provider credentials
//! - `DeviceDirectory`: Provider API for device discovery and access checks
//! - `LiveFeed`: One streaming protocol session per (credential, device)
//! - `MeasurementSink`: Idempotent persistence of telemetry records
//!
//! ## Driver Ports (Inbound)
//!
//! - `RecordHandler`: Receives every record a session decodes

mod credential_store;
mod device_directory;
mod live_feed;
mod measurement_sink;

pub use credential_store::{CredentialStore, StoreError};
pub use device_directory::{DeviceDirectory, DirectoryError};
pub use live_feed::{LiveFeed, RecordHandler};
pub use measurement_sink::{MeasurementSink, NoOpMeasurementSink};

#[cfg(test)]
pub use device_directory::MockDeviceDirectory;
#[cfg(test)]
pub use measurement_sink::MockMeasurementSink;
