//! Domain Layer - Core telemetry, credential and session types.
//!
//! This layer contains the types shared by every other layer. Nothing here
//! performs I/O; all types are plain Rust with serialization support.

/// Live power telemetry records and the snapshots delivered to subscribers.
pub mod telemetry;

/// Provider credentials and change notifications.
pub mod credential;

/// Protocol session lifecycle states and outcomes.
pub mod session;
