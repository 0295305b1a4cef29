//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SessionSupervisor`: One group of live sessions per active credential
//! - `TelemetryPipeline`: Fans records out to subscribers, then persists them
//! - `ReconnectPolicy`: Backoff for restarting ended sessions

mod pipeline;
mod reconnect;
mod supervisor;

pub use pipeline::TelemetryPipeline;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use supervisor::{ActivateOutcome, SessionSupervisor, SupervisorConfig, SupervisorError};
