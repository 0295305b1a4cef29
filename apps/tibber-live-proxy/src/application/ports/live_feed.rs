//! Live Feed Port
//!
//! A `LiveFeed` runs one protocol session for one (credential, device) pair
//! and pushes every decoded record into a [`RecordHandler`]. The session
//! never retries on its own; callers decide whether to start another one.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::credential::Credential;
use crate::domain::session::{SessionEnd, SessionError};
use crate::domain::telemetry::{DeviceId, TelemetryRecord};

/// Receives records from a running session, in receipt order.
///
/// Called inline from the session loop, so implementations must not block
/// for long.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Handle one decoded record for `device`.
    async fn handle(&self, device: &DeviceId, record: TelemetryRecord);
}

/// Port for running streaming sessions.
#[async_trait]
pub trait LiveFeed: Send + Sync {
    /// Run a session until the provider completes it, it fails, or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] if the transport fails or the handshake is rejected.
    async fn run_session(
        &self,
        credential: &Credential,
        device: &DeviceId,
        handler: Arc<dyn RecordHandler>,
        cancel: CancellationToken,
    ) -> Result<SessionEnd, SessionError>;
}
