//! Device Directory Port (Driven Port)
//!
//! Interface to the provider's request/response API: verifying a token,
//! discovering the homes it can see, and confirming a home streams live data.

use async_trait::async_trait;

use crate::domain::credential::Credential;
use crate::domain::telemetry::DeviceId;

/// Device directory error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    /// The provider rejected the token.
    #[error("provider rejected credential: {message}")]
    Unauthorized {
        /// Provider message.
        message: String,
    },

    /// The provider returned GraphQL errors.
    #[error("provider API error: {message}")]
    Api {
        /// Joined error messages.
        message: String,
    },

    /// The home is not visible to this credential.
    #[error("home {0} not found for credential")]
    DeviceNotFound(DeviceId),

    /// The home exists but has no real-time meter attached.
    #[error("real-time consumption not enabled for home {0}")]
    RealTimeDisabled(DeviceId),

    /// The request could not be sent or timed out.
    #[error("provider request failed: {message}")]
    Transport {
        /// Client error message.
        message: String,
    },

    /// The response body was not the expected shape.
    #[error("unexpected provider response: {message}")]
    Decode {
        /// Decode error message.
        message: String,
    },
}

/// Port for device discovery and access pre-flight.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Confirm the credential is accepted by the provider.
    async fn verify_credential(&self, credential: &Credential) -> Result<(), DirectoryError>;

    /// List the homes with real-time telemetry enabled.
    async fn list_devices(&self, credential: &Credential) -> Result<Vec<DeviceId>, DirectoryError>;

    /// Confirm the credential can stream live data for `device`.
    async fn verify_access(
        &self,
        credential: &Credential,
        device: &DeviceId,
    ) -> Result<(), DirectoryError>;
}
