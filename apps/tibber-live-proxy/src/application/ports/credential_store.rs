//! Credential Store Port (Driven Port)
//!
//! Interface for reading provider credentials.

use async_trait::async_trait;

use crate::domain::credential::{Credential, CredentialId};

/// Credential store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The underlying database rejected the operation.
    #[error("store database error: {message}")]
    Database {
        /// Driver error message.
        message: String,
    },

    /// The blocking worker running the operation failed.
    #[error("store worker failed: {message}")]
    Worker {
        /// Join error message.
        message: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt stored value in {field}: {message}")]
    Corrupt {
        /// Column that failed to decode.
        field: &'static str,
        /// Decode error message.
        message: String,
    },
}

/// Port for reading credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// List every credential whose `active` flag is set.
    async fn list_active_credentials(&self) -> Result<Vec<Credential>, StoreError>;

    /// Look up one credential; `None` if it does not exist.
    async fn get_credential(&self, id: CredentialId) -> Result<Option<Credential>, StoreError>;

    /// Cheap liveness probe used by the change listener.
    async fn ping(&self) -> Result<(), StoreError>;
}
