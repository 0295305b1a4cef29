//! Provider GraphQL API Client
//!
//! Request/response access to the provider's GraphQL endpoint, used for the
//! activation pre-flight and for home discovery. Every call posts the same
//! viewer query:
//!
//! ```graphql
//! { viewer { homes { id features { realTimeConsumptionEnabled } } } }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::application::ports::{DeviceDirectory, DirectoryError};
use crate::domain::credential::Credential;
use crate::domain::telemetry::DeviceId;

const HOMES_QUERY: &str = "{ viewer { homes { id features { realTimeConsumptionEnabled } } } }";

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<ViewerData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ViewerData {
    viewer: Viewer,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    #[serde(default)]
    homes: Vec<HomeWire>,
}

#[derive(Debug, Deserialize)]
struct HomeWire {
    id: String,
    #[serde(default)]
    features: Option<HomeFeatures>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HomeFeatures {
    #[serde(default)]
    real_time_consumption_enabled: Option<bool>,
}

/// A home visible to a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Home {
    /// Home id.
    pub id: DeviceId,
    /// Whether a real-time meter is attached.
    pub real_time_enabled: bool,
}

impl From<HomeWire> for Home {
    fn from(wire: HomeWire) -> Self {
        Self {
            id: DeviceId::new(wire.id),
            real_time_enabled: wire
                .features
                .and_then(|f| f.real_time_consumption_enabled)
                .unwrap_or(false),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// GraphQL client for the provider API.
#[derive(Debug, Clone)]
pub struct TibberApiClient {
    client: Client,
    url: String,
    user_agent: String,
}

impl TibberApiClient {
    /// Default GraphQL endpoint.
    pub const DEFAULT_URL: &'static str = "https://api.tibber.com/v1-beta/gql";

    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        url: impl Into<String>,
        user_agent: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Transport {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            url: url.into(),
            user_agent: user_agent.into(),
        })
    }

    /// Fetch every home visible to `credential`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the token is rejected, or the
    /// response carries GraphQL errors.
    pub async fn homes(&self, credential: &Credential) -> Result<Vec<Home>, DirectoryError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(credential.token())
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .json(&serde_json::json!({ "query": HOMES_QUERY }))
            .send()
            .await
            .map_err(|e| DirectoryError::Transport {
                message: e.to_string(),
            })?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(DirectoryError::Unauthorized {
                message: status.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::Api {
                message: format!("{status}: {body}"),
            });
        }

        let body: GraphQlResponse = response.json().await.map_err(|e| DirectoryError::Decode {
            message: e.to_string(),
        })?;

        if !body.errors.is_empty() {
            let message = body
                .errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DirectoryError::Api { message });
        }

        let data = body.data.ok_or_else(|| DirectoryError::Decode {
            message: "response has neither data nor errors".to_string(),
        })?;
        Ok(data.viewer.homes.into_iter().map(Home::from).collect())
    }
}

#[async_trait]
impl DeviceDirectory for TibberApiClient {
    async fn verify_credential(&self, credential: &Credential) -> Result<(), DirectoryError> {
        self.homes(credential).await.map(|_| ())
    }

    async fn list_devices(&self, credential: &Credential) -> Result<Vec<DeviceId>, DirectoryError> {
        let homes = self.homes(credential).await?;
        let total = homes.len();
        let devices: Vec<_> = homes
            .into_iter()
            .filter(|home| home.real_time_enabled)
            .map(|home| home.id)
            .collect();

        tracing::debug!(
            credential_id = %credential.id(),
            homes = total,
            real_time = devices.len(),
            "Discovered homes"
        );
        Ok(devices)
    }

    async fn verify_access(
        &self,
        credential: &Credential,
        device: &DeviceId,
    ) -> Result<(), DirectoryError> {
        let home = self
            .homes(credential)
            .await?
            .into_iter()
            .find(|home| &home.id == device)
            .ok_or_else(|| DirectoryError::DeviceNotFound(device.clone()))?;

        if home.real_time_enabled {
            Ok(())
        } else {
            Err(DirectoryError::RealTimeDisabled(device.clone()))
        }
    }
}
