#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Tibber Live Proxy - Real-Time Power Telemetry Fan-Out
//!
//! Holds one `graphql-transport-ws` subscription per (credential, home) to
//! the provider's live measurement feed and fans every decoded sample out to
//! any number of downstream consumers, persisting it on the way.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `telemetry`: Homes, power samples and live updates
//!   - `credential`: Provider tokens and change notifications
//!   - `session`: Protocol session states, outcomes and errors
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Credential store, device directory, live feed, measurement sink
//!   - `services`: Session supervisor, telemetry pipeline, restart policy
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `tibber`: GraphQL API client and live measurement sessions
//!   - `broadcast`: Deliver-or-evict fan-out to subscribers
//!   - `store`: SQLite credentials, measurements and change watcher
//!   - `http`: Health, metrics and Server-Sent Events
//!   - `config`, `metrics`, `telemetry`: Ambient concerns
//!
//! # Data Flow
//!
//! ```text
//!                      ┌────────────────┐
//! credentials table ──►│   Supervisor   │── activate / deactivate
//!                      └───────┬────────┘
//!                              │ one task per home
//!                              ▼
//! provider WS ───────► Protocol Session ──► Pipeline ──┬──► Broadcaster ──► SSE client 1
//!                                                      │                 ──► SSE client N
//!                                                      └──► SQLite
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::credential::{ChangeAction, Credential, CredentialChange, CredentialId};
pub use domain::session::{SessionEnd, SessionError, SessionState};
pub use domain::telemetry::{DeviceId, LiveUpdate, TelemetryRecord};

// Services
pub use application::services::{
    SessionSupervisor, SupervisorConfig, SupervisorError, TelemetryPipeline,
};

// Infrastructure config
pub use infrastructure::config::{
    BroadcastSettings, ConfigError, ProxyConfig, ServerSettings, SessionSettings, StoreSettings,
    SupervisorSettings, TibberSettings,
};

// HTTP server
pub use infrastructure::http::{HttpServer, HttpServerError, HttpServerState};

// Broadcast hub (for integration tests)
pub use infrastructure::broadcast::{
    BroadcastConfig, BroadcastHub, BroadcastStats, SharedBroadcastHub, SubscriberKey,
    Subscription,
};

// Provider adapters
pub use infrastructure::tibber::{LiveSessionConfig, TibberApiClient, TibberLiveFeed};

// Persistence
pub use infrastructure::store::{CredentialWatcher, SqliteStore};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
