//! Tibber Provider Adapters
//!
//! - `envelope`: `graphql-transport-ws` message types and payload decoding
//! - `session`: the live measurement protocol session ([`TibberLiveFeed`])
//! - `api`: GraphQL client for home discovery ([`TibberApiClient`])

pub mod api;
pub mod envelope;
pub mod session;

pub use api::{Home, TibberApiClient};
pub use envelope::{Envelope, EnvelopeError, SUBPROTOCOL};
pub use session::{LiveSessionConfig, SessionDriver, TibberLiveFeed};
