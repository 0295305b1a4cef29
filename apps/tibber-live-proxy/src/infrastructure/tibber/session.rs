//! Live Measurement Session
//!
//! Runs one `graphql-transport-ws` session against the provider's
//! subscription endpoint for one (credential, home) pair.
//!
//! # Protocol
//!
//! 1. Connect with `Authorization: Bearer <token>` and subprotocol `graphql-transport-ws`
//! 2. Send `{"type":"connection_init","payload":{}}`
//! 3. Read exactly one envelope; anything but `connection_ack` aborts
//! 4. Send `{"type":"subscribe","id":"1","payload":{"query":...}}` with the
//!    `liveMeasurement` subscription for the home
//! 5. Stream `next` envelopes until `complete`, a transport failure, or cancellation
//!
//! On cancellation the session sends `connection_terminate` and closes the
//! socket, both best-effort. The session never reconnects by itself.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use super::envelope::{self, Envelope, SUBPROTOCOL};
use crate::SessionSettings;
use crate::application::ports::{LiveFeed, RecordHandler};
use crate::domain::credential::Credential;
use crate::domain::session::{SessionEnd, SessionError, SessionState};
use crate::domain::telemetry::DeviceId;
use crate::infrastructure::metrics::{self, DiscardReason};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for live measurement sessions.
#[derive(Debug, Clone)]
pub struct LiveSessionConfig {
    /// Subscription endpoint.
    pub url: String,
    /// `User-Agent` header value.
    pub user_agent: String,
    /// Limit for opening the transport.
    pub connect_timeout: Duration,
    /// Limit for the reply to `connection_init`.
    pub ack_timeout: Duration,
}

impl LiveSessionConfig {
    /// Default subscription endpoint.
    pub const DEFAULT_URL: &'static str =
        "wss://websocket-api.tibber.com/v1-beta/gql/subscriptions";

    /// Create a configuration with default timeouts.
    #[must_use]
    pub fn new(url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: user_agent.into(),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
        }
    }

    /// Build from session settings.
    #[must_use]
    pub fn from_settings(url: &str, user_agent: &str, settings: &SessionSettings) -> Self {
        Self {
            url: url.to_string(),
            user_agent: user_agent.to_string(),
            connect_timeout: settings.connect_timeout,
            ack_timeout: settings.ack_timeout,
        }
    }
}

// =============================================================================
// Live Feed Adapter
// =============================================================================

/// [`LiveFeed`] backed by the provider's WebSocket API.
#[derive(Debug, Clone)]
pub struct TibberLiveFeed {
    config: LiveSessionConfig,
}

impl TibberLiveFeed {
    /// Create a feed.
    #[must_use]
    pub const fn new(config: LiveSessionConfig) -> Self {
        Self { config }
    }

    fn build_request(
        &self,
        credential: &Credential,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SessionError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Connect(e.to_string()))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token()))
            .map_err(|_| SessionError::Connect("token is not a valid header value".into()))?;
        let user_agent = HeaderValue::from_str(&self.config.user_agent)
            .map_err(|_| SessionError::Connect("user agent is not a valid header value".into()))?;

        let headers = request.headers_mut();
        headers.insert(header::AUTHORIZATION, bearer);
        headers.insert(header::USER_AGENT, user_agent);
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(SUBPROTOCOL),
        );
        Ok(request)
    }
}

#[async_trait]
impl LiveFeed for TibberLiveFeed {
    async fn run_session(
        &self,
        credential: &Credential,
        device: &DeviceId,
        handler: Arc<dyn RecordHandler>,
        cancel: CancellationToken,
    ) -> Result<SessionEnd, SessionError> {
        tracing::info!(
            credential_id = %credential.id(),
            home_id = %device,
            url = %self.config.url,
            "Connecting live measurement session"
        );

        let request = self.build_request(credential)?;
        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(request),
        );

        let ws_stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(SessionEnd::cancelled(0)),
            result = connect => match result {
                Ok(Ok((ws_stream, _response))) => ws_stream,
                Ok(Err(e)) => return Err(SessionError::Connect(e.to_string())),
                Err(_) => return Err(SessionError::Connect("connect timed out".into())),
            },
        };

        let (write, read) = ws_stream.split();
        SessionDriver::new(write, read, device, self.config.ack_timeout)
            .run(handler.as_ref(), &cancel)
            .await
    }
}

// =============================================================================
// Session Driver
// =============================================================================

enum Frame {
    Envelope(Envelope),
    Malformed(String),
}

/// Protocol state machine over an already-open transport.
///
/// Generic over the socket halves so it can run against any message sink
/// and stream.
pub struct SessionDriver<'a, W, R> {
    write: W,
    read: R,
    device: &'a DeviceId,
    ack_timeout: Duration,
    state: SessionState,
    records: u64,
}

impl<'a, W, R> SessionDriver<'a, W, R>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    /// Wrap an open transport.
    pub const fn new(write: W, read: R, device: &'a DeviceId, ack_timeout: Duration) -> Self {
        Self {
            write,
            read,
            device,
            ack_timeout,
            state: SessionState::Connecting,
            records: 0,
        }
    }

    /// Run the handshake and stream until the session closes.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] on transport failure or handshake rejection.
    pub async fn run(
        mut self,
        handler: &dyn RecordHandler,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, SessionError> {
        let result = self.run_inner(handler, cancel).await;
        self.transition(SessionState::Closed);
        result
    }

    async fn run_inner(
        &mut self,
        handler: &dyn RecordHandler,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, SessionError> {
        if cancel.is_cancelled() {
            return Ok(self.terminate().await);
        }

        self.transition(SessionState::AwaitingAck);
        self.send(&Envelope::connection_init()).await?;

        let reply = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(self.terminate().await),
            reply = tokio::time::timeout(self.ack_timeout, self.next_frame()) => reply,
        };

        match reply {
            Err(_) => return Err(SessionError::AckTimeout),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(Frame::Envelope(Envelope::ConnectionAck { .. }))) => {}
            Ok(Ok(Frame::Envelope(other))) => {
                return Err(SessionError::HandshakeRejected(other.kind().to_string()));
            }
            Ok(Ok(Frame::Malformed(_))) => {
                return Err(SessionError::HandshakeRejected("malformed envelope".into()));
            }
        }

        self.transition(SessionState::Subscribing);
        self.send(&Envelope::subscribe_live_measurement(self.device))
            .await?;

        self.transition(SessionState::Streaming);
        tracing::info!(home_id = %self.device, "Live measurement subscription started");

        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(self.terminate().await),
                frame = self.next_frame() => frame?,
            };

            match frame {
                Frame::Envelope(Envelope::Next { payload, .. }) => {
                    self.on_next(&payload, handler).await;
                }
                Frame::Envelope(Envelope::Error { payload, .. }) => {
                    tracing::warn!(
                        home_id = %self.device,
                        errors = %envelope::describe_errors(&payload),
                        "Subscription error from provider"
                    );
                }
                Frame::Envelope(Envelope::Complete { .. }) => {
                    tracing::info!(
                        home_id = %self.device,
                        records = self.records,
                        "Provider completed subscription"
                    );
                    let _ = self.write.close().await;
                    return Ok(SessionEnd::completed(self.records));
                }
                Frame::Envelope(Envelope::Ping { payload }) => {
                    self.send(&Envelope::Pong { payload }).await?;
                }
                Frame::Envelope(other) => {
                    tracing::debug!(
                        home_id = %self.device,
                        kind = other.kind(),
                        "Ignoring envelope"
                    );
                }
                Frame::Malformed(reason) => {
                    tracing::debug!(
                        home_id = %self.device,
                        error = %reason,
                        "Dropping malformed envelope"
                    );
                    metrics::record_discarded(DiscardReason::Malformed);
                }
            }
        }
    }

    async fn on_next(&mut self, payload: &serde_json::Value, handler: &dyn RecordHandler) {
        match envelope::decode_live_measurement(payload) {
            Ok(Some(record)) => {
                self.records += 1;
                metrics::record_received();
                handler.handle(self.device, record).await;
            }
            Ok(None) => {
                tracing::trace!(home_id = %self.device, "Dropping record without timestamp");
                metrics::record_discarded(DiscardReason::UnsetTimestamp);
            }
            Err(e) => {
                tracing::debug!(home_id = %self.device, error = %e, "Dropping undecodable record");
                metrics::record_discarded(DiscardReason::Malformed);
            }
        }
    }

    /// Read until the next text envelope, answering transport pings on the way.
    async fn next_frame(&mut self) -> Result<Frame, SessionError> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(match Envelope::decode(&text) {
                        Ok(envelope) => Frame::Envelope(envelope),
                        Err(e) => Frame::Malformed(e.to_string()),
                    });
                }
                Some(Ok(Message::Ping(data))) => {
                    self.write
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| SessionError::Send(e.to_string()))?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(home_id = %self.device, ?frame, "Provider sent close frame");
                    return Err(SessionError::ConnectionClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SessionError::Receive(e.to_string())),
                None => return Err(SessionError::ConnectionClosed),
            }
        }
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), SessionError> {
        let json = envelope
            .encode()
            .map_err(|e| SessionError::Send(e.to_string()))?;
        self.write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| SessionError::Send(e.to_string()))
    }

    async fn terminate(&mut self) -> SessionEnd {
        self.transition(SessionState::Terminating);
        if let Err(e) = self.send(&Envelope::ConnectionTerminate).await {
            tracing::debug!(
                home_id = %self.device,
                error = %e,
                "connection_terminate not delivered"
            );
        }
        let _ = self.write.close().await;
        tracing::info!(
            home_id = %self.device,
            records = self.records,
            "Live measurement session cancelled"
        );
        SessionEnd::cancelled(self.records)
    }

    fn transition(&mut self, next: SessionState) {
        tracing::trace!(
            home_id = %self.device,
            from = self.state.as_str(),
            to = next.as_str(),
            "Session state change"
        );
        self.state = next;
    }
}

// =============================================================================
// Tests
// =============================================================================
