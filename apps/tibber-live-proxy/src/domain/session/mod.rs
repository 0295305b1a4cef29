//! Session Lifecycle Types
//!
//! A protocol session moves through a fixed sequence of states:
//!
//! ```text
//! Connecting → AwaitingAck → Subscribing → Streaming → Terminating → Closed
//! ```
//!
//! Any failure jumps straight to `Closed`. `Closed` is terminal; a new
//! activation always creates a fresh session.

use thiserror::Error;

/// Current phase of a protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opening the transport.
    Connecting,
    /// `connection_init` sent, waiting for the single reply.
    AwaitingAck,
    /// Sending the subscription.
    Subscribing,
    /// Decoding `next` envelopes.
    Streaming,
    /// Cancellation observed, sending `connection_terminate`.
    Terminating,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Stable lowercase name for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::AwaitingAck => "awaiting_ack",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Terminating => "terminating",
            Self::Closed => "closed",
        }
    }
}

/// Why a session reached `Closed` without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    /// The provider sent `complete`.
    Completed,
    /// The cancellation signal was raised.
    Cancelled,
}

/// Summary of a session that ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEnd {
    /// How the session ended.
    pub reason: SessionEndReason,
    /// Records handed downstream during the session.
    pub records: u64,
}

impl SessionEnd {
    /// Session ended by `complete`.
    #[must_use]
    pub const fn completed(records: u64) -> Self {
        Self {
            reason: SessionEndReason::Completed,
            records,
        }
    }

    /// Session ended by cancellation.
    #[must_use]
    pub const fn cancelled(records: u64) -> Self {
        Self {
            reason: SessionEndReason::Cancelled,
            records,
        }
    }

    /// Whether the session was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.reason, SessionEndReason::Cancelled)
    }
}

/// Errors that close a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The transport could not be opened.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The first reply to `connection_init` was not `connection_ack`.
    #[error("handshake rejected: expected connection_ack, got {0}")]
    HandshakeRejected(String),

    /// No reply to `connection_init` within the ack timeout.
    #[error("timed out waiting for connection_ack")]
    AckTimeout,

    /// Sending an envelope failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading from the transport failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The provider closed the transport.
    #[error("connection closed by provider")]
    ConnectionClosed,
}

impl SessionError {
    /// Stable label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::HandshakeRejected(_) => "handshake_rejected",
            Self::AckTimeout => "ack_timeout",
            Self::Send(_) => "send",
            Self::Receive(_) => "receive",
            Self::ConnectionClosed => "closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_snake_case() {
        assert_eq!(SessionState::AwaitingAck.as_str(), "awaiting_ack");
        assert_eq!(SessionState::Closed.as_str(), "closed");
    }

    #[test]
    fn session_end_constructors() {
        assert!(SessionEnd::cancelled(3).is_cancelled());
        assert!(!SessionEnd::completed(0).is_cancelled());
        assert_eq!(SessionEnd::completed(9).records, 9);
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(SessionError::AckTimeout.kind(), "ack_timeout");
        assert_eq!(
            SessionError::HandshakeRejected("error".into()).to_string(),
            "handshake rejected: expected connection_ack, got error"
        );
    }
}
