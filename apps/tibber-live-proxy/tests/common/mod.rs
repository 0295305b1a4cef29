//! Loopback provider for integration tests.
//!
//! Accepts one WebSocket connection, echoes the requested subprotocol, and
//! plays a fixed script: an optional reply to `connection_init`, then a list
//! of frames after `subscribe`. Every frame the client sends is forwarded to
//! the test as JSON.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header;

/// What the provider does after `subscribe`.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Reply to `connection_init`; `None` never replies.
    pub ack: Option<Value>,
    /// Frames sent once `subscribe` arrives.
    pub after_subscribe: Vec<Value>,
    /// Send a close frame after the scripted frames.
    pub close_after: bool,
}

impl Script {
    /// Ack the handshake and stream `frames`.
    pub fn streaming(frames: Vec<Value>) -> Self {
        Self {
            ack: Some(json!({"type": "connection_ack"})),
            after_subscribe: frames,
            close_after: false,
        }
    }
}

/// Headers the client sent on the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub authorization: Option<String>,
    pub user_agent: Option<String>,
    pub protocol: Option<String>,
}

/// Handle to a running loopback provider.
pub struct Provider {
    pub url: String,
    pub frames: mpsc::UnboundedReceiver<Value>,
    pub handshake: oneshot::Receiver<Handshake>,
}

impl Provider {
    /// Next client frame, failing the test after two seconds.
    pub async fn next_frame(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("provider connection ended")
    }

    /// Every remaining client frame until the connection ends.
    pub async fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_secs(2), self.frames.recv()).await
        {
            frames.push(frame);
        }
        frames
    }
}

/// A `next` envelope carrying one measurement.
pub fn next_measurement(timestamp: &str, power: f64) -> Value {
    json!({
        "type": "next",
        "id": "1",
        "payload": {
            "data": {
                "liveMeasurement": {
                    "timestamp": timestamp,
                    "power": power,
                    "powerProduction": 0.0,
                    "accumulatedConsumption": 3.5,
                    "accumulatedProduction": 0.0
                }
            }
        }
    })
}

fn header_value(req: &Request, name: header::HeaderName) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

type HandshakeReply = Result<Response, ErrorResponse>;

/// Start a provider that serves one connection with `script`.
pub async fn start_provider(script: Script) -> Provider {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frame_tx, frames) = mpsc::unbounded_channel();
    let (handshake_tx, handshake) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();

        let callback = move |req: &Request, mut response: Response| -> HandshakeReply {
            let seen = Handshake {
                authorization: header_value(req, header::AUTHORIZATION),
                user_agent: header_value(req, header::USER_AGENT),
                protocol: header_value(req, header::SEC_WEBSOCKET_PROTOCOL),
            };
            if let Some(protocol) = req.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol.clone());
            }
            let _ = handshake_tx.send(seen);
            Ok(response)
        };

        let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
            return;
        };

        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let frame: Value = serde_json::from_str(&text).unwrap();
            let kind = frame["type"].as_str().unwrap_or_default().to_string();
            let _ = frame_tx.send(frame);

            match kind.as_str() {
                "connection_init" => {
                    if let Some(ack) = &script.ack {
                        ws.send(Message::Text(ack.to_string().into())).await.unwrap();
                    }
                }
                "subscribe" => {
                    for frame in &script.after_subscribe {
                        ws.send(Message::Text(frame.to_string().into())).await.unwrap();
                    }
                    if script.close_after {
                        let _ = ws.close(None).await;
                    }
                }
                _ => {}
            }
        }
    });

    Provider {
        url: format!("ws://{addr}"),
        frames,
        handshake,
    }
}
