//! Session event framing.
//!
//! Every frame is a JSON text message tagged by `event`. Inbound frames are
//! parsed into [`InboundEvent`]; anything the server says goes out as an
//! [`OutboundEvent`] through the connection's [`Outbox`].

use base64::Engine;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Current time as an RFC 3339 UTC string with millisecond precision.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Client-to-server events.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
pub enum InboundEvent {
    #[serde(rename = "start")]
    Start {
        start: StartBody,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    #[serde(rename = "media")]
    Media { media: MediaBody },
    #[serde(rename = "stop")]
    Stop {
        #[serde(default)]
        stop: Option<Value>,
    },
    /// Any other `event` tag. Logged and ignored.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct StartBody {
    /// Base64 of a JSON object carrying `agentId` and `clientId`.
    #[serde(rename = "extraData", default)]
    pub extra_data: Option<String>,
    /// Some transports put the stream id inside `start`.
    #[serde(rename = "streamSid", default)]
    pub stream_sid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MediaBody {
    /// Base64 of raw audio bytes.
    pub payload: String,
}

/// Decoded contents of `start.extraData`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub agent_id: String,
    pub client_id: String,
}

impl StartPayload {
    /// Decodes the base64 JSON carried in `extraData`.
    pub fn decode(extra_data: &str) -> Result<Self, String> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(extra_data.trim())
            .map_err(|e| format!("extraData is not base64: {e}"))?;
        let payload: Self = serde_json::from_slice(&raw)
            .map_err(|e| format!("extraData is not a valid start payload: {e}"))?;
        if payload.agent_id.trim().is_empty() {
            return Err("agentId must not be empty".to_string());
        }
        Ok(payload)
    }

    /// Encodes a payload the way clients send it.
    pub fn encode(agent_id: &str, client_id: &str) -> String {
        let json = serde_json::json!({ "agentId": agent_id, "clientId": client_id });
        base64::engine::general_purpose::STANDARD.encode(json.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaPayload {
    pub payload: String,
}

/// Server-to-client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum OutboundEvent {
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
        timestamp: String,
    },
    #[serde(rename = "start")]
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        timestamp: String,
    },
    #[serde(rename = "transcript")]
    Transcript {
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
        timestamp: String,
    },
    #[serde(rename = "conversation")]
    Conversation {
        #[serde(rename = "userMessage", skip_serializing_if = "Option::is_none")]
        user_message: Option<String>,
        #[serde(rename = "aiResponse", skip_serializing_if = "Option::is_none")]
        ai_response: Option<String>,
        timestamp: String,
    },
    #[serde(rename = "media")]
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
        timestamp: String,
    },
    #[serde(rename = "error")]
    Error { message: String, timestamp: String },
    #[serde(rename = "log")]
    Log {
        level: String,
        message: String,
        meta: Value,
        timestamp: String,
    },
    #[serde(rename = "stop")]
    Stop { timestamp: String },
}

impl OutboundEvent {
    pub fn user_message(text: impl Into<String>) -> Self {
        Self::Conversation {
            user_message: Some(text.into()),
            ai_response: None,
            timestamp: timestamp(),
        }
    }

    pub fn ai_response(text: impl Into<String>) -> Self {
        Self::Conversation {
            user_message: None,
            ai_response: Some(text.into()),
            timestamp: timestamp(),
        }
    }

    pub fn media(stream_sid: impl Into<String>, audio: &[u8]) -> Self {
        Self::Media {
            stream_sid: stream_sid.into(),
            media: MediaPayload {
                payload: base64::engine::general_purpose::STANDARD.encode(audio),
            },
            timestamp: timestamp(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: timestamp(),
        }
    }

    pub fn stop() -> Self {
        Self::Stop {
            timestamp: timestamp(),
        }
    }

    /// The `event` tag, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Start { .. } => "start",
            Self::Transcript { .. } => "transcript",
            Self::Conversation { .. } => "conversation",
            Self::Media { .. } => "media",
            Self::Error { .. } => "error",
            Self::Log { .. } => "log",
            Self::Stop { .. } => "stop",
        }
    }
}

/// Sending half of a connection's outbound queue.
///
/// The queue is bounded; when a slow client lets it fill up, further events
/// are dropped with a warning rather than blocking the session.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<String>,
    diagnostics: bool,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<String>, diagnostics: bool) -> Self {
        Self { tx, diagnostics }
    }

    /// Queues `event`. Returns `false` if it was dropped.
    pub fn emit(&self, event: &OutboundEvent) -> bool {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(event = event.name(), "failed to serialize outbound event: {}", e);
                return false;
            }
        };
        match self.tx.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(event = event.name(), "outbound queue full; event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(event = event.name(), "connection gone; event dropped");
                false
            }
        }
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.emit(&OutboundEvent::error(message))
    }

    /// Mirrors a diagnostic to the client when client diagnostics are on.
    pub fn diagnostic(&self, level: &str, message: impl Into<String>, meta: Value) {
        if !self.diagnostics {
            return;
        }
        self.emit(&OutboundEvent::Log {
            level: level.to_string(),
            message: message.into(),
            meta,
            timestamp: timestamp(),
        });
    }
}
