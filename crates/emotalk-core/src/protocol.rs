//! Conversation wire protocol.
//!
//! Every frame is a JSON object tagged by `type`. Audio travels base64-encoded
//! in both directions.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::types::Emotion;

/// Lifecycle notices sent in `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
    Thinking,
    SttUnavailable,
    ProfileChanged,
}

/// Server -> client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Status {
        text: SessionStatus,
    },
    Transcript {
        text: String,
        is_final: bool,
    },
    /// Expression switch for the visual front end.
    Emotion {
        emotion: Emotion,
        intensity: f64,
    },
    Response {
        text: String,
        emotion: Emotion,
    },
    Audio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_data: Option<String>,
        is_final: bool,
    },
    Error {
        text: String,
    },
}

impl ServerEvent {
    pub fn status(status: SessionStatus) -> Self {
        Self::Status { text: status }
    }

    pub fn audio_chunk(data: &[u8]) -> Self {
        Self::Audio {
            audio_data: Some(base64::engine::general_purpose::STANDARD.encode(data)),
            is_final: false,
        }
    }

    pub fn audio_end() -> Self {
        Self::Audio {
            audio_data: None,
            is_final: true,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }

    pub fn is_audio_end(&self) -> bool {
        matches!(self, Self::Audio { is_final: true, .. })
    }
}

/// Client -> server command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Audio {
        #[serde(default)]
        data: String,
    },
    Text {
        #[serde(default)]
        text: String,
    },
    Config {
        #[serde(default)]
        profile_id: Option<String>,
    },
    Stop,
}

/// Decode the base64 payload of an inbound audio command.
pub fn decode_audio(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(data.trim())
}
