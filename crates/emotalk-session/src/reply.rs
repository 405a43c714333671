//! Reply-generation adapter: bounded history plus structured reply decoding.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, warn};

use emotalk_core::types::{Emotion, ReplyEnvelope, Turn};
use emotalk_providers::ReplyGenerator;

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

const APOLOGY_TEXT: &str =
    "Sorry, something went wrong on my side for a moment. Could you say that again?";

/// Outcome of decoding raw generator output.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyDecode {
    Parsed(ReplyEnvelope),
    /// Output that did not match the reply record; carries the raw text.
    Malformed(String),
}

impl ReplyDecode {
    /// Collapse into an envelope. Malformed output becomes a neutral reply
    /// made of the raw text.
    pub fn into_envelope(self) -> ReplyEnvelope {
        match self {
            ReplyDecode::Parsed(envelope) => envelope,
            ReplyDecode::Malformed(raw) => ReplyEnvelope::new(raw, Emotion::Neutral, 0.5, None),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReplyRecord {
    text: String,
    #[serde(default)]
    emotion: Option<String>,
    #[serde(default)]
    intensity: Option<f64>,
    #[serde(default, alias = "voice_direction")]
    delivery_hint: Option<String>,
}

/// Remove a surrounding Markdown code fence (the opening line and the closing
/// line are dropped).
pub(crate) fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let Some(first_newline) = trimmed.find('\n') else {
        return trimmed;
    };
    let body = &trimmed[first_newline + 1..];
    match body.rfind('\n') {
        Some(last_newline) if body[last_newline + 1..].trim_start().starts_with("```") => {
            body[..last_newline].trim()
        }
        None if body.trim_start().starts_with("```") => "",
        _ => body.trim(),
    }
}

/// Decode raw generator output into a reply envelope.
pub fn decode_reply(raw: &str) -> ReplyDecode {
    let body = strip_code_fence(raw);
    match serde_json::from_str::<ReplyRecord>(body) {
        Ok(record) => {
            let emotion = record
                .emotion
                .as_deref()
                .map(Emotion::from_label)
                .unwrap_or_default();
            ReplyDecode::Parsed(ReplyEnvelope::new(
                record.text,
                emotion,
                record.intensity.unwrap_or(0.5),
                record.delivery_hint,
            ))
        }
        Err(e) => {
            warn!(%e, "Reply is not a reply record, using it as plain text");
            ReplyDecode::Malformed(raw.trim().to_string())
        }
    }
}

/// Envelope returned when the generator itself fails.
pub fn apology_envelope() -> ReplyEnvelope {
    ReplyEnvelope::new(APOLOGY_TEXT, Emotion::Neutral, 0.3, Some("calmly".into()))
}

/// Envelope returned when no generator is configured.
pub fn placeholder_envelope(user_text: &str) -> ReplyEnvelope {
    ReplyEnvelope::new(
        format!(
            "(Placeholder) You said \"{user_text}\". Configure a reply-generation API key to get real answers."
        ),
        Emotion::Happy,
        0.6,
        Some("brightly".into()),
    )
}

/// Wraps a reply generator with the session's behavior directive and a
/// bounded conversation history.
pub struct ReplyAdapter {
    generator: Option<Arc<dyn ReplyGenerator>>,
    directive: String,
    history: VecDeque<Turn>,
    limit: usize,
}

impl ReplyAdapter {
    pub fn new(generator: Option<Arc<dyn ReplyGenerator>>, directive: String, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            generator,
            directive,
            history: VecDeque::with_capacity(limit + 1),
            limit,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.generator.is_none()
    }

    pub fn set_directive(&mut self, directive: String) {
        self.directive = directive;
    }

    pub fn history(&self) -> Vec<Turn> {
        self.history.iter().cloned().collect()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        debug!("Conversation history cleared");
    }

    fn remember(&mut self, turn: Turn) {
        self.history.push_back(turn);
        while self.history.len() > self.limit {
            self.history.pop_front();
        }
    }

    /// Produce a reply for `user_text`. Never fails: generator errors yield
    /// the apology envelope and malformed output degrades to plain text.
    pub async fn generate(&mut self, user_text: &str) -> ReplyEnvelope {
        let Some(generator) = self.generator.clone() else {
            debug!("No reply generator configured, returning placeholder");
            return placeholder_envelope(user_text);
        };

        self.remember(Turn::user(user_text));
        let history: Vec<Turn> = self.history.iter().cloned().collect();

        match generator.complete(&self.directive, &history).await {
            Ok(raw) => {
                let envelope = decode_reply(&raw).into_envelope();
                self.remember(Turn::assistant(envelope.text.clone()));
                envelope
            }
            Err(e) => {
                error!(provider = generator.id(), %e, "Reply generation failed");
                apology_envelope()
            }
        }
    }
}
