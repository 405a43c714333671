use serde::{Deserialize, Serialize};

/// Discrete emotion attached to every generated reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    #[default]
    Neutral,
    Happy,
    Sad,
    Angry,
    Surprised,
    Thinking,
    Anxious,
    Empathetic,
}

impl Emotion {
    pub const ALL: [Emotion; 8] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Surprised,
        Emotion::Thinking,
        Emotion::Anxious,
        Emotion::Empathetic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Surprised => "surprised",
            Emotion::Thinking => "thinking",
            Emotion::Anxious => "anxious",
            Emotion::Empathetic => "empathetic",
        }
    }

    /// Resolve a free-form label. Anything unrecognized is `Neutral`.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(label))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One entry of the bounded conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Structured output of one reply-generation call.
///
/// Construct through [`ReplyEnvelope::new`] so intensity stays in `[0, 1]`.
/// Deserialization goes through `new` as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEnvelope")]
pub struct ReplyEnvelope {
    pub text: String,
    pub emotion: Emotion,
    pub intensity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_hint: Option<String>,
}

impl ReplyEnvelope {
    pub fn new(
        text: impl Into<String>,
        emotion: Emotion,
        intensity: f64,
        delivery_hint: Option<String>,
    ) -> Self {
        Self {
            text: text.into(),
            emotion,
            intensity: clamp_unit(intensity),
            delivery_hint: delivery_hint
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty()),
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    text: String,
    emotion: Emotion,
    intensity: f64,
    #[serde(default)]
    delivery_hint: Option<String>,
}

impl From<RawEnvelope> for ReplyEnvelope {
    fn from(raw: RawEnvelope) -> Self {
        Self::new(raw.text, raw.emotion, raw.intensity, raw.delivery_hint)
    }
}

/// Clamp into `[0, 1]`; NaN becomes the midpoint.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.5;
    }
    value.clamp(0.0, 1.0)
}

/// Continuous voice-synthesis controls derived from an emotion and intensity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParameters {
    /// One of exactly `0.0`, `0.5`, `1.0`.
    pub stability: f64,
    /// Style expressiveness in `[0, 1]`.
    pub style: f64,
    /// Speech-rate multiplier in `[0.7, 1.2]`.
    pub speed: f64,
    /// Bracketed delivery tags (e.g. `"[calm] [softly]"`), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_tag: Option<String>,
}

impl Default for VoiceParameters {
    fn default() -> Self {
        Self {
            stability: 0.5,
            style: 0.0,
            speed: 1.0,
            delivery_tag: None,
        }
    }
}

/// Event produced by a recognition capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Partial(String),
    Final(String),
    UtteranceBoundary,
}
