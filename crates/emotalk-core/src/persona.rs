//! Persona profiles: the behavior directive that conditions reply generation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// The structured-reply instructions every directive ends with.
macro_rules! reply_format {
    () => {
        r#"Answer ONLY with a JSON object of the following shape, with no text before or after it:
{
  "text": "what you actually say",
  "emotion": "happy|sad|angry|surprised|thinking|neutral|empathetic|anxious",
  "intensity": 0.0-1.0,
  "voice_direction": "a short delivery hint (e.g. softly, tearfully, brightly)"
}

How to choose the emotion:
- neutral: calm, everyday conversation
- happy: bright, positive content
- sad: sad or gloomy content
- angry: annoying or infuriating situations
- surprised: surprising news or something unexpected
- thinking: a question that needs careful thought
- anxious: uneasy or nervous situations
- empathetic: comforting or empathizing with the user

intensity is how strong the emotion is: 0.0 is faint, 1.0 is very strong.
voice_direction is a hint for the tone of voice.

Keep every answer to two or three sentences."#
    };
}
pub(crate) use reply_format;

/// Directive used when no persona profile can be loaded. It forces the
/// structured reply record the session core expects.
pub const DEFAULT_DIRECTIVE: &str = concat!(
    "You are a conversation partner. Empathize with what the user says and talk naturally.\n\n",
    reply_format!()
);

/// Immutable persona profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Natural-language behavior directive for reply generation.
    pub system_prompt: String,
    /// Synthesis voice override for this persona.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
}

impl PersonaProfile {
    /// The built-in persona used when nothing else is available.
    pub fn builtin(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: "Default".into(),
            description: "Built-in conversation partner".into(),
            system_prompt: DEFAULT_DIRECTIVE.to_string(),
            voice_id: None,
        }
    }

    pub fn summary(&self) -> PersonaSummary {
        PersonaSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

/// Listing entry for persona pickers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaSummary {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Source of persona profiles.
#[async_trait]
pub trait PersonaStore: Send + Sync {
    /// Load a persona. `Ok(None)` when it does not exist.
    async fn load(&self, id: &str) -> Result<Option<PersonaProfile>>;

    async fn list(&self) -> Result<Vec<PersonaSummary>>;
}

/// Reads `<dir>/<id>.json` persona files.
pub struct FilePersonaStore {
    dir: PathBuf,
}

impl FilePersonaStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

}

/// `<dir>/<id>.json`, or `None` for ids that could escape `dir`.
pub(crate) fn profile_path(dir: &Path, id: &str) -> Option<PathBuf> {
    let valid = !id.is_empty()
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_');
    valid.then(|| dir.join(format!("{id}.json")))
}

#[async_trait]
impl PersonaStore for FilePersonaStore {
    async fn load(&self, id: &str) -> Result<Option<PersonaProfile>> {
        let Some(path) = profile_path(&self.dir, id) else {
            warn!(persona = id, "Rejected persona id");
            return Ok(None);
        };
        if !path.exists() {
            debug!(path = %path.display(), "Persona file not found");
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut profile: PersonaProfile = serde_json::from_str(&data)?;
        if profile.system_prompt.trim().is_empty() {
            profile.system_prompt = DEFAULT_DIRECTIVE.to_string();
        }
        Ok(Some(profile))
    }

    async fn list(&self) -> Result<Vec<PersonaSummary>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut profiles = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read_to_string(&path)
                .await
                .map_err(crate::error::EmotalkError::from)
                .and_then(|data| {
                    serde_json::from_str::<PersonaProfile>(&data).map_err(Into::into)
                });
            match parsed {
                Ok(profile) => profiles.push(profile.summary()),
                Err(e) => warn!(path = %path.display(), %e, "Skipping unreadable persona"),
            }
        }
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(profiles)
    }
}
