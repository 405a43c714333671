//! Process-wide service registry.
//!
//! Built once from [`Config`] at startup and shared behind an `Arc`. Every
//! capability is optional: a missing credential leaves its slot empty and the
//! session degrades that stage instead of failing.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use emotalk_core::case::{CASE_PREFIX, CaseProfile, FileCaseStore};
use emotalk_core::config::Config;
use emotalk_core::conversation_store::{ConversationStore, JsonlConversationStore};
use emotalk_core::persona::{FilePersonaStore, PersonaProfile, PersonaStore};
use emotalk_media::recognition::{DeepgramRecognizer, SpeechRecognizer};
use emotalk_media::synthesis::{
    ElevenLabsHttpSynthesizer, ElevenLabsSettings, ElevenLabsWsSynthesizer, SynthesisRoute,
};
use emotalk_providers::ReplyGenerator;

use crate::reply::DEFAULT_HISTORY_LIMIT;

/// Which capabilities are wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub recognition: bool,
    pub reply: bool,
    pub synthesis: bool,
    pub store: bool,
}

pub struct Services {
    pub personas: Arc<dyn PersonaStore>,
    pub cases: Option<Arc<FileCaseStore>>,
    pub reply: Option<Arc<dyn ReplyGenerator>>,
    pub recognizer: Option<Arc<dyn SpeechRecognizer>>,
    pub synthesis: Option<SynthesisRoute>,
    pub store: Option<Arc<dyn ConversationStore>>,
    pub history_limit: usize,
    pub default_persona: String,
}

impl Services {
    /// A registry with only a persona source. Every capability is absent.
    pub fn new(personas: Arc<dyn PersonaStore>) -> Self {
        Self {
            personas,
            cases: None,
            reply: None,
            recognizer: None,
            synthesis: None,
            store: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            default_persona: "default".into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut services = Self::new(Arc::new(FilePersonaStore::new(config.personas_dir())));
        services.cases = Some(Arc::new(FileCaseStore::new(config.cases_dir())));
        services.history_limit = config.history_limit().max(1);
        services.default_persona = config.default_persona();
        services.reply = reply_generator(config);
        services.recognizer = recognizer(config);
        services.synthesis = synthesis_route(config);
        services.store = config.store_dir().map(|dir| {
            Arc::new(JsonlConversationStore::new(dir)) as Arc<dyn ConversationStore>
        });

        let availability = services.availability();
        info!(
            recognition = availability.recognition,
            reply = availability.reply,
            synthesis = availability.synthesis,
            store = availability.store,
            "Services initialized"
        );
        services
    }

    pub fn availability(&self) -> Availability {
        Availability {
            recognition: self.recognizer.is_some(),
            reply: self.reply.is_some(),
            synthesis: self.synthesis.is_some(),
            store: self.store.is_some(),
        }
    }

    /// Load a persona, falling back to the built-in default. Never fails.
    pub async fn resolve_persona(&self, id: Option<&str>) -> PersonaProfile {
        let id = id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(self.default_persona.as_str());
        if let Some(case_id) = id.strip_prefix(CASE_PREFIX) {
            if let Some(case) = self.load_case(case_id).await {
                info!(case = %case.id, name = %case.name, "Case loaded");
                return case.to_persona();
            }
            info!(case = case_id, "Case not found, using built-in default");
            return PersonaProfile::builtin(id);
        }
        match self.personas.load(id).await {
            Ok(Some(profile)) => {
                info!(persona = %profile.id, name = %profile.name, "Persona loaded");
                profile
            }
            Ok(None) => {
                info!(persona = id, "Persona not found, using built-in default");
                PersonaProfile::builtin(id)
            }
            Err(e) => {
                warn!(persona = id, %e, "Persona load failed, using built-in default");
                PersonaProfile::builtin(id)
            }
        }
    }

    /// Load a counseling case. `None` when cases are not configured, the
    /// case is missing, or its file is invalid.
    pub async fn load_case(&self, id: &str) -> Option<CaseProfile> {
        let cases = self.cases.as_ref()?;
        match cases.load(id).await {
            Ok(case) => case,
            Err(e) => {
                warn!(case = id, %e, "Case load failed");
                None
            }
        }
    }
}

fn reply_generator(config: &Config) -> Option<Arc<dyn ReplyGenerator>> {
    let reply = config.reply();
    let Some(api_key) = reply.resolve_api_key() else {
        warn!("No usable reply-generation key, replies will be placeholders");
        return None;
    };
    match reply.provider.as_str() {
        "anthropic" => Some(Arc::new(emotalk_providers::anthropic::AnthropicGenerator::new(
            api_key,
            reply.base_url.as_deref(),
            reply.model(),
            reply.max_tokens(),
        ))),
        other => {
            warn!(provider = other, "Unknown reply provider");
            None
        }
    }
}

fn recognizer(config: &Config) -> Option<Arc<dyn SpeechRecognizer>> {
    let recognition = config.recognition();
    let Some(api_key) = recognition.resolve_api_key() else {
        warn!("No usable recognition key, sessions will be text-only");
        return None;
    };
    match recognition.provider.as_str() {
        "deepgram" => Some(Arc::new(DeepgramRecognizer::new(api_key, recognition))),
        other => {
            warn!(provider = other, "Unknown recognition provider");
            None
        }
    }
}

fn synthesis_route(config: &Config) -> Option<SynthesisRoute> {
    let synthesis = config.synthesis();
    let Some(api_key) = synthesis.resolve_api_key() else {
        warn!("No usable synthesis key, replies will have no audio");
        return None;
    };
    if synthesis.voice_id.as_deref().is_none_or(str::is_empty) {
        warn!("No synthesis voice_id configured, replies will have no audio");
        return None;
    }
    match synthesis.provider.as_str() {
        "elevenlabs" => {
            let settings = ElevenLabsSettings::from_config(&synthesis, api_key);
            Some(
                SynthesisRoute::new(Arc::new(ElevenLabsWsSynthesizer::new(settings.clone())))
                    .with_secondary(Arc::new(ElevenLabsHttpSynthesizer::new(settings))),
            )
        }
        other => {
            warn!(provider = other, "Unknown synthesis provider");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emotalk_core::config::{ReplyConfig, StoreConfig, SynthesisConfig};

    #[test]
    fn test_from_config_without_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            reply: Some(ReplyConfig {
                api_key_env: Some("EMOTALK_TEST_NO_SUCH_KEY".into()),
                ..Default::default()
            }),
            recognition: Some(emotalk_core::config::RecognitionConfig {
                api_key_env: Some("EMOTALK_TEST_NO_SUCH_KEY".into()),
                ..Default::default()
            }),
            synthesis: Some(SynthesisConfig {
                api_key: Some("xi-0123456789abcdef".into()),
                voice_id: None,
                ..Default::default()
            }),
            store: Some(StoreConfig {
                enabled: true,
                dir: Some(dir.path().display().to_string()),
            }),
            ..Default::default()
        };
        let services = Services::from_config(&config);
        assert_eq!(
            services.availability(),
            Availability {
                recognition: false,
                reply: false,
                synthesis: false,
                store: true,
            }
        );
        assert_eq!(services.history_limit, 20);
    }

    #[test]
    fn test_from_config_with_credentials() {
        let config = Config {
            reply: Some(ReplyConfig {
                api_key: Some("sk-ant-0123456789abcdef".into()),
                ..Default::default()
            }),
            synthesis: Some(SynthesisConfig {
                api_key: Some("xi-0123456789abcdef".into()),
                voice_id: Some("voice-1".into()),
                ..Default::default()
            }),
            store: Some(StoreConfig {
                enabled: false,
                dir: None,
            }),
            ..Default::default()
        };
        let services = Services::from_config(&config);
        let availability = services.availability();
        assert!(availability.reply);
        assert!(availability.synthesis);
        assert!(!availability.store);
        let route = services.synthesis.unwrap();
        assert_eq!(route.primary.id(), "elevenlabs-ws");
        assert_eq!(route.secondary.unwrap().id(), "elevenlabs-http");
    }

    #[tokio::test]
    async fn test_resolve_persona_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("coach.json"),
            r#"{"id":"coach","name":"Coach","system_prompt":"Be a coach.","voice_id":"v-coach"}"#,
        )
        .unwrap();
        let services = Services::new(Arc::new(FilePersonaStore::new(dir.path().to_path_buf())));

        let coach = services.resolve_persona(Some("coach")).await;
        assert_eq!(coach.system_prompt, "Be a coach.");
        assert_eq!(coach.voice_id.as_deref(), Some("v-coach"));

        let missing = services.resolve_persona(Some("nobody")).await;
        assert_eq!(missing.system_prompt, emotalk_core::persona::DEFAULT_DIRECTIVE);

        let default = services.resolve_persona(None).await;
        assert_eq!(default.id, "default");
    }

    #[tokio::test]
    async fn test_resolve_case_persona() {
        let personas = tempfile::tempdir().unwrap();
        let cases = tempfile::tempdir().unwrap();
        std::fs::write(
            cases.path().join("grief.json"),
            r#"{"id":"grief","name":"Jiho","age":42,"presenting_issue":"Lost a parent","voice_id":"v-jiho"}"#,
        )
        .unwrap();
        let mut services =
            Services::new(Arc::new(FilePersonaStore::new(personas.path().to_path_buf())));
        services.cases = Some(Arc::new(FileCaseStore::new(cases.path().to_path_buf())));

        let persona = services.resolve_persona(Some("case:grief")).await;
        assert_eq!(persona.id, "case:grief");
        assert_eq!(persona.name, "Jiho");
        assert_eq!(persona.voice_id.as_deref(), Some("v-jiho"));
        assert!(persona.system_prompt.contains("- Age: 42"));

        let missing = services.resolve_persona(Some("case:nobody")).await;
        assert_eq!(missing.system_prompt, emotalk_core::persona::DEFAULT_DIRECTIVE);
        assert_eq!(services.load_case("grief").await.unwrap().age, Some(42));
    }
}
