//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level emotalk configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognition: Option<RecognitionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub personas: Option<PersonasConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Reply-generation (LLM) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// Provider (default: "anthropic").
    #[serde(default = "default_reply_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Model id (default: "claude-sonnet-4-20250514").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            provider: default_reply_provider(),
            api_key: None,
            api_key_env: Some("ANTHROPIC_API_KEY".into()),
            base_url: None,
            model: None,
            max_tokens: None,
        }
    }
}

fn default_reply_provider() -> String {
    "anthropic".into()
}

impl ReplyConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env).filter(|k| is_usable_credential(k))
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or("claude-sonnet-4-20250514")
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(1024)
    }
}

/// Streaming speech recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Provider (default: "deepgram").
    #[serde(default = "default_recognition_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_recognition_model")]
    pub model: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Silence (ms) after which the engine reports an utterance boundary.
    #[serde(default = "default_utterance_end_ms")]
    pub utterance_end_ms: u32,

    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u32,

    #[serde(default = "default_true")]
    pub interim_results: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            provider: default_recognition_provider(),
            api_key: None,
            api_key_env: Some("DEEPGRAM_API_KEY".into()),
            model: default_recognition_model(),
            language: default_language(),
            sample_rate: default_sample_rate(),
            encoding: default_encoding(),
            utterance_end_ms: default_utterance_end_ms(),
            endpointing_ms: default_endpointing_ms(),
            interim_results: true,
        }
    }
}

fn default_recognition_provider() -> String {
    "deepgram".into()
}

fn default_recognition_model() -> String {
    "nova-2".into()
}

fn default_language() -> String {
    "ko".into()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_encoding() -> String {
    "linear16".into()
}

fn default_utterance_end_ms() -> u32 {
    1500
}

fn default_endpointing_ms() -> u32 {
    300
}

fn default_true() -> bool {
    true
}

impl RecognitionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env).filter(|k| is_usable_credential(k))
    }
}

/// Streaming speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Provider (default: "elevenlabs").
    #[serde(default = "default_synthesis_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,

    /// Model id. Only `eleven_v3*` models understand bracketed delivery tags.
    #[serde(default = "default_synthesis_model")]
    pub model_id: String,

    #[serde(default = "default_output_format")]
    pub output_format: String,

    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f64,

    /// Read size for the HTTP fallback transport.
    #[serde(default = "default_http_chunk_size")]
    pub http_chunk_size: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_synthesis_provider(),
            api_key: None,
            api_key_env: Some("ELEVENLABS_API_KEY".into()),
            voice_id: None,
            model_id: default_synthesis_model(),
            output_format: default_output_format(),
            similarity_boost: default_similarity_boost(),
            http_chunk_size: default_http_chunk_size(),
            base_url: None,
        }
    }
}

fn default_synthesis_provider() -> String {
    "elevenlabs".into()
}

fn default_synthesis_model() -> String {
    "eleven_flash_v2_5".into()
}

fn default_output_format() -> String {
    "pcm_16000".into()
}

fn default_similarity_boost() -> f64 {
    0.75
}

fn default_http_chunk_size() -> usize {
    4096
}

impl SynthesisConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env).filter(|k| is_usable_credential(k))
    }

    pub fn supports_delivery_tags(&self) -> bool {
        self.model_id.starts_with("eleven_v3")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Conversation turns kept for reply generation (default: 20).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_persona: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonasConfig {
    /// Directory of `<id>.json` persona files (default: `~/.emotalk/personas`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Directory of `<id>.json` counseling cases (default: `~/.emotalk/cases`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cases_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory for conversation logs (default: `~/.emotalk/conversations`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Browser origin allowed by CORS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend_url: Option<String>,
}

fn default_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "emotalk_session=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// A credential is usable when it is present, not a `your_...` placeholder,
/// and longer than 10 characters.
pub fn is_usable_credential(key: &str) -> bool {
    let key = key.trim();
    !key.is_empty() && !key.starts_with("your_") && key.len() > 10
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

fn expand_dir(dir: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(dir).as_ref())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::EmotalkError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::EmotalkError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Reply config, falling back to defaults (env-var credential lookup).
    pub fn reply(&self) -> ReplyConfig {
        self.reply.clone().unwrap_or_default()
    }

    pub fn recognition(&self) -> RecognitionConfig {
        self.recognition.clone().unwrap_or_default()
    }

    pub fn synthesis(&self) -> SynthesisConfig {
        self.synthesis.clone().unwrap_or_default()
    }

    pub fn history_limit(&self) -> usize {
        self.session
            .as_ref()
            .and_then(|s| s.history_limit)
            .unwrap_or(20)
    }

    pub fn default_persona(&self) -> String {
        self.session
            .as_ref()
            .and_then(|s| s.default_persona.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn personas_dir(&self) -> PathBuf {
        self.personas
            .as_ref()
            .and_then(|p| p.dir.as_deref())
            .map(expand_dir)
            .unwrap_or_else(|| data_dir().join("personas"))
    }

    pub fn cases_dir(&self) -> PathBuf {
        self.personas
            .as_ref()
            .and_then(|p| p.cases_dir.as_deref())
            .map(expand_dir)
            .unwrap_or_else(|| data_dir().join("cases"))
    }

    /// Conversation log directory, or `None` when persistence is disabled.
    pub fn store_dir(&self) -> Option<PathBuf> {
        match &self.store {
            Some(store) if !store.enabled => None,
            Some(store) => Some(
                store
                    .dir
                    .as_deref()
                    .map(expand_dir)
                    .unwrap_or_else(|| data_dir().join("conversations")),
            ),
            None => Some(data_dir().join("conversations")),
        }
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(8000)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Origins allowed by CORS. Local dev origins are kept when a remote
    /// frontend is configured.
    pub fn allowed_origins(&self) -> Vec<String> {
        let frontend = self
            .gateway
            .as_ref()
            .and_then(|g| g.frontend_url.clone())
            .unwrap_or_else(|| "http://localhost:3000".to_string());
        let mut origins = vec![frontend.clone()];
        if frontend != "http://localhost:3000" {
            origins.push("http://localhost:3000".into());
            origins.push("http://localhost:3001".into());
        }
        origins
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.reply().resolve_api_key().is_none() {
            warnings.push(
                "Reply generation has no usable API key; placeholder replies will be used".into(),
            );
        }
        if self.recognition().resolve_api_key().is_none() {
            warnings.push(
                "Recognition has no usable API key; sessions will run in text-only mode".into(),
            );
        }
        let synthesis = self.synthesis();
        if synthesis.resolve_api_key().is_none() {
            warnings.push("Synthesis has no usable API key; replies will have no audio".into());
        } else if synthesis.voice_id.as_deref().is_none_or(str::is_empty) {
            warnings.push("Synthesis has no voice_id configured; replies will have no audio".into());
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }
        if self.history_limit() == 0 {
            errors.push("session.history_limit must be at least 1".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for emotalk data: `~/.emotalk/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".emotalk")
}
