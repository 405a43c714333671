//! Streaming speech synthesis.
//!
//! Audio is streamed as raw PCM chunks in the order the engine produces them.
//! ElevenLabs is reachable over two transports: the `stream-input` WebSocket
//! (primary, lowest first-chunk latency) and the chunked HTTP `/stream`
//! endpoint (secondary).

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, trace};

use emotalk_core::config::SynthesisConfig;
use emotalk_core::types::VoiceParameters;

pub type AudioStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

const ELEVENLABS_HTTP_URL: &str = "https://api.elevenlabs.io";
const ELEVENLABS_WS_URL: &str = "wss://api.elevenlabs.io";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    /// Text to speak, already tagged if the engine understands tags.
    pub text: String,
    pub voice: VoiceParameters,
    /// Voice override (e.g. from the persona). Falls back to the engine default.
    pub voice_id: Option<String>,
}

/// The speech synthesis capability.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn id(&self) -> &str;

    /// Whether bracketed delivery tags are spoken as direction rather than
    /// read aloud.
    fn supports_delivery_tags(&self) -> bool {
        false
    }

    /// Start synthesis. The returned stream is finite and ends when the
    /// engine signals completion.
    async fn synthesize(&self, request: &SynthesisRequest) -> anyhow::Result<AudioStream>;
}

/// Primary transport plus an optional secondary to retry through.
#[derive(Clone)]
pub struct SynthesisRoute {
    pub primary: Arc<dyn SpeechSynthesizer>,
    pub secondary: Option<Arc<dyn SpeechSynthesizer>>,
}

impl SynthesisRoute {
    pub fn new(primary: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn SpeechSynthesizer>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn supports_delivery_tags(&self) -> bool {
        self.primary.supports_delivery_tags()
    }
}

// --- ElevenLabs ---

/// Connection settings shared by both ElevenLabs transports.
#[derive(Debug, Clone)]
pub struct ElevenLabsSettings {
    pub api_key: String,
    pub voice_id: Option<String>,
    pub model_id: String,
    pub output_format: String,
    pub similarity_boost: f64,
    pub http_chunk_size: usize,
    pub http_base_url: String,
    pub ws_base_url: String,
}

impl ElevenLabsSettings {
    pub fn from_config(config: &SynthesisConfig, api_key: String) -> Self {
        let http_base_url = config
            .base_url
            .as_deref()
            .unwrap_or(ELEVENLABS_HTTP_URL)
            .trim_end_matches('/')
            .to_string();
        let ws_base_url = match config.base_url.as_deref() {
            Some(url) => url
                .trim_end_matches('/')
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1),
            None => ELEVENLABS_WS_URL.to_string(),
        };
        Self {
            api_key,
            voice_id: config.voice_id.clone().filter(|v| !v.is_empty()),
            model_id: config.model_id.clone(),
            output_format: config.output_format.clone(),
            similarity_boost: config.similarity_boost,
            http_chunk_size: config.http_chunk_size.max(1),
            http_base_url,
            ws_base_url,
        }
    }

    fn voice_for<'a>(&'a self, request: &'a SynthesisRequest) -> anyhow::Result<&'a str> {
        request
            .voice_id
            .as_deref()
            .filter(|v| !v.is_empty())
            .or(self.voice_id.as_deref())
            .ok_or_else(|| anyhow::anyhow!("No synthesis voice configured"))
    }

    fn supports_delivery_tags(&self) -> bool {
        self.model_id.starts_with("eleven_v3")
    }

    /// `voice_settings` object understood by both transports.
    pub fn voice_settings(&self, voice: &VoiceParameters) -> serde_json::Value {
        json!({
            "stability": voice.stability,
            "similarity_boost": self.similarity_boost,
            "style": voice.style,
            "use_speaker_boost": true,
            "speed": voice.speed,
        })
    }

    pub fn stream_input_url(&self, voice_id: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{voice_id}/stream-input?model_id={}&output_format={}",
            self.ws_base_url, self.model_id, self.output_format
        )
    }

    pub fn http_stream_url(&self, voice_id: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{voice_id}/stream?output_format={}",
            self.http_base_url, self.output_format
        )
    }
}

/// WebSocket `stream-input` transport.
pub struct ElevenLabsWsSynthesizer {
    settings: ElevenLabsSettings,
}

impl ElevenLabsWsSynthesizer {
    pub fn new(settings: ElevenLabsSettings) -> Self {
        Self { settings }
    }

    /// Messages sent after connecting: begin-of-stream with settings, the
    /// text with a flush, then the empty end-of-stream marker.
    pub fn handshake(&self, request: &SynthesisRequest) -> [serde_json::Value; 3] {
        [
            json!({
                "text": " ",
                "voice_settings": self.settings.voice_settings(&request.voice),
                "generation_config": { "flush": true },
            }),
            json!({ "text": request.text, "flush": true }),
            json!({ "text": "" }),
        ]
    }
}

#[derive(Debug, Deserialize)]
struct StreamInputFrame {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default, rename = "isFinal")]
    is_final: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Result of decoding one `stream-input` frame.
#[derive(Debug, PartialEq)]
pub enum FrameOutcome {
    Audio(Bytes),
    Final,
    Skip,
}

/// Decode one text frame from the `stream-input` socket.
pub fn decode_stream_input_frame(text: &str) -> anyhow::Result<FrameOutcome> {
    let frame: StreamInputFrame = serde_json::from_str(text)?;
    if let Some(error) = frame.error {
        let detail = frame.message.unwrap_or_default();
        anyhow::bail!("ElevenLabs stream error: {error} {detail}");
    }
    if let Some(audio) = frame.audio.filter(|a| !a.is_empty()) {
        let pcm = base64::engine::general_purpose::STANDARD.decode(audio)?;
        if !pcm.is_empty() {
            return Ok(FrameOutcome::Audio(Bytes::from(pcm)));
        }
    }
    if frame.is_final == Some(true) {
        return Ok(FrameOutcome::Final);
    }
    Ok(FrameOutcome::Skip)
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsWsSynthesizer {
    fn id(&self) -> &str {
        "elevenlabs-ws"
    }

    fn supports_delivery_tags(&self) -> bool {
        self.settings.supports_delivery_tags()
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> anyhow::Result<AudioStream> {
        let voice_id = self.settings.voice_for(request)?;
        let mut ws_request = self.settings.stream_input_url(voice_id).into_client_request()?;
        ws_request
            .headers_mut()
            .insert("xi-api-key", HeaderValue::from_str(&self.settings.api_key)?);

        debug!(voice_id, model = %self.settings.model_id, text_len = request.text.len(), "Opening synthesis socket");

        let (mut ws, _) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(ws_request))
                .await
                .map_err(|_| anyhow::anyhow!("ElevenLabs connect timed out"))??;

        for message in self.handshake(request) {
            ws.send(Message::Text(message.to_string().into())).await?;
        }

        let stream = futures::stream::unfold(Some(ws), |state| async move {
            let mut ws = state?;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => match decode_stream_input_frame(text.as_str()) {
                        Ok(FrameOutcome::Audio(pcm)) => return Some((Ok(pcm), Some(ws))),
                        Ok(FrameOutcome::Final) => {
                            let _ = ws.close(None).await;
                            return None;
                        }
                        Ok(FrameOutcome::Skip) => continue,
                        Err(e) => return Some((Err(e), None)),
                    },
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Some((Err(anyhow::anyhow!("ElevenLabs socket error: {e}")), None));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Chunked HTTP `/stream` transport.
pub struct ElevenLabsHttpSynthesizer {
    settings: ElevenLabsSettings,
    client: reqwest::Client,
}

impl ElevenLabsHttpSynthesizer {
    pub fn new(settings: ElevenLabsSettings) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { settings, client }
    }

    pub fn request_body(&self, request: &SynthesisRequest) -> serde_json::Value {
        json!({
            "text": request.text,
            "model_id": self.settings.model_id,
            "voice_settings": self.settings.voice_settings(&request.voice),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsHttpSynthesizer {
    fn id(&self) -> &str {
        "elevenlabs-http"
    }

    fn supports_delivery_tags(&self) -> bool {
        self.settings.supports_delivery_tags()
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> anyhow::Result<AudioStream> {
        let voice_id = self.settings.voice_for(request)?;
        let url = self.settings.http_stream_url(voice_id);

        debug!(voice_id, model = %self.settings.model_id, text_len = request.text.len(), "Starting HTTP synthesis stream");

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.settings.api_key)
            .header("Content-Type", "application/json")
            .json(&self.request_body(request))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let body = Box::pin(
            resp.bytes_stream()
                .map(|chunk| chunk.map_err(|e| anyhow::anyhow!("TTS stream error: {e}"))),
        );
        Ok(Box::pin(rechunk(body, self.settings.http_chunk_size)))
    }
}

struct RechunkState<S> {
    inner: S,
    buffer: BytesMut,
    ready: VecDeque<Bytes>,
    done: bool,
}

/// Regroup a byte stream into chunks of exactly `size` bytes (the last chunk
/// may be shorter). Errors pass through and end the stream.
pub fn rechunk<S>(inner: S, size: usize) -> impl Stream<Item = anyhow::Result<Bytes>> + Send
where
    S: Stream<Item = anyhow::Result<Bytes>> + Send + Unpin,
{
    let size = size.max(1);
    let state = RechunkState {
        inner,
        buffer: BytesMut::new(),
        ready: VecDeque::new(),
        done: false,
    };
    futures::stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(chunk) = state.ready.pop_front() {
                return Some((Ok(chunk), state));
            }
            if state.done {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    while state.buffer.len() >= size {
                        state.ready.push_back(state.buffer.split_to(size).freeze());
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    if !state.buffer.is_empty() {
                        let rest = state.buffer.split().freeze();
                        trace!(len = rest.len(), "Flushing trailing audio");
                        state.ready.push_back(rest);
                    }
                }
            }
        }
    })
}
