//! Streaming speech recognition.
//!
//! A [`SpeechRecognizer`] opens a [`RecognitionSession`]: a sink for raw PCM
//! frames plus a single channel of [`TranscriptEvent`]s. The Deepgram live
//! client is the only engine implemented.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use emotalk_core::config::RecognitionConfig;
use emotalk_core::types::TranscriptEvent;

pub type TranscriptStream = Pin<Box<dyn Stream<Item = TranscriptEvent> + Send>>;

const DEEPGRAM_WS_URL: &str = "wss://api.deepgram.com/v1/listen";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A live connection to a recognition engine.
///
/// Dropping the session disconnects it.
pub struct RecognitionSession {
    audio_tx: mpsc::UnboundedSender<Vec<u8>>,
    events: Option<mpsc::UnboundedReceiver<TranscriptEvent>>,
    cancel: CancellationToken,
}

impl RecognitionSession {
    /// Wrap channel endpoints owned by an engine task. The task must stop
    /// when `cancel` fires.
    pub fn new(
        audio_tx: mpsc::UnboundedSender<Vec<u8>>,
        events: mpsc::UnboundedReceiver<TranscriptEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            audio_tx,
            events: Some(events),
            cancel,
        }
    }

    /// Forward one audio frame. Returns `false` once the engine has gone away.
    pub fn send_audio(&self, frame: Vec<u8>) -> bool {
        !self.cancel.is_cancelled() && self.audio_tx.send(frame).is_ok()
    }

    /// Take the transcript event sequence. It can be taken once; it ends when
    /// the engine disconnects.
    pub fn take_events(&mut self) -> Option<TranscriptStream> {
        self.events.take().map(|rx| {
            Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)) as TranscriptStream
        })
    }

    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && !self.audio_tx.is_closed()
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The speech recognition capability.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn id(&self) -> &str;

    /// Open a live recognition session. An `Err` means the capability is
    /// unavailable for this session.
    async fn connect(&self) -> anyhow::Result<RecognitionSession>;
}

// --- Deepgram live transcription ---

pub struct DeepgramRecognizer {
    api_key: String,
    config: RecognitionConfig,
    base_url: String,
}

impl DeepgramRecognizer {
    pub fn new(api_key: String, config: RecognitionConfig) -> Self {
        Self {
            api_key,
            config,
            base_url: DEEPGRAM_WS_URL.to_string(),
        }
    }

    /// Point at a different listen endpoint (e.g. a local test server).
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    /// Listen URL with the live-stream options as query parameters.
    pub fn listen_url(&self) -> String {
        let c = &self.config;
        format!(
            "{}?model={}&language={}&encoding={}&sample_rate={}&channels=1&punctuate=true\
             &interim_results={}&utterance_end_ms={}&vad_events=true&endpointing={}",
            self.base_url,
            c.model,
            c.language,
            c.encoding,
            c.sample_rate,
            c.interim_results,
            c.utterance_end_ms,
            c.endpointing_ms,
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DeepgramMessage {
    Results {
        channel: DeepgramChannel,
        #[serde(default)]
        is_final: bool,
    },
    UtteranceEnd,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    #[serde(default)]
    transcript: String,
}

/// Map one Deepgram text frame to a transcript event. Empty transcripts and
/// informational messages yield `None`.
pub fn parse_deepgram_message(text: &str) -> Option<TranscriptEvent> {
    let message: DeepgramMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            trace!(%e, "Ignoring unparseable Deepgram message");
            return None;
        }
    };
    match message {
        DeepgramMessage::Results { channel, is_final } => {
            let transcript = channel.alternatives.into_iter().next()?.transcript;
            if transcript.trim().is_empty() {
                return None;
            }
            Some(if is_final {
                TranscriptEvent::Final(transcript)
            } else {
                TranscriptEvent::Partial(transcript)
            })
        }
        DeepgramMessage::UtteranceEnd => Some(TranscriptEvent::UtteranceBoundary),
        DeepgramMessage::Other => None,
    }
}

#[async_trait]
impl SpeechRecognizer for DeepgramRecognizer {
    fn id(&self) -> &str {
        "deepgram"
    }

    async fn connect(&self) -> anyhow::Result<RecognitionSession> {
        let mut request = self.listen_url().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", self.api_key))?,
        );

        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| anyhow::anyhow!("Deepgram connect timed out"))??;
        info!(model = %self.config.model, language = %self.config.language, "Deepgram connected");

        let (mut sink, mut source) = ws.split();
        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TranscriptEvent>();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    frame = audio_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                                warn!(%e, "Deepgram audio send failed");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = keepalive.tick() => {
                        let msg = r#"{"type":"KeepAlive"}"#;
                        if sink.send(Message::Text(msg.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    incoming = source.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = parse_deepgram_message(text.as_str()) {
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Deepgram stream closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(%e, "Deepgram stream error");
                            break;
                        }
                    },
                }
            }

            let _ = sink.send(Message::Text(r#"{"type":"CloseStream"}"#.to_string().into())).await;
            let _ = sink.close().await;
            task_cancel.cancel();
            info!("Deepgram disconnected");
        });

        Ok(RecognitionSession::new(audio_tx, event_rx, cancel))
    }
}
