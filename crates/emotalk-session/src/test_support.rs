//! In-memory fakes for session tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use emotalk_core::conversation_store::{ConversationRecord, ConversationStore};
use emotalk_core::error::{EmotalkError, Result};
use emotalk_core::persona::{PersonaProfile, PersonaStore, PersonaSummary};
use emotalk_core::protocol::ServerEvent;
use emotalk_core::types::{TranscriptEvent, Turn};
use emotalk_media::recognition::{RecognitionSession, SpeechRecognizer};
use emotalk_media::synthesis::{AudioStream, SpeechSynthesizer, SynthesisRequest};
use emotalk_providers::ReplyGenerator;

/// Returns canned completions in order and records every call.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<String>>,
    fail: bool,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<Turn>>>,
    directives: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fail: false,
            delay: None,
            calls: Mutex::new(Vec::new()),
            directives: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// History passed to each call.
    pub fn calls(&self) -> Vec<Vec<Turn>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn directives(&self) -> Vec<String> {
        self.directives.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedGenerator {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, directive: &str, history: &[Turn]) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(history.to_vec());
        self.directives.lock().unwrap().push(directive.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("scripted failure");
        }
        let next = self.replies.lock().unwrap().pop_front();
        next.ok_or_else(|| anyhow::anyhow!("script exhausted"))
    }
}

enum SynthMode {
    Chunks(Vec<Vec<u8>>),
    FailOpen,
    FailAfter(Vec<Vec<u8>>),
}

/// Synthesizer that plays back fixed chunks or fails on cue.
pub struct FakeSynthesizer {
    mode: SynthMode,
    tags: bool,
    chunk_delay: Option<Duration>,
    requests: Mutex<Vec<SynthesisRequest>>,
}

impl FakeSynthesizer {
    fn with_mode(mode: SynthMode) -> Self {
        Self {
            mode,
            tags: false,
            chunk_delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self::with_mode(SynthMode::Chunks(chunks))
    }

    pub fn fail_open() -> Self {
        Self::with_mode(SynthMode::FailOpen)
    }

    /// Yield `chunks`, then an error.
    pub fn fail_after(chunks: Vec<Vec<u8>>) -> Self {
        Self::with_mode(SynthMode::FailAfter(chunks))
    }

    pub fn with_tags(mut self) -> Self {
        self.tags = true;
        self
    }

    /// Wait `delay` before every item, like audio arriving over a network.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<SynthesisRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    fn id(&self) -> &str {
        "fake"
    }

    fn supports_delivery_tags(&self) -> bool {
        self.tags
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> anyhow::Result<AudioStream> {
        self.requests.lock().unwrap().push(request.clone());
        let items: Vec<anyhow::Result<Bytes>> = match &self.mode {
            SynthMode::FailOpen => anyhow::bail!("connect refused"),
            SynthMode::Chunks(chunks) => chunks.iter().cloned().map(|c| Ok(Bytes::from(c))).collect(),
            SynthMode::FailAfter(chunks) => chunks
                .iter()
                .cloned()
                .map(|c| Ok(Bytes::from(c)))
                .chain(std::iter::once(Err(anyhow::anyhow!("stream reset"))))
                .collect(),
        };
        let stream = futures::stream::iter(items);
        match self.chunk_delay {
            Some(delay) => Ok(Box::pin(stream.then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            }))),
            None => Ok(Box::pin(stream)),
        }
    }
}

/// Recognizer whose transcript events are pushed by the test.
#[derive(Default)]
pub struct FakeRecognizer {
    unavailable: bool,
    events: Mutex<Option<mpsc::UnboundedSender<TranscriptEvent>>>,
    audio: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl FakeRecognizer {
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    pub fn push(&self, event: TranscriptEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Audio frames received so far.
    pub fn take_audio(&self) -> Vec<Vec<u8>> {
        let mut guard = self.audio.lock().unwrap();
        let mut frames = Vec::new();
        if let Some(rx) = guard.as_mut() {
            while let Ok(frame) = rx.try_recv() {
                frames.push(frame);
            }
        }
        frames
    }

    pub fn is_disconnected(&self) -> bool {
        self.cancel
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    fn id(&self) -> &str {
        "fake"
    }

    async fn connect(&self) -> anyhow::Result<RecognitionSession> {
        if self.unavailable {
            anyhow::bail!("recognition refused");
        }
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        *self.events.lock().unwrap() = Some(event_tx);
        *self.audio.lock().unwrap() = Some(audio_rx);
        *self.cancel.lock().unwrap() = Some(cancel.clone());
        Ok(RecognitionSession::new(audio_tx, event_rx, cancel))
    }
}

/// Conversation log kept in memory.
#[derive(Default)]
pub struct MemoryConversationStore {
    logs: Mutex<HashMap<String, Vec<ConversationRecord>>>,
}

impl MemoryConversationStore {
    pub fn records(&self, conversation_id: &str) -> Vec<ConversationRecord> {
        self.logs
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn start(&self, persona_id: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.logs.lock().unwrap().insert(
            id.clone(),
            vec![ConversationRecord::Started {
                persona_id: persona_id.to_string(),
                timestamp: chrono::Utc::now(),
            }],
        );
        Ok(id)
    }

    async fn append(&self, conversation_id: &str, record: ConversationRecord) -> Result<()> {
        match self.logs.lock().unwrap().get_mut(conversation_id) {
            Some(log) => {
                log.push(record);
                Ok(())
            }
            None => Err(EmotalkError::Store(format!(
                "unknown conversation: {conversation_id}"
            ))),
        }
    }

    async fn finish(&self, conversation_id: &str) -> Result<()> {
        self.append(
            conversation_id,
            ConversationRecord::Finished {
                timestamp: chrono::Utc::now(),
            },
        )
        .await
    }

    async fn read(&self, conversation_id: &str) -> Result<Vec<ConversationRecord>> {
        self.logs
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| EmotalkError::Store(format!("unknown conversation: {conversation_id}")))
    }
}

/// Personas held in memory.
#[derive(Default)]
pub struct MemoryPersonaStore {
    profiles: HashMap<String, PersonaProfile>,
}

impl MemoryPersonaStore {
    pub fn with(mut self, profile: PersonaProfile) -> Self {
        self.profiles.insert(profile.id.clone(), profile);
        self
    }
}

#[async_trait]
impl PersonaStore for MemoryPersonaStore {
    async fn load(&self, id: &str) -> Result<Option<PersonaProfile>> {
        Ok(self.profiles.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<PersonaSummary>> {
        let mut list: Vec<_> = self.profiles.values().map(PersonaProfile::summary).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }
}

/// Drain events until nothing arrives for a short while.
pub async fn collect_until_idle(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await {
        events.push(event);
    }
    events
}

/// Drain events up to and including the next end-of-audio marker.
pub async fn collect_until_audio_end(
    rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for end of audio")
            .expect("event channel closed");
        let done = event.is_audio_end();
        events.push(event);
        if done {
            return events;
        }
    }
}
