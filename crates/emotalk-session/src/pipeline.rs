//! Pipeline orchestrator.
//!
//! One run takes an utterance through reply generation, voice mapping and
//! streaming synthesis. Runs for the same session are serialized by the
//! pipeline's mutex, which also owns the reply adapter so that a persona
//! switch lands between runs, never inside one.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use emotalk_core::conversation_store::{ConversationRecord, ConversationStore};
use emotalk_core::persona::PersonaProfile;
use emotalk_core::protocol::{ServerEvent, SessionStatus};
use emotalk_core::types::{ReplyEnvelope, VoiceParameters};
use emotalk_media::emotion_map;
use emotalk_media::synthesis::{AudioStream, SpeechSynthesizer, SynthesisRequest, SynthesisRoute};

use crate::events::EventSink;
use crate::reply::ReplyAdapter;

/// Work handed to a session's pipeline worker, processed in FIFO order.
#[derive(Debug, Clone)]
pub enum PipelineJob {
    Utterance(String),
    Reconfigure(PersonaProfile),
}

/// Per-run synthesis summary.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AudioSummary {
    pub chunks: usize,
    pub bytes: usize,
    pub transport: Option<String>,
}

struct PipelineState {
    reply: ReplyAdapter,
    voice_id: Option<String>,
}

pub struct Pipeline {
    session_id: String,
    state: Mutex<PipelineState>,
    synthesis: Option<SynthesisRoute>,
    store: Option<Arc<dyn ConversationStore>>,
    conversation_id: Option<String>,
    /// Orders log appends against [`Pipeline::close_log`].
    log_gate: Mutex<()>,
    events: EventSink,
}

impl Pipeline {
    pub fn new(
        session_id: String,
        reply: ReplyAdapter,
        voice_id: Option<String>,
        synthesis: Option<SynthesisRoute>,
        events: EventSink,
    ) -> Self {
        Self {
            session_id,
            state: Mutex::new(PipelineState { reply, voice_id }),
            synthesis,
            store: None,
            conversation_id: None,
            log_gate: Mutex::new(()),
            events,
        }
    }

    /// Record turns into `conversation_id` of `store`.
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>, conversation_id: String) -> Self {
        self.store = Some(store);
        self.conversation_id = Some(conversation_id);
        self
    }

    pub async fn handle(&self, job: PipelineJob) {
        match job {
            PipelineJob::Utterance(text) => self.run(&text).await,
            PipelineJob::Reconfigure(profile) => self.reconfigure(&profile).await,
        }
    }

    /// Swap the behavior directive and voice, clear history, then announce it.
    pub async fn reconfigure(&self, profile: &PersonaProfile) {
        let mut state = self.state.lock().await;
        if !self.events.is_active() {
            return;
        }
        state.reply.set_directive(profile.system_prompt.clone());
        state.reply.clear_history();
        state.voice_id = profile.voice_id.clone();
        info!(session_id = %self.session_id, persona = %profile.id, "Persona changed");
        self.events.emit(ServerEvent::status(SessionStatus::ProfileChanged));
    }

    /// Current history snapshot (waits for any in-flight run).
    pub async fn history(&self) -> Vec<emotalk_core::types::Turn> {
        self.state.lock().await.reply.history()
    }

    /// Execute one full pipeline run for `user_text`.
    pub async fn run(&self, user_text: &str) {
        let user_text = user_text.trim();
        if user_text.is_empty() {
            return;
        }

        let mut state = self.state.lock().await;
        // Jobs queued behind a run that outlived the session are dropped here.
        if !self.events.is_active() {
            debug!(session_id = %self.session_id, "Session inactive, utterance dropped");
            return;
        }
        let started = Instant::now();
        info!(session_id = %self.session_id, text = user_text, "Pipeline started");

        self.persist(ConversationRecord::user(user_text)).await;

        if !self.events.emit(ServerEvent::status(SessionStatus::Thinking)) {
            return;
        }

        let envelope = state.reply.generate(user_text).await;
        let reply_ms = started.elapsed().as_millis();
        debug!(
            session_id = %self.session_id,
            emotion = %envelope.emotion,
            intensity = envelope.intensity,
            placeholder = state.reply.is_placeholder(),
            elapsed_ms = reply_ms,
            "Reply ready"
        );

        let voice = emotion_map::map_with_hint(
            envelope.emotion,
            envelope.intensity,
            envelope.delivery_hint.as_deref(),
        );

        if !self.events.emit(ServerEvent::Emotion {
            emotion: envelope.emotion,
            intensity: envelope.intensity,
        }) {
            return;
        }
        if !self.events.emit(ServerEvent::Response {
            text: envelope.text.clone(),
            emotion: envelope.emotion,
        }) {
            return;
        }

        let synthesis_started = Instant::now();
        let voice_id = state.voice_id.clone();
        let Some(audio) = self.stream_audio(&envelope, voice, voice_id).await else {
            return;
        };

        self.persist(ConversationRecord::assistant(
            &envelope.text,
            envelope.emotion,
            envelope.intensity,
        ))
        .await;

        info!(
            session_id = %self.session_id,
            reply_ms,
            synthesis_ms = synthesis_started.elapsed().as_millis(),
            total_ms = started.elapsed().as_millis(),
            chunks = audio.chunks,
            audio_bytes = audio.bytes,
            transport = audio.transport.as_deref().unwrap_or("none"),
            "Pipeline finished"
        );
    }

    /// Stream synthesized audio, then the end-of-audio marker. Returns `None`
    /// when the session went inactive mid-stream.
    async fn stream_audio(
        &self,
        envelope: &ReplyEnvelope,
        voice: VoiceParameters,
        voice_id: Option<String>,
    ) -> Option<AudioSummary> {
        let mut summary = AudioSummary::default();

        let opened = match &self.synthesis {
            Some(route) if !envelope.text.trim().is_empty() => {
                let text = if route.supports_delivery_tags() {
                    emotion_map::tagged_text(&envelope.text, &voice)
                } else {
                    envelope.text.clone()
                };
                let request = SynthesisRequest {
                    text,
                    voice,
                    voice_id,
                };
                open_with_fallback(route, &request).await
            }
            _ => None,
        };

        if let Some((transport, first, mut rest)) = opened {
            summary.transport = Some(transport);
            if let Some(first) = first {
                if !self.forward_chunk(&first, &mut summary) {
                    return None;
                }
                while let Some(item) = rest.next().await {
                    match item {
                        Ok(chunk) => {
                            if !self.forward_chunk(&chunk, &mut summary) {
                                return None;
                            }
                        }
                        Err(e) => {
                            warn!(session_id = %self.session_id, %e, chunks = summary.chunks, "Synthesis failed mid-stream");
                            if !self.events.emit(ServerEvent::error(format!("Audio stream interrupted: {e}"))) {
                                return None;
                            }
                            break;
                        }
                    }
                }
            }
        }

        if !self.events.emit(ServerEvent::audio_end()) {
            return None;
        }
        Some(summary)
    }

    fn forward_chunk(&self, chunk: &Bytes, summary: &mut AudioSummary) -> bool {
        if chunk.is_empty() {
            return true;
        }
        summary.chunks += 1;
        summary.bytes += chunk.len();
        self.events.emit(ServerEvent::audio_chunk(chunk))
    }

    /// Append to the conversation log unless the session has ended.
    async fn persist(&self, record: ConversationRecord) {
        let (Some(store), Some(id)) = (&self.store, &self.conversation_id) else {
            return;
        };
        let _gate = self.log_gate.lock().await;
        if !self.events.is_active() {
            return;
        }
        if let Err(e) = store.append(id, record).await {
            warn!(session_id = %self.session_id, %e, "Failed to persist conversation turn");
        }
    }

    /// Write the closing record. Call after the session's token is cancelled:
    /// appends that have not started yet are refused, so this is the last
    /// record of the conversation.
    pub async fn close_log(&self) {
        let (Some(store), Some(id)) = (&self.store, &self.conversation_id) else {
            return;
        };
        let _gate = self.log_gate.lock().await;
        if let Err(e) = store.finish(id).await {
            warn!(session_id = %self.session_id, %e, "Failed to close conversation log");
        }
    }
}

type OpenedStream = (String, Option<Bytes>, AudioStream);

/// Start a synthesis stream and wait for its first item, so a transport that
/// fails before producing audio can be retried elsewhere.
async fn open_stream(
    synthesizer: &dyn SpeechSynthesizer,
    request: &SynthesisRequest,
) -> anyhow::Result<OpenedStream> {
    let mut stream = synthesizer.synthesize(request).await?;
    match stream.next().await {
        Some(Ok(first)) => Ok((synthesizer.id().to_string(), Some(first), stream)),
        Some(Err(e)) => Err(e),
        None => Ok((synthesizer.id().to_string(), None, stream)),
    }
}

/// Try the primary transport, then the secondary once. `None` when both fail.
async fn open_with_fallback(
    route: &SynthesisRoute,
    request: &SynthesisRequest,
) -> Option<OpenedStream> {
    match open_stream(route.primary.as_ref(), request).await {
        Ok(opened) => return Some(opened),
        Err(e) => warn!(transport = route.primary.id(), %e, "Primary synthesis transport failed"),
    }
    let secondary = route.secondary.as_ref()?;
    match open_stream(secondary.as_ref(), request).await {
        Ok(opened) => {
            info!(transport = secondary.id(), "Synthesis served by secondary transport");
            Some(opened)
        }
        Err(e) => {
            warn!(transport = secondary.id(), %e, "Secondary synthesis transport failed");
            None
        }
    }
}

/// Spawn the FIFO worker that feeds jobs to `pipeline` until the sender side
/// is dropped.
pub fn spawn_worker(
    pipeline: Arc<Pipeline>,
    mut jobs: mpsc::UnboundedReceiver<PipelineJob>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            pipeline.handle(job).await;
        }
        debug!(session_id = %pipeline.session_id, "Pipeline worker stopped");
    })
}
