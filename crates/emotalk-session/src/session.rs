//! Conversation session lifecycle.
//!
//! A session is owned by the transport connection that created it. It moves
//! `Created -> Active -> Terminated` exactly once; after termination every
//! inbound call is a no-op.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use emotalk_core::conversation_store::ConversationStore;
use emotalk_core::error::{EmotalkError, Result};
use emotalk_core::persona::PersonaProfile;
use emotalk_core::protocol::{ClientCommand, ServerEvent, SessionStatus, decode_audio};
use emotalk_media::recognition::{RecognitionSession, SpeechRecognizer};

use crate::accumulator::consume_transcripts;
use crate::events::EventSink;
use crate::pipeline::{Pipeline, PipelineJob, spawn_worker};
use crate::registry::Services;
use crate::reply::ReplyAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Terminated,
}

/// What the transport should do after an inbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Continue,
    Stop,
}

pub struct ConversationSession {
    id: String,
    services: Arc<Services>,
    events: EventSink,
    terminated: CancellationToken,
    state: SessionState,
    persona: Option<PersonaProfile>,
    recognition: Option<RecognitionSession>,
    jobs: Option<mpsc::UnboundedSender<PipelineJob>>,
    pipeline: Option<Arc<Pipeline>>,
    worker: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    conversation_id: Option<String>,
}

impl ConversationSession {
    pub fn new(services: Arc<Services>, events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        let terminated = CancellationToken::new();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            services,
            events: EventSink::new(events, terminated.clone()),
            terminated,
            state: SessionState::Created,
            persona: None,
            recognition: None,
            jobs: None,
            pipeline: None,
            worker: None,
            consumer: None,
            conversation_id: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn recognition_available(&self) -> bool {
        self.recognition.as_ref().is_some_and(|r| r.is_connected())
    }

    pub fn persona(&self) -> Option<&PersonaProfile> {
        self.persona.as_ref()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Load the persona, start the pipeline worker, and try to open
    /// recognition. Recognition failure leaves the session in text-only mode.
    pub async fn initialize(&mut self, persona_id: Option<&str>) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(EmotalkError::Session(format!(
                "session {} already initialized",
                self.id
            )));
        }

        let persona = self.services.resolve_persona(persona_id).await;

        if let Some(store) = &self.services.store {
            match store.start(&persona.id).await {
                Ok(id) => self.conversation_id = Some(id),
                Err(e) => warn!(session_id = %self.id, %e, "Failed to open conversation log"),
            }
        }

        let reply = ReplyAdapter::new(
            self.services.reply.clone(),
            persona.system_prompt.clone(),
            self.services.history_limit,
        );
        let mut pipeline = Pipeline::new(
            self.id.clone(),
            reply,
            persona.voice_id.clone(),
            self.services.synthesis.clone(),
            self.events.clone(),
        );
        if let (Some(store), Some(conversation_id)) = (&self.services.store, &self.conversation_id) {
            pipeline = pipeline.with_store(store.clone(), conversation_id.clone());
        }

        let pipeline = Arc::new(pipeline);
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        self.worker = Some(spawn_worker(pipeline.clone(), job_rx));
        self.pipeline = Some(pipeline);

        if let Some(recognizer) = &self.services.recognizer {
            match recognizer.connect().await {
                Ok(session) => self.recognition = Some(session),
                Err(e) => warn!(session_id = %self.id, %e, "Recognition unavailable, text-only mode"),
            }
        }
        if let Some(transcripts) = self.recognition.as_mut().and_then(|r| r.take_events()) {
            self.consumer = Some(tokio::spawn(consume_transcripts(
                self.id.clone(),
                transcripts,
                self.events.clone(),
                job_tx.clone(),
                self.terminated.child_token(),
            )));
        }

        self.jobs = Some(job_tx);
        self.persona = Some(persona);
        self.state = SessionState::Active;

        info!(
            session_id = %self.id,
            persona = self.persona.as_ref().map(|p| p.id.as_str()).unwrap_or_default(),
            recognition = self.recognition.is_some(),
            "Session initialized"
        );

        self.events.emit(ServerEvent::status(SessionStatus::Connected));
        if self.recognition.is_none() {
            self.events
                .emit(ServerEvent::status(SessionStatus::SttUnavailable));
        }
        Ok(())
    }

    /// Forward a raw audio frame to recognition.
    pub fn submit_audio(&self, frame: Vec<u8>) {
        if self.state != SessionState::Active || frame.is_empty() {
            return;
        }
        match &self.recognition {
            Some(recognition) => {
                if !recognition.send_audio(frame) {
                    warn!(session_id = %self.id, "Recognition connection is gone, audio dropped");
                }
            }
            None => debug!(session_id = %self.id, "Audio received in text-only mode, ignored"),
        }
    }

    /// Queue a typed utterance for the pipeline.
    pub fn submit_text(&self, text: &str) {
        if self.state != SessionState::Active {
            return;
        }
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.enqueue(PipelineJob::Utterance(text.to_string()));
    }

    /// Switch persona. Takes effect after any queued or in-flight turn.
    pub async fn reconfigure(&mut self, persona_id: Option<&str>) {
        if self.state != SessionState::Active {
            return;
        }
        let profile = self.services.resolve_persona(persona_id).await;
        self.persona = Some(profile.clone());
        self.enqueue(PipelineJob::Reconfigure(profile));
    }

    fn enqueue(&self, job: PipelineJob) {
        let Some(jobs) = &self.jobs else {
            return;
        };
        if jobs.send(job).is_err() {
            warn!(session_id = %self.id, "Pipeline worker is gone, job dropped");
        }
    }

    /// Dispatch one inbound transport command.
    pub async fn handle_inbound(&mut self, command: ClientCommand) -> InboundOutcome {
        if self.state == SessionState::Terminated {
            return InboundOutcome::Stop;
        }
        match command {
            ClientCommand::Audio { data } => {
                if data.is_empty() {
                    return InboundOutcome::Continue;
                }
                match decode_audio(&data) {
                    Ok(frame) => self.submit_audio(frame),
                    Err(e) => warn!(session_id = %self.id, %e, "Dropping undecodable audio frame"),
                }
                InboundOutcome::Continue
            }
            ClientCommand::Text { text } => {
                self.submit_text(&text);
                InboundOutcome::Continue
            }
            ClientCommand::Config { profile_id } => {
                self.reconfigure(profile_id.as_deref()).await;
                InboundOutcome::Continue
            }
            ClientCommand::Stop => {
                info!(session_id = %self.id, "Client requested stop");
                self.stop().await;
                InboundOutcome::Stop
            }
        }
    }

    /// Terminate the session: stop the transcript consumer, release
    /// recognition, and close the conversation log. An in-flight pipeline run
    /// finishes its current step and then stops emitting.
    pub async fn stop(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.state = SessionState::Terminated;
        self.terminated.cancel();

        if let Some(recognition) = self.recognition.take() {
            recognition.disconnect();
        }
        self.jobs = None;
        if let Some(consumer) = self.consumer.take() {
            consumer.abort();
        }
        // Queued jobs see the cancelled token and return without side effects.
        drop(self.worker.take());

        if let Some(pipeline) = self.pipeline.take() {
            pipeline.close_log().await;
        }
        info!(session_id = %self.id, "Session terminated");
    }

    /// Transport-disconnect hook. Same as [`stop`](Self::stop).
    pub async fn shutdown(&mut self) {
        self.stop().await;
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.terminated.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        FakeRecognizer, FakeSynthesizer, MemoryConversationStore, MemoryPersonaStore,
        ScriptedGenerator, collect_until_audio_end, collect_until_idle,
    };
    use emotalk_core::conversation_store::ConversationRecord;
    use emotalk_core::types::{Emotion, TranscriptEvent};
    use emotalk_media::synthesis::SynthesisRoute;

    fn services() -> Services {
        let mut coach = PersonaProfile::builtin("coach");
        coach.name = "Coach".into();
        coach.system_prompt = "Be a coach.".into();
        Services::new(Arc::new(MemoryPersonaStore::default().with(coach)))
    }

    #[tokio::test]
    async fn test_text_only_session_announces_and_replies() {
        let mut services = services();
        services.reply = Some(Arc::new(ScriptedGenerator::new(vec![
            r#"{"text":"hi!","emotion":"happy","intensity":0.8}"#.into(),
        ])));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ConversationSession::new(Arc::new(services), tx);
        assert_eq!(session.state(), SessionState::Created);

        session.initialize(None).await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert!(!session.recognition_available());

        let outcome = session
            .handle_inbound(ClientCommand::Text { text: " hello ".into() })
            .await;
        assert_eq!(outcome, InboundOutcome::Continue);

        let events = collect_until_audio_end(&mut rx).await;
        assert_eq!(events[0], ServerEvent::status(SessionStatus::Connected));
        assert_eq!(events[1], ServerEvent::status(SessionStatus::SttUnavailable));
        assert_eq!(events[2], ServerEvent::status(SessionStatus::Thinking));
        assert_eq!(
            events[4],
            ServerEvent::Response {
                text: "hi!".into(),
                emotion: Emotion::Happy
            }
        );
        assert!(events.last().unwrap().is_audio_end());
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = ConversationSession::new(Arc::new(services()), tx);
        session.initialize(None).await.unwrap();
        assert!(session.initialize(None).await.is_err());
    }

    #[tokio::test]
    async fn test_recognized_speech_runs_pipeline() {
        let recognizer = Arc::new(FakeRecognizer::default());
        let mut services = services();
        services.recognizer = Some(recognizer.clone());
        services.reply = Some(Arc::new(ScriptedGenerator::new(vec![
            r#"{"text":"That sounds really heavy. Want to tell me more?","emotion":"empathetic","intensity":0.7}"#.into(),
        ])));
        services.synthesis = Some(SynthesisRoute::new(Arc::new(FakeSynthesizer::chunks(vec![
            vec![1; 4],
        ]))));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ConversationSession::new(Arc::new(services), tx);
        session.initialize(Some("coach")).await.unwrap();
        assert!(session.recognition_available());

        session
            .handle_inbound(ClientCommand::Audio {
                data: "AAEC".into(),
            })
            .await;
        assert_eq!(recognizer.take_audio(), vec![vec![0u8, 1, 2]]);

        recognizer.push(TranscriptEvent::Final("I feel".into()));
        recognizer.push(TranscriptEvent::Final("overwhelmed today".into()));
        recognizer.push(TranscriptEvent::UtteranceBoundary);

        let events = collect_until_audio_end(&mut rx).await;
        let kinds: Vec<_> = events
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "status", "transcript", "transcript", "status", "emotion", "response", "audio",
                "audio"
            ]
        );
        assert_eq!(
            events[4],
            ServerEvent::Emotion {
                emotion: Emotion::Empathetic,
                intensity: 0.7
            }
        );
    }

    #[tokio::test]
    async fn test_recognition_failure_is_text_only() {
        let mut services = services();
        services.recognizer = Some(Arc::new(FakeRecognizer::unavailable()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ConversationSession::new(Arc::new(services), tx);
        session.initialize(None).await.unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert!(!session.recognition_available());
        let events = collect_until_idle(&mut rx).await;
        assert_eq!(
            events,
            vec![
                ServerEvent::status(SessionStatus::Connected),
                ServerEvent::status(SessionStatus::SttUnavailable),
            ]
        );
    }

    #[tokio::test]
    async fn test_config_command_switches_persona() {
        let generator = Arc::new(ScriptedGenerator::new(vec!["one".into(), "two".into()]));
        let mut services = services();
        services.reply = Some(generator.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ConversationSession::new(Arc::new(services), tx);
        session.initialize(None).await.unwrap();

        session.submit_text("first");
        session
            .handle_inbound(ClientCommand::Config {
                profile_id: Some("coach".into()),
            })
            .await;
        session.submit_text("second");
        assert_eq!(session.persona().unwrap().id, "coach");

        let mut events = collect_until_audio_end(&mut rx).await;
        events.extend(collect_until_audio_end(&mut rx).await);
        let changed = events
            .iter()
            .position(|e| *e == ServerEvent::status(SessionStatus::ProfileChanged))
            .unwrap();
        let first_end = events.iter().position(|e| e.is_audio_end()).unwrap();
        assert!(changed > first_end, "persona switch must land after the first turn");

        let directives = generator.directives();
        assert_eq!(directives[0], emotalk_core::persona::DEFAULT_DIRECTIVE);
        assert_eq!(directives[1], "Be a coach.");
        // History was cleared: the second call only sees its own user turn.
        assert_eq!(generator.calls()[1].len(), 1);
    }

    #[tokio::test]
    async fn test_stop_terminates_and_ignores_later_input() {
        let generator = Arc::new(ScriptedGenerator::new(vec!["one".into()]));
        let store = Arc::new(MemoryConversationStore::default());
        let recognizer = Arc::new(FakeRecognizer::default());
        let mut services = services();
        services.reply = Some(generator.clone());
        services.store = Some(store.clone());
        services.recognizer = Some(recognizer.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ConversationSession::new(Arc::new(services), tx);
        session.initialize(None).await.unwrap();
        let conversation = session.conversation_id().unwrap().to_string();

        assert_eq!(
            session.handle_inbound(ClientCommand::Stop).await,
            InboundOutcome::Stop
        );
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!session.recognition_available());
        assert!(recognizer.is_disconnected());

        let before = collect_until_idle(&mut rx).await;
        assert_eq!(
            session
                .handle_inbound(ClientCommand::Text { text: "hello".into() })
                .await,
            InboundOutcome::Stop
        );
        session.submit_text("hello");
        session.submit_audio(vec![1, 2]);
        session.reconfigure(Some("coach")).await;
        session.stop().await;

        assert!(collect_until_idle(&mut rx).await.is_empty());
        assert_eq!(before.len(), 1);
        assert!(generator.calls().is_empty());

        let records = store.records(&conversation);
        assert!(matches!(records.last(), Some(ConversationRecord::Finished { .. })));
        assert_eq!(
            records
                .iter()
                .filter(|r| matches!(r, ConversationRecord::Finished { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_mid_run_keeps_finished_last() {
        let generator = Arc::new(
            ScriptedGenerator::new(vec!["one".into(), "two".into(), "three".into()])
                .with_delay(std::time::Duration::from_millis(50)),
        );
        let store = Arc::new(MemoryConversationStore::default());
        let mut services = services();
        services.reply = Some(generator.clone());
        services.store = Some(store.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ConversationSession::new(Arc::new(services), tx);
        session.initialize(None).await.unwrap();
        let conversation = session.conversation_id().unwrap().to_string();

        session.submit_text("one");
        session.submit_text("two");
        session.submit_text("three");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        session.stop().await;

        // Give the worker time to drain everything that was queued.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        collect_until_idle(&mut rx).await;

        let records = store.records(&conversation);
        assert!(matches!(records.last(), Some(ConversationRecord::Finished { .. })));
        let texts: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                ConversationRecord::Message { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["one"]);
        // Only the in-flight turn ever reached the generator.
        assert_eq!(generator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_initialize() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ConversationSession::new(Arc::new(services()), tx);
        session.stop().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.initialize(None).await.is_err());
        assert!(collect_until_idle(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_audio_is_dropped() {
        let recognizer = Arc::new(FakeRecognizer::default());
        let mut services = services();
        services.recognizer = Some(recognizer.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = ConversationSession::new(Arc::new(services), tx);
        session.initialize(None).await.unwrap();

        let outcome = session
            .handle_inbound(ClientCommand::Audio {
                data: "***not base64***".into(),
            })
            .await;
        assert_eq!(outcome, InboundOutcome::Continue);
        assert!(recognizer.take_audio().is_empty());
    }
}
