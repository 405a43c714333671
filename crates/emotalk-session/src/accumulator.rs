//! Transcript accumulation into complete utterances.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use emotalk_core::protocol::ServerEvent;
use emotalk_core::types::TranscriptEvent;
use emotalk_media::recognition::TranscriptStream;

use crate::events::EventSink;
use crate::pipeline::PipelineJob;

/// Collects final transcript fragments until an utterance boundary.
#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    pending: String,
}

/// What one transcript event produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// Transcript to forward for live display.
    pub display: Option<ServerEvent>,
    /// Completed utterance to hand to the pipeline.
    pub utterance: Option<String>,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &str {
        self.pending.trim()
    }

    /// Apply one event. The buffer is cleared only when an utterance is
    /// returned.
    pub fn apply(&mut self, event: TranscriptEvent) -> Applied {
        match event {
            TranscriptEvent::Partial(text) => Applied {
                display: Some(ServerEvent::Transcript {
                    text,
                    is_final: false,
                }),
                utterance: None,
            },
            TranscriptEvent::Final(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    self.pending.push(' ');
                    self.pending.push_str(trimmed);
                }
                Applied {
                    display: Some(ServerEvent::Transcript {
                        text,
                        is_final: true,
                    }),
                    utterance: None,
                }
            }
            TranscriptEvent::UtteranceBoundary => {
                let utterance = if self.pending.trim().is_empty() {
                    self.pending.clear();
                    None
                } else {
                    Some(std::mem::take(&mut self.pending).trim().to_string())
                };
                Applied {
                    display: None,
                    utterance,
                }
            }
        }
    }
}

/// Drain a recognition event stream until it ends or `cancel` fires,
/// forwarding transcripts to `events` and utterances to `jobs`.
pub async fn consume_transcripts(
    session_id: String,
    mut transcripts: TranscriptStream,
    events: EventSink,
    jobs: mpsc::UnboundedSender<PipelineJob>,
    cancel: CancellationToken,
) {
    let mut accumulator = TranscriptAccumulator::new();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = transcripts.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let applied = accumulator.apply(event);
        if let Some(display) = applied.display {
            if !events.emit(display) {
                break;
            }
        }
        if let Some(utterance) = applied.utterance {
            debug!(session_id = %session_id, text = %utterance, "Utterance complete");
            if jobs.send(PipelineJob::Utterance(utterance)).is_err() {
                break;
            }
        }
    }
    info!(session_id = %session_id, "Transcript consumer stopped");
}
