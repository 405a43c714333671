//! JSONL conversation log, one append-only file per conversation.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{EmotalkError, Result};
use crate::types::{Emotion, Role};

/// A single line of the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationRecord {
    Started {
        persona_id: String,
        timestamp: DateTime<Utc>,
    },
    Message {
        role: Role,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        emotion: Option<Emotion>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intensity: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    Finished {
        timestamp: DateTime<Utc>,
    },
}

impl ConversationRecord {
    pub fn user(text: &str) -> Self {
        Self::Message {
            role: Role::User,
            text: text.to_string(),
            emotion: None,
            intensity: None,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: &str, emotion: Emotion, intensity: f64) -> Self {
        Self::Message {
            role: Role::Assistant,
            text: text.to_string(),
            emotion: Some(emotion),
            intensity: Some(intensity),
            timestamp: Utc::now(),
        }
    }
}

/// External record of conversations. All calls are best-effort for callers.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Open a new conversation and return its id.
    async fn start(&self, persona_id: &str) -> Result<String>;

    async fn append(&self, conversation_id: &str, record: ConversationRecord) -> Result<()>;

    async fn finish(&self, conversation_id: &str) -> Result<()>;

    /// Every record of a conversation, in write order.
    async fn read(&self, conversation_id: &str) -> Result<Vec<ConversationRecord>>;
}

/// File-based conversation store.
///
/// Layout: `<base>/<conversation_id>.jsonl`, one [`ConversationRecord`] per line.
pub struct JsonlConversationStore {
    base: PathBuf,
}

impl JsonlConversationStore {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    fn log_path(&self, conversation_id: &str) -> Result<PathBuf> {
        if uuid::Uuid::parse_str(conversation_id).is_err() {
            return Err(EmotalkError::Store(format!(
                "invalid conversation id: {conversation_id}"
            )));
        }
        Ok(self.base.join(format!("{conversation_id}.jsonl")))
    }

    async fn write_line(&self, path: &PathBuf, record: &ConversationRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonlConversationStore {
    async fn start(&self, persona_id: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.base).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let path = self.log_path(&id)?;
        self.write_line(
            &path,
            &ConversationRecord::Started {
                persona_id: persona_id.to_string(),
                timestamp: Utc::now(),
            },
        )
        .await?;
        debug!(conversation = %id, persona = persona_id, "Conversation log opened");
        Ok(id)
    }

    async fn append(&self, conversation_id: &str, record: ConversationRecord) -> Result<()> {
        let path = self.log_path(conversation_id)?;
        if !path.exists() {
            return Err(EmotalkError::Store(format!(
                "unknown conversation: {conversation_id}"
            )));
        }
        self.write_line(&path, &record).await
    }

    async fn finish(&self, conversation_id: &str) -> Result<()> {
        self.append(
            conversation_id,
            ConversationRecord::Finished {
                timestamp: Utc::now(),
            },
        )
        .await
    }

    async fn read(&self, conversation_id: &str) -> Result<Vec<ConversationRecord>> {
        let path = self.log_path(conversation_id)?;
        if !path.exists() {
            return Err(EmotalkError::Store(format!(
                "unknown conversation: {conversation_id}"
            )));
        }
        let data = tokio::fs::read_to_string(&path).await?;
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| EmotalkError::Store(format!("corrupt log line: {e}")))
            })
            .collect()
    }
}
