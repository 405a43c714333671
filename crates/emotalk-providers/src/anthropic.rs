//! Anthropic Messages API provider.
//!
//! Streams `/v1/messages` and concatenates the `text_delta` fragments into a
//! single completion.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use emotalk_core::types::{Role, Turn};

use crate::ReplyGenerator;
use crate::sse::sse_events;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicGenerator {
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicGenerator {
    pub fn new(api_key: String, base_url: Option<&str>, model: &str, max_tokens: u32) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.to_string(),
            max_tokens,
            client,
        }
    }
}

// --- Anthropic request/response types ---

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<RequestMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: BlockDelta },
    Error { error: ApiError },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Convert history into Messages API turns.
///
/// The API requires the first message to come from the user, so leading
/// assistant turns are dropped. Blank turns are skipped.
fn format_messages(history: &[Turn]) -> Vec<RequestMessage<'_>> {
    history
        .iter()
        .skip_while(|t| t.role == Role::Assistant)
        .filter(|t| !t.text.trim().is_empty())
        .map(|t| RequestMessage {
            role: t.role.as_str(),
            content: &t.text,
        })
        .collect()
}

/// Fold one SSE payload into the accumulated text. Returns `Ok(true)` at
/// `message_stop`.
fn apply_stream_event(data: &str, text: &mut String) -> anyhow::Result<bool> {
    let event: StreamEvent = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(e) => {
            trace!(%e, data, "Skipping unparseable Anthropic event");
            return Ok(false);
        }
    };
    match event {
        StreamEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text: fragment },
        } => {
            text.push_str(&fragment);
            Ok(false)
        }
        StreamEvent::Error { error } => anyhow::bail!("Anthropic stream error: {}", error.message),
        StreamEvent::MessageStop => Ok(true),
        _ => Ok(false),
    }
}

#[async_trait]
impl ReplyGenerator for AnthropicGenerator {
    fn id(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, directive: &str, history: &[Turn]) -> anyhow::Result<String> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: directive,
            messages: format_messages(history),
            stream: true,
        };

        debug!(model = %self.model, turns = body.messages.len(), "Streaming Anthropic Messages API");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API error {status}: {body}");
        }

        let mut events = Box::pin(sse_events(response.bytes_stream()));
        let mut text = String::new();
        while let Some(event) = events.next().await {
            let event = event?;
            if apply_stream_event(event.data.trim(), &mut text)? {
                break;
            }
        }

        debug!(chars = text.chars().count(), "Anthropic completion finished");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_format_messages_skips_leading_assistant() {
        let history = vec![
            Turn::assistant("welcome"),
            Turn::user("hello"),
            Turn::assistant("hi"),
            Turn::user("  "),
        ];
        let messages = format_messages(&history);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, "assistant");
    }

    #[test]
    fn test_request_body_shape() {
        let history = vec![Turn::user("hello")];
        let body = MessagesRequest {
            model: "claude-test",
            max_tokens: 64,
            system: "be kind",
            messages: format_messages(&history),
            stream: true,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["system"], "be kind");
        assert_eq!(value["stream"], true);
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"], "hello");
    }

    #[test]
    fn test_apply_stream_event() {
        let mut text = String::new();
        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#;
        assert!(!apply_stream_event(delta, &mut text).unwrap());
        assert!(!apply_stream_event(r#"{"type":"ping"}"#, &mut text).unwrap());
        assert!(!apply_stream_event("not json", &mut text).unwrap());
        assert!(apply_stream_event(r#"{"type":"message_stop"}"#, &mut text).unwrap());
        assert_eq!(text, "Hel");

        let err = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert!(apply_stream_event(err, &mut text).is_err());
    }

    #[tokio::test]
    async fn test_complete_concatenates_deltas() {
        let sse = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"{\\\"text\\\": \"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"\\\"hi\\\"}\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let router = Router::new().route("/v1/messages", post(move || async move { sse }));
        let base = serve(router).await;

        let generator = AnthropicGenerator::new("sk-test-0123456789".into(), Some(&base), "m", 32);
        let text = generator
            .complete("directive", &[Turn::user("hello")])
            .await
            .unwrap();
        assert_eq!(text, "{\"text\": \"hi\"}");
    }

    #[tokio::test]
    async fn test_complete_fails_on_error_status() {
        let router = Router::new().route(
            "/v1/messages",
            post(|| async { (StatusCode::UNAUTHORIZED, "invalid x-api-key") }),
        );
        let base = serve(router).await;

        let generator = AnthropicGenerator::new("sk-test-0123456789".into(), Some(&base), "m", 32);
        let err = generator
            .complete("directive", &[Turn::user("hello")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
