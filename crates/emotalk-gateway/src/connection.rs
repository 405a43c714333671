//! Conversation WebSocket lifecycle: one session per connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use emotalk_core::protocol::{ClientCommand, ServerEvent};
use emotalk_session::{ConversationSession, InboundOutcome};

use crate::state::GatewayState;

/// How long a closing connection waits for queued events to reach the client.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Serialize session events onto the socket until every sender is gone or
/// the client stops accepting writes.
async fn forward_events<S>(mut events: mpsc::UnboundedReceiver<ServerEvent>, mut sink: S)
where
    S: Sink<Message> + Unpin,
{
    while let Some(event) = events.recv().await {
        let msg = match serde_json::to_string(&event) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%e, "Failed to encode outbound event");
                continue;
            }
        };
        if sink.send(Message::Text(msg.into())).await.is_err() {
            break;
        }
    }
}

/// Let the sender task drain what is already queued, aborting it if that
/// takes longer than `timeout`. Returns `true` when it finished on its own.
async fn finish_sender(send_task: JoinHandle<()>, timeout: Duration) -> bool {
    let abort = send_task.abort_handle();
    match tokio::time::timeout(timeout, send_task).await {
        Ok(_) => true,
        Err(_) => {
            abort.abort();
            false
        }
    }
}

/// Drive one conversation connection until the client stops or disconnects.
pub async fn handle_conversation(
    state: Arc<GatewayState>,
    ws: WebSocket,
    profile_id: Option<String>,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let mut session = ConversationSession::new(state.services.clone(), event_tx);
    let session_id = session.id().to_string();
    info!(session_id = %session_id, profile_id = ?profile_id, "New conversation connection");

    let send_task = tokio::spawn(forward_events(event_rx, ws_tx));

    if let Err(e) = session.initialize(profile_id.as_deref()).await {
        error!(session_id = %session_id, %e, "Session initialization failed");
        send_task.abort();
        return;
    }
    state
        .register(&session_id, session.persona().map(|p| p.id.clone()))
        .await;

    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let command = match serde_json::from_str::<ClientCommand>(text.as_str()) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(session_id = %session_id, %e, "Invalid command, ignoring");
                        continue;
                    }
                };
                if session.handle_inbound(command).await == InboundOutcome::Stop {
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                // Raw PCM frames are accepted alongside base64 audio commands.
                session.submit_audio(data.to_vec());
            }
            Ok(Message::Close(_)) => {
                debug!(session_id = %session_id, "Client requested close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(session_id = %session_id, %e, "WebSocket error");
                break;
            }
        }
    }

    session.shutdown().await;
    // Release the session's senders so the channel closes once the pipeline
    // worker drains, then let already-queued events go out.
    drop(session);
    if !finish_sender(send_task, FLUSH_TIMEOUT).await {
        debug!(session_id = %session_id, "Event flush timed out");
    }
    state.unregister(&session_id).await;
    info!(session_id = %session_id, "Conversation connection closed");
}
