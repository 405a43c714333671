//! Outbound event channel for one session.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use emotalk_core::protocol::ServerEvent;

/// Ordered sink for a session's outbound events.
///
/// Once the session is terminated every emit is refused, so in-flight work
/// stops producing events at its next send.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ServerEvent>,
    terminated: CancellationToken,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ServerEvent>, terminated: CancellationToken) -> Self {
        Self { tx, terminated }
    }

    /// Send an event. Returns `false` when the session is inactive or the
    /// transport has gone away.
    pub fn emit(&self, event: ServerEvent) -> bool {
        if self.terminated.is_cancelled() {
            trace!(?event, "Dropping event for inactive session");
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn is_active(&self) -> bool {
        !self.terminated.is_cancelled() && !self.tx.is_closed()
    }
}
