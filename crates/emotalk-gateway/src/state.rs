//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use emotalk_core::config::Config;
use emotalk_session::Services;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub services: Arc<Services>,
    pub connections: RwLock<HashMap<String, ConnectionInfo>>,
}

/// One live conversation connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub session_id: String,
    pub persona: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, services: Arc<Services>) -> Self {
        Self {
            config,
            services,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, session_id: &str, persona: Option<String>) {
        self.connections.write().await.insert(
            session_id.to_string(),
            ConnectionInfo {
                session_id: session_id.to_string(),
                persona,
                connected_at: Utc::now(),
            },
        );
    }

    pub async fn unregister(&self, session_id: &str) {
        self.connections.write().await.remove(session_id);
    }

    pub async fn session_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
