//! Axum-based HTTP and WebSocket server.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use emotalk_core::error::EmotalkError;
use emotalk_core::persona::PersonaStore;
use emotalk_session::review_conversation;

use crate::connection::handle_conversation;
use crate::state::GatewayState;

#[derive(Debug, Default, Deserialize)]
pub struct ConversationQuery {
    pub profile_id: Option<String>,
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins()
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/api/profiles", get(profiles_handler))
        .route("/api/cases", get(cases_handler))
        .route(
            "/api/conversations/{conversation_id}/feedback",
            post(feedback_handler),
        )
        .route("/ws/conversation", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway server and run until Ctrl+C.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.gateway_bind();
    let app = router(state);

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn root_handler() -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "service": "emotalk",
    }))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.session_count().await,
        "services": state.services.availability(),
    }))
}

async fn profiles_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    match state.services.personas.list().await {
        Ok(profiles) => (StatusCode::OK, axum::Json(json!({ "profiles": profiles }))),
        Err(e) => {
            warn!(%e, "Failed to list personas");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn cases_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let Some(cases) = &state.services.cases else {
        return (StatusCode::OK, axum::Json(json!({ "cases": [] })));
    };
    match cases.list().await {
        Ok(cases) => (StatusCode::OK, axum::Json(json!({ "cases": cases }))),
        Err(e) => {
            warn!(%e, "Failed to list cases");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn feedback_handler(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    match review_conversation(&state.services, &conversation_id).await {
        Ok(feedback) => axum::Json(feedback).into_response(),
        Err(e) => {
            let status = match e {
                EmotalkError::Capability(_) => StatusCode::SERVICE_UNAVAILABLE,
                EmotalkError::Store(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!(conversation = %conversation_id, %e, "Feedback request failed");
            (status, axum::Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConversationQuery>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_conversation(state, socket, query.profile_id))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(%e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
