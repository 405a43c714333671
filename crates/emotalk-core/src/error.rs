use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmotalkError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Capability unavailable: {0}")]
    Capability(String),

    #[error("Persona error: {0}")]
    Persona(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EmotalkError>;
