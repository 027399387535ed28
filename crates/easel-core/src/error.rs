use thiserror::Error;

#[derive(Debug, Error)]
pub enum EaselError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Canvas error: {0}")]
    Canvas(String),

    #[error("Layout error: {0}")]
    Layout(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EaselError>;
