use serde::Serialize;
use thiserror::Error;

/// Error taxonomy shared by the crawl, asset and query layers. Serializes to
/// `{"type": ..., "message": ...}` so a serving layer can forward it as-is.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "message")]
pub enum AppError {
    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Date resolution error: {0}")]
    DateResolution(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

/// Result type for application operations
pub type AppResult<T> = Result<T, AppError>;
