use crate::validation::ValidationResult;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KbError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {}", summarize(.0))]
    ValidationFailed(ValidationResult),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Unknown document type: {0}")]
    UnknownType(String),

    #[error("Invalid filename '{filename}': {reason}")]
    InvalidFilename { filename: String, reason: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, KbError>;

fn summarize(result: &ValidationResult) -> String {
    let messages: Vec<&str> = result.errors.iter().map(|e| e.message.as_str()).collect();
    messages.join("; ")
}
