//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Worker factory failed before any worker existed.
    WorkerCreation(String),
    /// Worker rejected a specific prompt; the session remains alive.
    Prompt(String),
    /// Command issued after the session reached `Stopped` or `Failed`.
    SessionEnded(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Artifact block failed external validation.
    Validation(String),
    /// A liveness or response deadline elapsed.
    Unresponsive(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::WorkerCreation(msg) => write!(f, "worker creation: {msg}"),
            Self::Prompt(msg) => write!(f, "prompt: {msg}"),
            Self::SessionEnded(msg) => write!(f, "session ended: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Unresponsive(msg) => write!(f, "unresponsive: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Db(format!("payload serialization: {err}"))
    }
}
