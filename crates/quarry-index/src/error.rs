//! Error types for quarry-index.

use std::num::TryFromIntError;

/// Errors surfaced by indexing, monitoring and search operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error reading source files or walking the tree.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `SQLite` metadata store error.
    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Vector store error (validation, transport or backend rejection).
    #[error("vector store error: {0}")]
    VectorStore(#[from] quarry_vector::VectorStoreError),

    /// LLM provider error (embedding, expansion, re-ranking).
    #[error("LLM error: {0}")]
    Llm(#[from] quarry_llm::LlmError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Tree-sitter parsing error.
    #[error("parse failed: {0}")]
    Parse(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// File watcher error.
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// Include/exclude glob could not be compiled.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] ignore::Error),

    #[error("integer conversion failed: {0}")]
    IntConversion(#[from] TryFromIntError),

    /// An indexing session is already active.
    #[error("indexing is already running")]
    AlreadyRunning,

    /// Pause/resume/stop/cancel with no active session.
    #[error("no indexing session is running")]
    NotRunning,

    /// A targeted operation was requested while a full session is active.
    #[error("an indexing session is active")]
    SessionActive,

    /// The session was cancelled and its partial results discarded.
    #[error("indexing cancelled")]
    Cancelled,

    /// Single-file operation failed; carries path and stage.
    #[error("{0}")]
    File(crate::session::FileError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Background task panicked or was aborted.
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Other(String),
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
