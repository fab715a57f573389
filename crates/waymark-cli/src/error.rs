//! CLI error types.

use thiserror::Error;
use waymark_core::migration::MigrationError;

/// CLI errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] waymark_core::Error),

    /// A migration, rollback or recovery ended in failure.
    #[error("{0}")]
    Migration(#[from] MigrationError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Background task error.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Output encoding error.
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),
}
