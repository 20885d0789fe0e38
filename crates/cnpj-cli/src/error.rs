//! Error types for the CLI
//!
//! Errors shown to operators carry enough context to act on: which stage
//! failed and what to check or re-run.

use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

/// Error type for CLI operations
#[derive(Error, Debug)]
pub enum CliError {
    /// The pipeline itself failed (catalog, fetch, conversion, ...)
    #[error("{0}")]
    Pipeline(#[from] cnpj_ingest::IngestError),

    /// Run-state file could not be read or parsed
    #[error("Could not read run state: {0}. Delete the state file to start a fresh run.")]
    State(String),

    /// File system operation failed
    #[error("File operation failed: {0}. Check permissions and disk space.")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}
