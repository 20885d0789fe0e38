//! Error taxonomy for the ingestion pipeline
//!
//! The variants mirror the failure classes the pipeline distinguishes:
//! a missing catalog aborts the whole run, fetch failures are split into
//! retryable and permanent, and archive/shard-level failures stay scoped
//! to the shard they hit so sibling shards of the same table can still
//! publish.

use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Main error type for the ingestion pipeline
#[derive(Error, Debug)]
pub enum IngestError {
    /// The catalog index page could not be fetched or parsed. Fatal to the
    /// run: without a catalog there is nothing to do.
    #[error("catalog unavailable ({url}): {reason}")]
    CatalogUnavailable { url: String, reason: String },

    /// A catalog entry matched no known table pattern. Skipped, never fatal.
    #[error("unrecognized archive name: {0}")]
    UnrecognizedArchiveName(String),

    /// A retryable fetch failure (connect error, timeout, 5xx).
    #[error("transient fetch failure for {url}: {reason}")]
    TransientFetch { url: String, reason: String },

    /// A non-retryable fetch failure (4xx, or retries exhausted). The
    /// archive is excluded from its table's shard set.
    #[error("permanent fetch failure for {url}: {reason}")]
    PermanentFetch { url: String, reason: String },

    /// The archive could not be opened or an entry failed to decompress.
    /// Fatal for this shard only.
    #[error("corrupt archive {archive}: {reason}")]
    CorruptArchive { archive: String, reason: String },

    /// The shard's malformed-row rate exceeded the configured threshold;
    /// the shard is excluded from its table.
    #[error("conversion failed for shard {shard}: {reason}")]
    ConversionFailed { shard: String, reason: String },

    /// The run was cancelled before completion.
    #[error("run cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("run state error: {0}")]
    State(#[from] serde_json::Error),

    #[error("checksum error: {0}")]
    Checksum(#[from] cnpj_common::CommonError),
}

impl IngestError {
    /// Whether this failure should be retried by the retrieval engine.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::TransientFetch { .. })
    }
}
