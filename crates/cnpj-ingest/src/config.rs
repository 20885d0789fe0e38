//! Pipeline configuration
//!
//! A single configuration struct carried through the whole run. Values come
//! from defaults, then `CNPJ_*` environment variables, then CLI flags.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Default catalog: the registry's dated open-data release directory
pub const DEFAULT_CATALOG_URL: &str =
    "https://arquivos.receitafederal.gov.br/dados/cnpj/dados_abertos_cnpj/2025-11/";

/// User agent sent on catalog and archive requests
pub const USER_AGENT: &str = concat!("cnpj-pipeline/", env!("CARGO_PKG_VERSION"));

/// Configuration for a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// URL of the catalog index page listing the release's archives
    pub catalog_url: String,

    /// Directory where downloaded archives are kept (retained across runs)
    pub download_dir: PathBuf,

    /// Scratch directory for extracted parts and staged shards (disposable)
    pub scratch_dir: PathBuf,

    /// Table-store directory receiving the columnar artifacts
    pub output_dir: PathBuf,

    /// Path of the persisted run state
    pub state_path: PathBuf,

    /// HTTP timeout per request, seconds
    pub timeout_secs: u64,

    /// Maximum fetch attempts per archive before a transient failure
    /// escalates to a permanent one
    pub max_retries: u32,

    /// Base backoff between fetch retries, milliseconds (doubles per attempt)
    pub retry_backoff_ms: u64,

    /// Parallel downloads (I/O tier)
    pub download_concurrency: usize,

    /// Parallel extract/convert workers (CPU tier)
    pub convert_concurrency: usize,

    /// Rows accumulated per record batch during conversion
    pub batch_size: usize,

    /// Fraction of malformed rows above which a shard is excluded
    pub malformed_row_threshold: f64,

    /// Keep extracted parts and staged shards after a successful publish
    pub keep_scratch: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            download_dir: PathBuf::from("data/archives"),
            scratch_dir: PathBuf::from("data/scratch"),
            output_dir: PathBuf::from("data/tables"),
            state_path: PathBuf::from("data/run_state.json"),
            timeout_secs: 600,
            max_retries: 3,
            retry_backoff_ms: 2_000,
            download_concurrency: 4,
            convert_concurrency: cores,
            batch_size: 65_536,
            malformed_row_threshold: 0.05,
            keep_scratch: false,
        }
    }
}

impl PipelineConfig {
    /// Apply `CNPJ_*` environment overrides on top of the current values
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("CNPJ_CATALOG_URL") {
            config.catalog_url = url;
        }
        if let Ok(dir) = std::env::var("CNPJ_DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("CNPJ_SCRATCH_DIR") {
            config.scratch_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("CNPJ_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Ok(n) = std::env::var("CNPJ_DOWNLOAD_CONCURRENCY") {
            config.download_concurrency = n
                .parse()
                .map_err(|_| IngestError::Config(format!("invalid concurrency: {}", n)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        if self.catalog_url.is_empty() {
            return Err(IngestError::Config("catalog URL cannot be empty".into()));
        }
        if self.max_retries == 0 {
            return Err(IngestError::Config("max_retries must be at least 1".into()));
        }
        if self.download_concurrency == 0 || self.convert_concurrency == 0 {
            return Err(IngestError::Config(
                "concurrency limits must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(IngestError::Config("batch_size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.malformed_row_threshold) {
            return Err(IngestError::Config(format!(
                "malformed_row_threshold must be within [0, 1], got {}",
                self.malformed_row_threshold
            )));
        }
        Ok(())
    }

    /// Directory holding extracted CSV parts for one archive
    pub fn parts_dir(&self) -> PathBuf {
        self.scratch_dir.join("parts")
    }

    /// Directory holding staged per-shard parquet files
    pub fn staged_dir(&self) -> PathBuf {
        self.scratch_dir.join("staged")
    }
}
