//! CNPJ pipeline CLI library
//!
//! Command-line interface over the ingestion pipeline:
//!
//! - **`cnpj run`**: full catalog → download → extract → convert → publish
//!   run with no required arguments, resuming any completed work
//! - **`cnpj status`**: report run-state and published-table progress
//! - **`cnpj clean`**: remove scratch data (and optionally the run state)

pub mod commands;
pub mod error;
pub mod progress;

// Re-export commonly used types
pub use error::{CliError, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cnpj_ingest::config::DEFAULT_CATALOG_URL;

/// CNPJ open-data ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "cnpj")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Base directory for archives, scratch space, state, and tables
    #[arg(long, env = "CNPJ_DATA_DIR", default_value = "data", global = true)]
    pub data_dir: PathBuf,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full pipeline: resolve, download, extract, convert, publish
    Run {
        /// Catalog index page listing the release's archives
        #[arg(long, env = "CNPJ_CATALOG_URL", default_value = DEFAULT_CATALOG_URL)]
        catalog_url: String,

        /// Parallel downloads
        #[arg(long, env = "CNPJ_DOWNLOAD_CONCURRENCY", default_value_t = 4)]
        download_concurrency: usize,

        /// Parallel extract/convert workers (defaults to the core count)
        #[arg(long)]
        convert_concurrency: Option<usize>,

        /// Fetch attempts per archive before giving up
        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        /// Fraction of malformed rows above which a shard is excluded
        #[arg(long, default_value_t = 0.05)]
        malformed_row_threshold: f64,

        /// Keep extracted parts and staged shards after publishing
        #[arg(long)]
        keep_scratch: bool,
    },

    /// Show run-state and published-table status
    Status,

    /// Remove scratch data
    Clean {
        /// Also remove the run state, forcing the next run to start fresh
        #[arg(long)]
        state: bool,

        /// Also remove downloaded archives
        #[arg(long)]
        archives: bool,
    },
}

impl Cli {
    /// Build the pipeline configuration shared by all subcommands
    pub fn pipeline_config(&self) -> cnpj_ingest::PipelineConfig {
        let mut config = cnpj_ingest::PipelineConfig {
            download_dir: self.data_dir.join("archives"),
            scratch_dir: self.data_dir.join("scratch"),
            output_dir: self.data_dir.join("tables"),
            state_path: self.data_dir.join("run_state.json"),
            ..Default::default()
        };

        if let Commands::Run {
            catalog_url,
            download_concurrency,
            convert_concurrency,
            max_retries,
            malformed_row_threshold,
            keep_scratch,
        } = &self.command
        {
            config.catalog_url = catalog_url.clone();
            config.download_concurrency = *download_concurrency;
            if let Some(workers) = convert_concurrency {
                config.convert_concurrency = *workers;
            }
            config.max_retries = *max_retries;
            config.malformed_row_threshold = *malformed_row_threshold;
            config.keep_scratch = *keep_scratch;
        }

        config
    }
}
