//! Archive retrieval engine
//!
//! Downloads archives to the retained download directory. Retrieval is
//! idempotent: a complete, size-matching local copy is never fetched again.
//! In-flight data goes to a `.part` sibling and is promoted by rename only
//! once complete, so no stage downstream ever trusts a half-written file.
//! Interrupted downloads resume with HTTP range requests.
//!
//! Failure classification: connect errors, timeouts and 5xx responses are
//! transient and retried with exponential backoff up to the configured
//! limit; 4xx responses are permanent and never retried. Exhausted retries
//! escalate to a permanent failure that excludes the archive from its
//! table's shard set without aborting the run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::catalog::ArchiveDescriptor;
use crate::config::{PipelineConfig, USER_AGENT};
use crate::error::{IngestError, Result};

/// Result of fetching one archive
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Final local path of the complete archive
    pub path: PathBuf,
    /// Size of the local file in bytes
    pub size: u64,
    /// Whether an existing complete copy was reused
    pub reused: bool,
}

/// Downloads catalog archives with retry, resumption, and idempotent reuse
#[derive(Clone)]
pub struct ArchiveFetcher {
    client: Client,
    max_retries: u32,
    retry_backoff: Duration,
}

impl ArchiveFetcher {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| IngestError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    /// Fetch one archive into `dest_dir`, returning the final local path.
    ///
    /// Idempotent: if a complete copy whose size matches the remote
    /// Content-Length already exists, it is reused without network traffic
    /// beyond a HEAD probe.
    pub async fn fetch(
        &self,
        descriptor: &ArchiveDescriptor,
        dest_dir: &Path,
    ) -> Result<FetchOutcome> {
        fs::create_dir_all(dest_dir).await?;

        let final_path = dest_dir.join(&descriptor.file_name);
        let part_path = dest_dir.join(format!("{}.part", descriptor.file_name));

        if let Some(size) = self.reusable_local_copy(descriptor, &final_path).await? {
            info!(archive = %descriptor.file_name, size, "local copy is complete, skipping download");
            return Ok(FetchOutcome {
                path: final_path,
                size,
                reused: true,
            });
        }

        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            match self.download_once(descriptor, &part_path).await {
                Ok(size) => {
                    fs::rename(&part_path, &final_path).await?;
                    info!(archive = %descriptor.file_name, size, attempt, "download complete");
                    return Ok(FetchOutcome {
                        path: final_path,
                        size,
                        reused: false,
                    });
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        archive = %descriptor.file_name,
                        attempt,
                        max = self.max_retries,
                        error = %err,
                        "download attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < self.max_retries {
                        let backoff = self.retry_backoff * 2u32.saturating_pow(attempt - 1);
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        // Retries exhausted: escalate to a permanent failure
        Err(IngestError::PermanentFetch {
            url: descriptor.url.to_string(),
            reason: format!(
                "{} attempts failed, last: {}",
                self.max_retries,
                last_error.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }

    /// Check whether the existing local file can be reused.
    ///
    /// When the remote size cannot be determined (HEAD unsupported or no
    /// Content-Length) an existing file is trusted as complete; a size
    /// mismatch discards the stale copy.
    async fn reusable_local_copy(
        &self,
        descriptor: &ArchiveDescriptor,
        final_path: &Path,
    ) -> Result<Option<u64>> {
        let Ok(metadata) = fs::metadata(final_path).await else {
            return Ok(None);
        };
        let local_size = metadata.len();

        match self.remote_size(descriptor).await {
            Some(remote) if remote != local_size => {
                warn!(
                    archive = %descriptor.file_name,
                    local_size,
                    remote_size = remote,
                    "local copy is truncated or stale, re-downloading"
                );
                fs::remove_file(final_path).await?;
                Ok(None)
            }
            _ => Ok(Some(local_size)),
        }
    }

    async fn remote_size(&self, descriptor: &ArchiveDescriptor) -> Option<u64> {
        let response = self
            .client
            .head(descriptor.url.clone())
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.content_length().filter(|&len| len > 0)
    }

    /// One download attempt, streaming into the `.part` file. Resumes from
    /// the current partial length when the server honors range requests.
    async fn download_once(
        &self,
        descriptor: &ArchiveDescriptor,
        part_path: &Path,
    ) -> Result<u64> {
        let url = descriptor.url.clone();
        let transient = |reason: String| IngestError::TransientFetch {
            url: url.to_string(),
            reason,
        };

        let resume_from = match fs::metadata(part_path).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => 0,
        };

        let mut request = self.client.get(url.clone());
        if resume_from > 0 {
            debug!(archive = %descriptor.file_name, resume_from, "resuming partial download");
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", resume_from));
        }

        let response = request.send().await.map_err(|e| transient(e.to_string()))?;
        let status = response.status();

        let append = match status {
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // Our partial file no longer lines up with the remote;
                // discard it and retry from scratch.
                fs::remove_file(part_path).await?;
                return Err(transient("range no longer satisfiable".into()));
            }
            s if s.is_success() => false,
            s if s.is_server_error() => {
                return Err(transient(format!("HTTP {}", s)));
            }
            s => {
                return Err(IngestError::PermanentFetch {
                    url: url.to_string(),
                    reason: format!("HTTP {}", s),
                });
            }
        };

        let expected_total = response
            .content_length()
            .map(|len| if append { resume_from + len } else { len });

        if let Some(parent) = part_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(part_path)
            .await?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transient(e.to_string()))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let written = fs::metadata(part_path).await?.len();
        if let Some(expected) = expected_total {
            if written != expected {
                return Err(transient(format!(
                    "truncated stream: {} of {} bytes",
                    written, expected
                )));
            }
        }

        Ok(written)
    }
}
