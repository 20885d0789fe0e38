//! End-to-end pipeline orchestration
//!
//! Drives catalog resolution → download → extract → convert → publish as a
//! restartable batch run. Each archive is processed by one task; downloads
//! run under an I/O-tier semaphore, extraction and conversion under a
//! CPU-tier semaphore inside `spawn_blocking`. Within a table, shard order
//! never matters (the result is a set union), so archives proceed fully in
//! parallel.
//!
//! Failure isolation follows the error taxonomy: only a missing catalog
//! aborts the run. Fetch failures, corrupt archives, and excluded shards
//! are recorded in the run state and reflected in the summary; the
//! affected table still publishes from its remaining good shards.
//!
//! Re-invocation resumes: completed downloads are reused, staged shards
//! are appended without re-scanning, and already-published tables are left
//! untouched. Running twice against unchanged inputs yields byte-identical
//! artifacts.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{ArchiveDescriptor, CatalogResolver, Resolution};
use crate::config::PipelineConfig;
use crate::convert::{self, ConvertOptions};
use crate::dictionary::TableKind;
use crate::error::{IngestError, Result};
use crate::extract::extract_archive;
use crate::fetch::ArchiveFetcher;
use crate::state::{ArchiveRecord, ArchiveStage, PartRecord, StateStore, TableRecord};
use crate::store::TableStore;

/// Per-table outcome of a run
#[derive(Debug, Clone)]
pub struct TableSummary {
    pub table: String,
    pub shards_attempted: usize,
    pub shards_converted: usize,
    pub shards_failed: usize,
    pub rows_written: u64,
    pub rows_malformed: u64,
    pub rows_deduped: u64,
}

impl TableSummary {
    /// A table that attempted shards but converted none has no usable data
    pub fn is_failed(&self) -> bool {
        self.shards_attempted > 0 && self.shards_converted == 0
    }
}

/// End-of-run report across all tables
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub tables: Vec<TableSummary>,
    /// Catalog entries that matched no known table pattern
    pub skipped_entries: Vec<String>,
}

impl RunSummary {
    /// True when at least one attempted table ended with zero usable
    /// shards; the process exits nonzero in that case.
    pub fn has_failed_tables(&self) -> bool {
        self.tables.iter().any(TableSummary::is_failed)
    }
}

/// The ingestion pipeline, wired from one [`PipelineConfig`]
pub struct Pipeline {
    config: PipelineConfig,
    resolver: CatalogResolver,
    fetcher: ArchiveFetcher,
    store: TableStore,
    state: Arc<StateStore>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let resolver = CatalogResolver::new(&config)?;
        let fetcher = ArchiveFetcher::new(&config)?;
        let store = TableStore::new(&config.output_dir)?;
        let state = Arc::new(StateStore::open(&config.state_path)?);

        Ok(Self {
            config,
            resolver,
            fetcher,
            store,
            state,
            cancel: CancellationToken::new(),
        })
    }

    /// Token a caller (e.g. a Ctrl-C handler) can trigger to abort the run
    /// cleanly between stages.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    /// Execute the full pipeline, resuming any completed work.
    pub async fn run(&self) -> Result<RunSummary> {
        let resolution = self.resolver.resolve().await?;

        self.state.update(|state| {
            for descriptor in &resolution.archives {
                state
                    .archives
                    .entry(descriptor.file_name.clone())
                    .or_insert_with(|| {
                        ArchiveRecord::new(
                            descriptor.url.to_string(),
                            descriptor.table.name().to_string(),
                        )
                    });
            }
        })?;

        self.process_archives(&resolution).await?;
        self.publish_tables().await?;
        self.cleanup_scratch();

        let summary = self.build_summary(&resolution);
        for table in &summary.tables {
            info!(
                table = %table.table,
                shards_attempted = table.shards_attempted,
                shards_converted = table.shards_converted,
                shards_failed = table.shards_failed,
                rows = table.rows_written,
                malformed = table.rows_malformed,
                deduped = table.rows_deduped,
                "table summary"
            );
        }
        Ok(summary)
    }

    async fn process_archives(&self, resolution: &Resolution) -> Result<()> {
        let download_permits = Arc::new(Semaphore::new(self.config.download_concurrency));
        let convert_permits = Arc::new(Semaphore::new(self.config.convert_concurrency));

        let mut tasks = JoinSet::new();
        for descriptor in resolution.archives.clone() {
            let worker = ArchiveWorker {
                config: self.config.clone(),
                fetcher: self.fetcher.clone(),
                store: self.store.clone(),
                state: Arc::clone(&self.state),
                cancel: self.cancel.clone(),
                download_permits: Arc::clone(&download_permits),
                convert_permits: Arc::clone(&convert_permits),
            };
            tasks.spawn(async move { worker.process(descriptor).await });
        }

        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(IngestError::Cancelled)) => cancelled = true,
                // Archive-level failures are recorded in the run state by
                // the worker; they must not abort sibling archives.
                Ok(Err(err)) => error!(error = %err, "archive task failed"),
                Err(join_err) => error!(error = %join_err, "archive task panicked"),
            }
        }

        if cancelled || self.cancel.is_cancelled() {
            warn!("run cancelled; state persisted for resumption");
            return Err(IngestError::Cancelled);
        }
        Ok(())
    }

    /// Assemble and publish every table that has staged shards waiting.
    ///
    /// When an artifact from a previous run already exists it participates
    /// in the merge, so resumed runs append new shards instead of
    /// re-scanning converted ones.
    async fn publish_tables(&self) -> Result<()> {
        for &kind in TableKind::ALL {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            let staged = self.staged_shards(kind);
            if staged.is_empty() {
                debug!(table = %kind, "no staged shards; nothing to publish");
                continue;
            }

            let mut inputs = Vec::new();
            let artifact = self.store.table_path(kind);
            if artifact.exists() {
                inputs.push(artifact);
            }
            inputs.extend(staged.iter().cloned());

            let staging = self.store.staging_path(kind);
            let merge = tokio::task::spawn_blocking(move || {
                convert::merge_shards(kind, &inputs, &staging)
            })
            .await
            .map_err(|e| IngestError::Config(format!("merge task failed: {}", e)))?;

            let stats = match merge {
                Ok(stats) => stats,
                Err(err) => {
                    // A failed merge must not block the other tables
                    error!(table = %kind, error = %err, "table assembly failed");
                    continue;
                }
            };

            let target = self.store.publish(kind)?;
            self.state.update(|state| {
                state.tables.insert(
                    kind.name().to_string(),
                    TableRecord {
                        artifact: target
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        rows_written: stats.rows_written,
                        rows_deduped: stats.rows_deduped,
                        shards_merged: stats.shards_merged,
                        published_at: Utc::now(),
                    },
                );
            })?;

            if !self.config.keep_scratch {
                for shard in &staged {
                    let _ = std::fs::remove_file(shard);
                }
            }
        }
        Ok(())
    }

    /// Staged shard paths recorded for a table that are present on disk
    fn staged_shards(&self, kind: TableKind) -> Vec<PathBuf> {
        let staged_dir = self.config.staged_dir();
        self.state.with(|state| {
            state
                .archives
                .values()
                .filter(|record| record.table == kind.name())
                .flat_map(|record| record.parts.iter())
                .filter_map(|part| part.staged.as_ref())
                .map(|name| staged_dir.join(name))
                .filter(|path| path.exists())
                .collect()
        })
    }

    fn cleanup_scratch(&self) {
        if self.config.keep_scratch {
            return;
        }
        // Extracted parts are removed per archive; this sweeps leftovers
        // from interrupted earlier runs. Archives themselves are retained.
        let _ = std::fs::remove_dir_all(self.config.parts_dir());
    }

    fn build_summary(&self, resolution: &Resolution) -> RunSummary {
        let mut summary = RunSummary {
            skipped_entries: resolution.skipped.clone(),
            ..Default::default()
        };

        self.state.with(|state| {
            for &kind in TableKind::ALL {
                let records: Vec<&ArchiveRecord> = state
                    .archives
                    .values()
                    .filter(|record| record.table == kind.name())
                    .collect();
                if records.is_empty() {
                    continue;
                }

                let mut table = TableSummary {
                    table: kind.name().to_string(),
                    shards_attempted: 0,
                    shards_converted: 0,
                    shards_failed: 0,
                    rows_written: 0,
                    rows_malformed: 0,
                    rows_deduped: 0,
                };

                for record in records {
                    if record.parts.is_empty() {
                        // Failed before any part was seen (fetch failure,
                        // corrupt archive): one lost shard.
                        table.shards_attempted += 1;
                        table.shards_failed += 1;
                        continue;
                    }
                    for part in &record.parts {
                        table.shards_attempted += 1;
                        if part.error.is_none() {
                            table.shards_converted += 1;
                        } else {
                            table.shards_failed += 1;
                        }
                        table.rows_malformed += part.rows_malformed;
                        table.rows_deduped += part.rows_deduped;
                    }
                }

                if let Some(published) = state.tables.get(kind.name()) {
                    table.rows_written = published.rows_written;
                    table.rows_deduped += published.rows_deduped;
                }

                summary.tables.push(table);
            }
        });

        summary
    }
}

/// Processes one archive end to end: fetch, extract, convert, record.
struct ArchiveWorker {
    config: PipelineConfig,
    fetcher: ArchiveFetcher,
    store: TableStore,
    state: Arc<StateStore>,
    cancel: CancellationToken,
    download_permits: Arc<Semaphore>,
    convert_permits: Arc<Semaphore>,
}

impl ArchiveWorker {
    async fn process(&self, descriptor: ArchiveDescriptor) -> Result<()> {
        let name = descriptor.file_name.clone();

        if self.already_converted(&descriptor) {
            debug!(archive = %name, "already converted; skipping");
            return Ok(());
        }

        let archive_path = match self.download(&descriptor).await? {
            Some(path) => path,
            // Fetch failure recorded; the archive drops out of its table
            None => return Ok(()),
        };

        self.extract_and_convert(&descriptor, archive_path).await
    }

    /// A converted archive is skipped when its staged shards are still on
    /// disk (awaiting publish) or its table's artifact already exists.
    fn already_converted(&self, descriptor: &ArchiveDescriptor) -> bool {
        let staged_dir = self.config.staged_dir();
        let artifact_exists = self.store.table_path(descriptor.table).exists();
        self.state.with(|state| {
            let Some(record) = state.archives.get(&descriptor.file_name) else {
                return false;
            };
            if record.stage != ArchiveStage::Converted {
                return false;
            }
            let staged_present = !record.parts.is_empty()
                && record
                    .parts
                    .iter()
                    .filter_map(|part| part.staged.as_ref())
                    .all(|shard| staged_dir.join(shard).exists());
            staged_present || artifact_exists
        })
    }

    async fn download(&self, descriptor: &ArchiveDescriptor) -> Result<Option<PathBuf>> {
        let _permit = self
            .download_permits
            .acquire()
            .await
            .map_err(|_| IngestError::Cancelled)?;
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        match self.fetcher.fetch(descriptor, &self.config.download_dir).await {
            Ok(outcome) => {
                let checksum = if outcome.reused {
                    self.state
                        .with(|s| s.archives.get(&descriptor.file_name).and_then(|r| r.sha256.clone()))
                } else {
                    None
                };
                let checksum = match checksum {
                    Some(existing) => existing,
                    None => {
                        let path = outcome.path.clone();
                        tokio::task::spawn_blocking(move || cnpj_common::checksum::sha256_file(path))
                            .await
                            .map_err(|e| IngestError::Config(format!("checksum task failed: {}", e)))??
                    }
                };

                self.state.update(|state| {
                    if let Some(record) = state.archives.get_mut(&descriptor.file_name) {
                        record.stage = ArchiveStage::Downloaded;
                        record.size = Some(outcome.size);
                        record.sha256 = Some(checksum);
                        record.error = None;
                    }
                })?;
                Ok(Some(outcome.path))
            }
            Err(IngestError::Cancelled) => Err(IngestError::Cancelled),
            Err(err) => {
                warn!(archive = %descriptor.file_name, error = %err, "archive excluded from its table");
                self.state.update(|state| {
                    if let Some(record) = state.archives.get_mut(&descriptor.file_name) {
                        record.stage = ArchiveStage::Failed;
                        record.error = Some(err.to_string());
                    }
                })?;
                Ok(None)
            }
        }
    }

    async fn extract_and_convert(
        &self,
        descriptor: &ArchiveDescriptor,
        archive_path: PathBuf,
    ) -> Result<()> {
        let _permit = self
            .convert_permits
            .acquire()
            .await
            .map_err(|_| IngestError::Cancelled)?;
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let archive_stem = descriptor
            .file_name
            .trim_end_matches(".zip")
            .to_string();
        let parts_dir = self.config.parts_dir().join(&archive_stem);
        let staged_dir = self.config.staged_dir();
        let table = descriptor.table;
        let options = ConvertOptions {
            batch_size: self.config.batch_size,
            malformed_row_threshold: self.config.malformed_row_threshold,
        };
        let previous_parts = self
            .state
            .with(|s| s.archives.get(&descriptor.file_name).map(|r| r.parts.clone()))
            .unwrap_or_default();

        let outcome = tokio::task::spawn_blocking(move || {
            convert_archive_parts(
                table,
                &archive_path,
                &parts_dir,
                &staged_dir,
                &options,
                &previous_parts,
            )
        })
        .await
        .map_err(|e| IngestError::Config(format!("convert task failed: {}", e)))?;

        match outcome {
            Ok(parts) => {
                self.state.update(|state| {
                    if let Some(record) = state.archives.get_mut(&descriptor.file_name) {
                        record.stage = ArchiveStage::Converted;
                        record.parts = parts;
                        record.error = None;
                    }
                })?;
                Ok(())
            }
            Err(err) => {
                warn!(archive = %descriptor.file_name, error = %err, "shard lost");
                self.state.update(|state| {
                    if let Some(record) = state.archives.get_mut(&descriptor.file_name) {
                        record.stage = ArchiveStage::Failed;
                        record.error = Some(err.to_string());
                    }
                })?;
                Ok(())
            }
        }
    }
}

/// Blocking half of the extract/convert stage for one archive.
///
/// Parts already staged by a previous interrupted run are reused. The
/// extracted CSV parts are deleted afterwards; they are re-creatable from
/// the retained archive.
fn convert_archive_parts(
    archive_table: TableKind,
    archive_path: &std::path::Path,
    parts_dir: &std::path::Path,
    staged_dir: &std::path::Path,
    options: &ConvertOptions,
    previous: &[PartRecord],
) -> Result<Vec<PartRecord>> {
    let parts = extract_archive(archive_path, parts_dir)?;

    let mut records = Vec::with_capacity(parts.len());
    for part_path in &parts {
        let part_name = part_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        // Inner part names carry the same table infix as the archive; the
        // archive's own classification is the fallback.
        let table = TableKind::from_file_name(&part_name).unwrap_or(archive_table);
        let staged_name = format!("{}__{}.parquet", table.name(), part_name);
        let staged_path = staged_dir.join(&staged_name);

        if let Some(prior) = previous
            .iter()
            .find(|p| p.name == part_name && p.staged.is_some())
        {
            if staged_path.exists() {
                debug!(part = %part_name, "reusing staged shard from previous run");
                records.push(prior.clone());
                continue;
            }
        }

        match convert::convert_part(table, part_path, &staged_path, options) {
            Ok(stats) => records.push(PartRecord {
                name: part_name,
                staged: Some(staged_name),
                rows_read: stats.rows_read,
                rows_written: stats.rows_written,
                rows_malformed: stats.rows_malformed,
                rows_deduped: stats.rows_deduped,
                error: None,
            }),
            Err(IngestError::ConversionFailed { reason, .. }) => {
                records.push(PartRecord {
                    name: part_name,
                    staged: None,
                    error: Some(reason),
                    ..Default::default()
                });
            }
            Err(err) => return Err(err),
        }
    }

    let _ = std::fs::remove_dir_all(parts_dir);
    Ok(records)
}
