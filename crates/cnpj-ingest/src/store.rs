//! Table store
//!
//! The output directory holding one columnar artifact per logical table,
//! addressed by the table's canonical name. This directory is the sole
//! contract surface toward downstream readers: any engine that can scan
//! parquet can query it, and no reader ever observes a partially written
//! artifact, because tables are assembled at a hidden staging path in the
//! same directory and promoted with an atomic rename.

use std::fs::File;
use std::path::{Path, PathBuf};

use parquet::file::reader::{FileReader, SerializedFileReader};
use tracing::info;

use crate::dictionary::TableKind;
use crate::error::Result;

/// Summary of one published artifact, for the end-of-run report
#[derive(Debug, Clone)]
pub struct TableReport {
    pub table: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub rows: i64,
}

/// Directory of published columnar tables
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final artifact path for a logical table
    pub fn table_path(&self, kind: TableKind) -> PathBuf {
        self.root.join(format!("{}.parquet", kind.name()))
    }

    /// Staging path the merge step writes to before promotion. Lives in the
    /// store directory so the final rename never crosses a filesystem.
    pub fn staging_path(&self, kind: TableKind) -> PathBuf {
        self.root.join(format!(".{}.parquet.tmp", kind.name()))
    }

    /// Atomically promote a fully assembled staging file to its final name
    pub fn publish(&self, kind: TableKind) -> Result<PathBuf> {
        let staging = self.staging_path(kind);
        let target = self.table_path(kind);
        std::fs::rename(&staging, &target)?;
        info!(table = %kind, path = %target.display(), "table published");
        Ok(target)
    }

    /// Summarize every published artifact from its parquet footer
    pub fn report(&self) -> Result<Vec<TableReport>> {
        let mut reports = Vec::new();
        for &kind in TableKind::ALL {
            let path = self.table_path(kind);
            let Ok(metadata) = std::fs::metadata(&path) else {
                continue;
            };
            let reader = SerializedFileReader::new(File::open(&path)?)?;
            let rows = reader.metadata().file_metadata().num_rows();
            reports.push(TableReport {
                table: kind.name().to_string(),
                path,
                size_bytes: metadata.len(),
                rows,
            });
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{merge_shards, ConvertOptions};

    #[test]
    fn publish_promotes_staging_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path()).unwrap();

        // Assemble a tiny artifact at the staging path
        let part = dir.path().join("CNAECSV");
        std::fs::write(&part, b"001;Alpha\n").unwrap();
        let shard = dir.path().join("shard.parquet");
        crate::convert::convert_part(
            TableKind::EconomicActivities,
            &part,
            &shard,
            &ConvertOptions::default(),
        )
        .unwrap();
        merge_shards(
            TableKind::EconomicActivities,
            &[shard],
            &store.staging_path(TableKind::EconomicActivities),
        )
        .unwrap();

        let published = store.publish(TableKind::EconomicActivities).unwrap();
        assert_eq!(published, store.table_path(TableKind::EconomicActivities));
        assert!(published.exists());
        assert!(!store
            .staging_path(TableKind::EconomicActivities)
            .exists());
    }

    #[test]
    fn report_reads_rows_from_parquet_footer() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path()).unwrap();

        let part = dir.path().join("MUNICCSV");
        std::fs::write(&part, b"0001;CAMPINAS\n0002;SANTOS\n").unwrap();
        let shard = dir.path().join("shard.parquet");
        crate::convert::convert_part(
            TableKind::Municipalities,
            &part,
            &shard,
            &ConvertOptions::default(),
        )
        .unwrap();
        merge_shards(
            TableKind::Municipalities,
            &[shard],
            &store.staging_path(TableKind::Municipalities),
        )
        .unwrap();
        store.publish(TableKind::Municipalities).unwrap();

        let reports = store.report().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].table, "municipios");
        assert_eq!(reports[0].rows, 2);
        assert!(reports[0].size_bytes > 0);
    }

    #[test]
    fn report_skips_unpublished_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path()).unwrap();
        assert!(store.report().unwrap().is_empty());
    }
}
