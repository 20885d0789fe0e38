//! Archive extraction stage
//!
//! Unpacks downloaded zip archives into the scratch directory. The inner
//! part file names are preserved (the registry encodes the table identity
//! in them), so conversion can re-associate every part with its logical
//! table. Scratch contents are disposable: everything here can be
//! re-created from the retained archives.
//!
//! An unreadable archive or entry is [`IngestError::CorruptArchive`],
//! fatal for that shard's contribution only, never for sibling archives of
//! the same table.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::{IngestError, Result};

/// Extract every regular entry of `archive_path` into `scratch_dir`.
///
/// Returns the extracted part paths, sorted by file name. Entry paths are
/// flattened to their basename; the registry's archives contain no
/// meaningful directory structure.
pub fn extract_archive(archive_path: &Path, scratch_dir: &Path) -> Result<Vec<PathBuf>> {
    let archive_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| archive_path.display().to_string());
    let corrupt = |reason: String| IngestError::CorruptArchive {
        archive: archive_name.clone(),
        reason,
    };

    std::fs::create_dir_all(scratch_dir)?;

    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;

    let mut extracted = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| corrupt(format!("entry {}: {}", index, e)))?;
        if entry.is_dir() {
            continue;
        }

        let entry_name = entry.name().to_string();
        let Some(base_name) = entry_name.rsplit('/').next().filter(|n| !n.is_empty()) else {
            continue;
        };

        let out_path = scratch_dir.join(base_name);
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| corrupt(format!("entry {}: {}", base_name, e)))?;

        debug!(archive = %archive_name, part = %base_name, "extracted part");
        extracted.push(out_path);
    }

    extracted.sort();
    info!(
        archive = %archive_name,
        parts = extracted.len(),
        "archive extracted"
    );

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn extracts_parts_preserving_names() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("Empresas0.zip");
        std::fs::write(
            &archive_path,
            build_zip(&[("K3241.K03200Y0.D50913.EMPRECSV", b"1;2\n")]),
        )
        .unwrap();

        let scratch = dir.path().join("scratch");
        let parts = extract_archive(&archive_path, &scratch).unwrap();

        assert_eq!(parts.len(), 1);
        assert_eq!(
            parts[0].file_name().unwrap().to_str().unwrap(),
            "K3241.K03200Y0.D50913.EMPRECSV"
        );
        assert_eq!(std::fs::read(&parts[0]).unwrap(), b"1;2\n");
    }

    #[test]
    fn flattens_nested_entry_paths() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("Socios0.zip");
        std::fs::write(
            &archive_path,
            build_zip(&[("inner/dir/SOCIOCSV", b"a;b\n")]),
        )
        .unwrap();

        let parts = extract_archive(&archive_path, &dir.path().join("scratch")).unwrap();
        assert_eq!(parts[0].file_name().unwrap().to_str().unwrap(), "SOCIOCSV");
    }

    #[test]
    fn garbage_archive_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("Empresas0.zip");
        std::fs::write(&archive_path, b"definitely not a zip").unwrap();

        let err = extract_archive(&archive_path, &dir.path().join("scratch")).unwrap_err();
        assert!(matches!(err, IngestError::CorruptArchive { .. }));
    }

    #[test]
    fn missing_archive_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_archive(
            &dir.path().join("Nope.zip"),
            &dir.path().join("scratch"),
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::Io(_)));
    }
}
