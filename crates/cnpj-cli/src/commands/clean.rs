//! `cnpj clean` command implementation
//!
//! Removes scratch data. Scratch is always safe to delete: everything in it
//! can be re-created from the retained archives. The run state and the
//! archives themselves are only removed when explicitly requested.

use cnpj_ingest::PipelineConfig;

use crate::error::Result;

/// Clean scratch (and optionally state / archives)
pub fn run(config: &PipelineConfig, clean_state: bool, clean_archives: bool) -> Result<()> {
    remove_dir(&config.scratch_dir, "scratch directory")?;

    if clean_state {
        match std::fs::remove_file(&config.state_path) {
            Ok(()) => println!("Removed run state {}", config.state_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    if clean_archives {
        remove_dir(&config.download_dir, "archive directory")?;
    }

    Ok(())
}

fn remove_dir(path: &std::path::Path, label: &str) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {
            println!("Removed {} {}", label, path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_removes_scratch_but_keeps_archives() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            scratch_dir: dir.path().join("scratch"),
            download_dir: dir.path().join("archives"),
            state_path: dir.path().join("run_state.json"),
            ..Default::default()
        };
        std::fs::create_dir_all(&config.scratch_dir).unwrap();
        std::fs::create_dir_all(&config.download_dir).unwrap();
        std::fs::write(&config.state_path, "{}").unwrap();

        run(&config, false, false).unwrap();

        assert!(!config.scratch_dir.exists());
        assert!(config.download_dir.exists());
        assert!(config.state_path.exists());
    }

    #[test]
    fn clean_state_and_archives_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            scratch_dir: dir.path().join("scratch"),
            download_dir: dir.path().join("archives"),
            state_path: dir.path().join("run_state.json"),
            ..Default::default()
        };
        std::fs::create_dir_all(&config.download_dir).unwrap();
        std::fs::write(&config.state_path, "{}").unwrap();

        run(&config, true, true).unwrap();

        assert!(!config.download_dir.exists());
        assert!(!config.state_path.exists());
    }

    #[test]
    fn clean_is_a_no_op_on_fresh_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            scratch_dir: dir.path().join("scratch"),
            download_dir: dir.path().join("archives"),
            state_path: dir.path().join("run_state.json"),
            ..Default::default()
        };
        run(&config, true, true).unwrap();
    }
}
