//! `cnpj status` command implementation
//!
//! Shows the persisted run state: per-stage archive counts and the
//! published tables.

use colored::Colorize;
use cnpj_ingest::{ArchiveStage, PipelineConfig, StateStore, TableStore};

use crate::error::Result;
use crate::progress::format_bytes;

/// Show run-state and table-store status
pub fn run(config: &PipelineConfig) -> Result<()> {
    let state = StateStore::open(&config.state_path)
        .map_err(|e| crate::error::CliError::State(e.to_string()))?;

    let (total, downloaded, converted, failed) = state.with(|s| {
        let mut downloaded = 0;
        let mut converted = 0;
        let mut failed = 0;
        for record in s.archives.values() {
            match record.stage {
                ArchiveStage::Downloaded => downloaded += 1,
                ArchiveStage::Converted => converted += 1,
                ArchiveStage::Failed => failed += 1,
                ArchiveStage::Pending => {}
            }
        }
        (s.archives.len(), downloaded, converted, failed)
    });

    if total == 0 {
        println!("No run state found.");
        println!("Run 'cnpj run' to start a pipeline run.");
        return Ok(());
    }

    println!("{}", "Archives:".cyan().bold());
    println!("  Total:      {}", total);
    println!("  Downloaded: {}", downloaded);
    println!("  Converted:  {}", converted);
    if failed > 0 {
        println!("  Failed:     {}", failed.to_string().red());
        state.with(|s| {
            for (name, record) in &s.archives {
                if record.stage == ArchiveStage::Failed {
                    let reason = record.error.as_deref().unwrap_or("unknown");
                    println!("    {} {}", name.red(), reason);
                }
            }
        });
    }
    println!();

    let store = TableStore::new(&config.output_dir)?;
    let reports = store.report()?;
    if reports.is_empty() {
        println!("No tables published yet.");
        return Ok(());
    }

    println!("{}", "Published Tables:".cyan().bold());
    for report in reports {
        println!(
            "  {:<20} {:>10} rows  {:>10}",
            report.table,
            report.rows,
            format_bytes(report.size_bytes)
        );
    }

    Ok(())
}
