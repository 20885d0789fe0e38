//! `cnpj run` command implementation
//!
//! Executes the full pipeline end to end, resuming completed stages from
//! the persisted run state. Ctrl-C aborts cleanly between stages; a later
//! invocation picks up where the run stopped.

use colored::Colorize;
use cnpj_ingest::{Pipeline, PipelineConfig, RunSummary};
use tracing::info;

use crate::error::Result;
use crate::progress::{create_spinner, format_bytes};

/// Outcome the caller maps to the process exit code
pub enum RunOutcome {
    /// All attempted tables have usable data
    Success,
    /// At least one table ended with zero usable shards
    TablesFailed,
}

/// Run the full pipeline
pub async fn run(config: PipelineConfig) -> Result<RunOutcome> {
    let pipeline = Pipeline::new(config)?;

    // Ctrl-C cancels between stages; state is persisted for resumption
    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received; finishing in-flight work...");
            cancel.cancel();
        }
    });

    let spinner = create_spinner("Running pipeline (resolve, download, convert)...");
    let summary = pipeline.run().await;
    spinner.finish_and_clear();

    let summary = summary?;
    print_summary(&summary);
    print_store_report(&pipeline)?;

    if summary.has_failed_tables() {
        info!("run finished with failed tables");
        Ok(RunOutcome::TablesFailed)
    } else {
        info!("run finished successfully");
        Ok(RunOutcome::Success)
    }
}

fn print_summary(summary: &RunSummary) {
    println!("{}", "Run Summary:".cyan().bold());
    println!();

    for table in &summary.tables {
        let status = if table.is_failed() {
            "FAILED".red().bold()
        } else if table.shards_failed > 0 {
            "PARTIAL".yellow().bold()
        } else {
            "OK".green().bold()
        };
        println!("{} {}", table.table.green(), status);
        println!(
            "  Shards:    {}/{} converted ({} failed)",
            table.shards_converted, table.shards_attempted, table.shards_failed
        );
        println!("  Rows:      {}", table.rows_written);
        if table.rows_malformed > 0 {
            println!("  Malformed: {} dropped", table.rows_malformed);
        }
        if table.rows_deduped > 0 {
            println!("  Duplicates: {} removed", table.rows_deduped);
        }
        println!();
    }

    if !summary.skipped_entries.is_empty() {
        println!(
            "Skipped {} unrecognized catalog entries: {}",
            summary.skipped_entries.len(),
            summary.skipped_entries.join(", ")
        );
        println!();
    }
}

fn print_store_report(pipeline: &Pipeline) -> Result<()> {
    let reports = pipeline.store().report()?;
    if reports.is_empty() {
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
