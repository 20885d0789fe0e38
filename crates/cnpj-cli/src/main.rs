//! CNPJ CLI - Main entry point

use clap::Parser;
use cnpj_cli::commands::run::RunOutcome;
use cnpj_cli::{Cli, Commands};
use cnpj_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Verbose mode logs debug to the console; normal runs keep the console
    // for the summary and send info+ to the log file.
    let log_config = if cli.verbose {
        LogConfig::builder()
            .level(LogLevel::Debug)
            .output(LogOutput::Console)
            .log_file_prefix("cnpj-cli".to_string())
            .build()
    } else {
        LogConfig::builder()
            .level(LogLevel::Warn)
            .output(LogOutput::Console)
            .log_file_prefix("cnpj-cli".to_string())
            .build()
    };
    // Explicit environment configuration wins over the flag defaults
    let log_config = if std::env::var("CNPJ_LOG_LEVEL").is_ok() {
        LogConfig::from_env().unwrap_or(log_config)
    } else {
        log_config
    };
    let _ = init_logging(&log_config);

    let exit_code = match execute_command(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            1
        }
    };
    process::exit(exit_code);
}

/// Execute the CLI command, returning the process exit code
async fn execute_command(cli: &Cli) -> cnpj_cli::Result<i32> {
    let config = cli.pipeline_config();

    match &cli.command {
        Commands::Run { .. } => match cnpj_cli::commands::run::run(config).await? {
            RunOutcome::Success => Ok(0),
            // At least one table has no usable data; operators must look
            // before trusting the table store
            RunOutcome::TablesFailed => Ok(1),
        },
        Commands::Status => {
            cnpj_cli::commands::status::run(&config)?;
            Ok(0)
        }
        Commands::Clean { state, archives } => {
            cnpj_cli::commands::clean::run(&config, *state, *archives)?;
            Ok(0)
        }
    }
}
