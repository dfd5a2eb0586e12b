//! SQL Server to CSV export tool.
//!
//! Runs one configured export per invocation: bcp when it can, driver
//! streaming otherwise. The new run state is written next to the CSV so the
//! following run resumes where this one stopped.
//!
//! Exit codes: 0 on success, 1 for user errors, 2 for everything else.

use clap::Parser;
use mssql_extract::{Cli, Command, EXIT_APPLICATION_ERROR, exit_code, result_json};
use mssql_extract_core::init_logging;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(
        cli.global.verbose,
        cli.global.quiet,
        cli.global.log_format.into(),
    ) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::from(EXIT_APPLICATION_ERROR);
    }

    match execute(&cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn execute(command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Run(args) => {
            let outcome = mssql_extract::run_export(args).await?;
            info!(
                "✓ Exported {} rows to {} using {}",
                outcome.result.row_count,
                outcome.result.output_file.display(),
                outcome.result.produced_by
            );
            println!("{}", result_json(&outcome.result)?);
            Ok(())
        }
        Command::Test(args) => {
            info!("Testing database connection...");
            let version = mssql_extract::test_connection(args).await?;
            info!("✓ Connection test successful");
            println!("Connection successful (SQL Server major version {version})");
            Ok(())
        }
    }
}
