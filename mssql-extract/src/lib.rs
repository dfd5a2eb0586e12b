//! Library module for mssql-extract
//!
//! Argument parsing, run-state files and exit code mapping live here so they
//! can be tested without spawning the binary. The main binary functionality
//! is in main.rs.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use mssql_extract_core::{
    ExportResult, ExtractionOutcome, Extractor, ExtractorConfig, ExtractorError, LogFormat,
    RunState,
};
use std::path::{Path, PathBuf};

/// Exit code for errors the operator can fix (configuration, missing objects)
pub const EXIT_USER_ERROR: u8 = 1;
/// Exit code for everything else
pub const EXIT_APPLICATION_ERROR: u8 = 2;

/// CLI argument structure
#[derive(Debug, Parser)]
#[command(name = "mssql-extract")]
#[command(about = "Export SQL Server tables and queries to CSV")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = "
mssql-extract - SQL Server to CSV export

Exports one table or query per run. The bcp utility is used when it is
available and applicable; otherwise rows are streamed through the driver.
Incremental and CDC exports resume from the state file of the previous run.

EXAMPLES:
  mssql-extract run --config export.json --state state.json --output-dir out/
  mssql-extract test --config export.json
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the configured export
    Run(RunArgs),
    /// Test the database connection
    Test(TestArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Configuration file (JSON)
    #[arg(long, env = "MSSQL_EXTRACT_CONFIG", value_name = "FILE")]
    pub config: PathBuf,

    /// State of the previous run; a missing file means first run
    #[arg(long, env = "MSSQL_EXTRACT_STATE", value_name = "FILE")]
    pub state: Option<PathBuf>,

    /// Directory the CSV file is written to
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// Where to write the new state (defaults to --state)
    #[arg(long, value_name = "FILE")]
    pub state_out: Option<PathBuf>,
}

impl RunArgs {
    /// Destination of the new run state, if any.
    pub fn state_destination(&self) -> Option<&Path> {
        self.state_out.as_deref().or(self.state.as_deref())
    }
}

#[derive(Debug, Args)]
pub struct TestArgs {
    /// Configuration file (JSON)
    #[arg(long, env = "MSSQL_EXTRACT_CONFIG", value_name = "FILE")]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormatArg {
    #[default]
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => Self::Text,
            LogFormatArg::Json => Self::Json,
        }
    }
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all log output except errors")]
    pub quiet: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,
}

/// Loads the previous run state.
///
/// A missing file is a first run and yields an empty state.
///
/// # Errors
/// Returns an error if the file exists but cannot be read or parsed
pub fn load_state(path: Option<&Path>) -> Result<RunState, ExtractorError> {
    let Some(path) = path else {
        return Ok(RunState::new());
    };
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No state file at {}, starting fresh", path.display());
            return Ok(RunState::new());
        }
        Err(e) => {
            return Err(ExtractorError::io(
                format!("read state file {}", path.display()),
                e,
            ));
        }
    };
    if content.trim().is_empty() {
        return Ok(RunState::new());
    }
    serde_json::from_str(&content).map_err(|e| ExtractorError::Serialization {
        context: format!("parse state file {}", path.display()),
        source: e,
    })
}

/// Writes the run state as pretty-printed JSON.
///
/// # Errors
/// Returns an error if the state cannot be serialized or written
pub fn write_state(path: &Path, state: &RunState) -> Result<(), ExtractorError> {
    let json = serde_json::to_string_pretty(state).map_err(|e| ExtractorError::Serialization {
        context: "serialize run state".to_string(),
        source: e,
    })?;
    std::fs::write(path, json)
        .map_err(|e| ExtractorError::io(format!("write state file {}", path.display()), e))
}

/// Loads the configuration and runs the export.
///
/// # Errors
/// Returns configuration, connection and export errors with context
pub async fn run_export(args: &RunArgs) -> anyhow::Result<ExtractionOutcome> {
    let config = ExtractorConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration {}", args.config.display()))?;
    let state = load_state(args.state.as_deref())?;

    tracing::info!(
        "Exporting '{}' from {} into {}",
        config.export.name,
        config.db,
        args.output_dir.display()
    );
    let outcome = Extractor::new(config)?.run(&state, &args.output_dir).await?;

    if let Some(destination) = args.state_destination() {
        write_state(destination, &outcome.state)?;
        tracing::debug!("Wrote state to {}", destination.display());
    }
    Ok(outcome)
}

/// Loads the configuration and checks the connection.
///
/// # Errors
/// Returns the configuration or connection error
pub async fn test_connection(args: &TestArgs) -> anyhow::Result<i32> {
    let config = ExtractorConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration {}", args.config.display()))?;
    Ok(Extractor::new(config)?.test_connection().await?)
}

/// Summary printed on stdout after a successful run.
pub fn result_json(result: &ExportResult) -> anyhow::Result<String> {
    serde_json::to_string_pretty(result).context("Failed to serialize export result")
}

/// Maps an error to the process exit code.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<ExtractorError>() {
        Some(e) if e.is_user_error() => EXIT_USER_ERROR,
        _ => EXIT_APPLICATION_ERROR,
    }
}
