//! Bulk-copy export through the external `bcp` utility.
//!
//! bcp is fast but blunt: character mode writes values verbatim, so the
//! SELECT pre-quotes strings and truncates datetimes, and the output file is
//! validated afterwards. Raw queries need their column names from
//! `sp_describe_first_result_set`, which only exists on SQL Server 2012 and
//! newer.

mod output;

pub use output::{OutputSummary, strip_delimiter_nuls, validate_output};

use super::{AdapterError, AdapterResult, ExportAdapter, ExportRequest, ExportSourcePlan};
use crate::config::{BcpOptions, DatabaseConfig};
use crate::connection::{ConnectionManager, server_address, trusts_server_certificate};
use crate::error::{ExtractorError, Result};
use crate::incremental;
use crate::metadata;
use crate::models::{AdapterKind, ColumnMetadata, ExportResult};
use crate::query::{OutputEncoding, QueryFactory};
use crate::security::mask_password_args;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Oldest server major version whose raw queries bcp can export.
pub const MIN_RAW_QUERY_SERVER_VERSION: i32 = 11;

/// Exports through a `bcp ... queryout` subprocess.
#[derive(Debug, Clone, Default)]
pub struct BcpAdapter {
    options: BcpOptions,
}

impl BcpAdapter {
    pub fn new(options: BcpOptions) -> Self {
        Self { options }
    }

    /// Command line arguments, password included.
    ///
    /// Log them only through [`mask_password_args`].
    pub fn command_args(
        &self,
        config: &DatabaseConfig,
        relaxed_verification: bool,
        sql: &str,
        output_file: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            sql.to_string(),
            "queryout".to_string(),
            output_file.display().to_string(),
            "-S".to_string(),
            server_address(config),
            "-U".to_string(),
            config.credentials.username().to_string(),
            "-P".to_string(),
            config.credentials.expose_password().to_string(),
        ];
        if let Some(database) = &config.database {
            args.push("-d".to_string());
            args.push(database.clone());
        }
        for flag in ["-q", "-k", "-c", "-t", ",", "-r", "\\n"] {
            args.push(flag.to_string());
        }
        args.push("-b".to_string());
        args.push(self.options.batch_size.to_string());
        args.push("-m".to_string());
        args.push(self.options.max_errors.to_string());
        if trusts_server_certificate(config, relaxed_verification) {
            args.push("-u".to_string());
        }
        args
    }

    /// Runs bcp and returns its stderr.
    async fn run_bcp(&self, args: &[String]) -> AdapterResult<String> {
        tracing::info!(
            "Running {} {}",
            self.options.binary.display(),
            mask_password_args(args).join(" ")
        );

        let output = match tokio::process::Command::new(&self.options.binary)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AdapterError::skipped(format!(
                    "bcp executable '{}' not found",
                    self.options.binary.display()
                )));
            }
            Err(e) => {
                return Err(ExtractorError::io(
                    format!("start {}", self.options.binary.display()),
                    e,
                )
                .into());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        tracing::debug!("bcp stdout: {}", stdout.trim());

        if !output.status.success() {
            return Err(ExtractorError::bulk_copy(format!(
                "bcp exited with {}\nstdout: {}\nstderr: {}",
                output.status,
                stdout.trim(),
                stderr.trim()
            ))
            .into());
        }
        Ok(stderr)
    }
}

/// Rejects described result sets bcp cannot wrap in a derived table.
fn check_described_columns(columns: &[ColumnMetadata]) -> std::result::Result<(), String> {
    if columns.is_empty() {
        return Err("query returns no result set".to_string());
    }
    let mut seen = HashSet::new();
    for column in columns {
        if column.name.is_empty() {
            return Err("query has an unnamed result column".to_string());
        }
        if !seen.insert(column.name.to_lowercase()) {
            return Err(format!(
                "query has duplicate result column '{}'",
                column.name
            ));
        }
    }
    Ok(())
}

/// Raw queries need `sp_describe_first_result_set`, which older servers lack.
fn check_server_version(
    is_raw_query: bool,
    server_major_version: i32,
) -> std::result::Result<(), String> {
    if is_raw_query && server_major_version < MIN_RAW_QUERY_SERVER_VERSION {
        return Err(format!(
            "server major version {server_major_version} cannot describe raw queries"
        ));
    }
    Ok(())
}

async fn post_process(
    output_file: PathBuf,
    expected_columns: usize,
    stderr: String,
    strip_nuls: bool,
) -> Result<OutputSummary> {
    tokio::task::spawn_blocking(move || {
        if strip_nuls {
            strip_delimiter_nuls(&output_file)?;
        }
        validate_output(&output_file, expected_columns, &stderr)
    })
    .await
    .map_err(|e| {
        ExtractorError::io(
            "post-process bcp output",
            std::io::Error::other(e.to_string()),
        )
    })?
}

#[async_trait]
impl ExportAdapter for BcpAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Bcp
    }

    async fn export(
        &mut self,
        conn: &mut ConnectionManager,
        request: &ExportRequest,
    ) -> AdapterResult<ExportResult> {
        if request.disable_bcp {
            return Err(AdapterError::skipped("bcp disabled by configuration"));
        }

        let factory = QueryFactory::new(OutputEncoding::Bcp);
        let (sql, columns) = match &request.source {
            ExportSourcePlan::Table { .. } => (
                request.table_select(&factory)?,
                request.table_output_columns(),
            ),
            ExportSourcePlan::Query { sql } => {
                let version = conn.server_major_version().await?;
                check_server_version(request.is_raw_query(), version)
                    .map_err(AdapterError::Skipped)?;
                let described = metadata::describe_query(conn, sql).await?;
                check_described_columns(&described).map_err(AdapterError::Skipped)?;
                let names = described.iter().map(|c| c.name.clone()).collect();
                (factory.wrap_query(sql, &described), names)
            }
        };

        let args = self.command_args(
            conn.config(),
            conn.relaxed_verification(),
            &sql,
            &request.output_file,
        );
        let stderr = self.run_bcp(&args).await?;

        let summary = post_process(
            request.output_file.clone(),
            columns.len(),
            stderr,
            request.is_raw_query(),
        )
        .await?;

        let watermark = match (request.incremental(), &request.source, &summary.last_row) {
            (
                Some(plan),
                ExportSourcePlan::Table {
                    table,
                    columns: table_columns,
                    ..
                },
                Some(last_row),
            ) => {
                incremental::resolve_bcp_watermark(
                    conn,
                    table,
                    table_columns,
                    &plan.column,
                    last_row,
                    request.nolock,
                )
                .await?
            }
            _ => None,
        };

        tracing::info!(
            "bcp exported {} rows to {}",
            summary.row_count,
            request.output_file.display()
        );

        Ok(ExportResult {
            output_file: request.output_file.clone(),
            row_count: summary.row_count,
            columns,
            has_header: false,
            watermark,
            produced_by: AdapterKind::Bcp,
        })
    }
}
