//! Top-level run: one configured export from connection to next run state.

use crate::adapters::{
    BcpAdapter, ExportRequest, ExportSourcePlan, FallbackOrchestrator, IncrementalPlan,
};
use crate::cdc::{self, CdcExport};
use crate::config::{ExportSource, ExtractorConfig};
use crate::connection::ConnectionManager;
use crate::error::{ExtractorError, Result};
use crate::incremental::{next_watermark, resolve_incremental_column};
use crate::metadata;
use crate::models::{ColumnMetadata, ExportResult, RunState, TableRef};
use crate::retry::RetryProxy;
use chrono::NaiveDateTime;
use std::path::Path;
use std::sync::Arc;

/// Schema used when neither the table nor the connection names one.
pub const DEFAULT_SCHEMA: &str = "dbo";

/// Result of a run plus the state to persist for the next one.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub result: ExportResult,
    pub state: RunState,
}

/// Runs the configured export.
#[derive(Debug, Clone)]
pub struct Extractor {
    config: ExtractorConfig,
    retry: RetryProxy,
}

impl Extractor {
    /// Validates the configuration; nothing connects yet.
    ///
    /// # Errors
    /// Returns a configuration error for conflicting or incomplete settings
    pub fn new(config: ExtractorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            retry: RetryProxy::default(),
        })
    }

    /// Replaces the connection retry policy.
    pub fn with_retry(mut self, retry: RetryProxy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    async fn connect(&self) -> Result<ConnectionManager> {
        ConnectionManager::connect(Arc::new(self.config.db.clone()), self.retry.clone()).await
    }

    /// Connects and reports the server major version.
    ///
    /// # Errors
    /// Returns the connection error if the server cannot be reached
    pub async fn test_connection(&self) -> Result<i32> {
        let mut conn = self.connect().await?;
        let version = conn.server_major_version().await?;
        tracing::info!("Connection to {} OK, server major version {}", self.config.db, version);
        Ok(version)
    }

    /// Exports into `output_dir/<name>.csv` and computes the next run state.
    ///
    /// Keys of `state` that the export does not use are carried over.
    ///
    /// # Errors
    /// Returns user errors for unknown tables or columns and invalid CDC
    /// windows, and the last adapter error if the export itself fails
    pub async fn run(&self, state: &RunState, output_dir: &Path) -> Result<ExtractionOutcome> {
        tokio::fs::create_dir_all(output_dir).await.map_err(|e| {
            ExtractorError::io(format!("create output directory {}", output_dir.display()), e)
        })?;

        let mut conn = self.connect().await?;
        let (request, window_end) = self.plan_request(&mut conn, state, output_dir).await?;

        let mut orchestrator =
            FallbackOrchestrator::with_default_adapters(BcpAdapter::new(self.config.bcp.clone()));
        let result = orchestrator.export(&mut conn, &request).await?;

        let mut next_state = state.clone();
        if request.incremental().is_some() {
            let previous = state.last_fetched_row();
            if let Some(watermark) = next_watermark(previous.as_deref(), result.watermark.clone()) {
                next_state.set_last_fetched_row(watermark);
            }
        }
        if let Some(window_end) = window_end {
            next_state.set_last_fetched_time(window_end);
        }

        Ok(ExtractionOutcome {
            result,
            state: next_state,
        })
    }

    /// Resolves metadata and builds the adapter request.
    ///
    /// Returns the CDC window end alongside when the export runs in CDC mode.
    async fn plan_request(
        &self,
        conn: &mut ConnectionManager,
        state: &RunState,
        output_dir: &Path,
    ) -> Result<(ExportRequest, Option<NaiveDateTime>)> {
        let export = &self.config.export;
        let mut window_end = None;

        let source = match export.source()? {
            ExportSource::Query(sql) => ExportSourcePlan::Query {
                sql: sql.to_string(),
            },
            ExportSource::Table(table) => {
                let table = qualify_table(table, self.config.db.schema.as_deref());
                let all_columns = metadata::table_columns(conn, &table).await?;
                let columns = select_columns(&table, &all_columns, &export.columns)?;

                let incremental = match export.incremental_fetching_column.as_deref() {
                    Some(name) => {
                        let column = resolve_incremental_column(&table, &all_columns, name)?;
                        if !columns.iter().any(|c| c.name == column.name) {
                            return Err(ExtractorError::user_input(format!(
                                "incremental fetching column '{}' must be one of the exported columns",
                                column.name
                            )));
                        }
                        Some(IncrementalPlan {
                            column,
                            watermark: state.last_fetched_row(),
                            limit: export.incremental_fetching_limit,
                        })
                    }
                    None => None,
                };

                let changes = if export.cdc_mode {
                    let plan =
                        cdc::plan_window(conn, &table, state, export.cdc_mode_full_load_fallback)
                            .await?;
                    window_end = Some(plan.window_end);
                    match plan.export {
                        CdcExport::Changes(window) => Some(window),
                        CdcExport::FullLoad => None,
                    }
                } else {
                    None
                };

                ExportSourcePlan::Table {
                    table,
                    columns,
                    incremental,
                    changes,
                }
            }
        };

        let request = ExportRequest {
            name: export.name.clone(),
            source,
            output_file: output_dir.join(format!("{}.csv", export.name)),
            nolock: export.nolock,
            retries: export.retries,
            disable_bcp: export.disable_bcp,
            disable_fallback: export.disable_fallback,
        };
        Ok((request, window_end))
    }
}

/// Fills in the schema of a table reference that has none.
pub fn qualify_table(table: &TableRef, default_schema: Option<&str>) -> TableRef {
    if table.schema.trim().is_empty() {
        TableRef::new(
            default_schema
                .filter(|schema| !schema.trim().is_empty())
                .unwrap_or(DEFAULT_SCHEMA),
            table.table_name.clone(),
        )
    } else {
        table.clone()
    }
}

/// Applies the column allow-list, keeping its order.
///
/// # Errors
/// Returns a user error naming every allow-listed column the table lacks
pub fn select_columns(
    table: &TableRef,
    all: &[ColumnMetadata],
    allow_list: &[String],
) -> Result<Vec<ColumnMetadata>> {
    if allow_list.is_empty() {
        return Ok(all.to_vec());
    }

    let mut selected = Vec::with_capacity(allow_list.len());
    let mut missing = Vec::new();
    for name in allow_list {
        match all.iter().find(|c| c.name.eq_ignore_ascii_case(name)) {
            Some(column) => selected.push(column.clone()),
            None => missing.push(name.as_str()),
        }
    }

    if missing.is_empty() {
        Ok(selected)
    } else {
        Err(ExtractorError::user_input(format!(
            "columns not found in table '{table}': {}",
            missing.join(", ")
        )))
    }
}
