//! Export strategies and the orchestrator that chooses between them.
//!
//! An adapter turns an [`ExportRequest`] into a CSV file. It either runs to
//! completion, fails after trying, or declines with a skip reason when it does
//! not apply to the request. The [`FallbackOrchestrator`] walks the adapters in
//! priority order and treats a skip as "try the next one".
//!
//! # Module Structure
//! - `bcp`: external `bcp` bulk-copy process
//! - `streaming`: driver cursor streamed to CSV
//! - `fallback`: ordered orchestration

pub mod bcp;
pub mod fallback;
pub mod streaming;

pub use bcp::BcpAdapter;
pub use fallback::FallbackOrchestrator;
pub use streaming::StreamingAdapter;

use crate::connection::ConnectionManager;
use crate::error::{ExtractorError, Result};
use crate::models::{AdapterKind, ColumnMetadata, ExportResult, Lsn, TableRef};
use crate::query::{
    CdcWindow, IS_DELETED_COLUMN, IncrementalClause, QueryFactory, SelectSource, SelectSpec,
};
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Why an adapter did not produce a result.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The adapter does not apply to this request; try the next one
    #[error("skipped: {0}")]
    Skipped(String),

    /// The adapter ran and failed
    #[error(transparent)]
    Failed(#[from] ExtractorError),
}

impl AdapterError {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }
}

/// Result type for adapter runs.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// One export strategy.
///
/// `C` is the session the adapter talks to the server through; production
/// adapters use [`ConnectionManager`].
#[async_trait]
pub trait ExportAdapter<C: ?Sized + Send = ConnectionManager>: Send {
    /// Which strategy this is.
    fn kind(&self) -> AdapterKind;

    /// Writes the request's rows to `request.output_file`.
    ///
    /// # Errors
    /// Returns [`AdapterError::Skipped`] when the adapter does not apply and
    /// [`AdapterError::Failed`] when it ran and could not finish
    async fn export(&mut self, conn: &mut C, request: &ExportRequest) -> AdapterResult<ExportResult>;
}

/// Incremental fetching settings with the column resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalPlan {
    pub column: ColumnMetadata,
    /// Watermark stored by the previous run
    pub watermark: Option<String>,
    pub limit: Option<u64>,
}

/// Owned CDC window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeWindow {
    pub capture_instance: String,
    pub from_lsn: Lsn,
    pub to_lsn: Lsn,
}

/// What the adapters read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportSourcePlan {
    /// A table, optionally through its CDC change function
    Table {
        table: TableRef,
        /// Selected columns in output order
        columns: Vec<ColumnMetadata>,
        incremental: Option<IncrementalPlan>,
        changes: Option<ChangeWindow>,
    },
    /// A user-supplied query, exported as is
    Query { sql: String },
}

/// Fully resolved export, ready for an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub name: String,
    pub source: ExportSourcePlan,
    pub output_file: PathBuf,
    pub nolock: bool,
    /// Retry cap for the streaming export
    pub retries: u32,
    pub disable_bcp: bool,
    pub disable_fallback: bool,
}

impl ExportRequest {
    /// Whether the source is a user query.
    pub fn is_raw_query(&self) -> bool {
        matches!(self.source, ExportSourcePlan::Query { .. })
    }

    /// Incremental settings, for table exports that have them.
    pub fn incremental(&self) -> Option<&IncrementalPlan> {
        match &self.source {
            ExportSourcePlan::Table { incremental, .. } => incremental.as_ref(),
            ExportSourcePlan::Query { .. } => None,
        }
    }

    /// Output column names of a table export, in file order.
    pub fn table_output_columns(&self) -> Vec<String> {
        match &self.source {
            ExportSourcePlan::Table {
                columns, changes, ..
            } => {
                let mut names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
                if changes.is_some() {
                    names.push(IS_DELETED_COLUMN.to_string());
                }
                names
            }
            ExportSourcePlan::Query { .. } => Vec::new(),
        }
    }

    /// SELECT statement for a table export.
    ///
    /// # Errors
    /// Returns a configuration error for query exports, or a user error if
    /// the stored watermark is not a valid literal
    pub fn table_select(&self, factory: &QueryFactory) -> Result<String> {
        let ExportSourcePlan::Table {
            table,
            columns,
            incremental,
            changes,
        } = &self.source
        else {
            return Err(ExtractorError::configuration(format!(
                "export '{}' is query based and has no table SELECT",
                self.name
            )));
        };

        let source = match changes {
            Some(window) => SelectSource::Changes(CdcWindow {
                capture_instance: &window.capture_instance,
                from_lsn: window.from_lsn,
                to_lsn: window.to_lsn,
            }),
            None => SelectSource::Table(table),
        };

        factory.select(&SelectSpec {
            source,
            columns,
            nolock: self.nolock,
            incremental: incremental.as_ref().map(|plan| IncrementalClause {
                column: &plan.column,
                watermark: plan.watermark.as_deref(),
                limit: plan.limit,
            }),
        })
    }
}
