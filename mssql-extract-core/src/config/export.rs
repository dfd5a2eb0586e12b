//! Per-export configuration and its up-front validation.

use crate::error::{ExtractorError, Result};
use crate::models::TableRef;
use serde::{Deserialize, Serialize};

/// Where the exported rows come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportSource<'a> {
    /// User-supplied SELECT statement
    Query(&'a str),
    /// Whole table (optionally restricted to a column allow-list)
    Table(&'a TableRef),
}

/// One export: what to read and how.
///
/// Exactly one of `query` and `table` is set; [`ExportConfig::validate`]
/// enforces this together with the other flag combinations before any
/// connection is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    /// Output name, used for the CSV file name and log context
    pub name: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub table: Option<TableRef>,
    /// Column allow-list, in output order; empty means every column
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub incremental_fetching_column: Option<String>,
    /// Maximum rows fetched per incremental run
    #[serde(default)]
    pub incremental_fetching_limit: Option<u64>,
    /// Retry attempts for the streaming export
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub nolock: bool,
    #[serde(default)]
    pub disable_bcp: bool,
    #[serde(default)]
    pub disable_fallback: bool,
    #[serde(default)]
    pub cdc_mode: bool,
    #[serde(default)]
    pub cdc_mode_full_load_fallback: bool,
}

fn default_retries() -> u32 {
    5
}

impl ExportConfig {
    /// Creates a table export with default flags.
    pub fn for_table(name: impl Into<String>, table: TableRef) -> Self {
        Self::empty(name.into(), None, Some(table))
    }

    /// Creates a query export with default flags.
    pub fn for_query(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self::empty(name.into(), Some(query.into()), None)
    }

    fn empty(name: String, query: Option<String>, table: Option<TableRef>) -> Self {
        Self {
            name,
            query,
            table,
            columns: Vec::new(),
            incremental_fetching_column: None,
            incremental_fetching_limit: None,
            retries: default_retries(),
            nolock: false,
            disable_bcp: false,
            disable_fallback: false,
            cdc_mode: false,
            cdc_mode_full_load_fallback: false,
        }
    }

    /// Builder method to restrict the exported columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to enable incremental fetching.
    pub fn with_incremental_fetching(mut self, column: impl Into<String>, limit: Option<u64>) -> Self {
        self.incremental_fetching_column = Some(column.into());
        self.incremental_fetching_limit = limit;
        self
    }

    pub fn with_nolock(mut self, nolock: bool) -> Self {
        self.nolock = nolock;
        self
    }

    pub fn with_disable_bcp(mut self, disable: bool) -> Self {
        self.disable_bcp = disable;
        self
    }

    pub fn with_disable_fallback(mut self, disable: bool) -> Self {
        self.disable_fallback = disable;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Builder method to enable CDC mode.
    pub fn with_cdc(mut self, full_load_fallback: bool) -> Self {
        self.cdc_mode = true;
        self.cdc_mode_full_load_fallback = full_load_fallback;
        self
    }

    /// Whether this export resumes from a watermark.
    pub fn is_incremental_fetching(&self) -> bool {
        self.incremental_fetching_column.is_some()
    }

    /// The export source.
    ///
    /// # Errors
    /// Returns a configuration error unless exactly one source is set
    pub fn source(&self) -> Result<ExportSource<'_>> {
        match (self.query.as_deref(), self.table.as_ref()) {
            (Some(query), None) => Ok(ExportSource::Query(query)),
            (None, Some(table)) => Ok(ExportSource::Table(table)),
            (Some(_), Some(_)) => Err(ExtractorError::configuration(format!(
                "export '{}': 'query' and 'table' are mutually exclusive",
                self.name
            ))),
            (None, None) => Err(ExtractorError::configuration(format!(
                "export '{}': one of 'query' or 'table' is required",
                self.name
            ))),
        }
    }

    /// Rejects conflicting or incomplete settings.
    ///
    /// # Errors
    /// Returns a configuration error describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ExtractorError::configuration("export name cannot be empty"));
        }
        if self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(ExtractorError::configuration(format!(
                "export name '{}' must be a plain file name",
                self.name
            )));
        }

        if self.disable_bcp && self.disable_fallback {
            return Err(ExtractorError::configuration(format!(
                "export '{}': 'disableBcp' and 'disableFallback' cannot both be set, \
                 no export strategy would remain",
                self.name
            )));
        }

        let source = self.source()?;

        if let ExportSource::Table(table) = source
            && table.table_name.trim().is_empty()
        {
            return Err(ExtractorError::configuration(format!(
                "export '{}': table name cannot be empty",
                self.name
            )));
        }

        if let ExportSource::Query(query) = source {
            if query.trim().is_empty() {
                return Err(ExtractorError::configuration(format!(
                    "export '{}': query cannot be empty",
                    self.name
                )));
            }
            if self.is_incremental_fetching() {
                return Err(ExtractorError::configuration(format!(
                    "export '{}': incremental fetching is not supported for custom queries",
                    self.name
                )));
            }
            if self.cdc_mode {
                return Err(ExtractorError::configuration(format!(
                    "export '{}': CDC mode is not supported for custom queries",
                    self.name
                )));
            }
            if !self.columns.is_empty() {
                return Err(ExtractorError::configuration(format!(
                    "export '{}': 'columns' cannot be combined with a custom query",
                    self.name
                )));
            }
        }

        if self.cdc_mode && self.is_incremental_fetching() {
            return Err(ExtractorError::configuration(format!(
                "export '{}': CDC mode and incremental fetching are mutually exclusive",
                self.name
            )));
        }

        if self.incremental_fetching_limit.is_some() && !self.is_incremental_fetching() {
            return Err(ExtractorError::configuration(format!(
                "export '{}': 'incrementalFetchingLimit' requires 'incrementalFetchingColumn'",
                self.name
            )));
        }

        if self.incremental_fetching_limit == Some(0) {
            return Err(ExtractorError::configuration(format!(
                "export '{}': 'incrementalFetchingLimit' must be greater than 0",
                self.name
            )));
        }

        Ok(())
    }
}
