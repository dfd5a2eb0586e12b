//! Core data models shared by the export engine.
//!
//! These are plain data carriers: table references, column metadata, export
//! results, persisted run state and CDC log sequence numbers.

use crate::error::{ExtractorError, Result};
use crate::type_mapping::{SqlTypeClass, map_sqlserver_type};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Schema-qualified table reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    /// Empty means the connection's default schema
    #[serde(default)]
    pub schema: String,
    pub table_name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table_name: table_name.into(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table_name)
    }
}

/// Column description from the catalog or from result set introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// SQL Server type name, e.g. `nvarchar` or `datetime2`
    pub data_type: String,
    pub is_nullable: bool,
    /// Character length or `precision,scale`, as reported by the server
    pub length: Option<String>,
    pub default_value: Option<String>,
}

impl ColumnMetadata {
    /// Creates a nullable column with no length or default.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable: true,
            length: None,
            default_value: None,
        }
    }

    /// Type family of this column.
    pub fn type_class(&self) -> SqlTypeClass {
        map_sqlserver_type(&self.data_type)
    }
}

/// Export strategy identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// External `bcp` bulk-copy process
    Bcp,
    /// Driver cursor streamed to CSV
    Streaming,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bcp => write!(f, "bcp"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// Outcome of one completed export.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub output_file: PathBuf,
    pub row_count: u64,
    /// Output column names, in file order
    pub columns: Vec<String>,
    /// Whether the first CSV line is a header
    pub has_header: bool,
    /// Next resumption value of the incremental column
    pub watermark: Option<String>,
    pub produced_by: AdapterKind,
}

/// Key holding the incremental watermark.
pub const LAST_FETCHED_ROW: &str = "lastFetchedRow";
/// Key holding the CDC window end time.
pub const LAST_FETCHED_TIME: &str = "lastFetchedTime";

/// State persisted between runs.
///
/// An opaque JSON object; only [`LAST_FETCHED_ROW`] and
/// [`LAST_FETCHED_TIME`] are interpreted, other keys survive untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunState(Map<String, Value>);

impl RunState {
    /// Empty state for a first run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored watermark, rendered as the literal text to compare against.
    pub fn last_fetched_row(&self) -> Option<String> {
        match self.0.get(LAST_FETCHED_ROW)? {
            Value::String(value) => Some(value.clone()),
            Value::Number(value) => Some(value.to_string()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn set_last_fetched_row(&mut self, value: impl Into<String>) {
        self.0
            .insert(LAST_FETCHED_ROW.to_string(), Value::String(value.into()));
    }

    /// Stored CDC window end.
    ///
    /// # Errors
    /// Returns a configuration error if the stored value is not a timestamp.
    pub fn last_fetched_time(&self) -> Result<Option<NaiveDateTime>> {
        let Some(value) = self.0.get(LAST_FETCHED_TIME) else {
            return Ok(None);
        };
        let Some(text) = value.as_str() else {
            return Err(ExtractorError::configuration(format!(
                "state key '{LAST_FETCHED_TIME}' must be a timestamp string"
            )));
        };
        parse_state_timestamp(text).map(Some)
    }

    pub fn set_last_fetched_time(&mut self, time: NaiveDateTime) {
        self.0.insert(
            LAST_FETCHED_TIME.to_string(),
            Value::String(time.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        );
    }

    /// Raw access for keys the engine does not interpret.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

fn parse_state_timestamp(text: &str) -> Result<NaiveDateTime> {
    text.parse::<NaiveDateTime>()
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|e| {
            ExtractorError::configuration(format!(
                "state key '{LAST_FETCHED_TIME}' is not a valid timestamp ('{text}'): {e}"
            ))
        })
}

/// CDC log sequence number: 10 opaque bytes, ordered bytewise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn([u8; 10]);

impl Lsn {
    pub fn new(bytes: [u8; 10]) -> Self {
        Self(bytes)
    }

    /// Builds an LSN from a driver binary value.
    ///
    /// # Errors
    /// Returns a query error if the value is not exactly 10 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 10] = bytes.try_into().map_err(|_| {
            ExtractorError::user_input(format!(
                "CDC returned an LSN of {} bytes, expected 10",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Binary literal usable inside T-SQL, e.g. `0x0000002A000001F00003`.
    pub fn to_sql_literal(&self) -> String {
        format!("0x{}", hex::encode_upper(self.0))
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_sql_literal())
    }
}
