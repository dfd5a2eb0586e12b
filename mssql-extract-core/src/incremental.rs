//! Incremental fetching: column checks and watermark resolution.
//!
//! A watermark is the text of the incremental column in the last exported
//! row. The next run selects `column >= watermark`, so the boundary row is
//! exported again on purpose. Most types can be read straight from the output
//! file; `datetime`/`datetime2` values written by bcp are truncated to whole
//! seconds and are recovered from the source row instead.

use crate::connection::ConnectionManager;
use crate::error::{ExtractorError, Result};
use crate::metadata;
use crate::models::{ColumnMetadata, TableRef};
use crate::query::watermark_recovery_query;
use crate::type_mapping::{SqlTypeClass, base_type_name};

/// How the watermark of a column is obtained after a bcp export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkRead {
    /// The exported text is the exact value
    Direct,
    /// The exported text is truncated; query the source row
    Recover,
}

/// Checks that a column can drive incremental fetching.
///
/// # Errors
/// Returns [`ExtractorError::UnsupportedIncrementalColumn`] for types
/// without a usable ordering
pub fn bcp_watermark_read(column: &ColumnMetadata) -> Result<WatermarkRead> {
    match column.type_class() {
        SqlTypeClass::Numeric(_) | SqlTypeClass::RowVersion | SqlTypeClass::SmallDateTime => {
            Ok(WatermarkRead::Direct)
        }
        SqlTypeClass::OtherTemporal if base_type_name(&column.data_type) != "time" => {
            Ok(WatermarkRead::Direct)
        }
        SqlTypeClass::DateTime => Ok(WatermarkRead::Recover),
        _ => Err(ExtractorError::UnsupportedIncrementalColumn {
            column: column.name.clone(),
            data_type: column.data_type.clone(),
        }),
    }
}

/// Finds and validates the incremental column among the table columns.
///
/// # Errors
/// Returns a user error if the column does not exist, or
/// [`ExtractorError::UnsupportedIncrementalColumn`] for unusable types
pub fn resolve_incremental_column(
    table: &TableRef,
    columns: &[ColumnMetadata],
    name: &str,
) -> Result<ColumnMetadata> {
    let column = columns
        .iter()
        .find(|column| column.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| {
            ExtractorError::user_input(format!(
                "incremental fetching column '{name}' not found in table '{table}'"
            ))
        })?;
    bcp_watermark_read(column)?;
    Ok(column.clone())
}

/// Picks the next watermark.
///
/// An export that returned no rows keeps the previous watermark.
pub fn next_watermark(previous: Option<&str>, exported: Option<String>) -> Option<String> {
    exported.or_else(|| previous.map(String::from))
}

/// Watermark of a bcp export, from the last line of its output.
///
/// `columns` are the exported table columns in file order and `last_row` the
/// fields of the last line. Returns `None` when the value is NULL or the
/// source row can no longer be matched; the caller then keeps the previous
/// watermark.
///
/// # Errors
/// Returns a query error if the recovery query fails
pub async fn resolve_bcp_watermark(
    conn: &mut ConnectionManager,
    table: &TableRef,
    columns: &[ColumnMetadata],
    incremental: &ColumnMetadata,
    last_row: &[String],
    nolock: bool,
) -> Result<Option<String>> {
    let Some(index) = columns
        .iter()
        .position(|column| column.name == incremental.name)
    else {
        return Err(ExtractorError::user_input(format!(
            "incremental fetching column '{}' is not part of the exported columns",
            incremental.name
        )));
    };
    let Some(value) = last_row.get(index).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };

    match bcp_watermark_read(incremental)? {
        WatermarkRead::Direct => Ok(Some(value.clone())),
        WatermarkRead::Recover => {
            let pairs: Vec<(&ColumnMetadata, &str)> = columns
                .iter()
                .zip(last_row.iter().map(String::as_str))
                .collect();
            let sql = watermark_recovery_query(table, incremental, &pairs, nolock);
            let recovered = metadata::scalar_text(conn, &sql).await?;
            if recovered.is_none() {
                tracing::warn!(
                    "Could not match the last exported row of {} to recover '{}'; keeping the previous watermark",
                    table,
                    incremental.name
                );
            }
            Ok(recovered)
        }
    }
}
