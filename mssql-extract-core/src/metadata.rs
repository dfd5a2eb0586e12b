//! Catalog lookups: table columns, result set description and CDC mapping.
//!
//! All catalog SQL lives here. Object names are passed as parameters, never
//! spliced into the statement text.

use crate::connection::{ConnectionManager, read_column, read_named_column};
use crate::error::{ExtractorError, Result};
use crate::models::{ColumnMetadata, Lsn, TableRef};
use crate::query::quote_table;
use chrono::NaiveDateTime;
use tiberius::Row;

const TABLE_COLUMNS_QUERY: &str = "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE,
       CASE
           WHEN CHARACTER_MAXIMUM_LENGTH IS NOT NULL
               THEN CAST(CHARACTER_MAXIMUM_LENGTH AS NVARCHAR(20))
           WHEN DATA_TYPE IN ('decimal', 'numeric')
               THEN CAST(NUMERIC_PRECISION AS NVARCHAR(10)) + N',' + CAST(NUMERIC_SCALE AS NVARCHAR(10))
       END AS COLUMN_LENGTH,
       COLUMN_DEFAULT
FROM INFORMATION_SCHEMA.COLUMNS
WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
ORDER BY ORDINAL_POSITION";

const DESCRIBE_QUERY: &str = "EXEC sp_describe_first_result_set @tsql = @P1";

const CAPTURE_INSTANCE_QUERY: &str = "SELECT TOP 1 capture_instance
FROM cdc.change_tables
WHERE source_object_id = OBJECT_ID(@P1)
ORDER BY create_date DESC";

const MIN_LSN_QUERY: &str = "SELECT sys.fn_cdc_get_min_lsn(@P1)";

const SERVER_TIME_QUERY: &str = "SELECT SYSDATETIME()";

/// Direction of a time to LSN mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsnRelation {
    /// First LSN committed after the time
    SmallestGreaterThan,
    /// Last LSN committed at or before the time
    LargestLessThanOrEqual,
}

impl LsnRelation {
    fn as_sql(self) -> &'static str {
        match self {
            Self::SmallestGreaterThan => "smallest greater than",
            Self::LargestLessThanOrEqual => "largest less than or equal",
        }
    }
}

/// Columns of a table in ordinal order.
///
/// # Errors
/// Returns a user error if the table does not exist or has no visible columns
pub async fn table_columns(
    conn: &mut ConnectionManager,
    table: &TableRef,
) -> Result<Vec<ColumnMetadata>> {
    let rows = conn
        .fetch_all(TABLE_COLUMNS_QUERY, &[table.schema.as_str(), table.table_name.as_str()])
        .await?;

    let columns = rows
        .iter()
        .map(column_from_catalog_row)
        .collect::<Result<Vec<_>>>()?;

    if columns.is_empty() {
        return Err(ExtractorError::user_input(format!(
            "table '{table}' does not exist or has no columns visible to this login"
        )));
    }

    tracing::debug!("Table {} has {} columns", table, columns.len());
    Ok(columns)
}

fn column_from_catalog_row(row: &Row) -> Result<ColumnMetadata> {
    let name: &str = read_column(row, 0, "column name")?
        .ok_or_else(|| ExtractorError::user_input("catalog returned a column without a name"))?;
    let data_type: &str = read_column(row, 1, "column type")?.unwrap_or_default();
    let is_nullable: Option<&str> = read_column(row, 2, "column nullability")?;
    let length: Option<&str> = read_column(row, 3, "column length")?;
    let default_value: Option<&str> = read_column(row, 4, "column default")?;

    Ok(ColumnMetadata {
        name: name.to_string(),
        data_type: data_type.to_string(),
        is_nullable: is_nullable == Some("YES"),
        length: length.map(String::from),
        default_value: default_value.map(String::from),
    })
}

/// Describes the first result set of a statement without running it.
///
/// Unnamed result columns come back with an empty name. Requires SQL
/// Server 2012 or newer.
///
/// # Errors
/// Returns a query error if the server cannot describe the statement
pub async fn describe_query(conn: &mut ConnectionManager, sql: &str) -> Result<Vec<ColumnMetadata>> {
    let rows = conn.fetch_all(DESCRIBE_QUERY, &[sql]).await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows {
        if read_named_column::<bool>(row, "is_hidden", "describe is_hidden")?.unwrap_or(false) {
            continue;
        }
        let name: Option<&str> = read_named_column(row, "name", "describe name")?;
        let data_type: Option<&str> = read_named_column(row, "system_type_name", "describe type")?;
        let is_nullable: Option<bool> = read_named_column(row, "is_nullable", "describe nullability")?;

        columns.push(ColumnMetadata {
            name: name.unwrap_or_default().to_string(),
            data_type: data_type.unwrap_or_default().to_string(),
            is_nullable: is_nullable.unwrap_or(true),
            length: None,
            default_value: None,
        });
    }
    Ok(columns)
}

/// Newest CDC capture instance of a table, if CDC is enabled for it.
///
/// # Errors
/// Returns a query error if the CDC catalog cannot be read
pub async fn capture_instance(
    conn: &mut ConnectionManager,
    table: &TableRef,
) -> Result<Option<String>> {
    let rows = conn
        .fetch_all(CAPTURE_INSTANCE_QUERY, &[quote_table(table).as_str()])
        .await?;
    match rows.first() {
        Some(row) => Ok(read_column::<&str>(row, 0, "capture instance")?.map(String::from)),
        None => Ok(None),
    }
}

/// Lowest LSN still available for a capture instance.
///
/// # Errors
/// Returns a query error if the lookup fails
pub async fn min_lsn(conn: &mut ConnectionManager, capture_instance: &str) -> Result<Option<Lsn>> {
    let rows = conn.fetch_all(MIN_LSN_QUERY, &[capture_instance]).await?;
    first_lsn(&rows)
}

/// Maps a point in time to an LSN.
///
/// # Errors
/// Returns a query error if the lookup fails
pub async fn map_time_to_lsn(
    conn: &mut ConnectionManager,
    relation: LsnRelation,
    time: NaiveDateTime,
) -> Result<Option<Lsn>> {
    let sql = format!(
        "SELECT sys.fn_cdc_map_time_to_lsn(N'{}', CONVERT(DATETIME2(6), @P1, 126))",
        relation.as_sql()
    );
    let time = time.format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
    let rows = conn.fetch_all(&sql, &[time.as_str()]).await?;
    first_lsn(&rows)
}

/// First LSN of a result; the all-zero LSN means "none" to the CDC functions.
fn first_lsn(rows: &[Row]) -> Result<Option<Lsn>> {
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    let lsn = read_column::<&[u8]>(row, 0, "LSN")?
        .map(Lsn::from_slice)
        .transpose()?;
    Ok(lsn.filter(|lsn| *lsn != Lsn::new([0; 10])))
}

/// Current server time.
///
/// # Errors
/// Returns a query error if the server time cannot be read
pub async fn server_time(conn: &mut ConnectionManager) -> Result<NaiveDateTime> {
    let rows = conn.fetch_all(SERVER_TIME_QUERY, &[]).await?;
    let time = match rows.first() {
        Some(row) => read_column::<NaiveDateTime>(row, 0, "server time")?,
        None => None,
    };
    time.ok_or_else(|| ExtractorError::user_input("server did not return its current time"))
}

/// Scalar text result of a single-value query.
///
/// # Errors
/// Returns a query error if the statement fails
pub async fn scalar_text(conn: &mut ConnectionManager, sql: &str) -> Result<Option<String>> {
    let rows = conn.fetch_all(sql, &[]).await?;
    match rows.first() {
        Some(row) => Ok(read_column::<&str>(row, 0, "scalar value")?.map(String::from)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_sql() {
        assert_eq!(
            LsnRelation::SmallestGreaterThan.as_sql(),
            "smallest greater than"
        );
        assert_eq!(
            LsnRelation::LargestLessThanOrEqual.as_sql(),
            "largest less than or equal"
        );
    }

    #[test]
    fn test_catalog_queries_are_parameterized() {
        for sql in [
            TABLE_COLUMNS_QUERY,
            DESCRIBE_QUERY,
            CAPTURE_INSTANCE_QUERY,
            MIN_LSN_QUERY,
        ] {
            assert!(sql.contains("@P1"), "{sql}");
        }
    }
}
