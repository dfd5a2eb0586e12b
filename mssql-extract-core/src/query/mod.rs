//! SELECT statement generation for both output encodings.
//!
//! The bulk-copy path needs every string pre-quoted and datetimes truncated,
//! because bcp character mode writes values verbatim. The streaming path gets
//! driver-safe expressions and lets the CSV writer do the quoting.

pub mod casting;

pub use casting::{column_expression, comparison_expression};

use crate::error::{ExtractorError, Result};
use crate::models::{ColumnMetadata, Lsn, TableRef};
use crate::type_mapping::SqlTypeClass;
use regex::Regex;
use std::sync::LazyLock;

/// Name of the derived deletion flag in CDC exports.
pub const IS_DELETED_COLUMN: &str = "is_deleted";

/// Alias of the derived table wrapping a raw query for bcp.
const RAW_QUERY_ALIAS: &str = "[bcp_query]";

static NUMERIC_LITERAL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^-?[0-9]+(\.[0-9]+)?([eE][-+]?[0-9]+)?$").ok());
static BINARY_LITERAL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^0[xX][0-9A-Fa-f]*$").ok());

/// Which adapter the statement is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEncoding {
    /// Driver-safe expressions for the streaming adapter
    Raw,
    /// Pre-quoted, second-precision expressions for bcp
    Bcp,
}

/// Bracket-quotes an identifier, doubling `]`.
pub fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// `[schema].[table]`
pub fn quote_table(table: &TableRef) -> String {
    format!(
        "{}.{}",
        quote_identifier(&table.schema),
        quote_identifier(&table.table_name)
    )
}

/// `'value'` with `'` doubled.
pub fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `N'value'` with `'` doubled.
pub fn quote_nstring(value: &str) -> String {
    format!("N{}", quote_string(value))
}

/// Renders a stored watermark as a literal comparable with `column`.
///
/// Numeric and binary values are emitted unquoted and must look like
/// literals of that kind; everything else becomes a quoted string.
///
/// # Errors
/// Returns a user error if an unquoted value is not a valid literal
pub fn watermark_literal(value: &str, column: &ColumnMetadata) -> Result<String> {
    let class = column.type_class();
    if !class.is_unquoted_literal() {
        return Ok(quote_string(value));
    }

    let pattern = match class {
        SqlTypeClass::RowVersion | SqlTypeClass::Binary => &BINARY_LITERAL,
        _ => &NUMERIC_LITERAL,
    };
    let value = value.trim();
    if pattern.as_ref().is_some_and(|p| p.is_match(value)) {
        Ok(value.to_string())
    } else {
        Err(ExtractorError::user_input(format!(
            "stored watermark '{value}' is not a valid {} value for column '{}'",
            column.data_type, column.name
        )))
    }
}

/// Incremental fetching parameters.
#[derive(Debug, Clone, Copy)]
pub struct IncrementalClause<'a> {
    pub column: &'a ColumnMetadata,
    /// Previous watermark; rows `>=` it are fetched again
    pub watermark: Option<&'a str>,
    pub limit: Option<u64>,
}

/// Change window read from a CDC capture instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdcWindow<'a> {
    pub capture_instance: &'a str,
    pub from_lsn: Lsn,
    pub to_lsn: Lsn,
}

/// Row source of a table-backed SELECT.
#[derive(Debug, Clone, Copy)]
pub enum SelectSource<'a> {
    Table(&'a TableRef),
    Changes(CdcWindow<'a>),
}

/// Everything needed to build a table-backed SELECT.
#[derive(Debug, Clone, Copy)]
pub struct SelectSpec<'a> {
    pub source: SelectSource<'a>,
    /// Columns in output order
    pub columns: &'a [ColumnMetadata],
    pub nolock: bool,
    pub incremental: Option<IncrementalClause<'a>>,
}

/// Builds statements for one output encoding.
#[derive(Debug, Clone, Copy)]
pub struct QueryFactory {
    encoding: OutputEncoding,
}

impl QueryFactory {
    pub fn new(encoding: OutputEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> OutputEncoding {
        self.encoding
    }

    /// Builds a table or change-table SELECT.
    ///
    /// # Errors
    /// Returns a user error if the previous watermark is not a valid literal
    /// for the incremental column
    ///
    /// # Example
    /// ```rust
    /// use mssql_extract_core::models::{ColumnMetadata, TableRef};
    /// use mssql_extract_core::query::{OutputEncoding, QueryFactory, SelectSource, SelectSpec};
    ///
    /// let table = TableRef::new("dbo", "orders");
    /// let columns = vec![ColumnMetadata::new("id", "int")];
    /// let sql = QueryFactory::new(OutputEncoding::Raw)
    ///     .select(&SelectSpec {
    ///         source: SelectSource::Table(&table),
    ///         columns: &columns,
    ///         nolock: true,
    ///         incremental: None,
    ///     })
    ///     .unwrap();
    /// assert_eq!(sql, "SELECT [id] FROM [dbo].[orders] WITH (NOLOCK)");
    /// ```
    pub fn select(&self, spec: &SelectSpec<'_>) -> Result<String> {
        let mut select_list: Vec<String> = spec
            .columns
            .iter()
            .map(|column| column_expression(column, self.encoding))
            .collect();

        let mut sql = String::new();
        let from = match spec.source {
            SelectSource::Table(table) => {
                let mut from = quote_table(table);
                if spec.nolock {
                    from.push_str(" WITH (NOLOCK)");
                }
                from
            }
            SelectSource::Changes(window) => {
                // table hints do not apply to table-valued functions
                if spec.nolock {
                    sql.push_str("SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED; ");
                }
                select_list.push(format!(
                    "CASE WHEN [__$operation] = 1 THEN 1 ELSE 0 END AS {}",
                    quote_identifier(IS_DELETED_COLUMN)
                ));
                format!(
                    "[cdc].{}({}, {}, N'all') AS [changes]",
                    quote_identifier(&format!(
                        "fn_cdc_get_all_changes_{}",
                        window.capture_instance
                    )),
                    window.from_lsn.to_sql_literal(),
                    window.to_lsn.to_sql_literal()
                )
            }
        };

        sql.push_str("SELECT ");
        if let Some(limit) = spec.incremental.and_then(|inc| inc.limit) {
            sql.push_str(&format!("TOP {limit} "));
        }
        sql.push_str(&select_list.join(", "));
        sql.push_str(" FROM ");
        sql.push_str(&from);

        if let Some(incremental) = spec.incremental {
            let column = quote_identifier(&incremental.column.name);
            if let Some(watermark) = incremental.watermark {
                let literal = watermark_literal(watermark, incremental.column)?;
                sql.push_str(&format!(" WHERE {column} >= {literal}"));
            }
            sql.push_str(&format!(" ORDER BY {column}"));
        } else if matches!(spec.source, SelectSource::Changes(_)) {
            sql.push_str(" ORDER BY [__$start_lsn], [__$seqval]");
            // the isolation level outlives the batch on a pooled connection
            if spec.nolock {
                sql.push_str("; SET TRANSACTION ISOLATION LEVEL READ COMMITTED");
            }
        }

        Ok(sql)
    }

    /// Wraps a user query so its columns get this encoding's casts.
    ///
    /// The raw encoding returns the query unchanged.
    pub fn wrap_query(&self, query: &str, columns: &[ColumnMetadata]) -> String {
        match self.encoding {
            OutputEncoding::Raw => query.to_string(),
            OutputEncoding::Bcp => {
                let select_list = columns
                    .iter()
                    .map(|column| column_expression(column, self.encoding))
                    .collect::<Vec<_>>()
                    .join(", ");
                let inner = query.trim().trim_end_matches(';').trim_end();
                format!("SELECT {select_list} FROM ({inner}) AS {RAW_QUERY_ALIAS}")
            }
        }
    }
}

/// Follow-up query recovering the full-precision incremental value of the
/// row bcp wrote last.
///
/// `last_row` pairs each exported column with its text in the output file.
/// Columns whose text form cannot be compared reliably are left out of the
/// match.
pub fn watermark_recovery_query(
    table: &TableRef,
    incremental: &ColumnMetadata,
    last_row: &[(&ColumnMetadata, &str)],
    nolock: bool,
) -> String {
    let conditions = last_row
        .iter()
        .filter_map(|(column, value)| {
            comparison_expression(column)
                .map(|expr| format!("COALESCE({expr}, N'') = {}", quote_nstring(value)))
        })
        .collect::<Vec<_>>();

    let mut sql = format!(
        "SELECT CONVERT(NVARCHAR(40), MAX({}), 121) FROM {}",
        quote_identifier(&incremental.name),
        quote_table(table)
    );
    if nolock {
        sql.push_str(" WITH (NOLOCK)");
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableRef {
        TableRef::new("dbo", "orders")
    }

    fn columns() -> Vec<ColumnMetadata> {
        vec![
            ColumnMetadata::new("id", "int"),
            ColumnMetadata::new("name", "nvarchar"),
            ColumnMetadata::new("updated_at", "datetime2"),
        ]
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("plain"), "[plain]");
        assert_eq!(quote_identifier("we]ird"), "[we]]ird]");
        assert_eq!(quote_table(&TableRef::new("s p", "t")), "[s p].[t]");
    }

    #[test]
    fn test_watermark_literal_quoting() {
        let id = ColumnMetadata::new("id", "bigint");
        let rv = ColumnMetadata::new("rv", "rowversion");
        let small = ColumnMetadata::new("s", "smalldatetime");
        let name = ColumnMetadata::new("n", "varchar");

        assert_eq!(watermark_literal("42", &id).unwrap(), "42");
        assert_eq!(watermark_literal("-1.5", &id).unwrap(), "-1.5");
        assert_eq!(
            watermark_literal("0x00000000000007D1", &rv).unwrap(),
            "0x00000000000007D1"
        );
        assert_eq!(
            watermark_literal("2024-01-01 10:00:00", &small).unwrap(),
            "'2024-01-01 10:00:00'"
        );
        assert_eq!(watermark_literal("O'Brien", &name).unwrap(), "'O''Brien'");
    }

    #[test]
    fn test_watermark_literal_rejects_injection() {
        let id = ColumnMetadata::new("id", "int");
        assert!(watermark_literal("1; DROP TABLE x", &id).is_err());
        let rv = ColumnMetadata::new("rv", "timestamp");
        assert!(watermark_literal("0xZZ", &rv).is_err());
    }

    #[test]
    fn test_plain_table_select() {
        let table = orders();
        let columns = columns();
        let sql = QueryFactory::new(OutputEncoding::Raw)
            .select(&SelectSpec {
                source: SelectSource::Table(&table),
                columns: &columns,
                nolock: false,
                incremental: None,
            })
            .unwrap();
        assert_eq!(sql, "SELECT [id], [name], [updated_at] FROM [dbo].[orders]");
    }

    #[test]
    fn test_incremental_select_with_limit() {
        let table = orders();
        let columns = columns();
        let sql = QueryFactory::new(OutputEncoding::Raw)
            .select(&SelectSpec {
                source: SelectSource::Table(&table),
                columns: &columns,
                nolock: true,
                incremental: Some(IncrementalClause {
                    column: &columns[0],
                    watermark: Some("5"),
                    limit: Some(100),
                }),
            })
            .unwrap();
        assert_eq!(
            sql,
            "SELECT TOP 100 [id], [name], [updated_at] FROM [dbo].[orders] WITH (NOLOCK) \
             WHERE [id] >= 5 ORDER BY [id]"
        );
    }

    #[test]
    fn test_first_incremental_run_has_order_but_no_where() {
        let table = orders();
        let columns = columns();
        let sql = QueryFactory::new(OutputEncoding::Bcp)
            .select(&SelectSpec {
                source: SelectSource::Table(&table),
                columns: &columns,
                nolock: false,
                incremental: Some(IncrementalClause {
                    column: &columns[2],
                    watermark: None,
                    limit: None,
                }),
            })
            .unwrap();
        assert!(!sql.contains("WHERE"));
        assert!(!sql.contains("TOP"));
        assert!(sql.ends_with("ORDER BY [updated_at]"));
        assert!(sql.contains("CONVERT(DATETIME2(0), [updated_at]) AS [updated_at]"));
    }

    #[test]
    fn test_datetime_watermark_is_quoted() {
        let table = orders();
        let columns = columns();
        let sql = QueryFactory::new(OutputEncoding::Raw)
            .select(&SelectSpec {
                source: SelectSource::Table(&table),
                columns: &columns,
                nolock: false,
                incremental: Some(IncrementalClause {
                    column: &columns[2],
                    watermark: Some("2024-01-01 10:00:00.1234567"),
                    limit: None,
                }),
            })
            .unwrap();
        assert!(sql.contains("WHERE [updated_at] >= '2024-01-01 10:00:00.1234567'"));
    }

    #[test]
    fn test_cdc_select() {
        let columns = vec![ColumnMetadata::new("id", "int")];
        let window = CdcWindow {
            capture_instance: "dbo_orders",
            from_lsn: Lsn::new([0, 0, 0, 0x2a, 0, 0, 0, 0, 0, 1]),
            to_lsn: Lsn::new([0, 0, 0, 0x2b, 0, 0, 0, 0, 0, 1]),
        };
        let sql = QueryFactory::new(OutputEncoding::Raw)
            .select(&SelectSpec {
                source: SelectSource::Changes(window),
                columns: &columns,
                nolock: true,
                incremental: None,
            })
            .unwrap();
        assert_eq!(
            sql,
            "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED; \
             SELECT [id], CASE WHEN [__$operation] = 1 THEN 1 ELSE 0 END AS [is_deleted] \
             FROM [cdc].[fn_cdc_get_all_changes_dbo_orders](0x0000002A000000000001, \
             0x0000002B000000000001, N'all') AS [changes] ORDER BY [__$start_lsn], [__$seqval]; \
             SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
        );
    }

    #[test]
    fn test_wrap_query() {
        let columns = vec![
            ColumnMetadata::new("id", "int"),
            ColumnMetadata::new("label", "varchar(20)"),
        ];
        let raw = QueryFactory::new(OutputEncoding::Raw).wrap_query("SELECT 1", &columns);
        assert_eq!(raw, "SELECT 1");

        let bcp = QueryFactory::new(OutputEncoding::Bcp)
            .wrap_query("SELECT id, label FROM t;  ", &columns);
        assert!(bcp.starts_with("SELECT [id], '\"' + REPLACE("));
        assert!(bcp.ends_with("FROM (SELECT id, label FROM t) AS [bcp_query]"));
    }

    #[test]
    fn test_watermark_recovery_query() {
        let table = orders();
        let columns = vec![
            ColumnMetadata::new("updated_at", "datetime"),
            ColumnMetadata::new("name", "varchar"),
            ColumnMetadata::new("price", "float"),
        ];
        let last_row = vec![
            (&columns[0], "2024-01-01 10:00:00"),
            (&columns[1], "O'Brien"),
            (&columns[2], "1.5"),
        ];
        let sql = watermark_recovery_query(&table, &columns[0], &last_row, false);
        assert_eq!(
            sql,
            "SELECT CONVERT(NVARCHAR(40), MAX([updated_at]), 121) FROM [dbo].[orders] \
             WHERE COALESCE(CONVERT(NVARCHAR(MAX), CONVERT(DATETIME2(0), [updated_at]), 120), N'') \
             = N'2024-01-01 10:00:00' AND COALESCE(CAST([name] AS NVARCHAR(MAX)), N'') = N'O''Brien'"
        );
    }
}
