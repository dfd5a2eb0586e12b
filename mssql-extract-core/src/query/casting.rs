//! Per-column select expressions for each output encoding.

use super::{OutputEncoding, quote_identifier};
use crate::models::ColumnMetadata;
use crate::type_mapping::{NumericKind, SqlTypeClass};

/// Select-list expression for one column.
///
/// Every transformed expression keeps the column name as its alias so that
/// both encodings expose identical column names.
pub fn column_expression(column: &ColumnMetadata, encoding: OutputEncoding) -> String {
    let name = quote_identifier(&column.name);
    match (column.type_class(), encoding) {
        (SqlTypeClass::RowVersion, _) => {
            format!("CONVERT(VARCHAR(MAX), CONVERT(BINARY(8), {name}), 1) AS {name}")
        }
        (SqlTypeClass::LargeText, OutputEncoding::Raw) => {
            format!("CAST({name} AS NVARCHAR(MAX)) AS {name}")
        }
        (SqlTypeClass::LargeText | SqlTypeClass::String, OutputEncoding::Bcp) => {
            format!("{} AS {name}", quote_wrapped(&name))
        }
        (SqlTypeClass::DateTime, OutputEncoding::Bcp) => {
            format!("CONVERT(DATETIME2(0), {name}) AS {name}")
        }
        _ => name,
    }
}

/// CSV quoting done server side: bcp character mode cannot quote fields.
///
/// NULL becomes an empty quoted field.
fn quote_wrapped(expression: &str) -> String {
    format!(
        "'\"' + REPLACE(COALESCE(CAST({expression} AS NVARCHAR(MAX)), ''), '\"', '\"\"') + '\"'"
    )
}

/// Expression rendering a column the way bcp character mode writes it.
///
/// Used to find the source row behind the last line of a bcp export. Returns
/// `None` for types whose text form is not stable enough to compare on.
pub fn comparison_expression(column: &ColumnMetadata) -> Option<String> {
    let name = quote_identifier(&column.name);
    match column.type_class() {
        SqlTypeClass::String | SqlTypeClass::LargeText => {
            Some(format!("CAST({name} AS NVARCHAR(MAX))"))
        }
        SqlTypeClass::DateTime => Some(format!(
            "CONVERT(NVARCHAR(MAX), CONVERT(DATETIME2(0), {name}), 120)"
        )),
        SqlTypeClass::SmallDateTime => Some(format!("CONVERT(NVARCHAR(MAX), {name}, 120)")),
        SqlTypeClass::OtherTemporal
        | SqlTypeClass::Numeric(NumericKind::Integer | NumericKind::Decimal | NumericKind::Bit) => {
            Some(format!("CONVERT(NVARCHAR(MAX), {name})"))
        }
        SqlTypeClass::Numeric(NumericKind::Money | NumericKind::Approximate)
        | SqlTypeClass::RowVersion
        | SqlTypeClass::Binary
        | SqlTypeClass::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str) -> ColumnMetadata {
        ColumnMetadata::new(name, data_type)
    }

    #[test]
    fn test_rowversion_same_in_both_encodings() {
        let rv = column("rv", "timestamp");
        let expected = "CONVERT(VARCHAR(MAX), CONVERT(BINARY(8), [rv]), 1) AS [rv]";
        assert_eq!(column_expression(&rv, OutputEncoding::Raw), expected);
        assert_eq!(column_expression(&rv, OutputEncoding::Bcp), expected);
    }

    #[test]
    fn test_large_text() {
        let notes = column("notes", "ntext");
        assert_eq!(
            column_expression(&notes, OutputEncoding::Raw),
            "CAST([notes] AS NVARCHAR(MAX)) AS [notes]"
        );
        assert_eq!(
            column_expression(&notes, OutputEncoding::Bcp),
            "'\"' + REPLACE(COALESCE(CAST([notes] AS NVARCHAR(MAX)), ''), '\"', '\"\"') + '\"' AS [notes]"
        );
    }

    #[test]
    fn test_strings_only_wrapped_for_bcp() {
        let name = column("name", "nvarchar");
        assert_eq!(column_expression(&name, OutputEncoding::Raw), "[name]");
        assert!(column_expression(&name, OutputEncoding::Bcp).starts_with("'\"' + REPLACE("));
    }

    #[test]
    fn test_datetime_truncated_for_bcp() {
        let created = column("created", "datetime2");
        assert_eq!(column_expression(&created, OutputEncoding::Raw), "[created]");
        assert_eq!(
            column_expression(&created, OutputEncoding::Bcp),
            "CONVERT(DATETIME2(0), [created]) AS [created]"
        );
        let small = column("small", "smalldatetime");
        assert_eq!(column_expression(&small, OutputEncoding::Bcp), "[small]");
    }

    #[test]
    fn test_other_types_unchanged() {
        for data_type in ["int", "decimal", "float", "uniqueidentifier", "varbinary", "date"] {
            let col = column("c", data_type);
            assert_eq!(column_expression(&col, OutputEncoding::Bcp), "[c]");
            assert_eq!(column_expression(&col, OutputEncoding::Raw), "[c]");
        }
    }

    #[test]
    fn test_comparison_expressions() {
        assert_eq!(
            comparison_expression(&column("d", "datetime")).as_deref(),
            Some("CONVERT(NVARCHAR(MAX), CONVERT(DATETIME2(0), [d]), 120)")
        );
        assert_eq!(
            comparison_expression(&column("n", "varchar")).as_deref(),
            Some("CAST([n] AS NVARCHAR(MAX))")
        );
        assert_eq!(
            comparison_expression(&column("i", "bigint")).as_deref(),
            Some("CONVERT(NVARCHAR(MAX), [i])")
        );
        assert!(comparison_expression(&column("f", "float")).is_none());
        assert!(comparison_expression(&column("m", "money")).is_none());
        assert!(comparison_expression(&column("rv", "rowversion")).is_none());
        assert!(comparison_expression(&column("b", "varbinary")).is_none());
    }
}
