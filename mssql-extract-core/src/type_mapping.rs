//! SQL Server data type classification.
//!
//! The export engine only cares about a handful of type families: they decide
//! how a column is cast for each output encoding, how a watermark value is
//! quoted, and whether a column can drive incremental fetching.

/// Numeric type families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
    /// `tinyint`, `smallint`, `int`, `bigint`
    Integer,
    /// `decimal`, `numeric`
    Decimal,
    /// `money`, `smallmoney`
    Money,
    /// `float`, `real`
    Approximate,
    /// `bit`
    Bit,
}

/// Family a SQL Server type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlTypeClass {
    /// `timestamp` / `rowversion`
    RowVersion,
    /// `text`, `ntext`, `xml`
    LargeText,
    /// `char`, `varchar`, `nchar`, `nvarchar`, `sysname`
    String,
    /// `datetime`, `datetime2`
    DateTime,
    /// `smalldatetime`
    SmallDateTime,
    /// `date`, `time`, `datetimeoffset`
    OtherTemporal,
    /// Exact or approximate numbers
    Numeric(NumericKind),
    /// `binary`, `varbinary`, `image`
    Binary,
    /// Everything else (`uniqueidentifier`, spatial, `sql_variant`, ...)
    Other,
}

impl SqlTypeClass {
    /// Whether values of this type compare unquoted in a WHERE clause.
    pub fn is_unquoted_literal(self) -> bool {
        matches!(self, Self::Numeric(_) | Self::RowVersion | Self::Binary)
    }
}

/// Strips a length/precision suffix and lowercases a type name.
///
/// `sp_describe_first_result_set` reports `nvarchar(50)`, the
/// `INFORMATION_SCHEMA` views report `nvarchar`; both map to `nvarchar`.
pub fn base_type_name(data_type: &str) -> String {
    let trimmed = data_type.trim();
    let base = trimmed
        .split_once('(')
        .map_or(trimmed, |(name, _)| name)
        .trim();
    base.to_lowercase()
}

/// Maps a SQL Server type name to its family.
///
/// # Example
/// ```rust
/// use mssql_extract_core::type_mapping::{map_sqlserver_type, NumericKind, SqlTypeClass};
///
/// assert_eq!(map_sqlserver_type("nvarchar(50)"), SqlTypeClass::String);
/// assert_eq!(map_sqlserver_type("BIGINT"), SqlTypeClass::Numeric(NumericKind::Integer));
/// assert_eq!(map_sqlserver_type("timestamp"), SqlTypeClass::RowVersion);
/// ```
pub fn map_sqlserver_type(data_type: &str) -> SqlTypeClass {
    match base_type_name(data_type).as_str() {
        "timestamp" | "rowversion" => SqlTypeClass::RowVersion,
        "text" | "ntext" | "xml" => SqlTypeClass::LargeText,
        "char" | "varchar" | "nchar" | "nvarchar" | "sysname" => SqlTypeClass::String,
        "datetime" | "datetime2" => SqlTypeClass::DateTime,
        "smalldatetime" => SqlTypeClass::SmallDateTime,
        "date" | "time" | "datetimeoffset" => SqlTypeClass::OtherTemporal,
        "tinyint" | "smallint" | "int" | "bigint" => SqlTypeClass::Numeric(NumericKind::Integer),
        "decimal" | "numeric" => SqlTypeClass::Numeric(NumericKind::Decimal),
        "money" | "smallmoney" => SqlTypeClass::Numeric(NumericKind::Money),
        "float" | "real" => SqlTypeClass::Numeric(NumericKind::Approximate),
        "bit" => SqlTypeClass::Numeric(NumericKind::Bit),
        "binary" | "varbinary" | "image" => SqlTypeClass::Binary,
        _ => SqlTypeClass::Other,
    }
}
