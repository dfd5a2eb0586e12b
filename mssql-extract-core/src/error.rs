//! Error types with credential-safe messages and retry classification.
//!
//! Every error carries enough context for an operator to act on it, but never
//! a password or a raw connection string. Driver errors are classified into a
//! [`DbErrorKind`] so the retry proxy and the exit-code mapping agree on what
//! is transient and what is the user's fault.

use thiserror::Error;

/// Classification of a database driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorKind {
    /// Socket level failure (reset, refused, broken pipe)
    Transport,
    /// TDS protocol violation or routing request
    Protocol,
    /// TLS negotiation failure
    Tls,
    /// Server reported a condition that usually clears on retry (deadlock, failover)
    Transient,
    /// Login rejected or database unavailable for this login
    Login,
    /// Referenced object or column does not exist
    InvalidObject,
    /// Statement could not be parsed
    Syntax,
    /// Permission denied on an object
    Permission,
    /// Anything else
    Other,
}

impl DbErrorKind {
    /// Whether errors of this kind are caused by configuration or input.
    pub fn is_user_facing(self) -> bool {
        matches!(
            self,
            Self::Login | Self::InvalidObject | Self::Syntax | Self::Permission
        )
    }
}

/// Main error type for export operations.
///
/// # Security
/// Messages never include passwords. Connection strings are redacted with
/// [`crate::security::redact_connection_string`] before they reach an error.
#[derive(Debug, Error)]
pub enum ExtractorError {
    /// Invalid or conflicting configuration, detected before connecting
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Establishing or keeping the database connection failed
    #[error("Database connection failed: {context}")]
    Connection {
        context: String,
        kind: DbErrorKind,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A statement failed on the server or in the driver
    #[error("Query execution failed: {context}")]
    Query {
        context: String,
        kind: DbErrorKind,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The request refers to something that does not exist or cannot be exported
    #[error("{message}")]
    UserInput { message: String },

    /// Incremental fetching requested on a column type that has no ordering we can resume from
    #[error(
        "Column '{column}' of type '{data_type}' cannot be used for incremental fetching; \
         only numeric, datetime and rowversion columns are supported"
    )]
    UnsupportedIncrementalColumn { column: String, data_type: String },

    /// CDC change window is empty or inverted
    #[error("Invalid CDC window: {message}")]
    CdcWindow { message: String },

    /// The bcp subprocess failed or produced unusable output
    #[error("bcp export failed: {message}")]
    BulkCopy { message: String },

    /// Every export strategy declined to run
    #[error("All export strategies unavailable: {reasons}")]
    AllAdaptersSkipped { reasons: String },

    /// I/O operation failed
    #[error("I/O operation failed: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing CSV output failed
    #[error("CSV output failed: {context}")]
    Csv {
        context: String,
        #[source]
        source: csv::Error,
    },

    /// Serialization or deserialization failed
    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results with ExtractorError
pub type Result<T> = std::result::Result<T, ExtractorError>;

/// Classifies a driver error.
pub fn classify_driver_error(error: &tiberius::error::Error) -> DbErrorKind {
    use tiberius::error::Error as TdsError;

    match error {
        TdsError::Io { .. } => DbErrorKind::Transport,
        TdsError::Protocol(_) | TdsError::Routing { .. } => DbErrorKind::Protocol,
        TdsError::Tls(_) => DbErrorKind::Tls,
        TdsError::Server(token) => classify_server_code(token.code()),
        _ => DbErrorKind::Other,
    }
}

/// Maps a SQL Server error number to a kind.
pub fn classify_server_code(code: u32) -> DbErrorKind {
    match code {
        // login failed, login from untrusted domain, cannot open database
        18456 | 18452 | 4060 => DbErrorKind::Login,
        // invalid column, invalid object, multi-part identifier could not be bound
        207 | 208 | 4104 => DbErrorKind::InvalidObject,
        102 | 105 | 156 | 170 => DbErrorKind::Syntax,
        229 | 230 | 262 | 297 => DbErrorKind::Permission,
        // deadlock victim, Azure throttling and failover codes
        1205 | 4221 | 10928 | 10929 | 40197 | 40501 | 40613 | 49918 | 49919 | 49920 => {
            DbErrorKind::Transient
        }
        _ => DbErrorKind::Other,
    }
}

impl ExtractorError {
    /// Creates a connection error from a driver error
    pub fn connection_failed(context: impl Into<String>, error: tiberius::error::Error) -> Self {
        Self::Connection {
            context: context.into(),
            kind: classify_driver_error(&error),
            source: Box::new(error),
        }
    }

    /// Creates a connection error that did not originate in the driver
    pub fn connection_io(context: impl Into<String>, error: std::io::Error) -> Self {
        Self::Connection {
            context: context.into(),
            kind: DbErrorKind::Transport,
            source: Box::new(error),
        }
    }

    /// Creates a query error from a driver error
    pub fn query_failed(context: impl Into<String>, error: tiberius::error::Error) -> Self {
        Self::Query {
            context: context.into(),
            kind: classify_driver_error(&error),
            source: Box::new(error),
        }
    }

    /// Creates a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a user input error
    pub fn user_input(message: impl Into<String>) -> Self {
        Self::UserInput {
            message: message.into(),
        }
    }

    /// Creates a bulk copy error
    pub fn bulk_copy(message: impl Into<String>) -> Self {
        Self::BulkCopy {
            message: message.into(),
        }
    }

    /// Creates an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a CSV error with context
    pub fn csv(context: impl Into<String>, source: csv::Error) -> Self {
        Self::Csv {
            context: context.into(),
            source,
        }
    }

    /// Driver error classification, if this error came from the database.
    pub fn db_kind(&self) -> Option<DbErrorKind> {
        match self {
            Self::Connection { kind, .. } | Self::Query { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Full message including the source chain, used for pattern matching.
    pub fn detailed_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }
        message
    }

    /// Whether the operator can fix this by changing configuration or input.
    ///
    /// User errors exit with code 1, everything else with code 2.
    pub fn is_user_error(&self) -> bool {
        match self {
            Self::Configuration { .. }
            | Self::UserInput { .. }
            | Self::UnsupportedIncrementalColumn { .. }
            | Self::CdcWindow { .. }
            | Self::AllAdaptersSkipped { .. } => true,
            Self::Connection { kind, .. } | Self::Query { kind, .. } => kind.is_user_facing(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_code_classification() {
        assert_eq!(classify_server_code(18456), DbErrorKind::Login);
        assert_eq!(classify_server_code(207), DbErrorKind::InvalidObject);
        assert_eq!(classify_server_code(102), DbErrorKind::Syntax);
        assert_eq!(classify_server_code(1205), DbErrorKind::Transient);
        assert_eq!(classify_server_code(50000), DbErrorKind::Other);
    }

    #[test]
    fn test_user_error_mapping() {
        assert!(ExtractorError::configuration("bad").is_user_error());
        assert!(ExtractorError::user_input("missing table").is_user_error());
        assert!(
            ExtractorError::UnsupportedIncrementalColumn {
                column: "name".to_string(),
                data_type: "varchar".to_string(),
            }
            .is_user_error()
        );
        assert!(!ExtractorError::bulk_copy("exit code 1").is_user_error());
        assert!(
            !ExtractorError::io("write", std::io::Error::other("disk full")).is_user_error()
        );
    }

    #[test]
    fn test_connection_error_kind() {
        let error = ExtractorError::connection_io(
            "connect to db.example.com",
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(error.db_kind(), Some(DbErrorKind::Transport));
        assert!(!error.is_user_error());
        assert!(error.detailed_message().contains("refused"));
    }

    #[test]
    fn test_unsupported_column_message_names_column() {
        let error = ExtractorError::UnsupportedIncrementalColumn {
            column: "title".to_string(),
            data_type: "nvarchar".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("'title'"));
        assert!(message.contains("nvarchar"));
    }
}
