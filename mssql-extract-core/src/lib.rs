//! Export engine for moving SQL Server tables and queries into CSV files.
//!
//! An export runs through two competing strategies: the external `bcp`
//! bulk-copy utility and a driver-side streaming cursor. The fallback
//! orchestrator tries them in that order and keeps going when a strategy does
//! not apply or fails. Incremental exports resume from a stored watermark and
//! CDC exports from a stored window end time.
//!
//! # Guarantees
//! - Read-only access to the source server
//! - Passwords never appear in logs, errors or `Debug` output
//! - Conflicting configuration is rejected before connecting
//! - Resumption is inclusive: the boundary row of the previous run is
//!   exported again
//!
//! # Architecture
//! - [`connection`] owns the single connection, [`retry`] wraps every round trip
//! - [`metadata`] holds all catalog SQL, [`query`] builds the export SELECTs
//! - [`adapters`] implements the two strategies and the fallback chain
//! - [`incremental`] and [`cdc`] compute where the next run starts
//! - [`extractor`] ties a configuration to one run

pub mod adapters;
pub mod cdc;
pub mod config;
pub mod connection;
pub mod error;
pub mod extractor;
pub mod incremental;
pub mod logging;
pub mod metadata;
pub mod models;
pub mod query;
pub mod retry;
pub mod security;
pub mod type_mapping;

// Re-export commonly used types
pub use adapters::{
    AdapterError, BcpAdapter, ExportAdapter, ExportRequest, FallbackOrchestrator, StreamingAdapter,
};
pub use config::{BcpOptions, DatabaseConfig, ExportConfig, ExtractorConfig, SslConfig};
pub use connection::ConnectionManager;
pub use error::{DbErrorKind, ExtractorError, Result};
pub use extractor::{ExtractionOutcome, Extractor};
pub use logging::{LogFormat, init_logging};
pub use models::{AdapterKind, ColumnMetadata, ExportResult, Lsn, RunState, TableRef};
pub use retry::{RetryConfig, RetryProxy};
pub use security::Credentials;
