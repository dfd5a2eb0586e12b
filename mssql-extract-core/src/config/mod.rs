//! Configuration for one extraction run.
//!
//! # Module Structure
//! - `database`: connection target, login and TLS settings
//! - `export`: what to export and which strategies are allowed
//!
//! The run configuration is read from a JSON file shaped as
//! `{"db": {...}, "export": {...}, "bcp": {...}}`. Everything is validated
//! up front so a bad flag combination never reaches the server.

mod database;
mod export;

pub use database::{DatabaseConfig, SslConfig};
pub use export::{ExportConfig, ExportSource};

use crate::error::{ExtractorError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Options for the external bulk-copy utility.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BcpOptions {
    /// Executable name or path
    #[serde(default = "default_bcp_binary")]
    pub binary: PathBuf,
    /// Rows per committed batch (`-b`)
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Errors tolerated before bcp aborts (`-m`)
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
}

fn default_bcp_binary() -> PathBuf {
    PathBuf::from("bcp")
}

fn default_batch_size() -> u32 {
    50_000
}

fn default_max_errors() -> u32 {
    1
}

impl Default for BcpOptions {
    fn default() -> Self {
        Self {
            binary: default_bcp_binary(),
            batch_size: default_batch_size(),
            max_errors: default_max_errors(),
        }
    }
}

/// Complete configuration for one run.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorConfig {
    pub db: DatabaseConfig,
    pub export: ExportConfig,
    #[serde(default)]
    pub bcp: BcpOptions,
}

impl ExtractorConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails validation
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExtractorError::io(format!("read config file {}", path.display()), e)
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            ExtractorError::configuration(format!(
                "invalid config file {}: {e}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    /// Returns the first configuration error found
    pub fn validate(&self) -> Result<()> {
        self.db.validate()?;
        self.export.validate()?;

        if self.bcp.batch_size == 0 {
            return Err(ExtractorError::configuration(
                "bcp.batchSize must be greater than 0",
            ));
        }
        if self.bcp.binary.as_os_str().is_empty() {
            return Err(ExtractorError::configuration("bcp.binary cannot be empty"));
        }

        Ok(())
    }
}
