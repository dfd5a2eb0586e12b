//! SQL Server connection configuration.

use crate::error::{ExtractorError, Result};
use crate::security::Credentials;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// TLS settings for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslConfig {
    /// Request an encrypted session
    #[serde(default)]
    pub enabled: bool,
    /// PEM/DER CA certificate used to verify the server
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Verify the server certificate chain and host name
    #[serde(default = "default_true")]
    pub verify_server_cert: bool,
    /// Accept a certificate whose CN/SAN does not match the host
    #[serde(default)]
    pub ignore_certificate_cn: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_file: None,
            verify_server_cert: true,
            ignore_certificate_cn: false,
        }
    }
}

/// Configuration for the source database.
///
/// Built once and shared read-only for the whole run.
///
/// # Security
/// The password lives in [`Credentials`] and is never printed by `Debug` or
/// `Display`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Server host name or address
    pub host: String,
    /// Named instance, resolved through SQL Browser when no port is set
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default)]
    pub database: Option<String>,
    /// Default schema for table references that omit one
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub ssl: Option<SslConfig>,
    /// Statements executed after every (re)connect
    #[serde(default)]
    pub init_queries: Vec<String>,
    /// Budget for one TCP connect plus login handshake, in milliseconds
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,
}

fn default_login_timeout_ms() -> u64 {
    30_000
}

impl std::fmt::Display for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DatabaseConfig({}{}{}{})",
            self.host,
            self.instance
                .as_ref()
                .map_or_else(String::new, |i| format!("\\{i}")),
            self.port.map_or_else(String::new, |p| format!(",{p}")),
            self.database
                .as_ref()
                .map_or_else(String::new, |db| format!("/{db}"))
        )
        // Intentionally omit username and never include credentials
    }
}

impl DatabaseConfig {
    /// Creates a config with the given host and login.
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            instance: None,
            port: None,
            credentials,
            database: None,
            schema: None,
            ssl: None,
            init_queries: Vec::new(),
            login_timeout_ms: default_login_timeout_ms(),
        }
    }

    /// Builder method to set port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Builder method to set the named instance.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Builder method to set database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Builder method to set TLS options.
    pub fn with_ssl(mut self, ssl: SslConfig) -> Self {
        self.ssl = Some(ssl);
        self
    }

    /// Builder method to add an init query.
    pub fn with_init_query(mut self, query: impl Into<String>) -> Self {
        self.init_queries.push(query.into());
        self
    }

    /// Builder method to set the login timeout.
    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    /// TLS settings when encryption was requested.
    pub fn ssl_enabled(&self) -> Option<&SslConfig> {
        self.ssl.as_ref().filter(|ssl| ssl.enabled)
    }

    /// Validates connection parameters.
    ///
    /// # Errors
    /// Returns a configuration error if a required value is missing or invalid
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ExtractorError::configuration("db.host cannot be empty"));
        }

        if self.port == Some(0) {
            return Err(ExtractorError::configuration(
                "db.port must be greater than 0",
            ));
        }

        if self
            .instance
            .as_ref()
            .is_some_and(|instance| instance.trim().is_empty())
        {
            return Err(ExtractorError::configuration(
                "db.instance cannot be empty when set",
            ));
        }

        if self.credentials.username().trim().is_empty() {
            return Err(ExtractorError::configuration("db.user cannot be empty"));
        }

        if self.login_timeout_ms == 0 {
            return Err(ExtractorError::configuration(
                "db.loginTimeoutMs must be greater than 0",
            ));
        }

        if self
            .init_queries
            .iter()
            .any(|query| query.trim().is_empty())
        {
            return Err(ExtractorError::configuration(
                "db.initQueries cannot contain empty statements",
            ));
        }

        Ok(())
    }
}
