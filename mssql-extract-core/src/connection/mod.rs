//! Owner of the single live database connection.
//!
//! The manager connects (negotiating TLS, optionally relaxing host name
//! verification), runs init queries after every (re)connect, caches the server
//! major version and replaces a dead connection on demand. Every round trip
//! goes through the [`RetryProxy`].

mod ado;

pub use ado::{build_connection_string, server_address, tds_config, trusts_server_certificate};

use crate::config::DatabaseConfig;
use crate::error::{DbErrorKind, ExtractorError, Result};
use crate::retry::RetryProxy;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tiberius::{Client, Query, Row, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

/// Driver client over a tokio TCP stream.
pub type TdsClient = Client<Compat<TcpStream>>;

static HOSTNAME_MISMATCH: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(hostname mismatch|NotValidForName|certificate is not valid for|name does not match)",
    )
    .ok()
});

/// Whether a connect error is a certificate host name mismatch.
pub fn is_hostname_mismatch(error: &ExtractorError) -> bool {
    HOSTNAME_MISMATCH
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(&error.detailed_message()))
}

const ENCRYPTION_QUERY: &str =
    "SELECT CAST(CONNECTIONPROPERTY('encrypt_option') AS NVARCHAR(10)) AS encrypt_option";
const VERSION_QUERY: &str = "SELECT CAST(PARSENAME(CAST(SERVERPROPERTY('ProductVersion') \
                             AS NVARCHAR(128)), 4) AS INT) AS major_version";

/// The live connection plus what is needed to replace it.
pub struct ConnectionManager {
    config: Arc<DatabaseConfig>,
    retry: RetryProxy,
    client: Option<TdsClient>,
    server_major_version: Option<i32>,
    relaxed_verification: bool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config.to_string())
            .field("connected", &self.client.is_some())
            .field("server_major_version", &self.server_major_version)
            .field("relaxed_verification", &self.relaxed_verification)
            .finish()
    }
}

impl ConnectionManager {
    /// Connects to the configured server, retrying transient failures.
    ///
    /// # Errors
    /// Returns a connection error once retries are exhausted, or immediately
    /// for login and TLS verification failures
    pub async fn connect(config: Arc<DatabaseConfig>, retry: RetryProxy) -> Result<Self> {
        let mut manager = Self {
            config,
            retry,
            client: None,
            server_major_version: None,
            relaxed_verification: false,
        };
        manager.reconnect().await?;
        Ok(manager)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The retry policy this manager applies.
    pub fn retry_proxy(&self) -> &RetryProxy {
        &self.retry
    }

    /// Whether certificate verification was relaxed after a host name mismatch.
    pub fn relaxed_verification(&self) -> bool {
        self.relaxed_verification
    }

    /// The live client.
    ///
    /// # Errors
    /// Returns a connection error if the previous connection was dropped and
    /// not replaced yet
    pub fn client(&mut self) -> Result<&mut TdsClient> {
        self.client.as_mut().ok_or_else(|| ExtractorError::Connection {
            context: format!("no live connection to {}", self.config),
            kind: DbErrorKind::Transport,
            source: Box::new(std::io::Error::from(std::io::ErrorKind::NotConnected)),
        })
    }

    /// Drops the connection after a transport-level failure.
    pub fn mark_broken(&mut self) {
        if self.client.take().is_some() {
            tracing::debug!("Dropped broken connection to {}", self.config);
        }
    }

    /// Replaces the connection, retrying per policy.
    ///
    /// # Errors
    /// Returns the last connection error if no attempt succeeds
    pub async fn reconnect(&mut self) -> Result<()> {
        self.client = None;
        let config = Arc::clone(&self.config);
        let relaxed = self.relaxed_verification;
        let (client, relaxed) = self.retry.run(|| open(&config, relaxed)).await?;
        self.client = Some(client);
        self.relaxed_verification = relaxed;
        Ok(())
    }

    /// Runs `SELECT 1` on the current connection.
    pub async fn health_check(&mut self) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        let result = async { client.simple_query("SELECT 1").await?.into_row().await }.await;
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Health check failed: {}", e);
                false
            }
        }
    }

    /// Reconnects if the health check fails.
    ///
    /// # Errors
    /// Returns the reconnect error when the connection could not be replaced
    pub async fn try_reconnect(&mut self) -> Result<()> {
        if self.health_check().await {
            return Ok(());
        }
        tracing::warn!("Connection to {} is unhealthy, reconnecting", self.config);
        self.reconnect().await
    }

    /// Server major version (e.g. 11 for SQL Server 2012), cached after the first call.
    ///
    /// # Errors
    /// Returns a query error if the version cannot be read
    pub async fn server_major_version(&mut self) -> Result<i32> {
        if let Some(version) = self.server_major_version {
            return Ok(version);
        }
        let rows = self.fetch_all(VERSION_QUERY, &[]).await?;
        let version = match rows.first() {
            Some(row) => read_column::<i32>(row, 0, "server major version")?,
            None => None,
        }
        .ok_or_else(|| ExtractorError::user_input("server did not report a product version"))?;
        tracing::debug!("Server major version: {}", version);
        self.server_major_version = Some(version);
        Ok(version)
    }

    /// Runs a query and collects the first result set, retrying per policy.
    ///
    /// Statements without parameters are sent as a plain batch; with
    /// parameters they are sent as `@P1`, `@P2`, ... placeholders.
    ///
    /// # Errors
    /// Returns a query error for server errors, or a connection error when
    /// the connection could not be re-established
    pub async fn fetch_all(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Row>> {
        let retry = self.retry.clone();
        let sql = sql.to_string();
        let params: Vec<String> = params.iter().map(|p| (*p).to_string()).collect();

        retry
            .call(self, |manager| {
                let sql = sql.clone();
                let params = params.clone();
                Box::pin(async move { manager.fetch_all_once(&sql, &params).await })
            })
            .await
    }

    /// Opens a connection if the previous one was dropped, without retrying.
    ///
    /// # Errors
    /// Returns the connection error of the single attempt
    pub async fn ensure_connected(&mut self) -> Result<&mut TdsClient> {
        if self.client.is_none() {
            let (client, relaxed) = open(&self.config, self.relaxed_verification).await?;
            self.client = Some(client);
            self.relaxed_verification = relaxed;
        }
        self.client()
    }

    /// Wraps a driver error raised by `sql`, dropping the connection when the
    /// error left it unusable.
    pub fn query_error(&mut self, sql: &str, error: tiberius::error::Error) -> ExtractorError {
        let error = ExtractorError::query_failed(summarize_sql(sql), error);
        if matches!(
            error.db_kind(),
            Some(DbErrorKind::Transport | DbErrorKind::Protocol)
        ) {
            self.mark_broken();
        }
        error
    }

    async fn fetch_all_once(&mut self, sql: &str, params: &[String]) -> Result<Vec<Row>> {
        let client = self.ensure_connected().await?;

        let result = if params.is_empty() {
            async { client.simple_query(sql).await?.into_first_result().await }.await
        } else {
            let mut query = Query::new(sql);
            for param in params {
                query.bind(param.as_str());
            }
            async { query.query(client).await?.into_first_result().await }.await
        };

        result.map_err(|e| self.query_error(sql, e))
    }
}

/// Reads a column by position without panicking on an unexpected type.
///
/// # Errors
/// Returns a query error naming `what` if the value cannot be converted
pub(crate) fn read_column<'a, T>(row: &'a Row, index: usize, what: &str) -> Result<Option<T>>
where
    T: tiberius::FromSql<'a>,
{
    row.try_get::<T, usize>(index)
        .map_err(|e| ExtractorError::query_failed(format!("read {what}"), e))
}

/// Reads a column by name; see [`read_column`].
///
/// # Errors
/// Returns a query error naming `what` if the column is missing or the value
/// cannot be converted
pub(crate) fn read_named_column<'a, T>(row: &'a Row, name: &str, what: &str) -> Result<Option<T>>
where
    T: tiberius::FromSql<'a>,
{
    row.try_get::<T, &str>(name)
        .map_err(|e| ExtractorError::query_failed(format!("read {what}"), e))
}

/// Shortened statement text for error context.
pub(crate) fn summarize_sql(sql: &str) -> String {
    const MAX: usize = 120;
    let flat = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > MAX {
        let truncated: String = flat.chars().take(MAX).collect();
        format!("{truncated}...")
    } else {
        flat
    }
}

/// Opens a connection, relaxing host name verification once when allowed.
///
/// Returns the client and whether verification ended up relaxed.
async fn open(config: &DatabaseConfig, relaxed: bool) -> Result<(TdsClient, bool)> {
    let client = match open_once(config, relaxed).await {
        Ok(client) => (client, relaxed),
        Err(error)
            if !relaxed
                && config
                    .ssl_enabled()
                    .is_some_and(|ssl| ssl.ignore_certificate_cn)
                && is_hostname_mismatch(&error) =>
        {
            tracing::warn!(
                "Server certificate does not match host {}, retrying without host name verification",
                config.host
            );
            (open_once(config, true).await?, true)
        }
        Err(error) => return Err(error),
    };
    Ok(client)
}

async fn open_once(config: &DatabaseConfig, relaxed: bool) -> Result<TdsClient> {
    let tds = tds_config(config, relaxed)?;
    let timeout = config.login_timeout();
    let mut client = match tokio::time::timeout(timeout, connect_tds(tds, config)).await {
        Ok(client) => client?,
        Err(_) => return Err(login_timeout_error(config, timeout)),
    };

    if config.ssl_enabled().is_some() {
        verify_encryption(&mut client, config).await?;
    }

    for query in &config.init_queries {
        tracing::debug!("Running init query: {}", summarize_sql(query));
        client
            .simple_query(query.as_str())
            .await
            .map_err(|e| ExtractorError::query_failed(format!("init query on {config}"), e))?
            .into_results()
            .await
            .map_err(|e| ExtractorError::query_failed(format!("init query on {config}"), e))?;
    }

    tracing::info!("Connected to {}", config);
    Ok(client)
}

/// Handshake expiry; the message is what the retry proxy keys its
/// deadline-based retries on.
fn login_timeout_error(config: &DatabaseConfig, timeout: std::time::Duration) -> ExtractorError {
    ExtractorError::connection_io(
        format!("login to {config}"),
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("login timeout expired after {} ms", timeout.as_millis()),
        ),
    )
}

async fn connect_tds(mut tds: tiberius::Config, config: &DatabaseConfig) -> Result<TdsClient> {
    let tcp = if config.instance.is_some() && config.port.is_none() {
        TcpStream::connect_named(&tds).await.map_err(|e| {
            ExtractorError::connection_failed(format!("resolve named instance for {config}"), e)
        })?
    } else {
        TcpStream::connect(tds.get_addr())
            .await
            .map_err(|e| ExtractorError::connection_io(format!("connect to {config}"), e))?
    };
    tcp.set_nodelay(true)
        .map_err(|e| ExtractorError::connection_io(format!("configure socket for {config}"), e))?;

    match Client::connect(tds.clone(), tcp.compat_write()).await {
        Ok(client) => Ok(client),
        // Azure gateways redirect to the node that owns the database
        Err(tiberius::error::Error::Routing { host, port }) => {
            tracing::debug!("Redirected to {}:{}", host, port);
            tds.host(&host);
            tds.port(port);
            let tcp = TcpStream::connect(tds.get_addr())
                .await
                .map_err(|e| ExtractorError::connection_io(format!("connect to {host}:{port}"), e))?;
            tcp.set_nodelay(true).map_err(|e| {
                ExtractorError::connection_io(format!("configure socket for {host}:{port}"), e)
            })?;
            Client::connect(tds, tcp.compat_write())
                .await
                .map_err(|e| ExtractorError::connection_failed(format!("login to {host}:{port}"), e))
        }
        Err(e) => Err(ExtractorError::connection_failed(format!("login to {config}"), e)),
    }
}

async fn verify_encryption(client: &mut TdsClient, config: &DatabaseConfig) -> Result<()> {
    let row = client
        .simple_query(ENCRYPTION_QUERY)
        .await
        .map_err(|e| ExtractorError::query_failed("check session encryption", e))?
        .into_row()
        .await
        .map_err(|e| ExtractorError::query_failed("check session encryption", e))?;

    let encrypted = match row.as_ref() {
        Some(row) => read_column::<&str>(row, 0, "session encryption")?
            .is_some_and(|value| value.eq_ignore_ascii_case("TRUE")),
        None => false,
    };

    if encrypted {
        Ok(())
    } else {
        Err(ExtractorError::configuration(format!(
            "SSL was requested but the session to {config} is not encrypted"
        )))
    }
}
