//! ADO-style connection string construction.

use crate::config::DatabaseConfig;
use crate::error::{ExtractorError, Result};
use crate::security::redact_connection_string;
use std::borrow::Cow;
use zeroize::Zeroizing;

const APPLICATION_NAME: &str = "mssql-extract";

/// Server address in the `host[\instance][,port]` form shared by ADO and bcp.
pub fn server_address(config: &DatabaseConfig) -> String {
    let mut address = config.host.clone();
    if let Some(instance) = &config.instance {
        address.push('\\');
        address.push_str(instance);
    }
    if let Some(port) = config.port {
        address.push(',');
        address.push_str(&port.to_string());
    }
    address
}

/// Whether the server certificate is accepted without verification.
///
/// `relax_verification` is set after a hostname mismatch when the
/// configuration allows ignoring the certificate CN.
pub fn trusts_server_certificate(config: &DatabaseConfig, relax_verification: bool) -> bool {
    match config.ssl_enabled() {
        Some(ssl) => relax_verification || !ssl.verify_server_cert,
        None => true,
    }
}

/// Builds the connection string.
///
/// The result holds the password and is zeroed on drop. Log it only through
/// [`redact_connection_string`].
pub fn build_connection_string(
    config: &DatabaseConfig,
    relax_verification: bool,
) -> Zeroizing<String> {
    let trust = trusts_server_certificate(config, relax_verification);
    let ssl = config.ssl_enabled();

    let mut pairs: Vec<(&str, Cow<'_, str>)> = vec![(
        "Server",
        Cow::Owned(format!("tcp:{}", server_address(config))),
    )];
    if let Some(database) = &config.database {
        pairs.push(("Database", Cow::Borrowed(database)));
    }
    pairs.push((
        "Encrypt",
        Cow::Borrowed(if ssl.is_some() { "true" } else { "false" }),
    ));
    pairs.push((
        "TrustServerCertificate",
        Cow::Borrowed(if trust { "true" } else { "false" }),
    ));
    if let Some(ca_file) = ssl.and_then(|ssl| ssl.ca_file.as_ref())
        && !trust
    {
        pairs.push((
            "TrustServerCertificateCA",
            Cow::Owned(ca_file.display().to_string()),
        ));
    }
    pairs.push(("User ID", Cow::Borrowed(config.credentials.username())));
    pairs.push((
        "Password",
        Cow::Borrowed(config.credentials.expose_password()),
    ));
    pairs.push(("Application Name", Cow::Borrowed(APPLICATION_NAME)));

    let mut connection_string = Zeroizing::new(String::new());
    for (key, value) in pairs {
        connection_string.push_str(key);
        connection_string.push('=');
        connection_string.push_str(&quote_value(&value));
        connection_string.push(';');
    }
    connection_string
}

/// Quotes a value that would otherwise break `key=value;` parsing.
fn quote_value(value: &str) -> Cow<'_, str> {
    let needs_quoting = value.contains([';', '"', '\''])
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace);
    if needs_quoting {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Driver configuration for the given settings.
///
/// # Errors
/// Returns a configuration error if the driver rejects the connection string
pub fn tds_config(config: &DatabaseConfig, relax_verification: bool) -> Result<tiberius::Config> {
    let connection_string = build_connection_string(config, relax_verification);
    tracing::debug!(
        connection = %redact_connection_string(&connection_string),
        "Built connection string"
    );
    tiberius::Config::from_ado_string(&connection_string).map_err(|e| {
        ExtractorError::configuration(format!("invalid connection settings for {config}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SslConfig;
    use crate::security::Credentials;
    use std::path::PathBuf;

    fn config() -> DatabaseConfig {
        DatabaseConfig::new(
            "db.example.com",
            Credentials::new("reader".to_string(), "s3cret".to_string()),
        )
        .with_database("sales")
    }

    #[test]
    fn test_server_address_forms() {
        assert_eq!(server_address(&config()), "db.example.com");
        assert_eq!(
            server_address(&config().with_port(1533)),
            "db.example.com,1533"
        );
        assert_eq!(
            server_address(&config().with_instance("SQLEXPRESS").with_port(1533)),
            "db.example.com\\SQLEXPRESS,1533"
        );
    }

    #[test]
    fn test_plain_connection_string() {
        let value = build_connection_string(&config().with_port(1433), false);
        assert_eq!(
            value.as_str(),
            "Server=tcp:db.example.com,1433;Database=sales;Encrypt=false;\
             TrustServerCertificate=true;User ID=reader;Password=s3cret;\
             Application Name=mssql-extract;"
        );
    }

    #[test]
    fn test_ssl_with_ca_file() {
        let config = config().with_ssl(SslConfig {
            ca_file: Some(PathBuf::from("/etc/ssl/ca.pem")),
            ..SslConfig::default()
        });
        let value = build_connection_string(&config, false);
        assert!(value.contains("Encrypt=true;"));
        assert!(value.contains("TrustServerCertificate=false;"));
        assert!(value.contains("TrustServerCertificateCA=/etc/ssl/ca.pem;"));

        // relaxed verification cannot be combined with a CA file
        let relaxed = build_connection_string(&config, true);
        assert!(relaxed.contains("TrustServerCertificate=true;"));
        assert!(!relaxed.contains("TrustServerCertificateCA"));
    }

    #[test]
    fn test_unverified_ssl_trusts_certificate() {
        let config = config().with_ssl(SslConfig {
            verify_server_cert: false,
            ..SslConfig::default()
        });
        assert!(trusts_server_certificate(&config, false));
        assert!(
            build_connection_string(&config, false).contains("TrustServerCertificate=true;")
        );
    }

    #[test]
    fn test_special_characters_are_quoted() {
        let config = DatabaseConfig::new(
            "db",
            Credentials::new("reader".to_string(), "pa;ss\"word".to_string()),
        );
        let value = build_connection_string(&config, false);
        assert!(value.contains("Password=\"pa;ss\"\"word\";"));
        assert!(!redact_connection_string(&value).contains("pa;ss"));
    }

    #[test]
    fn test_driver_accepts_connection_string() {
        let config = config().with_instance("SQLEXPRESS").with_ssl(SslConfig::default());
        let tds = tds_config(&config, false).unwrap();
        assert!(tds.get_addr().starts_with("db.example.com:"));
    }
}
