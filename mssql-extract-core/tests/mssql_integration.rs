//! End-to-end exports against a SQL Server container.
//!
//! These tests need Docker and pull `mcr.microsoft.com/mssql/server`. The
//! container has no `bcp` executable, so the bulk-copy adapter skips and the
//! streaming adapter produces every file.
//!
//! Run with:
//! ```bash
//! cargo test -p mssql-extract-core --test mssql_integration -- --ignored
//! ```

use mssql_extract_core::config::{BcpOptions, DatabaseConfig, ExportConfig, ExtractorConfig};
use mssql_extract_core::connection::ConnectionManager;
use mssql_extract_core::error::ExtractorError;
use mssql_extract_core::incremental::{resolve_bcp_watermark, resolve_incremental_column};
use mssql_extract_core::metadata;
use mssql_extract_core::models::{AdapterKind, RunState, TableRef};
use mssql_extract_core::security::Credentials;
use mssql_extract_core::{Extractor, RetryConfig, RetryProxy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use testcontainers_modules::mssql_server::MssqlServer;
use testcontainers_modules::testcontainers::ContainerAsync;
use testcontainers_modules::testcontainers::runners::AsyncRunner;
use tiberius::{AuthMethod, Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;

const SA_PASSWORD: &str = "yourStrong(!)Password";
const TEST_DB: &str = "extract_test";
const MSSQL_PORT: u16 = 1433;

const SETUP_SQL: &str = "
CREATE TABLE dbo.items (
    id INT NOT NULL PRIMARY KEY,
    name NVARCHAR(50) NULL,
    updated DATETIME2(7) NOT NULL
);
INSERT INTO dbo.items (id, name, updated) VALUES
    (1, N'alpha', '2024-01-01T10:00:00.1234567'),
    (2, N'beta \"quoted\"', '2024-01-02T10:00:00.1234567'),
    (3, NULL, '2024-01-03T10:00:00.1234567'),
    (4, N'delta, comma', '2024-01-04T10:00:00.1234567'),
    (5, N'', '2024-01-05T10:00:00.1234567'),
    (6, N'zeta', '2024-01-06T10:00:00.7654321');
";

struct TestServer {
    _container: ContainerAsync<MssqlServer>,
    host: String,
    port: u16,
}

async fn start_server() -> TestServer {
    let container = MssqlServer::default()
        .with_accept_eula()
        .start()
        .await
        .expect("Failed to start SQL Server container");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host")
        .to_string();
    let port = container
        .get_host_port_ipv4(MSSQL_PORT)
        .await
        .expect("Failed to get SQL Server port");

    let server = TestServer {
        _container: container,
        host,
        port,
    };
    setup_database(&server).await;
    server
}

async fn admin_client(server: &TestServer, database: &str) -> Client<tokio_util::compat::Compat<TcpStream>> {
    let mut config = Config::new();
    config.host(&server.host);
    config.port(server.port);
    config.database(database);
    config.authentication(AuthMethod::sql_server("sa", SA_PASSWORD));
    config.trust_cert();

    let mut last_error = None;
    for _ in 0..30 {
        match TcpStream::connect(config.get_addr()).await {
            Ok(tcp) => {
                tcp.set_nodelay(true).expect("Failed to set nodelay");
                match Client::connect(config.clone(), tcp.compat_write()).await {
                    Ok(client) => return client,
                    Err(e) => last_error = Some(e.to_string()),
                }
            }
            Err(e) => last_error = Some(e.to_string()),
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    panic!("SQL Server did not accept connections: {last_error:?}");
}

async fn setup_database(server: &TestServer) {
    let mut master = admin_client(server, "master").await;
    master
        .simple_query(format!("CREATE DATABASE {TEST_DB}"))
        .await
        .expect("Failed to create database")
        .into_results()
        .await
        .expect("Failed to create database");

    let mut client = admin_client(server, TEST_DB).await;
    client
        .simple_query(SETUP_SQL)
        .await
        .expect("Failed to create table")
        .into_results()
        .await
        .expect("Failed to create table");
}

fn database_config(server: &TestServer) -> DatabaseConfig {
    DatabaseConfig::new(
        server.host.clone(),
        Credentials::new("sa".to_string(), SA_PASSWORD.to_string()),
    )
    .with_port(server.port)
    .with_database(TEST_DB)
}

fn retry() -> RetryProxy {
    RetryProxy::new(
        RetryConfig::default().with_intervals(Duration::from_millis(200), Duration::from_secs(2)),
    )
}

fn extractor(server: &TestServer, export: ExportConfig) -> Extractor {
    let db = database_config(server);

    let config = ExtractorConfig {
        db,
        export,
        bcp: BcpOptions {
            binary: PathBuf::from("bcp-not-installed"),
            ..BcpOptions::default()
        },
    };
    Extractor::new(config).expect("valid config").with_retry(retry())
}

fn items() -> TableRef {
    TableRef::new("dbo", "items")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_integration_incremental_resumption_is_inclusive() {
    let server = start_server().await;
    let output = tempfile::tempdir().unwrap();

    let export = ExportConfig::for_table("items", items())
        .with_columns(["id", "name"])
        .with_incremental_fetching("id", Some(1));
    let first = extractor(&server, export)
        .run(&RunState::new(), output.path())
        .await
        .unwrap();

    assert_eq!(first.result.produced_by, AdapterKind::Streaming);
    assert_eq!(first.result.row_count, 1);
    assert!(!first.result.has_header);
    assert_eq!(first.state.last_fetched_row().as_deref(), Some("1"));
    assert_eq!(
        std::fs::read_to_string(&first.result.output_file).unwrap(),
        "1,alpha\n"
    );

    let export = ExportConfig::for_table("items", items())
        .with_columns(["id", "name"])
        .with_incremental_fetching("id", Some(2));
    let second = extractor(&server, export)
        .run(&first.state, output.path())
        .await
        .unwrap();

    assert_eq!(second.result.row_count, 2);
    assert_eq!(second.state.last_fetched_row().as_deref(), Some("2"));
    assert_eq!(
        std::fs::read_to_string(&second.result.output_file).unwrap(),
        "1,alpha\n2,\"beta \"\"quoted\"\"\"\n"
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_integration_datetime_watermark_keeps_full_precision() {
    let server = start_server().await;
    let output = tempfile::tempdir().unwrap();

    let export = ExportConfig::for_table("items", items())
        .with_incremental_fetching("updated", None);
    let outcome = extractor(&server, export)
        .run(&RunState::new(), output.path())
        .await
        .unwrap();

    assert_eq!(outcome.result.row_count, 6);
    assert_eq!(
        outcome.state.last_fetched_row().as_deref(),
        Some("2024-01-06 10:00:00.7654321")
    );

    // resuming from the stored value re-reads exactly the boundary row
    let export = ExportConfig::for_table("items", items())
        .with_incremental_fetching("updated", None);
    let resumed = extractor(&server, export)
        .run(&outcome.state, output.path())
        .await
        .unwrap();
    assert_eq!(resumed.result.row_count, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_integration_bcp_watermark_recovery_restores_fraction() {
    let server = start_server().await;
    let mut conn = ConnectionManager::connect(Arc::new(database_config(&server)), retry())
        .await
        .unwrap();
    let columns = metadata::table_columns(&mut conn, &items()).await.unwrap();
    let updated = resolve_incremental_column(&items(), &columns, "updated").unwrap();

    // last line of a bcp export: strings unquoted by the CSV reader, the
    // datetime2 rounded by CONVERT(DATETIME2(0), ...)
    let last_row = vec![
        "6".to_string(),
        "zeta".to_string(),
        "2024-01-06 10:00:01".to_string(),
    ];
    let watermark = resolve_bcp_watermark(&mut conn, &items(), &columns, &updated, &last_row, false)
        .await
        .unwrap();
    assert_eq!(watermark.as_deref(), Some("2024-01-06 10:00:00.7654321"));

    let with_nolock = resolve_bcp_watermark(&mut conn, &items(), &columns, &updated, &last_row, true)
        .await
        .unwrap();
    assert_eq!(with_nolock, watermark);

    // a row that no longer exists keeps the previous watermark
    let vanished = vec![
        "6".to_string(),
        "renamed".to_string(),
        "2024-01-06 10:00:01".to_string(),
    ];
    let missing = resolve_bcp_watermark(&mut conn, &items(), &columns, &updated, &vanished, false)
        .await
        .unwrap();
    assert_eq!(missing, None);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_integration_raw_query_has_header_and_reruns_identically() {
    let server = start_server().await;
    let output = tempfile::tempdir().unwrap();
    let export = ExportConfig::for_query(
        "report",
        "SELECT id, name FROM dbo.items WHERE id <= 3 ORDER BY id",
    );

    let first = extractor(&server, export.clone())
        .run(&RunState::new(), output.path())
        .await
        .unwrap();
    let first_bytes = std::fs::read(&first.result.output_file).unwrap();

    assert!(first.result.has_header);
    assert_eq!(first.result.columns, vec!["id", "name"]);
    assert_eq!(
        String::from_utf8(first_bytes.clone()).unwrap(),
        "id,name\n1,alpha\n2,\"beta \"\"quoted\"\"\"\n3,\n"
    );

    let second = extractor(&server, export)
        .run(&RunState::new(), output.path())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&second.result.output_file).unwrap(), first_bytes);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_integration_unknown_column_is_user_error() {
    let server = start_server().await;
    let output = tempfile::tempdir().unwrap();

    let export = ExportConfig::for_table("items", items()).with_columns(["id", "missing"]);
    let err = extractor(&server, export)
        .run(&RunState::new(), output.path())
        .await
        .unwrap_err();

    assert!(err.is_user_error());
    assert!(err.to_string().contains("missing"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_integration_cdc_full_load_fallback_records_time() {
    let server = start_server().await;
    let output = tempfile::tempdir().unwrap();

    // without the SQL Server Agent no LSNs are ever mapped, so the window is unusable
    let mut client = admin_client(&server, TEST_DB).await;
    client
        .simple_query(
            "EXEC sys.sp_cdc_enable_db;
             EXEC sys.sp_cdc_enable_table @source_schema = N'dbo', @source_name = N'items', @role_name = NULL;",
        )
        .await
        .expect("Failed to enable CDC")
        .into_results()
        .await
        .expect("Failed to enable CDC");

    let strict = ExportConfig::for_table("items", items()).with_cdc(false);
    let err = extractor(&server, strict)
        .run(&RunState::new(), output.path())
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractorError::CdcWindow { .. }));

    let fallback = ExportConfig::for_table("items", items()).with_cdc(true);
    let outcome = extractor(&server, fallback)
        .run(&RunState::new(), output.path())
        .await
        .unwrap();

    assert_eq!(outcome.result.row_count, 6);
    assert!(!outcome.result.columns.contains(&"is_deleted".to_string()));
    assert!(outcome.state.last_fetched_time().unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_integration_test_connection_reports_version() {
    let server = start_server().await;
    let extractor = extractor(&server, ExportConfig::for_table("items", items()));
    assert!(extractor.test_connection().await.unwrap() >= 14);
}
