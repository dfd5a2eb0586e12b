//! Driver-side export: rows are streamed from the TDS cursor into a CSV file.

mod value;

pub use value::render_value;

use super::{AdapterError, AdapterResult, ExportAdapter, ExportRequest, ExportSourcePlan};
use crate::connection::{ConnectionManager, TdsClient, summarize_sql};
use crate::error::{ExtractorError, Result};
use crate::models::{AdapterKind, ExportResult};
use crate::query::{OutputEncoding, QueryFactory};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tiberius::QueryItem;

/// Exports by reading the result set through the driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamingAdapter;

impl StreamingAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// Everything one streaming attempt needs, owned so it can move into a retry.
#[derive(Debug, Clone)]
struct StreamJob {
    sql: String,
    output_file: PathBuf,
    write_header: bool,
    /// Column whose last value becomes the watermark
    watermark_column: Option<String>,
}

#[derive(Debug, Default)]
struct StreamSummary {
    row_count: u64,
    columns: Vec<String>,
    watermark: Option<String>,
}

/// Runs one attempt and reconnects when it fails, so the next attempt
/// starts from a healthy connection.
async fn stream_with_recovery(conn: &mut ConnectionManager, job: &StreamJob) -> Result<StreamSummary> {
    match stream_once(conn, job).await {
        Ok(summary) => Ok(summary),
        Err(error) => {
            tracing::warn!("Streaming export failed: {}", error);
            if let Err(reconnect) = conn.try_reconnect().await {
                tracing::warn!("Reconnect after streaming failure failed: {}", reconnect);
            }
            Err(error)
        }
    }
}

async fn stream_once(conn: &mut ConnectionManager, job: &StreamJob) -> Result<StreamSummary> {
    let file = File::create(&job.output_file)
        .map_err(|e| ExtractorError::io(format!("create {}", job.output_file.display()), e))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));

    let client = conn.ensure_connected().await?;
    let summary = write_rows(client, job, &mut writer).await?;

    writer
        .flush()
        .map_err(|e| ExtractorError::io(format!("flush {}", job.output_file.display()), e))?;
    Ok(summary)
}

async fn write_rows(
    client: &mut TdsClient,
    job: &StreamJob,
    writer: &mut csv::Writer<BufWriter<File>>,
) -> Result<StreamSummary> {
    let driver_error = |e| ExtractorError::query_failed(summarize_sql(&job.sql), e);
    let csv_error =
        |e| ExtractorError::csv(format!("write {}", job.output_file.display()), e);

    let mut stream = client.simple_query(job.sql.as_str()).await.map_err(driver_error)?;
    let mut summary = StreamSummary::default();
    let mut watermark_index = None;

    while let Some(item) = stream.try_next().await.map_err(driver_error)? {
        match item {
            QueryItem::Metadata(meta) if meta.result_index() == 0 => {
                summary.columns = meta.columns().iter().map(|c| c.name().to_string()).collect();
                watermark_index = job.watermark_column.as_deref().and_then(|name| {
                    summary
                        .columns
                        .iter()
                        .position(|column| column.eq_ignore_ascii_case(name))
                });
                if job.write_header {
                    writer.write_record(&summary.columns).map_err(csv_error)?;
                }
            }
            QueryItem::Row(row) if row.result_index() == 0 => {
                let fields = row
                    .cells()
                    .map(|(_, data)| render_value(data))
                    .collect::<Result<Vec<_>>>()?;
                if let Some(index) = watermark_index {
                    summary.watermark = fields.get(index).filter(|v| !v.is_empty()).cloned();
                }
                writer.write_record(&fields).map_err(csv_error)?;
                summary.row_count += 1;
            }
            // later result sets of a batch are not exported
            QueryItem::Metadata(_) | QueryItem::Row(_) => {}
        }
    }
    Ok(summary)
}

#[async_trait]
impl ExportAdapter for StreamingAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Streaming
    }

    async fn export(
        &mut self,
        conn: &mut ConnectionManager,
        request: &ExportRequest,
    ) -> AdapterResult<ExportResult> {
        if request.disable_fallback {
            return Err(AdapterError::skipped("streaming fallback disabled by configuration"));
        }

        let sql = match &request.source {
            ExportSourcePlan::Table { .. } => {
                request.table_select(&QueryFactory::new(OutputEncoding::Raw))?
            }
            ExportSourcePlan::Query { sql } => sql.clone(),
        };
        let job = StreamJob {
            sql,
            output_file: request.output_file.clone(),
            write_header: request.is_raw_query(),
            watermark_column: request.incremental().map(|plan| plan.column.name.clone()),
        };
        tracing::debug!("Streaming {} to {}", summarize_sql(&job.sql), job.output_file.display());

        let retry = conn.retry_proxy().with_max_retries(request.retries);
        let summary = retry
            .call(conn, |conn| {
                let job = job.clone();
                Box::pin(async move { stream_with_recovery(conn, &job).await })
            })
            .await?;

        tracing::info!(
            "Streamed {} rows to {}",
            summary.row_count,
            request.output_file.display()
        );

        Ok(ExportResult {
            output_file: request.output_file.clone(),
            row_count: summary.row_count,
            columns: summary.columns,
            has_header: job.write_header,
            watermark: summary.watermark,
            produced_by: AdapterKind::Streaming,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_kind() {
        assert_eq!(StreamingAdapter::new().kind(), AdapterKind::Streaming);
    }
}
