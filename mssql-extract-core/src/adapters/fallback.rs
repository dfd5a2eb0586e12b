//! Ordered fallback across export adapters.

use super::{AdapterError, ExportAdapter, ExportRequest};
use crate::connection::ConnectionManager;
use crate::error::{ExtractorError, Result};
use crate::models::ExportResult;

/// Tries adapters in priority order until one produces a file.
///
/// A skip moves on silently. A failure moves on with a warning, except on the
/// last adapter, whose error is returned. The last error seen is returned if
/// no adapter succeeds after one has failed.
pub struct FallbackOrchestrator<C: ?Sized + Send = ConnectionManager> {
    adapters: Vec<Box<dyn ExportAdapter<C>>>,
}

impl FallbackOrchestrator<ConnectionManager> {
    /// bcp first, then the streaming export.
    pub fn with_default_adapters(bcp: super::BcpAdapter) -> Self {
        Self::new(vec![
            Box::new(bcp),
            Box::new(super::StreamingAdapter::new()),
        ])
    }
}

impl<C: ?Sized + Send> FallbackOrchestrator<C> {
    pub fn new(adapters: Vec<Box<dyn ExportAdapter<C>>>) -> Self {
        Self { adapters }
    }

    /// Runs the export with the first adapter that does not skip.
    ///
    /// # Errors
    /// Returns the last adapter failure, or
    /// [`ExtractorError::AllAdaptersSkipped`] listing every skip reason
    pub async fn export(&mut self, conn: &mut C, request: &ExportRequest) -> Result<ExportResult> {
        let mut skipped = Vec::new();
        let mut last_error = None;
        let count = self.adapters.len();

        for (position, adapter) in self.adapters.iter_mut().enumerate() {
            let kind = adapter.kind();
            tracing::debug!("Export '{}': trying {} adapter", request.name, kind);

            match adapter.export(conn, request).await {
                Ok(result) => {
                    tracing::info!(
                        "Export '{}' produced by {} adapter ({} rows)",
                        request.name,
                        kind,
                        result.row_count
                    );
                    return Ok(result);
                }
                Err(AdapterError::Skipped(reason)) => {
                    tracing::info!("Export '{}': {} adapter skipped: {}", request.name, kind, reason);
                    skipped.push(format!("{kind}: {reason}"));
                }
                Err(AdapterError::Failed(error)) if position + 1 == count => return Err(error),
                Err(AdapterError::Failed(error)) => {
                    tracing::warn!(
                        "Export '{}': {} adapter failed, trying next: {}",
                        request.name,
                        kind,
                        error.detailed_message()
                    );
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) => Err(error),
            None => Err(ExtractorError::AllAdaptersSkipped {
                reasons: skipped.join("; "),
            }),
        }
    }
}
