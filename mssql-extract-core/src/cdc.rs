//! Change data capture windows.
//!
//! Each run reads the changes between the end of the previous window and the
//! server time taken at the start of this run. Both bounds are mapped from
//! time to LSN on the server; the run state only stores the time.

use crate::adapters::ChangeWindow;
use crate::connection::ConnectionManager;
use crate::error::{ExtractorError, Result};
use crate::metadata::{self, LsnRelation};
use crate::models::{Lsn, RunState, TableRef};
use chrono::NaiveDateTime;

/// What a CDC run exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdcExport {
    /// Changes inside the window
    Changes(ChangeWindow),
    /// The whole table, after an unusable window with full-load fallback on
    FullLoad,
}

/// Outcome of the window computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdcPlan {
    pub export: CdcExport,
    /// Server time the window ends at; stored as the next `lastFetchedTime`
    pub window_end: NaiveDateTime,
}

/// Checks the mapped bounds of a window.
///
/// # Errors
/// Returns [`ExtractorError::CdcWindow`] when a bound is missing or the
/// window is reversed and full-load fallback is off
pub fn decide_window(
    capture_instance: &str,
    from_lsn: Option<Lsn>,
    to_lsn: Option<Lsn>,
    full_load_fallback: bool,
) -> Result<CdcExport> {
    let problem = match (from_lsn, to_lsn) {
        (Some(from_lsn), Some(to_lsn)) if to_lsn >= from_lsn => {
            return Ok(CdcExport::Changes(ChangeWindow {
                capture_instance: capture_instance.to_string(),
                from_lsn,
                to_lsn,
            }));
        }
        (Some(from_lsn), Some(to_lsn)) => {
            format!("window end {to_lsn} is before window start {from_lsn}")
        }
        (None, _) => "no change data is available after the last fetched time".to_string(),
        (_, None) => "no change data is available up to the current server time".to_string(),
    };

    if full_load_fallback {
        tracing::warn!(
            "CDC window for {} is unusable ({}), falling back to a full load",
            capture_instance,
            problem
        );
        Ok(CdcExport::FullLoad)
    } else {
        Err(ExtractorError::CdcWindow {
            message: format!("capture instance '{capture_instance}': {problem}"),
        })
    }
}

/// Computes the window for this run.
///
/// The server time is read before anything else so that changes committed
/// while the export runs fall into the next window.
///
/// # Errors
/// Returns a user error if CDC is not enabled for the table, a
/// [`ExtractorError::CdcWindow`] error for an unusable window without
/// fallback, or a query error from the CDC functions
pub async fn plan_window(
    conn: &mut ConnectionManager,
    table: &TableRef,
    state: &RunState,
    full_load_fallback: bool,
) -> Result<CdcPlan> {
    let window_end = metadata::server_time(conn).await?;

    let capture_instance = metadata::capture_instance(conn, table)
        .await?
        .ok_or_else(|| {
            ExtractorError::user_input(format!("change data capture is not enabled for table '{table}'"))
        })?;

    let from_lsn = match state.last_fetched_time()? {
        Some(last) => {
            metadata::map_time_to_lsn(conn, LsnRelation::SmallestGreaterThan, last).await?
        }
        None => metadata::min_lsn(conn, &capture_instance).await?,
    };
    let to_lsn =
        metadata::map_time_to_lsn(conn, LsnRelation::LargestLessThanOrEqual, window_end).await?;

    tracing::debug!(
        "CDC window for {}: {:?} .. {:?} (ends {})",
        capture_instance,
        from_lsn,
        to_lsn,
        window_end
    );

    let export = decide_window(&capture_instance, from_lsn, to_lsn, full_load_fallback)?;
    Ok(CdcPlan { export, window_end })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsn(last: u8) -> Lsn {
        let mut bytes = [0u8; 10];
        bytes[9] = last;
        Lsn::new(bytes)
    }

    #[test]
    fn test_valid_window() {
        let export = decide_window("dbo_orders", Some(lsn(1)), Some(lsn(5)), false).unwrap();
        assert_eq!(
            export,
            CdcExport::Changes(ChangeWindow {
                capture_instance: "dbo_orders".to_string(),
                from_lsn: lsn(1),
                to_lsn: lsn(5),
            })
        );
        // a single-LSN window is valid
        assert!(matches!(
            decide_window("dbo_orders", Some(lsn(3)), Some(lsn(3)), false),
            Ok(CdcExport::Changes(_))
        ));
    }

    #[test]
    fn test_reversed_window_is_user_error() {
        let err = decide_window("dbo_orders", Some(lsn(5)), Some(lsn(1)), false).unwrap_err();
        assert!(matches!(err, ExtractorError::CdcWindow { .. }));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_missing_bound_is_user_error() {
        assert!(decide_window("dbo_orders", None, Some(lsn(1)), false).is_err());
        assert!(decide_window("dbo_orders", Some(lsn(1)), None, false).is_err());
    }

    #[test]
    fn test_full_load_fallback() {
        assert_eq!(
            decide_window("dbo_orders", Some(lsn(5)), Some(lsn(1)), true).unwrap(),
            CdcExport::FullLoad
        );
        assert_eq!(
            decide_window("dbo_orders", None, None, true).unwrap(),
            CdcExport::FullLoad
        );
    }
}
