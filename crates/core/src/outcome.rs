//! Terminal outcome classification.
//!
//! Turns the job's [`ExecutionResult`] into the status text, retry
//! recommendation, and destination class of the outgoing message.

use crate::error::{ReductionError, PERMISSION_RETRY_SECS};

/// Tagged outcome of one job execution. Produced exactly once per job.
#[derive(Debug)]
pub enum ExecutionResult {
    Success,
    /// Intentionally not processed; not a failure.
    Skipped { reason: String },
    Failed(ReductionError),
}

/// Which outgoing destination class the report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Complete,
    Skipped,
    Error,
}

/// Classified report state for the outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeReport {
    pub disposition: Disposition,
    /// Status text; `None` only on success. Applied to the message
    /// first-write-wins.
    pub status_message: Option<String>,
    /// Recommended retry delay in seconds, when resubmission is worth
    /// suggesting.
    pub retry_in_secs: Option<u64>,
}

/// Classify an execution result.
///
/// Script failures whose message contains "skip" (case-insensitive) are
/// reclassified as skips: instrument scripts long predate the explicit
/// skip signal and announce event-mode runs this way. The explicit
/// [`ProcedureOutcome::Skipped`](crate::scripting::ProcedureOutcome)
/// variant is the forward path; this text match only keeps legacy
/// scripts out of the error queue.
pub fn classify(result: &ExecutionResult) -> OutcomeReport {
    match result {
        ExecutionResult::Success => OutcomeReport {
            disposition: Disposition::Complete,
            status_message: None,
            retry_in_secs: None,
        },
        ExecutionResult::Skipped { reason } => skipped(reason),
        ExecutionResult::Failed(ReductionError::Permission(detail)) => OutcomeReport {
            disposition: Disposition::Error,
            status_message: Some(format!("Permission error: {detail}")),
            retry_in_secs: Some(PERMISSION_RETRY_SECS),
        },
        ExecutionResult::Failed(ReductionError::ScriptExecution { message, .. })
            if message.to_lowercase().contains("skip") =>
        {
            skipped(message)
        }
        ExecutionResult::Failed(error) => OutcomeReport {
            disposition: Disposition::Error,
            status_message: Some(format!("REDUCTION Error: {error}")),
            retry_in_secs: None,
        },
    }
}

fn skipped(reason: &str) -> OutcomeReport {
    OutcomeReport {
        disposition: Disposition::Skipped,
        status_message: Some(format!("Reduction Skipped: {reason}")),
        retry_in_secs: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_has_no_status() {
        let report = classify(&ExecutionResult::Success);
        assert_eq!(report.disposition, Disposition::Complete);
        assert_eq!(report.status_message, None);
        assert_eq!(report.retry_in_secs, None);
    }

    #[test]
    fn skip_carries_reason() {
        let report = classify(&ExecutionResult::Skipped {
            reason: "listed in procedure skip set".to_string(),
        });
        assert_eq!(report.disposition, Disposition::Skipped);
        assert_eq!(
            report.status_message.as_deref(),
            Some("Reduction Skipped: listed in procedure skip set")
        );
    }

    #[test]
    fn permission_failure_recommends_six_hour_retry() {
        let report = classify(&ExecutionResult::Failed(ReductionError::Permission(
            "Couldn't read /data/run.nxs".to_string(),
        )));
        assert_eq!(report.disposition, Disposition::Error);
        assert_eq!(report.retry_in_secs, Some(21_600));
        assert!(report.status_message.unwrap().starts_with("Permission error:"));
    }

    #[test]
    fn script_error_with_skip_text_is_reclassified() {
        let report = classify(&ExecutionResult::Failed(ReductionError::ScriptExecution {
            kind: "Exception".to_string(),
            message: "SKIP due to event mode".to_string(),
        }));
        assert_eq!(report.disposition, Disposition::Skipped);
        assert!(report.status_message.unwrap().contains("Reduction Skipped:"));
    }

    #[test]
    fn script_error_without_skip_text_stays_an_error() {
        let report = classify(&ExecutionResult::Failed(ReductionError::ScriptExecution {
            kind: "ValueError".to_string(),
            message: "bad frames".to_string(),
        }));
        assert_eq!(report.disposition, Disposition::Error);
        let status = report.status_message.unwrap();
        assert!(status.starts_with("REDUCTION Error:"));
        assert!(status.contains("bad frames"));
    }

    #[test]
    fn timeout_is_a_non_retryable_error() {
        let report = classify(&ExecutionResult::Failed(ReductionError::Timeout {
            elapsed_secs: 3600,
        }));
        assert_eq!(report.disposition, Disposition::Error);
        assert_eq!(report.retry_in_secs, None);
        assert!(report.status_message.unwrap().contains("timed out"));
    }
}
