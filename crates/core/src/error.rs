//! Failure taxonomy for the reduction pipeline.
//!
//! Every stage of a job aborts with one of these variants; the outcome
//! classifier in [`crate::outcome`] turns the terminal variant into the
//! status text and destination of the outgoing message.

/// Recommended retry delay for permission failures (6 hours).
///
/// Shared storage mounts come and go; a permission failure is usually
/// transient at this timescale, so the outgoing report asks the server
/// to resubmit rather than giving up on the run.
pub const PERMISSION_RETRY_SECS: u64 = 6 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ReductionError {
    /// A required message field is missing or malformed. Raised before
    /// any filesystem mutation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A required path is unreadable or unwritable.
    #[error("Permission error: {0}")]
    Permission(String),

    /// The user reduction script raised an uncaught error.
    #[error("Error in user reduction script: {kind} - {message}")]
    ScriptExecution {
        /// Error kind reported by the script runtime (exception type,
        /// process exit, etc.).
        kind: String,
        /// Human-readable error message.
        message: String,
    },

    /// The reduction script exceeded its wall-clock budget and was
    /// abandoned.
    #[error("Reduction script timed out after {elapsed_secs}s")]
    Timeout {
        /// Configured budget that elapsed, in seconds.
        elapsed_secs: u64,
    },

    /// Publishing the outgoing message failed. Logged only, never
    /// retried.
    #[error("Failed to publish outcome: {0}")]
    Transport(String),
}
