//! Well-known queue destination names.

use autoreduce_core::Disposition;

/// Incoming jobs waiting for a worker.
pub const REDUCTION_PENDING: &str = "/queue/ReductionPending";

/// Progress notification published before execution begins.
pub const REDUCTION_STARTED: &str = "/queue/ReductionStarted";

/// Jobs that completed successfully.
pub const REDUCTION_COMPLETE: &str = "/queue/ReductionComplete";

/// Jobs intentionally not processed.
pub const REDUCTION_SKIPPED: &str = "/queue/ReductionSkipped";

/// Jobs that terminated with a failure.
pub const REDUCTION_ERROR: &str = "/queue/ReductionError";

/// Outgoing destination for a classified outcome.
pub fn destination_for(disposition: Disposition) -> &'static str {
    match disposition {
        Disposition::Complete => REDUCTION_COMPLETE,
        Disposition::Skipped => REDUCTION_SKIPPED,
        Disposition::Error => REDUCTION_ERROR,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
