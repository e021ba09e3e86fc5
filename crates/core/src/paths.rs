//! Temporary and versioned-permanent storage planning.
//!
//! Permanent layout is `{archive_root}/{instrument}/{proposal}/{run}/{version}`;
//! flat-layout instruments (historically the excitation class) omit the
//! run-number segment. The temporary working tree mirrors the permanent
//! one under `temp_root`, with a `reduction_log/` subdirectory that gets
//! materialized together with the results.

use std::path::{Path, PathBuf};

use crate::error::ReductionError;

/// Name of the log subdirectory inside the working tree.
pub const LOG_DIR_NAME: &str = "reduction_log";

/// Planned storage locations for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPlan {
    /// Temporary working directory handed to the procedure.
    pub temp_dir: PathBuf,
    /// Log directory inside the working tree.
    pub log_dir: PathBuf,
    /// Versioned permanent destination.
    pub final_dir: PathBuf,
    /// Selected version number.
    pub version: u64,
}

/// Computes storage locations for jobs. Side-effect-free apart from
/// listing the permanent directory during version selection.
#[derive(Debug, Clone)]
pub struct PathPlanner {
    archive_root: PathBuf,
    temp_root: PathBuf,
}

impl PathPlanner {
    pub fn new(archive_root: impl Into<PathBuf>, temp_root: impl Into<PathBuf>) -> Self {
        Self {
            archive_root: archive_root.into(),
            temp_root: temp_root.into(),
        }
    }

    /// Relative base directory for a run:
    /// `{instrument}/{proposal}/{run_number}`.
    pub fn instrument_dir(instrument: &str, proposal: u64, run_number: u64) -> PathBuf {
        [
            instrument.to_string(),
            proposal.to_string(),
            run_number.to_string(),
        ]
        .iter()
        .collect()
    }

    /// Plan storage for a run.
    ///
    /// `base` is the archive-relative run directory and must end in the
    /// run-number segment; anything else is a validation failure before
    /// any filesystem access. Flat-layout instruments then drop that
    /// trailing segment. The version is 0 when overwriting or when the
    /// permanent base does not exist yet, otherwise one greater than the
    /// highest integer-named subdirectory.
    pub fn plan(
        &self,
        base: &Path,
        run_number: u64,
        flat_layout: bool,
        overwrite: bool,
    ) -> Result<PathPlan, ReductionError> {
        let last = base.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if last != run_number.to_string() {
            return Err(ReductionError::Validation(format!(
                "output directory does not follow the instrument/proposal/run_number \
                 convention: {}",
                base.display()
            )));
        }

        let rel = if flat_layout {
            base.parent().unwrap_or(base).to_path_buf()
        } else {
            base.to_path_buf()
        };

        let permanent_base = self.archive_root.join(&rel);
        let version = next_version(&permanent_base, overwrite);

        let temp_dir = self.temp_root.join(&rel);
        let log_dir = temp_dir.join(LOG_DIR_NAME);
        let final_dir = permanent_base.join(version.to_string());

        Ok(PathPlan {
            temp_dir,
            log_dir,
            final_dir,
            version,
        })
    }
}

/// Select the next reduction version under `permanent_base`.
fn next_version(permanent_base: &Path, overwrite: bool) -> u64 {
    if overwrite || !permanent_base.is_dir() {
        return 0;
    }
    let mut highest: Option<u64> = None;
    if let Ok(entries) = std::fs::read_dir(permanent_base) {
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(version) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok())
            {
                highest = Some(highest.map_or(version, |h| h.max(version)));
            }
        }
    }
    highest.map_or(0, |h| h + 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
