//! Worker settings, read from the environment (`.env` is loaded by the
//! binary before this runs).

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Default wall-clock budget for one reduction script (one hour).
const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 3600;

/// Instruments whose permanent layout omits the run-number segment and
/// whose prior output is preserved on re-reduction (the excitation
/// class, historically).
const DEFAULT_EXCITATION_INSTRUMENTS: &str = "LET,MAPS,MARI,MERLIN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Settings for one worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root of permanent, versioned storage.
    pub archive_root: PathBuf,
    /// Root of temporary working storage.
    pub temp_root: PathBuf,
    /// Per-instrument script directories, `{scripts_dir}/{INSTRUMENT}/reduce.py`.
    pub scripts_dir: PathBuf,
    /// Python interpreter used for reduction procedures.
    pub python_bin: String,
    /// Wall-clock budget for the procedure call.
    pub script_timeout: Duration,
    /// Instruments stored without a run-number directory.
    pub flat_output_instruments: HashSet<String>,
    /// Instruments whose existing permanent output is never removed
    /// before materialization.
    pub preserve_output_instruments: HashSet<String>,
    /// Software-version tag stamped into outgoing messages that do not
    /// carry one.
    pub software: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let timeout_secs = match std::env::var("AUTOREDUCE_SCRIPT_TIMEOUT_SECS") {
            Ok(value) => value.parse::<u64>().map_err(|_| ConfigError::Invalid {
                var: "AUTOREDUCE_SCRIPT_TIMEOUT_SECS",
                value,
            })?,
            Err(_) => DEFAULT_SCRIPT_TIMEOUT_SECS,
        };

        Ok(Self {
            archive_root: env_path("AUTOREDUCE_ARCHIVE_ROOT", "/instrument"),
            temp_root: env_path("AUTOREDUCE_TEMP_ROOT", "/autoreducetmp"),
            scripts_dir: env_path("AUTOREDUCE_SCRIPTS_DIR", "/autoreduce/scripts"),
            python_bin: env_or("AUTOREDUCE_PYTHON_BIN", "python3"),
            script_timeout: Duration::from_secs(timeout_secs),
            flat_output_instruments: env_instrument_set(
                "AUTOREDUCE_FLAT_OUTPUT_INSTRUMENTS",
            ),
            preserve_output_instruments: env_instrument_set(
                "AUTOREDUCE_PRESERVE_OUTPUT_INSTRUMENTS",
            ),
            software: std::env::var("AUTOREDUCE_SOFTWARE").ok(),
        })
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_path(var: &str, default: &str) -> PathBuf {
    PathBuf::from(env_or(var, default))
}

/// Comma-separated instrument list, upper-cased. Both instrument-class
/// variables default to the excitation instruments.
fn env_instrument_set(var: &str) -> HashSet<String> {
    parse_instrument_set(&env_or(var, DEFAULT_EXCITATION_INSTRUMENTS))
}

fn parse_instrument_set(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|name| name.trim().to_uppercase())
        .filter(|name| !name.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
