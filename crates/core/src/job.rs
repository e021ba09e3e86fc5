//! Incoming message model, validated job descriptor, and job log sink.
//!
//! A [`Message`] is the loosely-typed wire form exchanged with the rest
//! of the autoreduction system; every field is optional because the
//! at-least-once channel makes no promises about producers.
//! [`JobDescriptor::from_message`] is the single place that turns it
//! into a typed view, failing with a named-field validation error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReductionError;

// ---------------------------------------------------------------------------
// Wire message
// ---------------------------------------------------------------------------

/// Reduction arguments carried by the message: two named buckets that
/// are merged over the procedure's own defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReductionArguments {
    /// User-facing variables every run exposes.
    #[serde(default)]
    pub standard_vars: BTreeMap<String, Value>,
    /// Expert variables hidden behind the advanced toggle.
    #[serde(default)]
    pub advanced_vars: BTreeMap<String, Value>,
}

/// One job message, both incoming (from the pending queue) and outgoing
/// (to the complete/skipped/error queues). Outgoing messages carry all
/// incoming fields plus status text, logs, the retry recommendation,
/// and the produced output locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Path of the immutable input data file.
    pub data: Option<String>,
    pub facility: Option<String>,
    pub instrument: Option<String>,
    /// Proposal/reference number; producers send it as a JSON number or
    /// a numeric string.
    pub rb_number: Option<Value>,
    /// Run number; same loose typing as `rb_number`.
    pub run_number: Option<Value>,
    /// Reduction-procedure reference (script text or path).
    pub reduction_script: Option<String>,
    pub reduction_arguments: Option<ReductionArguments>,
    /// When true, version 0 is reused instead of allocating a new one.
    #[serde(default)]
    pub overwrite: bool,
    pub description: Option<String>,
    /// Software-version tag of the reduction runtime.
    pub software: Option<String>,
    /// Status text: `None` on success, human-readable reason otherwise.
    /// Set at most once; the first write wins.
    pub message: Option<String>,
    /// Recommended retry delay in seconds, when the failure is worth
    /// resubmitting (the server does the actual re-queueing).
    pub retry_in: Option<u64>,
    /// Captured output of the reduction script.
    pub reduction_log: Option<String>,
    /// Engine-side administrative log.
    pub admin_log: Option<String>,
    /// Permanent locations produced by this job, in materialization
    /// order. Append-only once published.
    #[serde(default)]
    pub reduction_data: Vec<String>,
}

impl Message {
    /// Record a status message, keeping only the first one (the outgoing
    /// message has a bounded size, and the first failure is the one that
    /// matters).
    pub fn record_status(&mut self, text: &str) {
        if self.message.as_deref().is_none_or(str::is_empty) {
            self.message = Some(text.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Job descriptor
// ---------------------------------------------------------------------------

/// Validated, typed view over one incoming message. Exclusively owned
/// by a single pipeline execution.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    /// Input data file. Existence is checked by the runner before any
    /// directory is created, not here.
    pub data_file: PathBuf,
    pub facility: String,
    /// Instrument name, normalized to upper-case.
    pub instrument: String,
    pub proposal: u64,
    pub run_number: u64,
    /// Reduction-procedure reference as carried by the message.
    pub reduction_script: String,
    pub arguments: ReductionArguments,
    pub overwrite: bool,
    pub description: Option<String>,
}

impl JobDescriptor {
    /// Validate the message and build the descriptor.
    ///
    /// Every required field must be present and non-null; proposal and
    /// run number must coerce to non-negative integers. The error names
    /// the offending field. No side effects.
    pub fn from_message(message: &Message) -> Result<Self, ReductionError> {
        let data_file = normalize_data_path(require(message.data.as_deref(), "data")?);
        let facility = require(message.facility.as_deref(), "facility")?.to_string();
        let instrument = require(message.instrument.as_deref(), "instrument")?.to_uppercase();
        let proposal = coerce_run_int(message.rb_number.as_ref(), "rb_number")?;
        let run_number = coerce_run_int(message.run_number.as_ref(), "run_number")?;
        let reduction_script =
            require(message.reduction_script.as_deref(), "reduction_script")?.to_string();
        let arguments = message
            .reduction_arguments
            .clone()
            .ok_or_else(|| missing("reduction_arguments"))?;

        Ok(Self {
            data_file,
            facility,
            instrument,
            proposal,
            run_number,
            reduction_script,
            arguments,
            overwrite: message.overwrite,
            description: message.description.clone(),
        })
    }
}

/// Map a Windows share path from the front end onto the archive mount:
/// `\\isis\inst$\…` is `/isis/…` on the workers, and any remaining
/// backslashes become separators.
fn normalize_data_path(raw: &str) -> PathBuf {
    let mapped = match raw.strip_prefix(r"\\isis\inst$\") {
        Some(rest) => format!("/isis/{rest}"),
        None => raw.to_string(),
    };
    PathBuf::from(mapped.replace('\\', "/"))
}

fn missing(field: &str) -> ReductionError {
    ReductionError::Validation(format!("{field} is missing"))
}

fn require<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, ReductionError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(missing(field)),
    }
}

/// Coerce a JSON number or numeric string to a non-negative integer.
fn coerce_run_int(value: Option<&Value>, field: &str) -> Result<u64, ReductionError> {
    let value = value.ok_or_else(|| missing(field))?;
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        ReductionError::Validation(format!("{field} is not a non-negative integer: {value}"))
    })
}

// ---------------------------------------------------------------------------
// Log sink
// ---------------------------------------------------------------------------

/// Shared, cloneable log sink for one job.
///
/// Two buffers: the script-output log (everything the reduction
/// procedure writes) and the administrative log (engine-side notes).
/// Passed explicitly into the procedure call instead of redirecting
/// global streams, so capture survives any exit path — including the
/// call future being dropped on timeout while subprocess readers are
/// still draining.
#[derive(Debug, Clone, Default)]
pub struct JobLogs {
    inner: Arc<Mutex<LogBuffers>>,
}

#[derive(Debug, Default)]
struct LogBuffers {
    script: String,
    admin: String,
}

impl JobLogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw script output (no newline added; subprocess readers
    /// hand over chunks as they arrive).
    pub fn script_raw(&self, text: &str) {
        self.inner.lock().expect("log lock poisoned").script.push_str(text);
    }

    /// Append one line to the script-output log.
    pub fn script_line(&self, text: &str) {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        inner.script.push_str(text);
        inner.script.push('\n');
    }

    /// Append one timestamped line to the administrative log.
    pub fn admin_line(&self, text: &str) {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        inner.admin.push_str(&format!("{stamp} {text}\n"));
    }

    pub fn script_log(&self) -> String {
        self.inner.lock().expect("log lock poisoned").script.clone()
    }

    pub fn admin_log(&self) -> String {
        self.inner.lock().expect("log lock poisoned").admin.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
