//! The capability interface exposed by a loaded reduction procedure.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::error::ReductionError;
use crate::job::{JobLogs, ReductionArguments};

/// Arguments for one entry-point invocation.
///
/// The two buckets are the job's reduction arguments; the procedure
/// merges them over its own declared defaults, job values winning.
#[derive(Debug, Clone)]
pub struct ProcedureInvocation {
    /// Immutable input data file.
    pub input_file: PathBuf,
    /// Temporary working directory the procedure writes into.
    pub output_dir: PathBuf,
    pub standard_vars: BTreeMap<String, Value>,
    pub advanced_vars: BTreeMap<String, Value>,
}

impl ProcedureInvocation {
    pub fn new(input_file: PathBuf, output_dir: PathBuf, arguments: &ReductionArguments) -> Self {
        Self {
            input_file,
            output_dir,
            standard_vars: arguments.standard_vars.clone(),
            advanced_vars: arguments.advanced_vars.clone(),
        }
    }
}

/// Terminal result of one entry-point invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcedureOutcome {
    /// The procedure completed. `extra_outputs` is whatever the entry
    /// point returned as additional save locations — kept as raw JSON
    /// values so the materializer can warn about non-string entries.
    Completed { extra_outputs: Vec<Value> },
    /// The procedure explicitly declined to process this run.
    Skipped { reason: String },
}

/// A loaded instrument reduction procedure.
///
/// Object-safe so the worker can run against mocks; the runner is the
/// single call site and enforces the wall-clock budget around `run`.
#[async_trait::async_trait]
pub trait ReductionProcedure: Send + Sync {
    /// Run numbers this procedure unconditionally skips.
    fn skip_runs(&self) -> &[u64];

    /// Invoke the entry point. All procedure output must be delivered
    /// through `logs`, never to the engine's own streams.
    async fn run(
        &self,
        invocation: &ProcedureInvocation,
        logs: JobLogs,
    ) -> Result<ProcedureOutcome, ReductionError>;
}

impl std::fmt::Debug for dyn ReductionProcedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ReductionProcedure")
    }
}

/// Loads the reduction procedure for an instrument from its well-known
/// location.
#[async_trait::async_trait]
pub trait ProcedureLoader: Send + Sync {
    async fn load(&self, instrument: &str)
        -> Result<Box<dyn ReductionProcedure>, ReductionError>;
}
