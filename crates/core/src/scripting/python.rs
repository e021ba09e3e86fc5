//! Python reduction procedures behind a subprocess boundary.
//!
//! Each instrument keeps its procedure at
//! `{scripts_dir}/{INSTRUMENT}/reduce.py`, exposing
//! `main(input_file=…, output_dir=…)` and an optional module-level
//! `SKIP_RUNS` list. [`PythonLoader`] probes the skip list at load time;
//! [`PythonProcedure::run`] executes an embedded driver that merges the
//! job's argument buckets into the script's `web_var` namespace, calls
//! the entry point, and hands the outcome back through a result file
//! (stdout stays reserved for the script's own logging).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use super::procedure::{
    ProcedureInvocation, ProcedureLoader, ProcedureOutcome, ReductionProcedure,
};
use super::subprocess;
use crate::error::ReductionError;
use crate::job::JobLogs;

/// Well-known procedure file name inside an instrument's script
/// directory.
pub const PROCEDURE_FILE: &str = "reduce.py";

/// Probe that imports the script and prints its `SKIP_RUNS` list as
/// JSON. Runs the module's top level, which is unavoidable across a
/// process boundary; the real invocation loads it again.
const SKIP_RUNS_PROBE: &str = r#"
import importlib.util
import json
import sys

spec = importlib.util.spec_from_file_location("reducescript", sys.argv[1])
module = importlib.util.module_from_spec(spec)
spec.loader.exec_module(module)
print(json.dumps([int(run) for run in getattr(module, "SKIP_RUNS", [])]))
"#;

/// Driver executed for the real invocation. Reads a JSON request from
/// stdin, loads the script, injects `web_var` argument buckets (request
/// values overwrite script defaults), calls `main`, and writes a JSON
/// outcome to the request's result file. Always exits 0 when the driver
/// itself survives; script failures are reported inside the outcome.
const REDUCTION_DRIVER: &str = r#"
import importlib.util
import json
import sys
import traceback
import types


def load_script(path):
    spec = importlib.util.spec_from_file_location("reducescript", path)
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)
    return module


request = json.load(sys.stdin)
outcome = {"status": "completed", "output_dirs": []}
try:
    script = load_script(request["script"])
    web_var = getattr(script, "web_var", None)
    if web_var is None:
        web_var = types.ModuleType("reduce_vars")
        script.web_var = web_var
    for bucket in ("standard_vars", "advanced_vars"):
        merged = dict(getattr(web_var, bucket, None) or {})
        merged.update(request["arguments"].get(bucket, {}))
        setattr(web_var, bucket, merged)
    returned = script.main(
        input_file=request["input_file"], output_dir=request["output_dir"]
    )
    if isinstance(returned, str):
        outcome["output_dirs"] = [returned]
    elif isinstance(returned, list):
        outcome["output_dirs"] = [
            entry if isinstance(entry, str) else {"invalid": repr(entry)}
            for entry in returned
        ]
    elif returned is not None:
        outcome["invalid_return"] = repr(returned)
except BaseException as exc:
    traceback.print_exc()
    if "skip" in type(exc).__name__.lower():
        outcome = {"status": "skipped", "reason": str(exc)}
    else:
        outcome = {"status": "error", "kind": type(exc).__name__, "message": str(exc)}
with open(request["result_file"], "w") as handle:
    json.dump(outcome, handle)
"#;

/// Outcome JSON written by the driver.
#[derive(Debug, Deserialize)]
struct DriverOutcome {
    status: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    output_dirs: Vec<Value>,
    #[serde(default)]
    invalid_return: Option<String>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Loads Python procedures from per-instrument script directories.
#[derive(Debug, Clone)]
pub struct PythonLoader {
    python_bin: String,
    scripts_dir: PathBuf,
}

impl PythonLoader {
    pub fn new(python_bin: impl Into<String>, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            python_bin: python_bin.into(),
            scripts_dir: scripts_dir.into(),
        }
    }

    fn script_path(&self, instrument: &str) -> PathBuf {
        self.scripts_dir.join(instrument).join(PROCEDURE_FILE)
    }

    /// Read the script's `SKIP_RUNS` list. A probe failure (import
    /// error, bad output) yields an empty list; the real invocation
    /// surfaces the same import error as a script failure.
    async fn probe_skip_runs(&self, script: &Path) -> Vec<u64> {
        // The probe executes the script's module top level; the caller
        // races the whole load under the job budget, and kill_on_drop
        // takes the interpreter down with the abandoned future.
        let output = Command::new(&self.python_bin)
            .arg("-c")
            .arg(SKIP_RUNS_PROBE)
            .arg(script)
            .kill_on_drop(true)
            .output()
            .await;
        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                tracing::warn!(
                    script = %script.display(),
                    exit = output.status.code().unwrap_or(-1),
                    "skip-run probe failed; assuming no skip list"
                );
                return Vec::new();
            }
            Err(error) => {
                tracing::warn!(
                    script = %script.display(),
                    %error,
                    "could not spawn skip-run probe; assuming no skip list"
                );
                return Vec::new();
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .last()
            .and_then(|line| serde_json::from_str::<Vec<u64>>(line.trim()).ok())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ProcedureLoader for PythonLoader {
    async fn load(
        &self,
        instrument: &str,
    ) -> Result<Box<dyn ReductionProcedure>, ReductionError> {
        let script = self.script_path(instrument);
        if tokio::fs::metadata(&script).await.is_err() {
            return Err(ReductionError::ScriptExecution {
                kind: "ScriptNotFound".to_string(),
                message: format!("no reduction script at {}", script.display()),
            });
        }
        let skip_runs = self.probe_skip_runs(&script).await;
        Ok(Box::new(PythonProcedure {
            python_bin: self.python_bin.clone(),
            script,
            skip_runs,
        }))
    }
}

// ---------------------------------------------------------------------------
// Procedure
// ---------------------------------------------------------------------------

/// One loaded `reduce.py`, executed via the embedded driver.
pub struct PythonProcedure {
    python_bin: String,
    script: PathBuf,
    skip_runs: Vec<u64>,
}

/// Monotonic suffix so concurrent invocations within one process (tests,
/// mostly) never share a result file.
static RESULT_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Unlinks the result file on every exit path, including the run future
/// being dropped on timeout after the driver already reported.
struct ResultFileGuard {
    path: PathBuf,
}

impl Drop for ResultFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl PythonProcedure {
    /// Result file inside the job's working tree, so anything that
    /// escapes the guard is still collected with the rest of the tree.
    fn result_file(output_dir: &Path) -> PathBuf {
        let seq = RESULT_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        output_dir.join(format!(".reduce-result-{}-{seq}.json", std::process::id()))
    }
}

#[async_trait::async_trait]
impl ReductionProcedure for PythonProcedure {
    fn skip_runs(&self) -> &[u64] {
        &self.skip_runs
    }

    async fn run(
        &self,
        invocation: &ProcedureInvocation,
        logs: JobLogs,
    ) -> Result<ProcedureOutcome, ReductionError> {
        let result_file = Self::result_file(&invocation.output_dir);
        let _guard = ResultFileGuard {
            path: result_file.clone(),
        };
        let payload = json!({
            "script": self.script,
            "input_file": invocation.input_file,
            "output_dir": invocation.output_dir,
            "result_file": result_file,
            "arguments": {
                "standard_vars": invocation.standard_vars,
                "advanced_vars": invocation.advanced_vars,
            },
        });

        let mut cmd = Command::new(&self.python_bin);
        cmd.arg("-c").arg(REDUCTION_DRIVER);
        let result = subprocess::run_streaming(&mut cmd, &payload, &logs).await?;

        let outcome_bytes = tokio::fs::read(&result_file).await;

        let outcome: DriverOutcome = match outcome_bytes
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        {
            Some(outcome) => outcome,
            None => {
                // The interpreter died before the driver could report.
                return Err(ReductionError::ScriptExecution {
                    kind: "ProcessExit".to_string(),
                    message: format!(
                        "reduction driver exited with code {} without reporting an outcome",
                        result.exit_code
                    ),
                });
            }
        };

        match outcome.status.as_str() {
            "completed" => {
                if let Some(returned) = outcome.invalid_return {
                    logs.admin_line(&format!(
                        "Optional output directories of reduce.py must be a string or list \
                         of strings: {returned}"
                    ));
                }
                Ok(ProcedureOutcome::Completed {
                    extra_outputs: outcome.output_dirs,
                })
            }
            "skipped" => Ok(ProcedureOutcome::Skipped {
                reason: outcome.reason.unwrap_or_else(|| "skipped by script".to_string()),
            }),
            _ => Err(ReductionError::ScriptExecution {
                kind: outcome.kind.unwrap_or_else(|| "Exception".to_string()),
                message: outcome.message.unwrap_or_else(|| "unknown script error".to_string()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
