//! Subprocess plumbing shared by interpreter-backed procedures.
//!
//! Spawns a child process, pipes a JSON payload to its stdin, and
//! streams stdout/stderr into the job's script-output log as they
//! arrive. There is no timeout here: the runner races the whole
//! procedure call against the job's budget, and `kill_on_drop(true)`
//! makes dropping that future kill the child. The reader tasks are
//! detached, so output already produced survives the abandon.

use std::process::Stdio;
use std::time::Instant;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::ReductionError;
use crate::job::JobLogs;

/// Maximum bytes captured per output stream (10 MiB). Output beyond
/// this is discarded to bound memory against runaway scripts.
const MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

/// Result of a finished child process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessResult {
    /// Exit code, `-1` if killed by a signal.
    pub exit_code: i32,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Spawn `cmd`, feed it `payload` on stdin, stream its output into
/// `logs`, and wait for it to exit.
pub async fn run_streaming(
    cmd: &mut Command,
    payload: &Value,
    logs: &JobLogs,
) -> Result<ProcessResult, ReductionError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| ReductionError::ScriptExecution {
        kind: "Spawn".to_string(),
        message: e.to_string(),
    })?;

    // Write the request payload, then close stdin. Best-effort: a child
    // that exits without reading must not wedge the engine.
    if let Some(mut stdin) = child.stdin.take() {
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        let _ = stdin.write_all(&bytes).await;
        drop(stdin);
    }

    let stdout_task = spawn_reader(child.stdout.take(), logs.clone());
    let stderr_task = spawn_reader(child.stderr.take(), logs.clone());

    let status = child
        .wait()
        .await
        .map_err(|e| ReductionError::ScriptExecution {
            kind: "Wait".to_string(),
            message: e.to_string(),
        })?;

    // Readers finish at pipe EOF once the child has exited.
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    Ok(ProcessResult {
        exit_code: status.code().unwrap_or(-1),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Stream one output pipe into the script log, chunk by chunk, capped
/// at [`MAX_OUTPUT_BYTES`].
fn spawn_reader<R>(handle: Option<R>, logs: JobLogs) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(handle) = handle else { return };
        let mut capped = handle.take(MAX_OUTPUT_BYTES);
        let mut buf = [0u8; 8192];
        loop {
            match capped.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => logs.script_raw(&String::from_utf8_lossy(&buf[..n])),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
