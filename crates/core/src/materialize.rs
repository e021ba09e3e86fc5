//! Materialization of temporary results into permanent storage.
//!
//! Copying is a recursive newer-file-wins tree copy, so repeated
//! materialization of an unchanged source is a no-op. Replacement of an
//! existing destination removes it depth-first with a bounded backoff
//! per entry, tolerating transiently locked files on shared network
//! storage; a removal that never succeeds is recorded on the job and
//! the copy proceeds anyway. There is no lock or transaction across the
//! remove-then-copy sequence: a concurrent reader can observe the
//! destination empty or partially copied in that window.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;

use crate::job::{JobLogs, Message};

/// Per-entry removal backoff schedule: immediate, then growing pauses.
const REMOVAL_BACKOFF: [Duration; 9] = [
    Duration::ZERO,
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
];

/// Materialize the temporary working tree into `destination`.
///
/// Unless `preserve_existing` marks the instrument as keeping prior
/// content, an existing destination is removed first. The destination
/// is appended to the job's output-location list after a successful
/// copy; copy and removal failures are recorded first-write-wins on the
/// job status and never abort the job.
pub async fn materialize(
    temp_dir: &Path,
    destination: &Path,
    preserve_existing: bool,
    message: &mut Message,
    logs: &JobLogs,
) {
    if destination.is_dir() && !preserve_existing {
        remove_directory(destination, message, logs).await;
    }

    logs.admin_line(&format!(
        "Moving {} to {}",
        temp_dir.display(),
        destination.display()
    ));
    match copy_tree(temp_dir, destination).await {
        Ok(()) => message
            .reduction_data
            .push(destination.display().to_string()),
        Err(error) => {
            log_and_message(
                message,
                logs,
                &format!("Unable to copy to {} - {error}", destination.display()),
            );
        }
    }
}

/// Materialize the extra output locations returned by the procedure.
///
/// String entries get the full materialization treatment against the
/// same temporary source; non-string entries are logged as warnings and
/// ignored.
pub async fn materialize_extras(
    temp_dir: &Path,
    extra_outputs: &[Value],
    preserve_existing: bool,
    message: &mut Message,
    logs: &JobLogs,
) {
    for entry in extra_outputs {
        match entry.as_str() {
            Some(path) => {
                materialize(temp_dir, &PathBuf::from(path), preserve_existing, message, logs)
                    .await;
            }
            None => {
                let warning = format!(
                    "Optional output directories of reduce.py must be strings: {entry}"
                );
                tracing::warn!("{warning}");
                logs.admin_line(&warning);
            }
        }
    }
}

/// Best-effort removal of the temporary working tree. Failures are
/// logged, never escalated.
pub async fn cleanup_temp(temp_dir: &Path, logs: &JobLogs) {
    logs.admin_line(&format!("Removing temporary directory {}", temp_dir.display()));
    if let Err(error) = tokio::fs::remove_dir_all(temp_dir).await {
        tracing::warn!(dir = %temp_dir.display(), %error, "unable to remove temporary directory");
        logs.admin_line(&format!(
            "Unable to remove temporary directory {} - {error}",
            temp_dir.display()
        ));
    }
}

/// Recursive tree copy. A destination file is written only when it is
/// missing or strictly older (by mtime) than the source, which makes
/// repeated calls with an unchanged source idempotent.
pub async fn copy_tree(source: &Path, destination: &Path) -> std::io::Result<()> {
    copy_tree_inner(source, destination).await
}

fn copy_tree_inner<'a>(
    source: &'a Path,
    destination: &'a Path,
) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(destination).await?;
        let mut entries = tokio::fs::read_dir(source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let src_path = entry.path();
            let dst_path = destination.join(entry.file_name());
            if src_path.is_dir() {
                copy_tree_inner(&src_path, &dst_path).await?;
            } else if should_copy(&src_path, &dst_path) {
                tokio::fs::copy(&src_path, &dst_path).await?;
            }
        }
        Ok(())
    })
}

/// Copy when the destination is missing or strictly older than the
/// source.
fn should_copy(source: &Path, destination: &Path) -> bool {
    let Ok(dst_meta) = destination.metadata() else {
        return true;
    };
    let (Ok(src_mtime), Ok(dst_mtime)) = (
        source.metadata().and_then(|m| m.modified()),
        dst_meta.modified(),
    ) else {
        return true;
    };
    dst_mtime < src_mtime
}

/// Depth-first removal of an existing destination: files first, each
/// directory only once empty, every removal retried on the backoff
/// schedule. `remove_dir_all` is not robust enough against folders held
/// open over the network.
async fn remove_directory(directory: &Path, message: &mut Message, logs: &JobLogs) {
    if let Err(error) = remove_directory_inner(directory).await {
        log_and_message(
            message,
            logs,
            &format!(
                "Unable to remove existing directory {} - {error}",
                directory.display()
            ),
        );
    }
}

fn remove_directory_inner(
    directory: &Path,
) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + '_>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                remove_directory_inner(&path).await?;
            } else {
                remove_with_backoff(&path, false).await?;
            }
        }
        remove_with_backoff(directory, true).await
    })
}

/// Remove one file or (empty) directory, retrying on the fixed backoff
/// schedule to ride out transient "busy" states on shared storage.
async fn remove_with_backoff(path: &Path, is_dir: bool) -> std::io::Result<()> {
    let mut last_error = None;
    for delay in REMOVAL_BACKOFF {
        tokio::time::sleep(delay).await;
        let result = if is_dir {
            tokio::fs::remove_dir(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match result {
            Ok(()) => return Ok(()),
            // Someone else removed it: that is the state we wanted.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| std::io::Error::other("removal failed")))
}

/// Record a non-fatal materialization failure: admin log always, job
/// status only if no earlier failure claimed it.
fn log_and_message(message: &mut Message, logs: &JobLogs, text: &str) {
    tracing::warn!("{text}");
    logs.admin_line(text);
    message.record_status(text);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
