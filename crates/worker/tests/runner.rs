//! End-to-end pipeline tests driven by a recording publisher and mock
//! procedures.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use autoreduce_core::job::{JobLogs, Message, ReductionArguments};
use autoreduce_core::scripting::{
    ProcedureInvocation, ProcedureLoader, ProcedureOutcome, ReductionProcedure,
};
use autoreduce_core::ReductionError;
use autoreduce_queue::destinations::{
    REDUCTION_COMPLETE, REDUCTION_ERROR, REDUCTION_SKIPPED, REDUCTION_STARTED,
};
use autoreduce_queue::{Publisher, TransportError};
use autoreduce_worker::{JobRunner, WorkerConfig};

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingPublisher {
    sends: Mutex<Vec<(String, Message)>>,
}

impl RecordingPublisher {
    fn destinations(&self) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .map(|(dest, _)| dest.clone())
            .collect()
    }

    fn last_destination(&self) -> String {
        self.destinations().last().cloned().expect("no sends recorded")
    }
}

#[async_trait::async_trait]
impl Publisher for RecordingPublisher {
    async fn send(&self, destination: &str, message: &Message) -> Result<(), TransportError> {
        self.sends
            .lock()
            .unwrap()
            .push((destination.to_string(), message.clone()));
        Ok(())
    }
}

enum Behavior {
    Complete { extra_outputs: Vec<serde_json::Value> },
    Fail { kind: &'static str, message: &'static str },
    Hang,
}

struct MockProcedure {
    skip_runs: Vec<u64>,
    behavior: Behavior,
    calls: AtomicUsize,
}

impl MockProcedure {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            skip_runs: Vec::new(),
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    fn with_skip_runs(skip_runs: Vec<u64>) -> Arc<Self> {
        Arc::new(Self {
            skip_runs,
            behavior: Behavior::Complete {
                extra_outputs: vec![],
            },
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Newtype so the foreign `ReductionProcedure` trait can be implemented
/// for a shared `Arc<MockProcedure>` without violating coherence.
struct SharedProcedure(Arc<MockProcedure>);

#[async_trait::async_trait]
impl ReductionProcedure for SharedProcedure {
    fn skip_runs(&self) -> &[u64] {
        &self.0.skip_runs
    }

    async fn run(
        &self,
        invocation: &ProcedureInvocation,
        logs: JobLogs,
    ) -> Result<ProcedureOutcome, ReductionError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        logs.script_line("procedure invoked");
        match &self.0.behavior {
            Behavior::Complete { extra_outputs } => {
                tokio::fs::write(invocation.output_dir.join("reduced.nxs"), b"data")
                    .await
                    .expect("write reduced output");
                Ok(ProcedureOutcome::Completed {
                    extra_outputs: extra_outputs.clone(),
                })
            }
            Behavior::Fail { kind, message } => Err(ReductionError::ScriptExecution {
                kind: kind.to_string(),
                message: message.to_string(),
            }),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(300)).await;
                Ok(ProcedureOutcome::Completed {
                    extra_outputs: vec![],
                })
            }
        }
    }
}

struct MockLoader {
    procedure: Arc<MockProcedure>,
}

#[async_trait::async_trait]
impl ProcedureLoader for MockLoader {
    async fn load(
        &self,
        _instrument: &str,
    ) -> Result<Box<dyn ReductionProcedure>, ReductionError> {
        Ok(Box::new(SharedProcedure(self.procedure.clone())))
    }
}

/// A loader that never finishes, like a script whose module top level
/// blocks during the skip-list probe.
struct HangingLoader;

#[async_trait::async_trait]
impl ProcedureLoader for HangingLoader {
    async fn load(
        &self,
        _instrument: &str,
    ) -> Result<Box<dyn ReductionProcedure>, ReductionError> {
        tokio::time::sleep(Duration::from_secs(300)).await;
        Err(ReductionError::ScriptExecution {
            kind: "Spawn".to_string(),
            message: "unreachable".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn test_config(root: &Path) -> WorkerConfig {
    WorkerConfig {
        archive_root: root.join("archive"),
        temp_root: root.join("work"),
        scripts_dir: root.join("scripts"),
        python_bin: "python3".to_string(),
        script_timeout: Duration::from_secs(60),
        flat_output_instruments: Default::default(),
        preserve_output_instruments: Default::default(),
        software: Some("6.1".to_string()),
    }
}

fn pending_message(input: &Path) -> Message {
    Message {
        data: Some(input.display().to_string()),
        facility: Some("ISIS".to_string()),
        instrument: Some("ABC".to_string()),
        rb_number: Some(json!(12345)),
        run_number: Some(json!(100)),
        reduction_script: Some("def main(input_file, output_dir): pass".to_string()),
        reduction_arguments: Some(ReductionArguments::default()),
        ..Message::default()
    }
}

fn write_input(root: &Path) -> std::path::PathBuf {
    let input = root.join("RAW100.nxs");
    std::fs::write(&input, b"raw counts").expect("write input");
    input
}

fn runner(
    config: WorkerConfig,
    publisher: &Arc<RecordingPublisher>,
    procedure: &Arc<MockProcedure>,
) -> JobRunner {
    JobRunner::new(
        config,
        publisher.clone(),
        Arc::new(MockLoader {
            procedure: procedure.clone(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Scenario A: successful reduction versions past an existing "0"
/// directory and reports to the complete queue with a null status.
#[tokio::test]
async fn successful_job_selects_next_version_and_completes() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = write_input(tmp.path());
    let config = test_config(tmp.path());
    std::fs::create_dir_all(config.archive_root.join("ABC/12345/100/0")).expect("mkdir");

    let publisher = Arc::new(RecordingPublisher::default());
    let procedure = MockProcedure::new(Behavior::Complete {
        extra_outputs: vec![],
    });
    let outgoing = runner(config.clone(), &publisher, &procedure)
        .run(pending_message(&input))
        .await;

    assert_eq!(outgoing.message, None);
    assert_eq!(outgoing.reduction_data.len(), 1);
    assert!(outgoing.reduction_data[0].ends_with("/100/1"));
    assert_eq!(procedure.calls(), 1);
    assert_eq!(
        publisher.destinations(),
        vec![REDUCTION_STARTED.to_string(), REDUCTION_COMPLETE.to_string()]
    );

    let final_dir = config.archive_root.join("ABC/12345/100/1");
    assert!(final_dir.join("reduced.nxs").is_file());
    assert!(final_dir.join("reduction_log/RB12345Run100Script.out").is_file());
    // The working tree is gone.
    assert!(!config.temp_root.join("ABC/12345/100").exists());
    // Logs always reach the outgoing message.
    assert!(outgoing.reduction_log.unwrap().contains("procedure invoked"));
    assert!(!outgoing.admin_log.unwrap().is_empty());
    assert_eq!(outgoing.software.as_deref(), Some("6.1"));
}

/// Scenario B: a script error whose text mentions "skip" is routed to
/// the skipped queue, not the error queue.
#[tokio::test]
async fn skip_textual_error_is_reported_as_skipped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = write_input(tmp.path());
    let publisher = Arc::new(RecordingPublisher::default());
    let procedure = MockProcedure::new(Behavior::Fail {
        kind: "Exception",
        message: "skip due to event mode",
    });

    let outgoing = runner(test_config(tmp.path()), &publisher, &procedure)
        .run(pending_message(&input))
        .await;

    assert!(outgoing.message.unwrap().contains("Reduction Skipped:"));
    assert_eq!(outgoing.retry_in, None);
    assert_eq!(publisher.last_destination(), REDUCTION_SKIPPED);
}

/// Scenario C: an unreadable input fails as a permission error with the
/// 6-hour retry recommendation, before any directory is created.
#[tokio::test]
async fn missing_input_is_a_permission_error_without_filesystem_mutation() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = test_config(tmp.path());
    let publisher = Arc::new(RecordingPublisher::default());
    let procedure = MockProcedure::new(Behavior::Complete {
        extra_outputs: vec![],
    });

    let missing = tmp.path().join("not-there.nxs");
    let outgoing = runner(config.clone(), &publisher, &procedure)
        .run(pending_message(&missing))
        .await;

    assert!(outgoing.message.unwrap().starts_with("Permission error:"));
    assert_eq!(outgoing.retry_in, Some(21_600));
    assert_eq!(publisher.last_destination(), REDUCTION_ERROR);
    assert_eq!(procedure.calls(), 0);
    assert!(!config.archive_root.exists());
    assert!(!config.temp_root.exists());
}

#[tokio::test]
async fn run_in_skip_list_never_invokes_the_entry_point() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = write_input(tmp.path());
    let publisher = Arc::new(RecordingPublisher::default());
    let procedure = MockProcedure::with_skip_runs(vec![100, 200]);

    let outgoing = runner(test_config(tmp.path()), &publisher, &procedure)
        .run(pending_message(&input))
        .await;

    assert_eq!(procedure.calls(), 0);
    assert_eq!(
        outgoing.message.as_deref(),
        Some("Reduction Skipped: listed in procedure skip set")
    );
    assert_eq!(publisher.last_destination(), REDUCTION_SKIPPED);
}

#[tokio::test]
async fn hanging_procedure_times_out() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = write_input(tmp.path());
    let mut config = test_config(tmp.path());
    config.script_timeout = Duration::from_secs(1);
    let publisher = Arc::new(RecordingPublisher::default());
    let procedure = MockProcedure::new(Behavior::Hang);

    let outgoing = runner(config, &publisher, &procedure)
        .run(pending_message(&input))
        .await;

    assert_eq!(procedure.calls(), 1);
    assert!(outgoing.message.unwrap().contains("timed out"));
    assert_eq!(outgoing.retry_in, None);
    assert_eq!(publisher.last_destination(), REDUCTION_ERROR);
}

/// Loading runs user code too (the script's module top level), so a
/// hang there must hit the same budget as a hang in the entry point.
#[tokio::test]
async fn hanging_procedure_load_times_out() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = write_input(tmp.path());
    let mut config = test_config(tmp.path());
    config.script_timeout = Duration::from_secs(1);
    let publisher = Arc::new(RecordingPublisher::default());

    let outgoing = JobRunner::new(config, publisher.clone(), Arc::new(HangingLoader))
        .run(pending_message(&input))
        .await;

    assert!(outgoing.message.unwrap().contains("timed out"));
    assert_eq!(publisher.last_destination(), REDUCTION_ERROR);
}

#[tokio::test]
async fn invalid_message_fails_validation_before_any_work() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = test_config(tmp.path());
    let publisher = Arc::new(RecordingPublisher::default());
    let procedure = MockProcedure::new(Behavior::Complete {
        extra_outputs: vec![],
    });

    let mut message = pending_message(&tmp.path().join("RAW100.nxs"));
    message.instrument = None;
    let outgoing = runner(config.clone(), &publisher, &procedure)
        .run(message)
        .await;

    assert!(outgoing.message.unwrap().contains("instrument is missing"));
    // Validation fails before the started notification.
    assert_eq!(publisher.destinations(), vec![REDUCTION_ERROR.to_string()]);
    assert!(!config.archive_root.exists());
    assert!(!config.temp_root.exists());
}

#[tokio::test]
async fn extra_outputs_are_materialized_in_order() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = write_input(tmp.path());
    let extra_dir = tmp.path().join("calibration");
    let publisher = Arc::new(RecordingPublisher::default());
    let procedure = MockProcedure::new(Behavior::Complete {
        extra_outputs: vec![json!(extra_dir.display().to_string())],
    });

    let outgoing = runner(test_config(tmp.path()), &publisher, &procedure)
        .run(pending_message(&input))
        .await;

    assert_eq!(outgoing.message, None);
    assert_eq!(outgoing.reduction_data.len(), 2);
    assert!(outgoing.reduction_data[0].ends_with("/100/0"));
    assert_eq!(outgoing.reduction_data[1], extra_dir.display().to_string());
    assert!(extra_dir.join("reduced.nxs").is_file());
}

#[tokio::test]
async fn overwrite_reuses_version_zero() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = write_input(tmp.path());
    let config = test_config(tmp.path());
    std::fs::create_dir_all(config.archive_root.join("ABC/12345/100/0")).expect("mkdir");

    let publisher = Arc::new(RecordingPublisher::default());
    let procedure = MockProcedure::new(Behavior::Complete {
        extra_outputs: vec![],
    });
    let mut message = pending_message(&input);
    message.overwrite = true;

    let outgoing = runner(config, &publisher, &procedure).run(message).await;
    assert!(outgoing.reduction_data[0].ends_with("/100/0"));
    assert_eq!(publisher.last_destination(), REDUCTION_COMPLETE);
}

#[tokio::test]
async fn flat_layout_instrument_omits_run_directory() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = write_input(tmp.path());
    let mut config = test_config(tmp.path());
    config.flat_output_instruments.insert("ABC".to_string());

    let publisher = Arc::new(RecordingPublisher::default());
    let procedure = MockProcedure::new(Behavior::Complete {
        extra_outputs: vec![],
    });
    let outgoing = runner(config, &publisher, &procedure)
        .run(pending_message(&input))
        .await;

    assert!(outgoing.reduction_data[0].ends_with("/12345/0"));
    assert!(!outgoing.reduction_data[0].contains("/100/"));
}

#[tokio::test]
async fn preserve_class_keeps_existing_destination_content() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = write_input(tmp.path());
    let mut config = test_config(tmp.path());
    config.preserve_output_instruments.insert("ABC".to_string());
    // Overwrite pins version 0 so the run lands on the pre-existing
    // directory.
    let existing = config.archive_root.join("ABC/12345/100/0");
    std::fs::create_dir_all(&existing).expect("mkdir");
    std::fs::write(existing.join("previous.nxs"), b"old").expect("write");

    let publisher = Arc::new(RecordingPublisher::default());
    let procedure = MockProcedure::new(Behavior::Complete {
        extra_outputs: vec![],
    });
    let mut message = pending_message(&input);
    message.overwrite = true;

    let outgoing = runner(config, &publisher, &procedure).run(message).await;
    assert_eq!(outgoing.message, None);
    assert!(existing.join("previous.nxs").is_file());
    assert!(existing.join("reduced.nxs").is_file());
}

/// A script failure without skip text still materializes the working
/// tree (the script log) and lands in the error queue.
#[tokio::test]
async fn script_failure_materializes_logs_and_reports_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let input = write_input(tmp.path());
    let config = test_config(tmp.path());
    let publisher = Arc::new(RecordingPublisher::default());
    let procedure = MockProcedure::new(Behavior::Fail {
        kind: "ValueError",
        message: "bad frames",
    });

    let outgoing = runner(config.clone(), &publisher, &procedure)
        .run(pending_message(&input))
        .await;

    let status = outgoing.message.unwrap();
    assert!(status.starts_with("REDUCTION Error:"));
    assert!(status.contains("bad frames"));
    assert_eq!(publisher.last_destination(), REDUCTION_ERROR);

    let script_log = config
        .archive_root
        .join("ABC/12345/100/0/reduction_log/RB12345Run100Script.out");
    assert!(script_log.is_file());
    let contents = std::fs::read_to_string(script_log).expect("read log");
    assert!(contents.contains("bad frames"));
}
