//! The job pipeline: descriptor → path plan → procedure execution →
//! materialization → classification → report.
//!
//! One [`JobRunner`] handles exactly one job. Stages abort with a
//! classified failure; the final report is always published. Jobs that
//! reach the execution stage materialize their working tree even when
//! the script fails or skips (the working tree holds the script log),
//! while earlier failures leave permanent storage untouched.

use std::sync::Arc;

use autoreduce_core::job::{JobDescriptor, JobLogs, Message};
use autoreduce_core::materialize;
use autoreduce_core::scripting::{ProcedureInvocation, ProcedureLoader, ProcedureOutcome};
use autoreduce_core::{classify, ExecutionResult, PathPlan, PathPlanner, ReductionError};
use autoreduce_queue::destinations::{REDUCTION_SKIPPED, REDUCTION_STARTED};
use autoreduce_queue::{destinations, Publisher};

use crate::config::WorkerConfig;

pub struct JobRunner {
    config: WorkerConfig,
    publisher: Arc<dyn Publisher>,
    loader: Arc<dyn ProcedureLoader>,
}

impl JobRunner {
    pub fn new(
        config: WorkerConfig,
        publisher: Arc<dyn Publisher>,
        loader: Arc<dyn ProcedureLoader>,
    ) -> Self {
        Self {
            config,
            publisher,
            loader,
        }
    }

    /// Process one job end to end and return the outgoing message as
    /// published.
    pub async fn run(&self, mut message: Message) -> Message {
        let logs = JobLogs::new();
        let result = self.execute(&mut message, &logs).await;
        self.report(message, &logs, &result).await
    }

    /// Run the pipeline stages up to a terminal [`ExecutionResult`].
    async fn execute(&self, message: &mut Message, logs: &JobLogs) -> ExecutionResult {
        let descriptor = match JobDescriptor::from_message(message) {
            Ok(descriptor) => descriptor,
            Err(error) => return ExecutionResult::Failed(error),
        };
        if message.software.is_none() {
            message.software = self.config.software.clone();
        }
        if let Some(description) = &descriptor.description {
            tracing::info!(%description, "job description");
        }

        // Progress notification; a dead transport will be rediscovered
        // at the final report, so this is best-effort.
        if let Err(error) = self.publisher.send(REDUCTION_STARTED, message).await {
            tracing::warn!(%error, "failed to publish started notification");
            logs.admin_line(&format!("Failed to publish started notification - {error}"));
        }

        let planner = PathPlanner::new(&self.config.archive_root, &self.config.temp_root);
        let base = PathPlanner::instrument_dir(
            &descriptor.instrument,
            descriptor.proposal,
            descriptor.run_number,
        );
        let flat_layout = self
            .config
            .flat_output_instruments
            .contains(&descriptor.instrument);
        let plan = match planner.plan(
            &base,
            descriptor.run_number,
            flat_layout,
            descriptor.overwrite,
        ) {
            Ok(plan) => plan,
            Err(error) => return ExecutionResult::Failed(error),
        };
        logs.admin_line(&format!("Final result directory: {}", plan.final_dir.display()));

        // The input must be readable before any directory is created,
        // so an unreadable input leaves the filesystem untouched.
        if let Err(error) = tokio::fs::File::open(&descriptor.data_file).await {
            return ExecutionResult::Failed(ReductionError::Permission(format!(
                "Couldn't read {} - {error}",
                descriptor.data_file.display()
            )));
        }
        for dir in [&plan.temp_dir, &plan.log_dir, &plan.final_dir] {
            if let Err(error) = tokio::fs::create_dir_all(dir).await {
                return ExecutionResult::Failed(ReductionError::Permission(format!(
                    "Couldn't write to {} - {error}",
                    dir.display()
                )));
            }
        }

        // Execution stage reached: from here the working tree is
        // materialized whatever happens, matching what operators expect
        // to find in the archive after a failed run.
        let outcome = self.execute_procedure(&descriptor, &plan, logs).await;

        self.write_script_log(&descriptor, &plan, logs, outcome.as_ref().err())
            .await;

        let preserve = self
            .config
            .preserve_output_instruments
            .contains(&descriptor.instrument);
        materialize::materialize(&plan.temp_dir, &plan.final_dir, preserve, message, logs).await;
        if let Ok(ProcedureOutcome::Completed { extra_outputs }) = &outcome {
            materialize::materialize_extras(&plan.temp_dir, extra_outputs, preserve, message, logs)
                .await;
        }
        materialize::cleanup_temp(&plan.temp_dir, logs).await;

        match outcome {
            Ok(ProcedureOutcome::Completed { .. }) => ExecutionResult::Success,
            Ok(ProcedureOutcome::Skipped { reason }) => ExecutionResult::Skipped { reason },
            Err(error) => ExecutionResult::Failed(error),
        }
    }

    /// Load the procedure and invoke it, the whole sequence under the
    /// wall-clock budget: loading already executes user code (the
    /// script's module top level), so it must not escape the budget
    /// either.
    ///
    /// On expiry the raced future is dropped, which kills any live
    /// interpreter (kill_on_drop) while the detached readers keep
    /// whatever output was already produced.
    async fn execute_procedure(
        &self,
        descriptor: &JobDescriptor,
        plan: &PathPlan,
        logs: &JobLogs,
    ) -> Result<ProcedureOutcome, ReductionError> {
        let budget = self.config.script_timeout;
        match tokio::time::timeout(budget, self.load_and_invoke(descriptor, plan, logs)).await {
            Ok(result) => result,
            Err(_) => {
                logs.admin_line(&format!(
                    "Reduction script abandoned after {}s",
                    budget.as_secs()
                ));
                Err(ReductionError::Timeout {
                    elapsed_secs: budget.as_secs(),
                })
            }
        }
    }

    async fn load_and_invoke(
        &self,
        descriptor: &JobDescriptor,
        plan: &PathPlan,
        logs: &JobLogs,
    ) -> Result<ProcedureOutcome, ReductionError> {
        let procedure = self.loader.load(&descriptor.instrument).await?;

        if procedure.skip_runs().contains(&descriptor.run_number) {
            tracing::info!(
                run_number = descriptor.run_number,
                instrument = %descriptor.instrument,
                "run listed in procedure skip set"
            );
            return Ok(ProcedureOutcome::Skipped {
                reason: "listed in procedure skip set".to_string(),
            });
        }

        let invocation = ProcedureInvocation::new(
            descriptor.data_file.clone(),
            plan.temp_dir.clone(),
            &descriptor.arguments,
        );
        logs.admin_line(&format!(
            "Reduction started: {} -> {}",
            invocation.input_file.display(),
            invocation.output_dir.display()
        ));

        procedure.run(&invocation, logs.clone()).await
    }

    /// Persist the script-output buffer into the working tree so it is
    /// materialized next to the results; on failure the error text is
    /// appended, as operators read this file first.
    async fn write_script_log(
        &self,
        descriptor: &JobDescriptor,
        plan: &PathPlan,
        logs: &JobLogs,
        error: Option<&ReductionError>,
    ) {
        let name = format!(
            "RB{}Run{}Script.out",
            descriptor.proposal, descriptor.run_number
        );
        let mut contents = logs.script_log();
        if let Some(error) = error {
            contents.push_str(&format!("\n{error}\n"));
        }
        let path = plan.log_dir.join(name);
        if let Err(write_error) = tokio::fs::write(&path, contents).await {
            tracing::warn!(path = %path.display(), %write_error, "could not write script log");
            logs.admin_line(&format!(
                "Could not write script log {} - {write_error}",
                path.display()
            ));
        }
    }

    /// Fill in logs and classification, route on the final status text,
    /// and publish. Publishing is best-effort: a transport failure is
    /// logged and the process moves on to exit.
    async fn report(
        &self,
        mut message: Message,
        logs: &JobLogs,
        result: &ExecutionResult,
    ) -> Message {
        let report = classify(result);
        if let Some(status) = &report.status_message {
            message.record_status(status);
        }
        if message.retry_in.is_none() {
            message.retry_in = report.retry_in_secs;
        }
        message.reduction_log = Some(logs.script_log());
        message.admin_log = Some(logs.admin_log());

        // Route on the final status text rather than the execution
        // result alone: a materialization failure recorded on an
        // otherwise successful job must reach the error queue.
        let destination = match &message.message {
            None => destinations::REDUCTION_COMPLETE,
            Some(text) if text.to_lowercase().contains("skip") => REDUCTION_SKIPPED,
            Some(_) => destinations::REDUCTION_ERROR,
        };

        match self.publisher.send(destination, &message).await {
            Ok(()) => tracing::info!(destination, "reduction job reported"),
            Err(error) => {
                // Never retried: a dead transport must not trap the
                // process in a publish loop.
                tracing::error!(destination, %error, "failed to publish job outcome");
            }
        }
        message
    }
}

// Pipeline coverage lives in `tests/runner.rs`, driven by mock
// publishers and procedures.
