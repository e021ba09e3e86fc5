//! Domain logic for the autoreduction job engine.
//!
//! This crate holds everything a single reduction job needs that is not
//! transport: the validated job descriptor, temporary/permanent path
//! planning, the reduction-procedure contract and its Python subprocess
//! implementation, result materialization, and outcome classification.
//! Queue plumbing lives in `autoreduce-queue`; orchestration lives in
//! `autoreduce-worker`.

pub mod error;
pub mod job;
pub mod materialize;
pub mod outcome;
pub mod paths;
pub mod scripting;

pub use error::{ReductionError, PERMISSION_RETRY_SECS};
pub use job::{JobDescriptor, JobLogs};
pub use outcome::{classify, Disposition, ExecutionResult, OutcomeReport};
pub use paths::{PathPlan, PathPlanner};
