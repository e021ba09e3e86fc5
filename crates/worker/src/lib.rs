//! Job worker: one process, one reduction job, start to finish.

pub mod config;
pub mod runner;

pub use config::WorkerConfig;
pub use runner::JobRunner;
