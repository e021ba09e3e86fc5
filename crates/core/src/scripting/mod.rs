//! Reduction-procedure contract and execution.
//!
//! The user-supplied procedure sits behind the narrow
//! [`procedure::ReductionProcedure`] capability: a skip list plus one
//! `run(input_file, output_dir)` entry point. The production
//! implementation crosses a subprocess boundary into a Python
//! interpreter ([`python`]); the engine never lets unverified code past
//! that call seam.

pub mod procedure;
pub mod python;
pub mod subprocess;

pub use procedure::{
    ProcedureInvocation, ProcedureLoader, ProcedureOutcome, ReductionProcedure,
};
pub use python::PythonLoader;
