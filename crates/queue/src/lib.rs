//! Queue-side plumbing for the autoreduction engine.
//!
//! The broker transport itself is an external collaborator; this crate
//! only fixes the destination names and the [`Publisher`] boundary the
//! worker reports through.

pub mod destinations;
pub mod publisher;

pub use publisher::{Publisher, StdoutPublisher, TransportError};
