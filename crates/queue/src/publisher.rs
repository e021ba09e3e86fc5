//! The publishing boundary towards the message broker.
//!
//! [`Publisher`] is the narrow seam the engine reports through; the
//! real broker client lives outside this repository. [`StdoutPublisher`]
//! writes line-delimited JSON envelopes for a broker shim (and for
//! running a worker by hand).

use autoreduce_core::job::Message;

/// Failure publishing an outgoing message. Per policy this is logged
/// and never retried: a dead transport must not trap the process in a
/// retry loop.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write to transport: {0}")]
    Write(#[from] std::io::Error),
}

/// Point-to-point, at-least-once message publishing.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `message` to the named destination.
    async fn send(&self, destination: &str, message: &Message) -> Result<(), TransportError>;
}

/// Publishes envelopes as JSON lines on stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutPublisher;

#[async_trait::async_trait]
impl Publisher for StdoutPublisher {
    async fn send(&self, destination: &str, message: &Message) -> Result<(), TransportError> {
        let envelope = serde_json::json!({
            "destination": destination,
            "message": message,
        });
        let line = serde_json::to_string(&envelope)?;
        tracing::debug!(destination, "publishing message");
        println!("{line}");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
