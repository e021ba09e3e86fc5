use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autoreduce_core::job::Message;
use autoreduce_core::scripting::PythonLoader;
use autoreduce_queue::{destinations, Publisher, StdoutPublisher};
use autoreduce_worker::{JobRunner, WorkerConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autoreduce_worker=info,autoreduce_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(error) = run().await {
        tracing::error!(%error, "worker failed");
        std::process::exit(1);
    }
}

/// Invocation: `autoreduce-worker <destination> <serialized message>`.
/// Only messages addressed to the pending destination are executed.
async fn run() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let destination = args.next().context("missing destination argument")?;
    let raw_message = args.next().context("missing message argument")?;

    let publisher: Arc<dyn Publisher> = Arc::new(StdoutPublisher);

    let message: Message = match serde_json::from_str(&raw_message) {
        Ok(message) => message,
        Err(error) => {
            // Without a parseable message there is nothing to execute;
            // report a stub to the error queue so the job is not lost
            // silently, then fail.
            report_failure(
                publisher.as_ref(),
                Message::default(),
                &format!("REDUCTION Error: invalid message payload: {error}"),
            )
            .await;
            anyhow::bail!("invalid message payload: {error}");
        }
    };

    if destination != destinations::REDUCTION_PENDING {
        tracing::info!(%destination, "not a pending-queue message; nothing to do");
        return Ok(());
    }

    // A config failure still owes the server an error report for this
    // job; only then may the process terminate.
    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            report_failure(
                publisher.as_ref(),
                message,
                &format!("REDUCTION Error: {error}"),
            )
            .await;
            anyhow::bail!("invalid configuration: {error}");
        }
    };

    let loader = Arc::new(PythonLoader::new(
        config.python_bin.clone(),
        config.scripts_dir.clone(),
    ));
    let runner = JobRunner::new(config, publisher, loader);
    let outgoing = runner.run(message).await;
    match &outgoing.message {
        None => tracing::info!("reduction job successfully complete"),
        Some(status) => tracing::info!(%status, "reduction job finished"),
    }
    Ok(())
}

/// Stamp a terminal status on the message and publish it to the error
/// destination, best-effort.
async fn report_failure(publisher: &dyn Publisher, mut message: Message, status: &str) -> Message {
    message.record_status(status);
    if let Err(send_error) = publisher.send(destinations::REDUCTION_ERROR, &message).await {
        tracing::error!(%send_error, "failed to report job failure");
    }
    message
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
