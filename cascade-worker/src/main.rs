//! Worker process of one cascade node.
//!
//! Runs either the main consumer of the node or the copy worker of one table, as selected by
//! the `role` of the loaded [`WorkerConfig`], until SIGINT or SIGTERM.

use cascade_config::Environment;
use cascade_config::shared::WorkerConfig;
use cascade_telemetry::metrics::init_metrics;
use cascade_telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_worker_config;
use crate::core::start_worker;

mod config;
mod core;

fn main() -> anyhow::Result<()> {
    let config = load_worker_config()?;
    let environment = Environment::load()?;

    let _log_flusher = init_tracing(
        env!("CARGO_BIN_NAME"),
        environment,
        config.telemetry.log_dir.as_deref(),
    )?;

    init_metrics(
        config.telemetry.metrics_port,
        &config.queue_name,
        &config.consumer_name,
    )?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: WorkerConfig) -> anyhow::Result<()> {
    if let Err(err) = start_worker(config).await {
        error!("{err}");
        return Err(err);
    }

    Ok(())
}
