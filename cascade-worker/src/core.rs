use std::sync::Arc;

use cascade::concurrency::shutdown::create_shutdown_channel;
use cascade::node::postgres::PgConnector;
use cascade::workers::apply::run_worker;
use cascade_config::shared::{WorkerConfig, WorkerRole};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// Runs the configured worker until it finishes or a shutdown signal arrives.
///
/// A signal lets the worker end its current batch; nothing half applied is committed.
pub async fn start_worker(config: WorkerConfig) -> anyhow::Result<()> {
    log_config(&config);

    let mut sigterm = signal(SignalKind::terminate())?;
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let shutdown_handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down worker");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down worker");
            }
        }

        shutdown_tx.shutdown();
    });

    let result = run_worker(Arc::new(config), PgConnector::new(), shutdown_rx).await;

    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    if let Err(err) = &result {
        warn!(error = %err.summary(), "worker stopped with an error");
    }
    result?;

    info!("worker stopped");

    Ok(())
}

fn log_config(config: &WorkerConfig) {
    let (role, table) = match &config.role {
        WorkerRole::Main => ("main", None),
        WorkerRole::Copy { table } => ("copy", Some(table.as_str())),
    };

    info!(
        queue = %config.queue_name,
        consumer = %config.consumer_name,
        role,
        table,
        loop_delay_ms = config.batch.loop_delay_ms,
        fetch_size = config.batch.fetch_size,
        parallel_copies = config.copy.parallel_copies,
        retry_delay_ms = config.retry_delay_ms,
        "starting cascade worker"
    );
}
