use std::collections::HashSet;
use std::sync::Arc;

use cascade_config::shared::WorkerConfig;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::bail;
use crate::cascade_error;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{CascadeResult, ErrorKind};
use crate::node::base::NodeConnector;
use crate::workers::base::WorkerExit;
use crate::workers::copy::run_copy_worker;

#[derive(Debug, Default)]
struct CopyWorkerPoolInner {
    /// Tables with a launched copy worker that has not returned yet.
    active: HashSet<String>,
}

/// Receiving end of copy launch requests, consumed by [`CopyWorkerPool::run`].
#[derive(Debug)]
pub struct CopyLaunches(mpsc::UnboundedReceiver<String>);

/// Pool of copy workers owned by a main worker.
///
/// The main worker only requests launches; the tasks are spawned and joined by the pool
/// supervisor running next to it, see [`CopyWorkerPool::run`]. At most one copy worker runs per
/// table.
#[derive(Debug, Clone)]
pub struct CopyWorkerPool {
    inner: Arc<Mutex<CopyWorkerPoolInner>>,
    launch_tx: mpsc::UnboundedSender<String>,
}

impl CopyWorkerPool {
    pub fn new() -> (Self, CopyLaunches) {
        let (launch_tx, launch_rx) = mpsc::unbounded_channel();
        let pool = CopyWorkerPool {
            inner: Arc::new(Mutex::new(CopyWorkerPoolInner::default())),
            launch_tx,
        };

        (pool, CopyLaunches(launch_rx))
    }

    /// Requests a copy worker for `table`. Returns `false` when one is already running.
    pub async fn launch(&self, table: &str) -> CascadeResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.active.contains(table) {
            debug!(table, "copy worker already running");
            return Ok(false);
        }

        if self.launch_tx.send(table.to_string()).is_err() {
            bail!(
                ErrorKind::WorkerPanic,
                "Copy worker supervisor is gone",
                table
            );
        }
        inner.active.insert(table.to_string());

        Ok(true)
    }

    pub async fn has_active_worker(&self, table: &str) -> bool {
        self.inner.lock().await.active.contains(table)
    }

    async fn mark_finished(&self, table: &str) {
        self.inner.lock().await.active.remove(table);
    }

    /// Spawns requested copy workers and joins them until shutdown.
    ///
    /// A copy worker that fails ends the supervisor with its error after the remaining copy
    /// workers were aborted. On shutdown all copy workers are awaited, they stop at their next
    /// batch boundary.
    pub async fn run<C: NodeConnector>(
        self,
        launches: CopyLaunches,
        connector: C,
        config: Arc<WorkerConfig>,
        mut shutdown_rx: ShutdownRx,
    ) -> CascadeResult<()> {
        let CopyLaunches(mut launch_rx) = launches;
        let mut join_set: JoinSet<(String, CascadeResult<WorkerExit>)> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.wait() => {
                    info!(running = join_set.len(), "shutting down copy workers");
                    break;
                }

                Some(table) = launch_rx.recv() => {
                    let span = tracing::info_span!(
                        "copy_worker",
                        queue = %config.queue_name,
                        table = %table
                    );
                    let worker = run_copy_worker(
                        config.clone(),
                        connector.clone(),
                        table.clone(),
                        shutdown_rx.clone(),
                    )
                    .instrument(span);

                    info!(table = %table, "spawning copy worker");
                    join_set.spawn(async move { (table, worker.await) });
                }

                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    if let Err(err) = self.handle_joined(joined).await {
                        warn!(running = join_set.len(), "aborting remaining copy workers");
                        join_set.shutdown().await;
                        return Err(err);
                    }
                }
            }
        }

        let mut errors = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Err(err) = self.handle_joined(joined).await {
                errors.push(err);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    async fn handle_joined(
        &self,
        joined: Result<(String, CascadeResult<WorkerExit>), tokio::task::JoinError>,
    ) -> CascadeResult<()> {
        let (table, result) = match joined {
            Ok(joined) => joined,
            Err(join_err) if join_err.is_cancelled() => {
                debug!("copy worker task was cancelled");
                return Ok(());
            }
            Err(join_err) => {
                return Err(cascade_error!(
                    ErrorKind::WorkerPanic,
                    "Copy worker panicked",
                    join_err
                ));
            }
        };

        self.mark_finished(&table).await;

        match result {
            Ok(WorkerExit::Finished) => {
                info!(table = %table, "copy worker finished");
                Ok(())
            }
            Ok(WorkerExit::Shutdown) => {
                debug!(table = %table, "copy worker stopped for shutdown");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::CopyAlreadyRunning => {
                warn!(table = %table, "table is copied by another worker");
                Ok(())
            }
            Err(err) => {
                error!(table = %table, error = %err, "copy worker failed");
                Err(err)
            }
        }
    }
}
