//! In-memory cascade for tests.
//!
//! [`MemoryCluster`] keeps one simulated database per location with queues, node rows, table
//! states and plain data tables. [`MemoryConnector`] hands out node handles that implement every
//! node trait, so real workers and the real control plane run against it unchanged.
//!
//! [`TestCluster`] wires the usual topologies: location, node name and database are the same
//! string and each node's worker is called `<node>_worker`.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cascade_config::shared::{
    AdminConfig, BatchConfig, CopyConfig, TelemetryConfig, WatermarkConfig, WorkerConfig,
    WorkerRole,
};
use secrecy::SecretString;
use tokio::task::JoinHandle;

use crate::admin::ControlPlane;
use crate::admin::setup::NodeSetup;
use crate::cascade_error;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::concurrency::wait::poll_until;
use crate::error::{CascadeResult, ErrorKind};
use crate::node::base::NodeConnector;
use crate::queue::base::BatchSource;
use crate::workers::apply::run_worker;

pub mod cluster;
pub mod event;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod node;

pub use cluster::{ForeignKey, MemoryCluster};
pub use node::{MemoryConnector, MemoryNode};

pub const TEST_QUEUE: &str = "events";

/// How long test waits poll before failing.
pub const TEST_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

const TEST_POLL: Duration = Duration::from_millis(10);

const TICKER_PERIOD: Duration = Duration::from_millis(20);

pub fn worker_name(node_name: &str) -> String {
    format!("{node_name}_worker")
}

/// Worker settings with short delays and watermarks published after every batch.
pub fn test_worker_config(location: &str, role: WorkerRole) -> WorkerConfig {
    WorkerConfig {
        queue_name: TEST_QUEUE.to_string(),
        consumer_name: worker_name(location),
        node_location: SecretString::new(location.to_string()),
        role,
        batch: BatchConfig {
            loop_delay_ms: 10,
            ..BatchConfig::default()
        },
        watermark: WatermarkConfig {
            global_publish_period_ms: 0,
            local_publish_period_ms: 0,
            ..WatermarkConfig::default()
        },
        copy: CopyConfig {
            slot_poll_ms: 10,
            provider_poll_ms: 10,
            ..CopyConfig::default()
        },
        telemetry: TelemetryConfig::default(),
        retry_delay_ms: 100,
        sync_poll_ms: 10,
        pause_poll_ms: 10,
    }
}

pub fn test_admin_config(dump_file: PathBuf) -> AdminConfig {
    AdminConfig {
        rendezvous_timeout_ms: 10_000,
        poll_ms: 10,
        dump_file,
    }
}

/// Polls `check` until it holds, failing after [`TEST_WAIT_TIMEOUT`].
pub async fn wait_until<F, Fut>(description: &'static str, check: F) -> CascadeResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CascadeResult<bool>>,
{
    poll_until(description, TEST_POLL, TEST_WAIT_TIMEOUT, check).await
}

/// A worker running in the background.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown_tx: ShutdownTx,
    handle: JoinHandle<CascadeResult<()>>,
}

impl WorkerHandle {
    /// Asks the worker to shut down and returns how it ended.
    pub async fn stop(self) -> CascadeResult<()> {
        self.shutdown_tx.shutdown();
        self.join().await
    }

    /// Waits for the worker to end on its own.
    pub async fn join(self) -> CascadeResult<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(cascade_error!(
                ErrorKind::WorkerPanic,
                "Worker task failed",
                err.to_string()
            )),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub fn spawn_worker(connector: MemoryConnector, config: WorkerConfig) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let handle = tokio::spawn(run_worker(Arc::new(config), connector, shutdown_rx));

    WorkerHandle { shutdown_tx, handle }
}

/// Background ticker of one node. Stops when dropped.
#[derive(Debug)]
pub struct Ticker {
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Stops the ticker and waits until it can no longer tick.
    pub async fn stop(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A [`MemoryCluster`] together with a control plane on [`TEST_QUEUE`].
#[derive(Debug, Clone)]
pub struct TestCluster {
    pub cluster: MemoryCluster,
    pub connector: MemoryConnector,
    pub admin: ControlPlane<MemoryConnector>,
}

impl TestCluster {
    pub fn new(admin_config: AdminConfig) -> Self {
        let cluster = MemoryCluster::new();
        let connector = MemoryConnector::new(cluster.clone());
        let admin = ControlPlane::new(connector.clone(), admin_config, TEST_QUEUE);

        TestCluster {
            cluster,
            connector,
            admin,
        }
    }

    fn setup(node_name: &str) -> NodeSetup {
        NodeSetup {
            node_name: node_name.to_string(),
            worker_name: worker_name(node_name),
            location: node_name.to_string(),
        }
    }

    pub async fn add_root(&self, node_name: &str) -> CascadeResult<()> {
        self.cluster.add_database(node_name).await;
        self.admin.create_root(&Self::setup(node_name)).await
    }

    pub async fn add_branch(&self, node_name: &str, provider: &str) -> CascadeResult<()> {
        self.cluster.add_database(node_name).await;
        self.admin
            .create_branch(&Self::setup(node_name), provider)
            .await
    }

    pub async fn add_leaf(&self, node_name: &str, provider: &str) -> CascadeResult<()> {
        self.cluster.add_database(node_name).await;
        self.admin
            .create_leaf(&Self::setup(node_name), provider, None)
            .await
    }

    /// Creates `table` on every given node and subscribes them to it, in order.
    pub async fn add_table_everywhere(&self, table: &str, nodes: &[&str]) -> CascadeResult<()> {
        for node_name in nodes {
            self.cluster.create_table(node_name, table).await?;
            self.admin
                .add_table(node_name, table, Default::default(), None)
                .await?;
        }

        Ok(())
    }

    pub fn spawn_worker(&self, node_name: &str) -> WorkerHandle {
        spawn_worker(
            self.connector.clone(),
            test_worker_config(node_name, WorkerRole::Main),
        )
    }

    /// Ticks the queue of `node_name` periodically while it is a root.
    pub fn spawn_ticker(&self, node_name: &str) -> CascadeResult<Ticker> {
        let node = self.connector.connect(node_name)?;
        let handle = tokio::spawn(async move {
            loop {
                let _ = node.force_tick(TEST_QUEUE).await;
                tokio::time::sleep(TICKER_PERIOD).await;
            }
        });

        Ok(Ticker { handle })
    }

    /// Runs the ticker of `node_name` once and returns the new tick.
    pub async fn tick(&self, node_name: &str) -> CascadeResult<i64> {
        self.cluster.tick(node_name, TEST_QUEUE).await
    }

    /// Waits until the worker of `node_name` completed `tick_id`.
    pub async fn wait_completed(&self, node_name: &str, tick_id: i64) -> CascadeResult<()> {
        let cluster = &self.cluster;
        let worker = worker_name(node_name);
        let worker = worker.as_str();

        wait_until("node completing the tick", || async move {
            let state = cluster.consumer_state(node_name, TEST_QUEUE, worker).await?;
            Ok(state.is_some_and(|state| state.completed_tick >= tick_id))
        })
        .await
    }

    /// Waits until `table` on `node_name` reached the replicated phase.
    pub async fn wait_table_ok(&self, node_name: &str, table: &str) -> CascadeResult<()> {
        let cluster = &self.cluster;

        wait_until("table becoming replicated", || async move {
            let phase = cluster.table_phase(node_name, TEST_QUEUE, table).await?;
            Ok(phase == Some(crate::state::table::TablePhase::Ok))
        })
        .await
    }
}
