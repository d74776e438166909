use std::sync::Arc;

use cascade_config::shared::WorkerConfig;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::bail;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{CascadeResult, ErrorKind};
use crate::node::base::{NodeConnector, NodeRpc, ProgressTracker};
use crate::queue::base::BatchSource;
use crate::replication::replay::{ReplayRole, TableReplayer};
use crate::store::base::{CopyClaims, TableRegistry};
use crate::workers::apply::CascadeWorker;
use crate::workers::base::{WorkerExit, WorkerType};

/// Name of the queue consumer a copy worker of `worker` uses for `table`.
pub fn copy_consumer_name(worker: &str, table: &str) -> String {
    format!("{worker}_copy_{table}")
}

/// Copies one table and replays its events until the main worker takes it over.
///
/// The copy worker reads the queue through its own consumer, positioned where the main consumer
/// stood when the copy started. Both consumers are removed once the table is handed over.
///
/// Fails with [`ErrorKind::CopyAlreadyRunning`] when another worker, in this process or another
/// one, holds the copy claim of the table.
pub async fn run_copy_worker<C: NodeConnector>(
    config: Arc<WorkerConfig>,
    connector: C,
    table: String,
    shutdown_rx: ShutdownRx,
) -> CascadeResult<WorkerExit> {
    let queue = config.queue_name.clone();
    let consumer = copy_consumer_name(&config.consumer_name, &table);
    let local = connector.connect(config.node_location.expose_secret())?;

    let Some(_claim) = local.try_claim_copy(&queue, &table).await? else {
        bail!(
            ErrorKind::CopyAlreadyRunning,
            "Another worker is copying the table",
            format!("queue {queue}, table {table}")
        );
    };
    debug!(table = %table, "holding copy claim");

    let source = register_copy_consumer(&config, &connector, &local, &table, &consumer).await?;

    let replayer = TableReplayer::new(
        config.clone(),
        connector.clone(),
        local.clone(),
        ReplayRole::Copy {
            table: table.clone(),
            shutdown_rx: shutdown_rx.clone(),
        },
    );
    let worker = CascadeWorker::new(
        config,
        connector,
        local.clone(),
        replayer,
        WorkerType::Copy { table: table.clone() },
        consumer.clone(),
    );

    let exit = worker.run(shutdown_rx).await?;

    if exit == WorkerExit::Finished {
        source.unregister_consumer(&queue, &consumer).await?;
        local.unregister_node_consumer(&queue, &consumer).await?;
        info!(table = %table, consumer = %consumer, "removed copy consumer");
    }

    Ok(exit)
}

/// Registers the copy consumer on the copy source and locally, unless a previous run did.
///
/// Returns a handle to the copy source.
async fn register_copy_consumer<C: NodeConnector>(
    config: &WorkerConfig,
    connector: &C,
    local: &C::Node,
    table: &str,
    consumer: &str,
) -> CascadeResult<C::Node> {
    let queue = config.queue_name.as_str();

    if let Some(existing) = local.get_consumer_state(queue, consumer).await? {
        info!(consumer, completed_tick = existing.completed_tick, "resuming copy consumer");
        return connector.connect(&existing.provider_location);
    }

    let Some(main) = local.get_consumer_state(queue, &config.consumer_name).await? else {
        bail!(
            ErrorKind::MissingConsumerState,
            "Main consumer is not registered on the local node",
            format!("queue {queue}, consumer {}", config.consumer_name)
        );
    };

    let copy_node = local
        .load_table_states(queue)
        .await?
        .into_iter()
        .find(|state| state.name == table)
        .and_then(|state| state.attrs.copy_node);

    let (source_node, source_location) = match copy_node {
        Some(copy_node) => {
            let locations = local.get_queue_locations(queue).await?;
            let Some(location) = locations
                .into_iter()
                .find(|location| location.node_name == copy_node)
            else {
                bail!(
                    ErrorKind::ConfigError,
                    "Copy node has no registered location",
                    format!("table {table}: {copy_node}")
                );
            };
            (location.node_name, location.location)
        }
        None => (main.provider_node, main.provider_location),
    };

    let source = connector.connect(&source_location)?;
    source
        .register_consumer(queue, consumer, Some(main.completed_tick))
        .await?;
    local
        .register_node_consumer(queue, consumer, &source_node, main.completed_tick)
        .await?;

    info!(
        consumer,
        source = %source_node,
        tick_id = main.completed_tick,
        "registered copy consumer"
    );

    Ok(source)
}
