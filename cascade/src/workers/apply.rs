use std::sync::Arc;

use cascade_config::shared::{WorkerConfig, WorkerRole};
use metrics::{counter, histogram};
use secrecy::ExposeSecret;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::bail;
use crate::cascade::propagator::{BatchProgress, BatchPropagator, is_batch_done};
use crate::cascade::watermark::WatermarkPublisher;
use crate::cascade::worker_state::WorkerState;
use crate::concurrency::shutdown::{
    ShutdownResult, ShutdownRx, create_shutdown_channel, sleep_or_shutdown,
};
use crate::error::{CascadeError, CascadeResult, ErrorKind};
use crate::metrics::{
    ACTION_LABEL, CASCADE_BATCH_DURATION_SECONDS, CASCADE_BATCHES_TOTAL, CASCADE_EVENTS_TOTAL,
    CASCADE_TICKS_CREATED_TOTAL, CASCADE_WORKER_ERRORS_TOTAL, ERROR_TYPE_LABEL, OUTCOME_LABEL,
    WORKER_TYPE_LABEL,
};
use crate::node::base::{NodeConnector, ProgressTracker};
use crate::queue::base::{BatchSource, EventStream};
use crate::replication::base::TableApplier;
use crate::replication::replay::{ReplayRole, TableReplayer};
use crate::replication::sync::SyncStep;
use crate::store::base::{TargetStore, TargetTx};
use crate::types::{BatchInfo, BatchThresholds, ConsumerState, FetchMode, NodeInfo};
use crate::workers::base::{LoopStep, WorkerExit, WorkerType};
use crate::workers::copy::run_copy_worker;
use crate::workers::policy::{RetryDirective, build_error_handling_policy};
use crate::workers::pool::CopyWorkerPool;

/// The batch loop shared by main and copy workers.
///
/// Every iteration reads the consumer row, derives the worker state from the node row, fetches
/// one batch from the provider and applies it in a single local transaction together with the
/// new completed tick. The provider batch is closed only after that transaction committed.
#[derive(Debug)]
pub struct CascadeWorker<C: NodeConnector, A> {
    config: Arc<WorkerConfig>,
    connector: C,
    local: C::Node,
    applier: A,
    worker_type: WorkerType,
    consumer: String,
    watermarks: WatermarkPublisher,
}

impl<C, A> CascadeWorker<C, A>
where
    C: NodeConnector,
    A: TableApplier<C::Node>,
{
    pub fn new(
        config: Arc<WorkerConfig>,
        connector: C,
        local: C::Node,
        applier: A,
        worker_type: WorkerType,
        consumer: String,
    ) -> Self {
        let watermarks = WatermarkPublisher::new(config.watermark.clone());
        CascadeWorker {
            config,
            connector,
            local,
            applier,
            worker_type,
            consumer,
            watermarks,
        }
    }

    /// Runs batches until shutdown, until a copy worker is done, or until a non-retryable error.
    pub async fn run(mut self, mut shutdown_rx: ShutdownRx) -> CascadeResult<WorkerExit> {
        info!(worker_type = %self.worker_type, consumer = %self.consumer, "starting worker");

        loop {
            if shutdown_rx.is_shutdown() {
                info!("worker stopped for shutdown");
                return Ok(WorkerExit::Shutdown);
            }

            let step = match self.step(&mut shutdown_rx).await {
                Ok(step) => step,
                Err(err) => match self.handle_error(err, &mut shutdown_rx).await? {
                    ShutdownResult::Ok(()) => continue,
                    ShutdownResult::Shutdown => return Ok(WorkerExit::Shutdown),
                },
            };

            match step {
                LoopStep::Worked => {}
                LoopStep::Idle(delay) => {
                    let slept = sleep_or_shutdown(delay, &mut shutdown_rx).await;
                    if let ShutdownResult::Shutdown = slept {
                        info!("worker stopped for shutdown");
                        return Ok(WorkerExit::Shutdown);
                    }
                }
                LoopStep::Exit(exit) => {
                    info!(?exit, "worker exiting");
                    return Ok(exit);
                }
            }
        }
    }

    /// Records a failed iteration and decides between retrying and stopping.
    async fn handle_error(
        &self,
        err: CascadeError,
        shutdown_rx: &mut ShutdownRx,
    ) -> CascadeResult<ShutdownResult<()>> {
        let policy = build_error_handling_policy(&err);
        counter!(
            CASCADE_WORKER_ERRORS_TOTAL,
            WORKER_TYPE_LABEL => self.worker_type.label(),
            ERROR_TYPE_LABEL => policy.retry_directive().to_string(),
        )
        .increment(1);

        let summary = err.summary();
        if let Err(store_err) = self
            .local
            .set_consumer_error(&self.config.queue_name, &self.consumer, Some(&summary))
            .await
        {
            warn!(error = %store_err, "could not store the worker error on the consumer row");
        }

        match policy.retry_directive() {
            RetryDirective::Timed => {
                warn!(
                    error = %err,
                    retry_delay = ?self.config.retry_delay(),
                    "batch failed, retrying"
                );
                Ok(sleep_or_shutdown(self.config.retry_delay(), shutdown_rx).await)
            }
            RetryDirective::Manual | RetryDirective::NoRetry => {
                error!(
                    error = %err,
                    solution = policy.solution().unwrap_or_default(),
                    "worker failed"
                );
                Err(err)
            }
        }
    }

    async fn step(&mut self, shutdown_rx: &mut ShutdownRx) -> CascadeResult<LoopStep> {
        let config = self.config.clone();
        let queue = config.queue_name.as_str();

        let Some(consumer_state) = self.local.get_consumer_state(queue, &self.consumer).await?
        else {
            bail!(
                ErrorKind::MissingConsumerState,
                "Worker consumer is not registered on the local node",
                format!("queue {queue}, consumer {}", self.consumer)
            );
        };

        if consumer_state.paused {
            if !consumer_state.uptodate {
                self.local.set_consumer_uptodate(queue, &self.consumer, true).await?;
                info!("worker paused");
            }
            return Ok(LoopStep::Idle(config.pause_poll()));
        }
        if !consumer_state.uptodate {
            self.local.set_consumer_uptodate(queue, &self.consumer, true).await?;
            info!(provider = %consumer_state.provider_node, "acknowledged consumer change");
        }

        let node = self.local.get_node_info(queue).await?;
        let state = match self.worker_type {
            WorkerType::Main => WorkerState::for_node(queue, &node)?,
            WorkerType::Copy { .. } => WorkerState::for_copy(),
        };

        if !state.process_batch {
            if state.global_wm_event {
                self.watermarks.maybe_publish_global(&self.local, queue).await?;
            }
            return Ok(LoopStep::Idle(config.batch.loop_delay()));
        }

        let provider = self.connector.connect(&consumer_state.provider_location)?;
        let thresholds = self
            .applier
            .batch_thresholds()
            .unwrap_or_else(|| BatchThresholds::from_config(&config.batch));

        let Some(batch) = provider.next_batch(queue, &self.consumer, &thresholds).await? else {
            self.applier.note_idle();
            return Ok(LoopStep::Idle(config.batch.loop_delay()));
        };

        match is_batch_done(&batch, consumer_state.completed_tick)? {
            BatchProgress::AlreadyApplied => {
                debug!(
                    batch_id = batch.batch_id,
                    tick_id = batch.cur_tick_id,
                    "batch already applied, closing it"
                );
                provider.finish_batch(batch.batch_id).await?;
                counter!(CASCADE_BATCHES_TOTAL, OUTCOME_LABEL => "skipped").increment(1);
                self.publish_local_watermark(&provider, &state, &batch).await;

                return Ok(LoopStep::Worked);
            }
            BatchProgress::Pending => {}
        }

        if state.wait_behind {
            debug!(
                tick_id = batch.cur_tick_id,
                "waiting for the combined branch to pass the batch"
            );
            return Ok(LoopStep::Idle(config.batch.loop_delay()));
        }

        loop {
            match self.applier.prepare_batch(&batch, &provider, &thresholds).await? {
                SyncStep::Continue => break,
                SyncStep::Wait => {
                    let slept = sleep_or_shutdown(config.sync_poll(), shutdown_rx).await;
                    if let ShutdownResult::Shutdown = slept {
                        return Ok(LoopStep::Exit(WorkerExit::Shutdown));
                    }
                }
                SyncStep::Exit => return Ok(LoopStep::Exit(WorkerExit::Finished)),
            }
        }

        self.apply_batch(&provider, &node, &state, &consumer_state, &batch)
            .await?;

        Ok(LoopStep::Worked)
    }

    async fn apply_batch(
        &mut self,
        provider: &C::Node,
        node: &NodeInfo,
        state: &WorkerState,
        consumer_state: &ConsumerState,
        batch: &BatchInfo,
    ) -> CascadeResult<()> {
        let config = self.config.clone();
        let queue = config.queue_name.as_str();
        let started = Instant::now();

        let mut tx = self.local.begin().await?;
        let mut propagator = BatchPropagator::new(
            queue,
            state,
            config.batch.max_event_buffer,
            node.global_watermark,
        );

        let mut events = provider
            .load_events(batch, FetchMode::from_config(&config.batch))
            .await?;
        while let Some(chunk) = events.next_chunk().await? {
            for event in &chunk {
                propagator
                    .route::<C::Node, A>(&mut tx, &mut self.applier, event)
                    .await?;
            }
        }

        let tick_created = propagator.finish::<C::Node>(&mut tx, batch).await?;
        self.applier.finish_batch(&mut tx, batch).await?;
        tx.set_consumer_completed(queue, &self.consumer, batch.cur_tick_id)
            .await?;

        #[cfg(feature = "failpoints")]
        crate::failpoints::cascade_fail_point(crate::failpoints::WORKER_BEFORE_COMMIT)?;

        tx.commit().await?;
        provider.finish_batch(batch.batch_id).await?;
        self.applier.after_commit();

        if consumer_state.error.is_some() {
            self.local.set_consumer_error(queue, &self.consumer, None).await?;
            info!("worker recovered, cleared the stored error");
        }

        let stats = propagator.stats();
        let worker_type = self.worker_type.label();
        counter!(CASCADE_BATCHES_TOTAL, OUTCOME_LABEL => "applied").increment(1);
        counter!(CASCADE_EVENTS_TOTAL, ACTION_LABEL => "applied").increment(stats.applied);
        counter!(CASCADE_EVENTS_TOTAL, ACTION_LABEL => "filtered").increment(stats.filtered);
        counter!(CASCADE_EVENTS_TOTAL, ACTION_LABEL => "republished").increment(stats.republished);
        histogram!(CASCADE_BATCH_DURATION_SECONDS, WORKER_TYPE_LABEL => worker_type)
            .record(started.elapsed().as_secs_f64());
        if tick_created {
            counter!(CASCADE_TICKS_CREATED_TOTAL).increment(1);
        }

        debug!(
            batch_id = batch.batch_id,
            tick_id = batch.cur_tick_id,
            applied = stats.applied,
            filtered = stats.filtered,
            republished = stats.republished,
            "batch applied"
        );

        if let Some(upstream) = propagator.upstream_global_watermark() {
            self.watermarks.note_upstream_global(upstream);
        }
        self.publish_local_watermark(provider, state, batch).await;

        Ok(())
    }

    /// Publishing is best effort, the next due round tries again.
    async fn publish_local_watermark(
        &mut self,
        provider: &C::Node,
        state: &WorkerState,
        batch: &BatchInfo,
    ) {
        if !self.watermarks.local_due(state) {
            return;
        }

        let queue = self.config.queue_name.as_str();
        let result = match self.local.get_node_info(queue).await {
            Ok(node) => {
                self.watermarks
                    .maybe_publish_local(
                        &self.connector,
                        &self.local,
                        provider,
                        queue,
                        &node,
                        state,
                        batch.cur_tick_id,
                    )
                    .await
            }
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            warn!(error = %err, "could not publish the local watermark");
        }
    }
}

/// Runs the worker described by `config` until shutdown.
pub async fn run_worker<C: NodeConnector>(
    config: Arc<WorkerConfig>,
    connector: C,
    shutdown_rx: ShutdownRx,
) -> CascadeResult<()> {
    match &config.role {
        WorkerRole::Main => run_main_worker(config.clone(), connector, shutdown_rx).await,
        WorkerRole::Copy { table } => {
            let span = tracing::info_span!(
                "copy_worker",
                queue = %config.queue_name,
                table = %table
            );
            run_copy_worker(config.clone(), connector, table.clone(), shutdown_rx)
                .instrument(span)
                .await
                .map(|_| ())
        }
    }
}

/// Runs the main consumer of a node together with the supervisor of its copy workers.
///
/// When either side stops with an error the other one is asked to shut down, and both errors
/// are reported together.
pub async fn run_main_worker<C: NodeConnector>(
    config: Arc<WorkerConfig>,
    connector: C,
    mut shutdown_rx: ShutdownRx,
) -> CascadeResult<()> {
    let local = connector.connect(config.node_location.expose_secret())?;

    let (pool, launches) = CopyWorkerPool::new();
    let (worker_shutdown_tx, worker_shutdown_rx) = create_shutdown_channel();

    let replayer = TableReplayer::new(
        config.clone(),
        connector.clone(),
        local.clone(),
        ReplayRole::Main { pool: pool.clone() },
    );
    let worker = CascadeWorker::new(
        config.clone(),
        connector.clone(),
        local,
        replayer,
        WorkerType::Main,
        config.consumer_name.clone(),
    );

    let span = tracing::info_span!(
        "cascade_worker",
        queue = %config.queue_name,
        consumer = %config.consumer_name
    );

    let worker_run = async {
        let result = worker.run(worker_shutdown_rx.clone()).await;
        worker_shutdown_tx.shutdown();
        result
    }
    .instrument(span.clone());

    let supervisor_run = async {
        let result = pool
            .run(launches, connector.clone(), config.clone(), worker_shutdown_rx.clone())
            .await;
        if result.is_err() {
            worker_shutdown_tx.shutdown();
        }
        result
    }
    .instrument(span);

    let mut forward_rx = worker_shutdown_rx.clone();
    let forward_shutdown = async {
        tokio::select! {
            _ = shutdown_rx.wait() => worker_shutdown_tx.shutdown(),
            _ = forward_rx.wait() => {}
        }
    };

    let (worker_result, supervisor_result, ()) =
        tokio::join!(worker_run, supervisor_run, forward_shutdown);

    let errors: Vec<CascadeError> = [worker_result.err(), supervisor_result.err()]
        .into_iter()
        .flatten()
        .collect();
    if errors.is_empty() {
        info!("main worker stopped");
        Ok(())
    } else {
        Err(errors.into())
    }
}
