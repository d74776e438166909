use std::collections::BTreeMap;
use std::sync::Arc;

use cascade_config::shared::WorkerConfig;
use metrics::gauge;
use tracing::{debug, error, info, warn};

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::CascadeResult;
use crate::metrics::{CASCADE_TABLE_STATES, STATE_LABEL};
use crate::node::base::NodeConnector;
use crate::replication::base::TableApplier;
use crate::replication::copy::BulkCopy;
use crate::replication::filter::SnapshotFilter;
use crate::replication::handler::{RowSink, TableHandler, build_handler};
use crate::replication::sync::{
    CopySyncDecision, MainAction, PhaseCounts, SyncStep, plan_copy_sync, plan_main_sync,
};
use crate::state::table::{Actor, TablePhase, TableState};
use crate::store::base::{CopyClaims, TableRegistry, TargetStore, TargetTx};
use crate::types::{BatchInfo, BatchThresholds, ControlEvent, Event, RowChange, TxidSnapshot};
use crate::workers::pool::CopyWorkerPool;

/// Which side of the table handover a replayer runs.
#[derive(Debug)]
pub enum ReplayRole {
    /// Replays tables in sync and starts copies for missing ones.
    Main { pool: CopyWorkerPool },
    /// Copies one table and replays it until the main worker takes it over.
    Copy { table: String, shutdown_rx: ShutdownRx },
}

impl ReplayRole {
    fn actor(&self) -> Actor {
        match self {
            ReplayRole::Main { .. } => Actor::Main,
            ReplayRole::Copy { .. } => Actor::Copy,
        }
    }

    /// Returns `true` when events of `table` are applied by this role.
    fn replays(&self, table: &TableState) -> bool {
        match self {
            ReplayRole::Main { .. } => table.local && table.phase == TablePhase::Ok,
            ReplayRole::Copy { table: name, .. } => {
                &table.name == name
                    && matches!(table.phase, TablePhase::CatchingUp | TablePhase::DoSync { .. })
            }
        }
    }
}

#[derive(Debug)]
struct ReplayTable {
    state: TableState,
    filter: SnapshotFilter,
    handler: Box<dyn TableHandler>,
}

impl ReplayTable {
    fn new(state: TableState) -> CascadeResult<Self> {
        let handler = build_handler(state.attrs.handler_spec())?;
        debug!(table = %state.name, handler = handler.name(), "loaded table handler");

        Ok(ReplayTable {
            filter: SnapshotFilter::new(state.snapshot.clone()),
            handler,
            state,
        })
    }
}

/// Applies business events to the replicated tables of a node.
#[derive(Debug)]
pub struct TableReplayer<C: NodeConnector> {
    config: Arc<WorkerConfig>,
    connector: C,
    local: C::Node,
    role: ReplayRole,
    tables: BTreeMap<String, ReplayTable>,
    sink: RowSink,
    caught_up: bool,
    single_tick: bool,
}

impl<C: NodeConnector> TableReplayer<C> {
    pub fn new(config: Arc<WorkerConfig>, connector: C, local: C::Node, role: ReplayRole) -> Self {
        TableReplayer {
            config,
            connector,
            local,
            role,
            tables: BTreeMap::new(),
            sink: RowSink::new(),
            caught_up: false,
            single_tick: false,
        }
    }

    fn queue(&self) -> &str {
        &self.config.queue_name
    }

    /// Replaces the cached table states, keeping filters and handlers of unchanged tables.
    fn refresh(&mut self, states: Vec<TableState>) -> CascadeResult<()> {
        let mut tables = BTreeMap::new();

        for state in states {
            let table = match self.tables.remove(&state.name) {
                Some(mut table) if table.state.attrs == state.attrs => {
                    if table.filter.snapshot() != state.snapshot.as_ref() {
                        table.filter = SnapshotFilter::new(state.snapshot.clone());
                    }
                    table.state = state;
                    table
                }
                _ => ReplayTable::new(state)?,
            };
            tables.insert(table.state.name.clone(), table);
        }

        self.tables = tables;

        Ok(())
    }

    async fn save_phase(
        &mut self,
        tx: &mut <C::Node as TargetStore>::Tx,
        table_name: &str,
        next: TablePhase,
        snapshot: Option<TxidSnapshot>,
    ) -> CascadeResult<()> {
        let actor = self.role.actor();
        let queue = self.config.queue_name.clone();
        let Some(table) = self.tables.get_mut(table_name) else {
            return Ok(());
        };

        table.state.phase.check_transition(actor, &next)?;
        tx.save_table_state(&queue, table_name, &next, snapshot.as_ref())
            .await?;

        if table.state.phase != next {
            info!(
                table = %table_name,
                from_phase = %table.state.phase,
                to_phase = %next,
                "table state changed"
            );
        }
        table.state.phase = next;
        table.state.snapshot = snapshot;

        Ok(())
    }

    async fn sync_from_main(
        &mut self,
        batch: &BatchInfo,
        provider: &C::Node,
        thresholds: &BatchThresholds,
    ) -> CascadeResult<SyncStep> {
        let states: Vec<TableState> = self
            .tables
            .values()
            .map(|table| table.state.clone())
            .collect();
        let counts = PhaseCounts::from_tables(&states);
        for (state, count) in counts.by_name() {
            gauge!(CASCADE_TABLE_STATES, STATE_LABEL => state).set(count as f64);
        }

        let provider_phases = if counts.missing > 0 {
            provider
                .load_table_states(self.queue())
                .await?
                .into_iter()
                .filter(|table| table.local)
                .map(|table| (table.name, table.phase))
                .collect()
        } else {
            BTreeMap::new()
        };

        let plan = plan_main_sync(
            &states,
            &provider_phases,
            batch.cur_tick_id,
            thresholds.is_clear(),
            usize::from(self.config.copy.parallel_copies),
        );

        let single_tick = plan.need_single_tick || plan.shrink_thresholds;
        if single_tick && !self.single_tick {
            info!(
                tick_id = batch.cur_tick_id,
                "copy worker waits for sync, switching to single-tick batches"
            );
        }
        self.single_tick = single_tick;

        for action in plan.actions {
            match action {
                MainAction::DoSync { table, tick } => {
                    let snapshot = self.tables.get(&table).and_then(|t| t.state.snapshot.clone());
                    let mut tx = self.local.begin().await?;
                    self.save_phase(&mut tx, &table, TablePhase::DoSync { tick }, snapshot)
                        .await?;
                    tx.commit().await?;
                }
                MainAction::StartCopy { table } => {
                    let Some(dest_table) =
                        self.tables.get(&table).map(|t| t.state.dest_table.clone())
                    else {
                        continue;
                    };
                    let mut tx = self.local.begin().await?;
                    let fkeys = tx.drop_table_fkeys(&dest_table).await?;
                    self.save_phase(&mut tx, &table, TablePhase::InCopy, None).await?;
                    tx.commit().await?;

                    debug!(table = %table, dropped_fkeys = fkeys, "launching copy worker");
                    if let ReplayRole::Main { pool } = &self.role {
                        pool.launch(&table).await?;
                    }
                }
            }
        }

        if let ReplayRole::Main { pool } = &self.role {
            for table in self.tables.values() {
                if !table.state.local || !table.state.phase.is_copy_phase() {
                    continue;
                }
                if pool.has_active_worker(&table.state.name).await {
                    continue;
                }
                if self.local.copy_claimed(self.queue(), &table.state.name).await? {
                    debug!(table = %table.state.name, "table is copied by another worker");
                    continue;
                }

                warn!(
                    table = %table.state.name,
                    phase = %table.state.phase,
                    "table has no running copy worker, relaunching"
                );
                pool.launch(&table.state.name).await?;
            }
        }

        Ok(plan.step)
    }

    async fn sync_from_copy(
        &mut self,
        batch: &BatchInfo,
        provider: &C::Node,
    ) -> CascadeResult<SyncStep> {
        let ReplayRole::Copy { table: table_name, .. } = &self.role else {
            return Ok(SyncStep::Continue);
        };
        let table_name = table_name.clone();

        let decision = plan_copy_sync(
            self.tables.get(&table_name).map(|table| &table.state),
            batch.cur_tick_id,
            self.caught_up,
        )?;

        match decision {
            CopySyncDecision::Exit => {
                match self.tables.get(&table_name) {
                    Some(table) => info!(
                        table = %table_name,
                        phase = %table.state.phase,
                        "table is not copied any more"
                    ),
                    None => error!(table = %table_name, "table disappeared from the registry"),
                }
                Ok(SyncStep::Exit)
            }
            CopySyncDecision::FinishSync => {
                let snapshot = self.copy_snapshot(&table_name);
                let mut tx = self.local.begin().await?;
                self.save_phase(&mut tx, &table_name, TablePhase::Ok, snapshot).await?;
                tx.commit().await?;
                info!(
                    table = %table_name,
                    tick_id = batch.cur_tick_id,
                    "table handed over to the main worker"
                );

                Ok(SyncStep::Exit)
            }
            CopySyncDecision::RestoreDdl => {
                let Some((dest_table, ddl)) = self
                    .tables
                    .get(&table_name)
                    .and_then(|t| {
                        let ddl = t.state.dropped_ddl.clone()?;
                        Some((t.state.dest_table.clone(), ddl))
                    })
                else {
                    return Ok(SyncStep::Continue);
                };

                let mut tx = self.local.begin().await?;
                tx.lock_table(&dest_table).await?;
                tx.restore_table_objects(&ddl).await?;
                tx.save_table_struct(self.queue(), &table_name, None).await?;
                tx.commit().await?;
                info!(table = %table_name, "restored objects dropped for the bulk copy");

                if let Some(table) = self.tables.get_mut(&table_name) {
                    table.state.dropped_ddl = None;
                }

                Ok(SyncStep::Continue)
            }
            CopySyncDecision::RequestSync { tick } => {
                let snapshot = self.copy_snapshot(&table_name);
                let mut tx = self.local.begin().await?;
                self.save_phase(&mut tx, &table_name, TablePhase::WannaSync { tick }, snapshot)
                    .await?;
                tx.commit().await?;

                Ok(SyncStep::Wait)
            }
            CopySyncDecision::Copy => {
                let ReplayRole::Copy { shutdown_rx, .. } = &mut self.role else {
                    return Ok(SyncStep::Wait);
                };
                let Some(table) = self.tables.get_mut(&table_name) else {
                    return Ok(SyncStep::Exit);
                };

                table.handler.reset();
                let bulk_copy = BulkCopy {
                    connector: &self.connector,
                    local: &self.local,
                    provider,
                    queue: &self.config.queue_name,
                    config: &self.config.copy,
                };
                if let ShutdownResult::Ok(state) = bulk_copy
                    .run(&table_name, table.handler.as_mut(), shutdown_rx)
                    .await?
                {
                    table.filter = SnapshotFilter::new(state.snapshot.clone());
                    table.state = state;
                }
                self.caught_up = false;

                Ok(SyncStep::Wait)
            }
            CopySyncDecision::Replay => Ok(SyncStep::Continue),
            CopySyncDecision::Wait => Ok(SyncStep::Wait),
        }
    }

    /// Snapshot the copy of `table_name` was taken in.
    fn copy_snapshot(&self, table_name: &str) -> Option<TxidSnapshot> {
        self.tables
            .get(table_name)
            .and_then(|table| table.filter.snapshot().cloned())
    }

    async fn flush(&mut self, tx: &mut <C::Node as TargetStore>::Tx) -> CascadeResult<()> {
        if !self.sink.is_empty() {
            tx.apply_rows(self.sink.take()).await?;
        }

        Ok(())
    }
}

impl<C: NodeConnector> TableApplier<C::Node> for TableReplayer<C> {
    fn batch_thresholds(&self) -> Option<BatchThresholds> {
        // The copy worker has to stop exactly at the tick the main worker synced at.
        match self.role {
            ReplayRole::Copy { .. } => Some(BatchThresholds::default()),
            ReplayRole::Main { .. } if self.single_tick => Some(BatchThresholds::default()),
            ReplayRole::Main { .. } => None,
        }
    }

    fn note_idle(&mut self) {
        self.caught_up = true;
    }

    async fn prepare_batch(
        &mut self,
        batch: &BatchInfo,
        provider: &C::Node,
        thresholds: &BatchThresholds,
    ) -> CascadeResult<SyncStep> {
        let states = self.local.load_table_states(self.queue()).await?;
        self.refresh(states)?;

        let step = match self.role {
            ReplayRole::Main { .. } => self.sync_from_main(batch, provider, thresholds).await?,
            ReplayRole::Copy { .. } => self.sync_from_copy(batch, provider).await?,
        };

        if step == SyncStep::Continue {
            for table in self.tables.values_mut() {
                if self.role.replays(&table.state) {
                    table.filter.begin_batch();
                    table.handler.prepare_batch(batch);
                }
            }
        }

        Ok(step)
    }

    async fn apply_row(
        &mut self,
        tx: &mut <C::Node as TargetStore>::Tx,
        event: &Event,
        change: &RowChange,
    ) -> CascadeResult<bool> {
        let Some(table) = self.tables.get_mut(&change.table) else {
            return Ok(false);
        };
        if !self.role.replays(&table.state) {
            return Ok(false);
        }
        if !table.filter.accept(event.txid) {
            debug!(
                table = %change.table,
                event_id = event.id,
                txid = event.txid,
                "event already contained in copy"
            );
            return Ok(false);
        }

        table
            .handler
            .apply_event(&table.state.dest_table, change, &mut self.sink)?;

        if self.sink.len() >= self.config.batch.max_event_buffer {
            self.flush(tx).await?;
        }

        Ok(true)
    }

    async fn apply_control(
        &mut self,
        tx: &mut <C::Node as TargetStore>::Tx,
        control: &ControlEvent,
    ) -> CascadeResult<()> {
        if !matches!(self.role, ReplayRole::Main { .. }) {
            return Ok(());
        }

        let queue = self.config.queue_name.clone();
        match control {
            ControlEvent::AddTable { table } => {
                info!(table = %table, "table registered upstream");
                tx.register_global_table(&queue, table).await?;
            }
            ControlEvent::RemoveTable { table } => {
                info!(table = %table, "table removed upstream");
                tx.unregister_global_table(&queue, table).await?;
                self.tables.remove(table);
            }
            _ => {}
        }

        Ok(())
    }

    async fn finish_batch(
        &mut self,
        tx: &mut <C::Node as TargetStore>::Tx,
        _batch: &BatchInfo,
    ) -> CascadeResult<()> {
        let mut dropped = Vec::new();
        for table in self.tables.values_mut() {
            if !self.role.replays(&table.state) {
                continue;
            }

            table
                .handler
                .finish_batch(&table.state.dest_table, &mut self.sink);
            if table.filter.finish_batch() {
                dropped.push((table.state.name.clone(), table.state.phase));
            }
        }
        self.flush(tx).await?;

        for (table_name, phase) in dropped {
            info!(table = %table_name, "dropping copy snapshot, no more overlapping transactions");
            self.save_phase(tx, &table_name, phase, None).await?;
        }

        if matches!(self.role, ReplayRole::Main { .. }) {
            let restored = tx.restore_pending_fkeys(self.queue()).await?;
            if restored > 0 {
                info!(restored, "restored pending foreign keys");
            }
        }

        Ok(())
    }

    fn after_commit(&mut self) {
        self.caught_up = false;
    }
}
