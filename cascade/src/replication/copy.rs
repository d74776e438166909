//! Initial bulk copy of one table.

use cascade_config::shared::CopyConfig;
use metrics::counter;
use tracing::{info, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx, sleep_or_shutdown};
use crate::error::{CascadeResult, ErrorKind};
use crate::metrics::CASCADE_COPY_ROWS_TOTAL;
use crate::node::base::{NodeConnector, NodeRpc};
use crate::queue::base::BatchSource;
use crate::replication::handler::{RowSink, TableHandler};
use crate::state::table::{Actor, TablePhase, TableState};
use crate::store::base::{CopySource, RowOp, TableRegistry, TargetStore, TargetTx};

/// Everything the bulk copy of one table needs.
pub struct BulkCopy<'a, C: NodeConnector> {
    pub connector: &'a C,
    pub local: &'a C::Node,
    /// Provider of the copy consumer, used unless the table names a `copy_node`.
    pub provider: &'a C::Node,
    pub queue: &'a str,
    pub config: &'a CopyConfig,
}

impl<C: NodeConnector> BulkCopy<'_, C> {
    /// Loads the table, waits for a copy slot and a usable source, then replaces the local
    /// contents with a consistent read of the source.
    ///
    /// The drop of foreign keys and secondary objects, the load and the switch to catching-up
    /// commit together, so a crash anywhere before the commit restarts the copy from scratch.
    pub async fn run(
        &self,
        table_name: &str,
        handler: &mut dyn TableHandler,
        shutdown_rx: &mut ShutdownRx,
    ) -> CascadeResult<ShutdownResult<TableState>> {
        let table = match self.wait_for_slot(table_name, shutdown_rx).await? {
            ShutdownResult::Ok(table) => table,
            ShutdownResult::Shutdown => return Ok(ShutdownResult::Shutdown),
        };

        let source = self.copy_source(&table).await?;
        let waited = self.wait_for_source(&source, table_name, shutdown_rx).await?;
        if let ShutdownResult::Shutdown = waited {
            return Ok(ShutdownResult::Shutdown);
        }

        info!(table = %table.name, dest_table = %table.dest_table, "starting bulk copy");
        let copy = source.copy_table(&table.name, handler.copy_condition()).await?;

        let mut tx = self.local.begin().await?;
        tx.lock_table(&table.dest_table).await?;
        let fkeys = tx.drop_table_fkeys(&table.dest_table).await?;
        let dropped_ddl = tx.drop_table_objects(&table.dest_table).await?;
        tx.save_table_struct(self.queue, &table.name, dropped_ddl.as_deref())
            .await?;

        let mut sink = RowSink::new();
        if !table.attrs.skip_truncate {
            sink.push(&table.dest_table, RowOp::Truncate);
        }
        let row_count = copy.rows.len();
        handler.bulk_copy(&table.dest_table, copy.rows, &mut sink);
        tx.apply_rows(sink.take()).await?;

        table.phase.check_transition(Actor::Copy, &TablePhase::CatchingUp)?;
        tx.save_table_state(self.queue, &table.name, &TablePhase::CatchingUp, Some(&copy.snapshot))
            .await?;

        #[cfg(feature = "failpoints")]
        crate::failpoints::cascade_fail_point(crate::failpoints::COPY_AFTER_BULK_COPY)?;

        tx.commit().await?;

        counter!(CASCADE_COPY_ROWS_TOTAL).increment(row_count as u64);
        info!(
            table = %table.name,
            rows = row_count,
            dropped_fkeys = fkeys,
            snapshot = %copy.snapshot,
            from_phase = %table.phase,
            to_phase = %TablePhase::CatchingUp,
            "bulk copy finished"
        );

        // A fresh tick lets the catch-up start right away.
        if let Err(err) = source.force_tick(self.queue).await {
            warn!(error = %err, "could not force a tick on the copy source");
        }

        Ok(ShutdownResult::Ok(TableState {
            phase: TablePhase::CatchingUp,
            snapshot: Some(copy.snapshot),
            dropped_ddl,
            ..table
        }))
    }

    async fn load_table(&self, table_name: &str) -> CascadeResult<TableState> {
        let tables = self.local.load_table_states(self.queue).await?;
        match tables.into_iter().find(|table| table.name == table_name) {
            Some(table) => Ok(table),
            None => bail!(
                ErrorKind::MissingTableState,
                "Table disappeared during copy",
                table_name
            ),
        }
    }

    async fn wait_for_slot(
        &self,
        table_name: &str,
        shutdown_rx: &mut ShutdownRx,
    ) -> CascadeResult<ShutdownResult<TableState>> {
        let mut logged = false;
        loop {
            let table = self.load_table(table_name).await?;
            if !table.max_parallel_copies_reached() {
                return Ok(ShutdownResult::Ok(table));
            }

            if !logged {
                info!(
                    table = %table.name,
                    copy_pos = table.copy_pos,
                    "waiting for a free copy slot"
                );
                logged = true;
            }
            let slept = sleep_or_shutdown(self.config.slot_poll(), shutdown_rx).await;
            if let ShutdownResult::Shutdown = slept {
                return Ok(ShutdownResult::Shutdown);
            }
        }
    }

    async fn copy_source(&self, table: &TableState) -> CascadeResult<C::Node> {
        let Some(copy_node) = &table.attrs.copy_node else {
            return Ok(self.provider.clone());
        };

        let locations = self.local.get_queue_locations(self.queue).await?;
        match locations.iter().find(|location| &location.node_name == copy_node) {
            Some(location) => {
                info!(table = %table.name, copy_node = %copy_node, "copying from a dedicated node");
                self.connector.connect(&location.location)
            }
            None => bail!(
                ErrorKind::ConfigError,
                "Copy node has no registered location",
                format!("table {}: {copy_node}", table.name)
            ),
        }
    }

    async fn wait_for_source(
        &self,
        source: &C::Node,
        table_name: &str,
        shutdown_rx: &mut ShutdownRx,
    ) -> CascadeResult<ShutdownResult<()>> {
        loop {
            let tables = source.load_table_states(self.queue).await?;
            match tables.iter().find(|table| table.name == table_name) {
                Some(table) if table.local && table.phase == TablePhase::Ok => {
                    return Ok(ShutdownResult::Ok(()));
                }
                Some(table) => {
                    info!(
                        table = %table_name,
                        source_phase = %table.phase,
                        "waiting for the copy source to be in sync"
                    );
                }
                None => bail!(
                    ErrorKind::MissingTableState,
                    "Table is not registered on the copy source",
                    table_name
                ),
            }

            let slept = sleep_or_shutdown(self.config.provider_poll(), shutdown_rx).await;
            if let ShutdownResult::Shutdown = slept {
                return Ok(ShutdownResult::Shutdown);
            }
        }
    }
}
