use cascade_postgres::{lock, londiste, pgq, pgq_node, table};
use cascade_postgres::pgq::NewEventRow;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::{debug, info};

use crate::error::CascadeResult;
use crate::node::postgres::PgNode;
use crate::state::table::{TableAttrs, TablePhase, TableState};
use crate::store::base::{
    CopyClaims, CopySource, RowOp, TableCopy, TableRegistry, TargetStore, TargetTx,
};
use crate::types::{Event, NewEvent, NodeLocation, TxidSnapshot};

/// A transaction on a Postgres node.
#[derive(Debug)]
pub struct PgTargetTx {
    tx: Transaction<'static, Postgres>,
}

impl TargetTx for PgTargetTx {
    async fn apply_rows(&mut self, ops: Vec<(String, RowOp)>) -> CascadeResult<u64> {
        let mut touched = 0;

        for (table_name, op) in ops {
            touched += match op {
                RowOp::Insert { row } => table::insert_row(&mut *self.tx, &table_name, &row).await?,
                RowOp::Upsert { key_columns, row } => {
                    table::upsert_row(&mut self.tx, &table_name, &key_columns, &row).await?
                }
                RowOp::Delete { key } => table::delete_row(&mut *self.tx, &table_name, &key).await?,
                RowOp::Truncate => {
                    table::truncate_table(&mut *self.tx, &table_name).await?;
                    0
                }
                RowOp::Copy { rows } => {
                    table::bulk_insert_rows(&mut *self.tx, &table_name, &rows).await?
                }
            };
        }

        Ok(touched)
    }

    async fn insert_events(
        &mut self,
        queue: &str,
        events: &[Event],
        keep_ids: bool,
    ) -> CascadeResult<()> {
        let rows: Vec<NewEventRow> = events.iter().map(NewEventRow::from).collect();
        pgq::bulk_insert_events(&mut self.tx, queue, &rows, keep_ids).await?;

        Ok(())
    }

    async fn insert_event(&mut self, queue: &str, event: &NewEvent) -> CascadeResult<()> {
        pgq::insert_event(&mut *self.tx, queue, &NewEventRow::from(event)).await?;

        Ok(())
    }

    async fn create_tick(
        &mut self,
        queue: &str,
        tick_id: i64,
        tick_time: DateTime<Utc>,
        event_seq: i64,
    ) -> CascadeResult<()> {
        pgq::ticker(&mut *self.tx, queue, tick_id, tick_time, event_seq).await?;

        Ok(())
    }

    async fn register_location(
        &mut self,
        queue: &str,
        location: &NodeLocation,
    ) -> CascadeResult<()> {
        pgq_node::register_location(
            &mut *self.tx,
            queue,
            &location.node_name,
            &location.location,
            location.dead,
        )
        .await?;

        Ok(())
    }

    async fn unregister_location(&mut self, queue: &str, node: &str) -> CascadeResult<()> {
        pgq_node::unregister_location(&mut *self.tx, queue, node).await?;

        Ok(())
    }

    async fn set_global_watermark(&mut self, queue: &str, tick_id: i64) -> CascadeResult<()> {
        pgq_node::set_global_watermark(&mut *self.tx, queue, Some(tick_id)).await?;

        Ok(())
    }

    async fn set_partition_watermark(
        &mut self,
        combined_queue: &str,
        part_queue: &str,
        tick_id: i64,
    ) -> CascadeResult<()> {
        pgq_node::set_partition_watermark(&mut *self.tx, combined_queue, part_queue, tick_id)
            .await?;

        Ok(())
    }

    async fn set_consumer_completed(
        &mut self,
        queue: &str,
        consumer: &str,
        tick_id: i64,
    ) -> CascadeResult<()> {
        pgq_node::set_consumer_completed(&mut *self.tx, queue, consumer, tick_id).await?;

        Ok(())
    }

    async fn save_table_state(
        &mut self,
        queue: &str,
        table: &str,
        phase: &TablePhase,
        snapshot: Option<&TxidSnapshot>,
    ) -> CascadeResult<()> {
        let snapshot = snapshot.map(|snapshot| snapshot.to_string());
        let merge_state = phase.to_merge_state();
        londiste::local_set_table_state(
            &mut *self.tx,
            queue,
            table,
            snapshot.as_deref(),
            merge_state.as_deref(),
        )
        .await?;

        Ok(())
    }

    async fn register_global_table(&mut self, queue: &str, table: &str) -> CascadeResult<()> {
        londiste::global_add_table(&mut *self.tx, queue, table).await?;

        Ok(())
    }

    async fn unregister_global_table(&mut self, queue: &str, table: &str) -> CascadeResult<()> {
        londiste::global_remove_table(&mut *self.tx, queue, table).await?;

        Ok(())
    }

    async fn save_table_struct(
        &mut self,
        queue: &str,
        table: &str,
        dropped_ddl: Option<&str>,
    ) -> CascadeResult<()> {
        londiste::local_set_table_struct(&mut *self.tx, queue, table, dropped_ddl).await?;

        Ok(())
    }

    async fn lock_table(&mut self, table_name: &str) -> CascadeResult<()> {
        table::lock_table(&mut *self.tx, table_name).await?;

        Ok(())
    }

    async fn drop_table_fkeys(&mut self, table_name: &str) -> CascadeResult<usize> {
        let fkeys = londiste::find_table_fkeys(&mut *self.tx, table_name).await?;
        for fkey in &fkeys {
            debug!(
                from_table = %fkey.from_table,
                to_table = %fkey.to_table,
                fkey = %fkey.fkey_name,
                "dropping foreign key"
            );
            londiste::drop_table_fkey(&mut *self.tx, &fkey.from_table, &fkey.fkey_name).await?;
        }

        Ok(fkeys.len())
    }

    async fn drop_table_objects(&mut self, table_name: &str) -> CascadeResult<Option<String>> {
        let ddl = table::drop_table_objects(&mut self.tx, table_name).await?;

        Ok(ddl)
    }

    async fn restore_table_objects(&mut self, ddl: &str) -> CascadeResult<()> {
        table::restore_table_objects(&mut self.tx, ddl).await?;

        Ok(())
    }

    async fn restore_pending_fkeys(&mut self, queue: &str) -> CascadeResult<usize> {
        let fkeys = londiste::get_valid_pending_fkeys(&mut *self.tx, queue).await?;
        for fkey in &fkeys {
            info!(from_table = %fkey.from_table, fkey = %fkey.fkey_name, "restoring foreign key");
            londiste::restore_table_fkey(&mut *self.tx, &fkey.from_table, &fkey.fkey_name).await?;
        }

        Ok(fkeys.len())
    }

    async fn commit(self) -> CascadeResult<()> {
        self.tx.commit().await?;

        Ok(())
    }

    async fn rollback(self) -> CascadeResult<()> {
        self.tx.rollback().await?;

        Ok(())
    }
}

impl TargetStore for PgNode {
    type Tx = PgTargetTx;

    async fn begin(&self) -> CascadeResult<PgTargetTx> {
        let tx = self.pool().begin().await?;

        Ok(PgTargetTx { tx })
    }
}

impl TableRegistry for PgNode {
    async fn load_table_states(&self, queue: &str) -> CascadeResult<Vec<TableState>> {
        let rows = londiste::get_table_list(self.pool(), queue).await?;

        rows.into_iter().map(TableState::try_from).collect()
    }

    async fn add_table(
        &self,
        queue: &str,
        table_name: &str,
        attrs: &TableAttrs,
        dest_table: Option<&str>,
    ) -> CascadeResult<()> {
        let attrs = attrs.encode();
        londiste::local_add_table(self.pool(), queue, table_name, attrs.as_deref(), dest_table)
            .await?;

        Ok(())
    }

    async fn remove_table(&self, queue: &str, table_name: &str) -> CascadeResult<()> {
        londiste::local_remove_table(self.pool(), queue, table_name).await?;

        Ok(())
    }

    async fn reset_table(&self, queue: &str, table_name: &str) -> CascadeResult<()> {
        londiste::local_set_table_state(self.pool(), queue, table_name, None, None).await?;

        Ok(())
    }

    async fn table_exists(&self, table_name: &str) -> CascadeResult<bool> {
        let exists = table::table_exists(self.pool(), table_name).await?;

        Ok(exists)
    }
}

impl CopySource for PgNode {
    async fn copy_table(
        &self,
        table_name: &str,
        condition: Option<&str>,
    ) -> CascadeResult<TableCopy> {
        let mut tx = self.pool().begin().await?;
        table::set_repeatable_read(&mut tx).await?;

        let rows = table::read_table_rows(&mut *tx, table_name, condition).await?;
        let snapshot = table::current_snapshot(&mut *tx).await?;
        tx.commit().await?;

        Ok(TableCopy {
            rows,
            snapshot: snapshot.parse()?,
        })
    }
}

/// Copy claim backed by an advisory lock. The lock goes away with the session, so the claim holds
/// a connection taken out of the pool.
#[derive(Debug)]
pub struct PgCopyClaim {
    _session: PgConnection,
}

impl CopyClaims for PgNode {
    type Claim = PgCopyClaim;

    async fn try_claim_copy(
        &self,
        queue: &str,
        table_name: &str,
    ) -> CascadeResult<Option<PgCopyClaim>> {
        let mut session = self.pool().acquire().await?.detach();
        if !lock::try_copy_lock(&mut session, queue, table_name).await? {
            return Ok(None);
        }

        debug!(table = %table_name, "claimed table copy");
        Ok(Some(PgCopyClaim { _session: session }))
    }

    async fn copy_claimed(&self, queue: &str, table_name: &str) -> CascadeResult<bool> {
        let mut conn = self.pool().acquire().await?;
        let free = lock::try_copy_lock(&mut *conn, queue, table_name).await?;
        if free {
            lock::copy_unlock(&mut *conn, queue, table_name).await?;
        }

        Ok(!free)
    }
}
