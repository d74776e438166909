use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::CascadeResult;
use crate::node::base::ProgressTracker;
use crate::state::table::{TableAttrs, TablePhase, TableState};
use crate::types::{Event, NewEvent, NodeLocation, RowMap, TxidSnapshot};

/// A row-level write produced by a table handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOp {
    Insert { row: RowMap },
    /// Updates the row matching `key_columns`, inserting it when absent.
    Upsert { key_columns: Vec<String>, row: RowMap },
    Delete { key: RowMap },
    Truncate,
    /// Bulk load of a table during its initial copy.
    Copy { rows: Vec<RowMap> },
}

/// One transaction on the target node.
///
/// Everything a batch changes goes through a single [`TargetTx`]: business rows, re-published
/// events, local ticks, table states and the completed tick of the consumer. Dropping a
/// transaction without committing rolls it back.
pub trait TargetTx: Send {
    /// Applies row operations in order. Returns the number of touched rows.
    fn apply_rows(
        &mut self,
        ops: Vec<(String, RowOp)>,
    ) -> impl Future<Output = CascadeResult<u64>> + Send;

    /// Copies events into the local queue, keeping their ids when `keep_ids` is set.
    fn insert_events(
        &mut self,
        queue: &str,
        events: &[Event],
        keep_ids: bool,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn insert_event(
        &mut self,
        queue: &str,
        event: &NewEvent,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Creates a tick with an explicit id on the local queue.
    fn create_tick(
        &mut self,
        queue: &str,
        tick_id: i64,
        tick_time: DateTime<Utc>,
        event_seq: i64,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn register_location(
        &mut self,
        queue: &str,
        location: &NodeLocation,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn unregister_location(
        &mut self,
        queue: &str,
        node: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn set_global_watermark(
        &mut self,
        queue: &str,
        tick_id: i64,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn set_partition_watermark(
        &mut self,
        combined_queue: &str,
        part_queue: &str,
        tick_id: i64,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Advances the completed tick of a consumer.
    fn set_consumer_completed(
        &mut self,
        queue: &str,
        consumer: &str,
        tick_id: i64,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn save_table_state(
        &mut self,
        queue: &str,
        table: &str,
        phase: &TablePhase,
        snapshot: Option<&TxidSnapshot>,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Adds a table to the queue-wide registry without subscribing to it.
    fn register_global_table(
        &mut self,
        queue: &str,
        table: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn unregister_global_table(
        &mut self,
        queue: &str,
        table: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Stores the DDL of objects dropped for a copy, `None` clearing it.
    fn save_table_struct(
        &mut self,
        queue: &str,
        table: &str,
        dropped_ddl: Option<&str>,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn lock_table(&mut self, table: &str) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Drops the foreign keys from and to `table`, remembering them as pending.
    fn drop_table_fkeys(
        &mut self,
        table: &str,
    ) -> impl Future<Output = CascadeResult<usize>> + Send;

    /// Drops secondary indexes and constraints, returning the DDL to re-create them.
    fn drop_table_objects(
        &mut self,
        table: &str,
    ) -> impl Future<Output = CascadeResult<Option<String>>> + Send;

    fn restore_table_objects(
        &mut self,
        ddl: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Re-creates the pending foreign keys whose tables are both replicated again.
    fn restore_pending_fkeys(
        &mut self,
        queue: &str,
    ) -> impl Future<Output = CascadeResult<usize>> + Send;

    fn commit(self) -> impl Future<Output = CascadeResult<()>> + Send;

    fn rollback(self) -> impl Future<Output = CascadeResult<()>> + Send;
}

/// Node database that business changes are applied to.
pub trait TargetStore: ProgressTracker {
    type Tx: TargetTx;

    fn begin(&self) -> impl Future<Output = CascadeResult<Self::Tx>> + Send;
}

/// Table registry of a node.
pub trait TableRegistry {
    /// Returns all tables known to `queue` on this node.
    fn load_table_states(
        &self,
        queue: &str,
    ) -> impl Future<Output = CascadeResult<Vec<TableState>>> + Send;

    /// Subscribes this node to a table. A root registers it as replicated right away and
    /// announces it downstream.
    fn add_table(
        &self,
        queue: &str,
        table: &str,
        attrs: &TableAttrs,
        dest_table: Option<&str>,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn remove_table(
        &self,
        queue: &str,
        table: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Puts a table back into [`TablePhase::Missing`], dropping its snapshot.
    fn reset_table(
        &self,
        queue: &str,
        table: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn table_exists(&self, table: &str) -> impl Future<Output = CascadeResult<bool>> + Send;
}

/// Claims on table copies, shared by every process working on the node database.
pub trait CopyClaims {
    /// Held claim. Dropping it releases the claim.
    type Claim: Send + 'static;

    /// Claims the copy of `table`, `None` when another worker holds the claim.
    fn try_claim_copy(
        &self,
        queue: &str,
        table: &str,
    ) -> impl Future<Output = CascadeResult<Option<Self::Claim>>> + Send;

    /// Returns `true` while some worker holds the claim on `table`.
    fn copy_claimed(
        &self,
        queue: &str,
        table: &str,
    ) -> impl Future<Output = CascadeResult<bool>> + Send;
}

/// Result of a consistent bulk read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCopy {
    pub rows: Vec<RowMap>,
    /// Snapshot the rows were read in.
    pub snapshot: TxidSnapshot,
}

/// Node a table can be bulk copied from.
pub trait CopySource {
    /// Reads all rows of `table` matching `condition` together with the read snapshot.
    fn copy_table(
        &self,
        table: &str,
        condition: Option<&str>,
    ) -> impl Future<Output = CascadeResult<TableCopy>> + Send;
}
