//! Node handles over a [`MemoryCluster`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::bail;
use crate::error::{CascadeResult, ErrorKind};
use crate::node::base::{NewNode, NodeConnector, NodeRpc, ProgressTracker};
use crate::queue::base::{BatchSource, EventStream};
use crate::state::table::{TableAttrs, TablePhase, TableState};
use crate::store::base::{
    CopyClaims, CopySource, RowOp, TableCopy, TableRegistry, TargetStore, TargetTx,
};
use crate::test_utils::cluster::{Database, LocalConsumer, MemoryCluster, OpOutput, TxOp};
use crate::types::{
    BatchInfo, BatchThresholds, ConsumerState, Event, FetchMode, NewEvent, NodeInfo, NodeLocation,
    SubscriberInfo, TxidSnapshot,
};

/// Connects to the databases of a [`MemoryCluster`] by location.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    cluster: MemoryCluster,
}

impl MemoryConnector {
    pub fn new(cluster: MemoryCluster) -> Self {
        MemoryConnector { cluster }
    }
}

impl NodeConnector for MemoryConnector {
    type Node = MemoryNode;

    fn connect(&self, location: &str) -> CascadeResult<MemoryNode> {
        Ok(MemoryNode {
            cluster: self.cluster.clone(),
            location: location.to_string(),
        })
    }
}

/// Handle to one database of a [`MemoryCluster`].
///
/// Every call checks reachability, so a handle to a database that goes down starts failing
/// with connection errors.
#[derive(Debug, Clone)]
pub struct MemoryNode {
    cluster: MemoryCluster,
    location: String,
}

impl MemoryNode {
    pub fn location(&self) -> &str {
        &self.location
    }

    async fn with_db<T, F>(&self, f: F) -> CascadeResult<T>
    where
        F: FnOnce(&mut Database) -> CascadeResult<T> + Send,
        T: Send,
    {
        self.cluster.with_db(&self.location, f).await
    }
}

impl ProgressTracker for MemoryNode {
    async fn get_node_info(&self, queue: &str) -> CascadeResult<NodeInfo> {
        self.with_db(|db| db.node_info(queue)).await
    }

    async fn get_consumer_state(
        &self,
        queue: &str,
        consumer: &str,
    ) -> CascadeResult<Option<ConsumerState>> {
        self.with_db(|db| Ok(db.consumer_state(queue, consumer)))
            .await
    }

    async fn set_consumer_uptodate(
        &self,
        queue: &str,
        consumer: &str,
        uptodate: bool,
    ) -> CascadeResult<()> {
        self.with_db(|db| {
            db.consumer_mut(queue, consumer)?.uptodate = uptodate;
            Ok(())
        })
        .await
    }

    async fn set_consumer_error(
        &self,
        queue: &str,
        consumer: &str,
        error: Option<&str>,
    ) -> CascadeResult<()> {
        self.with_db(|db| {
            db.consumer_mut(queue, consumer)?.error = error.map(str::to_string);
            Ok(())
        })
        .await
    }
}

impl NodeRpc for MemoryNode {
    async fn set_consumer_paused(
        &self,
        queue: &str,
        consumer: &str,
        paused: bool,
    ) -> CascadeResult<()> {
        self.with_db(|db| {
            let state = db.consumer_mut(queue, consumer)?;
            state.paused = paused;
            state.uptodate = false;
            Ok(())
        })
        .await
    }

    async fn change_consumer_provider(
        &self,
        queue: &str,
        consumer: &str,
        provider_node: &str,
    ) -> CascadeResult<()> {
        self.with_db(|db| {
            let is_worker = db
                .nodes
                .get(queue)
                .is_some_and(|node| node.worker_name == consumer);
            if is_worker && let Some(node) = db.nodes.get_mut(queue) {
                node.provider_node = Some(provider_node.to_string());
            }

            let state = db.consumer_mut(queue, consumer)?;
            state.provider_node = provider_node.to_string();
            state.uptodate = false;
            Ok(())
        })
        .await
    }

    async fn register_node_consumer(
        &self,
        queue: &str,
        consumer: &str,
        provider_node: &str,
        tick_id: i64,
    ) -> CascadeResult<()> {
        self.with_db(|db| {
            db.node(queue)?;
            db.consumers.insert(
                (queue.to_string(), consumer.to_string()),
                LocalConsumer {
                    provider_node: provider_node.to_string(),
                    completed_tick: tick_id,
                    paused: false,
                    uptodate: false,
                    error: None,
                },
            );
            Ok(())
        })
        .await
    }

    async fn unregister_node_consumer(&self, queue: &str, consumer: &str) -> CascadeResult<()> {
        self.with_db(|db| {
            db.consumers.remove(&(queue.to_string(), consumer.to_string()));
            Ok(())
        })
        .await
    }

    async fn register_subscriber(
        &self,
        queue: &str,
        node: &str,
        worker: &str,
        tick_id: Option<i64>,
    ) -> CascadeResult<Option<i64>> {
        self.with_db(|db| db.register_subscriber(queue, node, worker, tick_id))
            .await
    }

    async fn unregister_subscriber(&self, queue: &str, node: &str) -> CascadeResult<()> {
        self.with_db(|db| db.unregister_subscriber(queue, node))
            .await
    }

    async fn set_subscriber_watermark(
        &self,
        queue: &str,
        node: &str,
        tick_id: i64,
    ) -> CascadeResult<()> {
        self.with_db(|db| db.set_subscriber_watermark(queue, node, tick_id))
            .await
    }

    async fn set_global_watermark(&self, queue: &str, tick_id: Option<i64>) -> CascadeResult<()> {
        self.with_db(|db| db.set_global_watermark(queue, tick_id))
            .await
    }

    async fn register_location(&self, queue: &str, location: &NodeLocation) -> CascadeResult<()> {
        self.with_db(|db| db.register_location_now(queue, location))
            .await
    }

    async fn unregister_location(&self, queue: &str, node: &str) -> CascadeResult<()> {
        self.with_db(|db| db.unregister_location_now(queue, node))
            .await
    }

    async fn get_queue_locations(&self, queue: &str) -> CascadeResult<Vec<NodeLocation>> {
        self.with_db(|db| Ok(db.locations(queue))).await
    }

    async fn get_subscriber_info(&self, queue: &str) -> CascadeResult<Vec<SubscriberInfo>> {
        self.with_db(|db| Ok(db.subscriber_info(queue))).await
    }

    async fn create_node(&self, node: &NewNode) -> CascadeResult<()> {
        self.with_db(|db| db.create_node(node)).await
    }

    async fn drop_node(&self, queue: &str, node: &str) -> CascadeResult<()> {
        self.with_db(|db| db.drop_node(queue, node)).await
    }

    async fn demote_root(
        &self,
        queue: &str,
        step: i32,
        new_provider: &str,
    ) -> CascadeResult<Option<i64>> {
        self.with_db(|db| db.demote_root(queue, step, new_provider))
            .await
    }

    async fn promote_branch(&self, queue: &str) -> CascadeResult<()> {
        self.with_db(|db| db.promote_branch(queue)).await
    }

    async fn rename_node_step1(
        &self,
        queue: &str,
        old_name: &str,
        new_name: &str,
    ) -> CascadeResult<()> {
        self.with_db(|db| {
            db.rename_node_step1(queue, old_name, new_name);
            Ok(())
        })
        .await
    }

    async fn rename_node_step2(
        &self,
        queue: &str,
        old_name: &str,
        new_name: &str,
    ) -> CascadeResult<()> {
        self.with_db(|db| db.rename_node_step2(queue, old_name, new_name))
            .await
    }
}

/// Events of one batch, split into the chunks a cursor would return.
#[derive(Debug)]
pub struct MemoryEventStream {
    chunks: VecDeque<Vec<Event>>,
}

impl EventStream for MemoryEventStream {
    async fn next_chunk(&mut self) -> CascadeResult<Option<Vec<Event>>> {
        Ok(self.chunks.pop_front())
    }
}

impl BatchSource for MemoryNode {
    type Events = MemoryEventStream;

    async fn next_batch(
        &self,
        queue: &str,
        consumer: &str,
        thresholds: &BatchThresholds,
    ) -> CascadeResult<Option<BatchInfo>> {
        let single_tick = thresholds.is_clear();
        self.with_db(|db| db.next_batch(queue, consumer, single_tick))
            .await
    }

    async fn load_events(
        &self,
        batch: &BatchInfo,
        mode: FetchMode,
    ) -> CascadeResult<MemoryEventStream> {
        let events = self.with_db(|db| db.batch_events(batch.batch_id)).await?;

        let chunks = match mode {
            FetchMode::Eager => VecDeque::from([events]),
            FetchMode::Cursor { fetch_size } => events
                .chunks(fetch_size.max(1) as usize)
                .map(<[Event]>::to_vec)
                .collect(),
        };

        Ok(MemoryEventStream { chunks })
    }

    async fn finish_batch(&self, batch_id: i64) -> CascadeResult<()> {
        self.with_db(|db| db.finish_batch(batch_id)).await
    }

    /// The event comes back with the next tick, `delay` is not simulated.
    async fn retry_event(
        &self,
        batch_id: i64,
        event_id: i64,
        _delay: Duration,
    ) -> CascadeResult<()> {
        self.with_db(|db| db.retry_event(batch_id, event_id)).await
    }

    async fn register_consumer(
        &self,
        queue: &str,
        consumer: &str,
        tick_id: Option<i64>,
    ) -> CascadeResult<()> {
        self.with_db(|db| db.register_consumer(queue, consumer, tick_id))
            .await
    }

    async fn unregister_consumer(&self, queue: &str, consumer: &str) -> CascadeResult<()> {
        self.with_db(|db| {
            db.unregister_consumer(queue, consumer);
            Ok(())
        })
        .await
    }

    async fn get_consumer_tick(&self, queue: &str, consumer: &str) -> CascadeResult<Option<i64>> {
        self.with_db(|db| {
            Ok(db
                .queues
                .get(queue)
                .and_then(|queue_state| queue_state.consumers.get(consumer))
                .map(|position| position.last_tick))
        })
        .await
    }

    async fn force_tick(&self, queue: &str) -> CascadeResult<Option<i64>> {
        self.with_db(|db| db.force_tick(queue).map(Some)).await
    }

    async fn insert_event(&self, queue: &str, event: &NewEvent) -> CascadeResult<()> {
        self.with_db(|db| db.insert_autonomous_event(queue, event))
            .await
    }

    async fn delete_batch_events(&self, queue: &str, batch_id: i64) -> CascadeResult<u64> {
        self.with_db(|db| db.delete_batch_events(queue, batch_id))
            .await
    }

    async fn drop_ticks_after(&self, queue: &str, tick_id: i64) -> CascadeResult<u64> {
        self.with_db(|db| db.drop_ticks_after(queue, tick_id)).await
    }
}

/// A transaction on a [`MemoryNode`].
///
/// Statements run against a private copy of the database taken at `begin`, which gives them
/// their results and errors. The commit replays them on the live database under a fresh
/// transaction id.
#[derive(Debug)]
pub struct MemoryTx {
    cluster: MemoryCluster,
    location: String,
    working: Database,
    ops: Vec<TxOp>,
}

impl MemoryTx {
    fn stage(&mut self, op: TxOp) -> CascadeResult<OpOutput> {
        let txid = self.working.next_txid;
        let output = self.working.apply(&op, txid)?;
        self.ops.push(op);

        Ok(output)
    }

    fn stage_count(&mut self, op: TxOp) -> CascadeResult<usize> {
        match self.stage(op)? {
            OpOutput::Count(count) => Ok(count),
            other => bail!(
                ErrorKind::QueryFailed,
                "Statement returned an unexpected result",
                format!("{other:?}")
            ),
        }
    }
}

impl TargetTx for MemoryTx {
    async fn apply_rows(&mut self, ops: Vec<(String, RowOp)>) -> CascadeResult<u64> {
        let touched = self.stage_count(TxOp::ApplyRows(ops))?;
        Ok(touched as u64)
    }

    async fn insert_events(
        &mut self,
        queue: &str,
        events: &[Event],
        keep_ids: bool,
    ) -> CascadeResult<()> {
        self.stage(TxOp::InsertEvents {
            queue: queue.to_string(),
            events: events.to_vec(),
            keep_ids,
        })?;
        Ok(())
    }

    async fn insert_event(&mut self, queue: &str, event: &NewEvent) -> CascadeResult<()> {
        self.stage(TxOp::InsertEvent {
            queue: queue.to_string(),
            event: event.clone(),
        })?;
        Ok(())
    }

    async fn create_tick(
        &mut self,
        queue: &str,
        tick_id: i64,
        tick_time: DateTime<Utc>,
        event_seq: i64,
    ) -> CascadeResult<()> {
        self.stage(TxOp::CreateTick {
            queue: queue.to_string(),
            tick_id,
            time: tick_time,
            event_seq,
        })?;
        Ok(())
    }

    async fn register_location(
        &mut self,
        queue: &str,
        location: &NodeLocation,
    ) -> CascadeResult<()> {
        self.stage(TxOp::RegisterLocation {
            queue: queue.to_string(),
            location: location.clone(),
        })?;
        Ok(())
    }

    async fn unregister_location(&mut self, queue: &str, node: &str) -> CascadeResult<()> {
        self.stage(TxOp::UnregisterLocation {
            queue: queue.to_string(),
            node: node.to_string(),
        })?;
        Ok(())
    }

    async fn set_global_watermark(&mut self, queue: &str, tick_id: i64) -> CascadeResult<()> {
        self.stage(TxOp::SetGlobalWatermark {
            queue: queue.to_string(),
            tick_id,
        })?;
        Ok(())
    }

    async fn set_partition_watermark(
        &mut self,
        _combined_queue: &str,
        part_queue: &str,
        tick_id: i64,
    ) -> CascadeResult<()> {
        self.stage(TxOp::SetPartitionWatermark {
            part_queue: part_queue.to_string(),
            tick_id,
        })?;
        Ok(())
    }

    async fn set_consumer_completed(
        &mut self,
        queue: &str,
        consumer: &str,
        tick_id: i64,
    ) -> CascadeResult<()> {
        self.stage(TxOp::SetConsumerCompleted {
            queue: queue.to_string(),
            consumer: consumer.to_string(),
            tick_id,
        })?;
        Ok(())
    }

    async fn save_table_state(
        &mut self,
        queue: &str,
        table: &str,
        phase: &TablePhase,
        snapshot: Option<&TxidSnapshot>,
    ) -> CascadeResult<()> {
        self.stage(TxOp::SaveTableState {
            queue: queue.to_string(),
            table: table.to_string(),
            phase: *phase,
            snapshot: snapshot.cloned(),
        })?;
        Ok(())
    }

    async fn register_global_table(&mut self, queue: &str, table: &str) -> CascadeResult<()> {
        self.stage(TxOp::RegisterGlobalTable {
            queue: queue.to_string(),
            table: table.to_string(),
        })?;
        Ok(())
    }

    async fn unregister_global_table(&mut self, queue: &str, table: &str) -> CascadeResult<()> {
        self.stage(TxOp::UnregisterGlobalTable {
            queue: queue.to_string(),
            table: table.to_string(),
        })?;
        Ok(())
    }

    async fn save_table_struct(
        &mut self,
        queue: &str,
        table: &str,
        dropped_ddl: Option<&str>,
    ) -> CascadeResult<()> {
        self.stage(TxOp::SaveTableStruct {
            queue: queue.to_string(),
            table: table.to_string(),
            dropped_ddl: dropped_ddl.map(str::to_string),
        })?;
        Ok(())
    }

    async fn lock_table(&mut self, table: &str) -> CascadeResult<()> {
        self.stage(TxOp::LockTable {
            table: table.to_string(),
        })?;
        Ok(())
    }

    async fn drop_table_fkeys(&mut self, table: &str) -> CascadeResult<usize> {
        self.stage_count(TxOp::DropFkeys {
            table: table.to_string(),
        })
    }

    async fn drop_table_objects(&mut self, table: &str) -> CascadeResult<Option<String>> {
        match self.stage(TxOp::DropObjects {
            table: table.to_string(),
        })? {
            OpOutput::Ddl(ddl) => Ok(ddl),
            other => bail!(
                ErrorKind::QueryFailed,
                "Statement returned an unexpected result",
                format!("{other:?}")
            ),
        }
    }

    async fn restore_table_objects(&mut self, ddl: &str) -> CascadeResult<()> {
        self.stage(TxOp::RestoreObjects { ddl: ddl.to_string() })?;
        Ok(())
    }

    async fn restore_pending_fkeys(&mut self, queue: &str) -> CascadeResult<usize> {
        self.stage_count(TxOp::RestorePendingFkeys {
            queue: queue.to_string(),
        })
    }

    async fn commit(self) -> CascadeResult<()> {
        let MemoryTx {
            cluster, location, ops, ..
        } = self;

        cluster
            .with_db(&location, |db| {
                if db.fail_commits > 0 {
                    db.fail_commits -= 1;
                    bail!(
                        ErrorKind::TargetConnectionFailed,
                        "Connection closed during commit",
                        db.location.clone()
                    );
                }

                let mut next = db.clone();
                let txid = next.allocate_txid();
                for op in &ops {
                    next.apply(op, txid)?;
                }
                *db = next;

                Ok(())
            })
            .await
    }

    async fn rollback(self) -> CascadeResult<()> {
        Ok(())
    }
}

impl TargetStore for MemoryNode {
    type Tx = MemoryTx;

    async fn begin(&self) -> CascadeResult<MemoryTx> {
        let working = self.with_db(|db| Ok(db.clone())).await?;

        Ok(MemoryTx {
            cluster: self.cluster.clone(),
            location: self.location.clone(),
            working,
            ops: Vec::new(),
        })
    }
}

impl TableRegistry for MemoryNode {
    async fn load_table_states(&self, queue: &str) -> CascadeResult<Vec<TableState>> {
        self.with_db(|db| Ok(db.table_states(queue))).await
    }

    async fn add_table(
        &self,
        queue: &str,
        table: &str,
        attrs: &TableAttrs,
        dest_table: Option<&str>,
    ) -> CascadeResult<()> {
        self.with_db(|db| db.add_table(queue, table, attrs, dest_table))
            .await
    }

    async fn remove_table(&self, queue: &str, table: &str) -> CascadeResult<()> {
        self.with_db(|db| db.remove_table(queue, table)).await
    }

    async fn reset_table(&self, queue: &str, table: &str) -> CascadeResult<()> {
        self.with_db(|db| db.reset_table(queue, table)).await
    }

    async fn table_exists(&self, table: &str) -> CascadeResult<bool> {
        self.with_db(|db| Ok(db.data.contains_key(table))).await
    }
}

impl CopySource for MemoryNode {
    /// Returns every row of `table`; row conditions are not evaluated.
    async fn copy_table(&self, table: &str, _condition: Option<&str>) -> CascadeResult<TableCopy> {
        self.with_db(|db| {
            let Some(data) = db.data.get(table) else {
                bail!(ErrorKind::QueryFailed, "Relation does not exist", table);
            };

            Ok(TableCopy {
                rows: data.rows.clone(),
                snapshot: db.snapshot(),
            })
        })
        .await
    }
}

/// Claim on a table copy, released when dropped like the session lock it stands for.
#[derive(Debug)]
pub struct MemoryCopyClaim {
    _claim: Arc<()>,
}

impl CopyClaims for MemoryNode {
    type Claim = MemoryCopyClaim;

    async fn try_claim_copy(
        &self,
        queue: &str,
        table: &str,
    ) -> CascadeResult<Option<MemoryCopyClaim>> {
        self.with_db(|db| {
            Ok(db
                .claim_copy(queue, table)
                .map(|claim| MemoryCopyClaim { _claim: claim }))
        })
        .await
    }

    async fn copy_claimed(&self, queue: &str, table: &str) -> CascadeResult<bool> {
        self.with_db(|db| Ok(db.copy_claimed(queue, table))).await
    }
}
