//! State of the in-memory cluster.
//!
//! Every database of the cluster holds queues, node rows, table states and plain data tables.
//! Transactions stage their operations against a private copy of the database and replay them
//! on the live state at commit, so a commit is all-or-nothing and sees writes committed by
//! others in the meantime.

use std::collections::BTreeMap;
use std::mem;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::bail;
use crate::conversions::urlenc::encode_map;
use crate::error::{CascadeResult, ErrorKind};
use crate::node::base::NewNode;
use crate::state::table::{TableAttrs, TablePhase, TableState};
use crate::store::base::RowOp;
use crate::types::{
    ADD_TABLE_EVENT, BatchInfo, ChangeOp, ConsumerState, Event, GLOBAL_WATERMARK_EVENT,
    LOCATION_INFO_EVENT, NewEvent, NodeAttrs, NodeInfo, NodeLocation, NodeType, REMOVE_TABLE_EVENT,
    RowMap, SubscriberInfo, TxidSnapshot, UNREGISTER_LOCATION_EVENT,
};

/// Id of the first tick of a queue created on a root.
pub const ROOT_INITIAL_TICK: i64 = 1;

#[derive(Debug, Clone)]
pub(crate) struct Tick {
    pub(crate) time: DateTime<Utc>,
    pub(crate) event_seq: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct QueueConsumer {
    pub(crate) last_tick: i64,
    pub(crate) batch_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub(crate) struct Queue {
    pub(crate) events: BTreeMap<i64, Event>,
    pub(crate) ticks: BTreeMap<i64, Tick>,
    pub(crate) consumers: BTreeMap<String, QueueConsumer>,
    pub(crate) next_event_id: i64,
    /// Set by the first step of a root demotion; source changes are refused.
    pub(crate) frozen: bool,
    /// Events put back by `retry_event`, re-inserted at the next tick.
    pub(crate) retry: Vec<Event>,
}

impl Queue {
    fn new(initial_tick: i64) -> Self {
        let mut ticks = BTreeMap::new();
        ticks.insert(
            initial_tick,
            Tick {
                time: Utc::now(),
                event_seq: 0,
            },
        );

        Queue {
            events: BTreeMap::new(),
            ticks,
            consumers: BTreeMap::new(),
            next_event_id: 1,
            frozen: false,
            retry: Vec::new(),
        }
    }

    pub(crate) fn last_tick(&self) -> i64 {
        self.ticks.keys().next_back().copied().unwrap_or_default()
    }

    fn push_event(&mut self, mut event: Event, keep_id: bool) {
        if keep_id {
            self.next_event_id = self.next_event_id.max(event.id + 1);
        } else {
            event.id = self.next_event_id;
            self.next_event_id += 1;
        }
        self.events.insert(event.id, event);
    }

    fn tick(&mut self) -> i64 {
        for event in mem::take(&mut self.retry) {
            self.push_event(event, false);
        }

        let tick_id = self.last_tick() + 1;
        self.ticks.insert(
            tick_id,
            Tick {
                time: Utc::now(),
                event_seq: self.next_event_id - 1,
            },
        );
        tick_id
    }

    fn tick_seq(&self, tick_id: i64) -> i64 {
        self.ticks
            .get(&tick_id)
            .map(|tick| tick.event_seq)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OpenBatch {
    pub(crate) queue: String,
    pub(crate) consumer: String,
    pub(crate) info: BatchInfo,
}

#[derive(Debug, Clone)]
pub(crate) struct NodeRow {
    pub(crate) node_type: NodeType,
    pub(crate) node_name: String,
    pub(crate) worker_name: String,
    pub(crate) provider_node: Option<String>,
    pub(crate) global_watermark: i64,
    pub(crate) combined_queue: Option<String>,
    pub(crate) attrs: NodeAttrs,
}

#[derive(Debug, Clone)]
pub(crate) struct LocalConsumer {
    pub(crate) provider_node: String,
    pub(crate) completed_tick: i64,
    pub(crate) paused: bool,
    pub(crate) uptodate: bool,
    pub(crate) error: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Subscriber {
    pub(crate) worker_name: String,
    pub(crate) watermark: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct TableRecord {
    pub(crate) local: bool,
    pub(crate) phase: TablePhase,
    pub(crate) snapshot: Option<TxidSnapshot>,
    pub(crate) attrs: TableAttrs,
    pub(crate) dest_table: String,
    pub(crate) dropped_ddl: Option<String>,
}

impl TableRecord {
    fn global(table: &str) -> Self {
        TableRecord {
            local: false,
            phase: TablePhase::Missing,
            snapshot: None,
            attrs: TableAttrs::default(),
            dest_table: table.to_string(),
            dropped_ddl: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DataTable {
    pub(crate) rows: Vec<RowMap>,
    /// DDL of secondary indexes and constraints, dropped for bulk loads.
    pub(crate) objects: Option<String>,
}

/// A foreign key between two data tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub name: String,
    pub table: String,
    pub ref_table: String,
}

impl ForeignKey {
    pub fn new(name: &str, table: &str, ref_table: &str) -> Self {
        ForeignKey {
            name: name.to_string(),
            table: table.to_string(),
            ref_table: ref_table.to_string(),
        }
    }

    fn touches(&self, table: &str) -> bool {
        self.table == table || self.ref_table == table
    }
}

/// An operation staged by a transaction.
#[derive(Debug, Clone)]
pub(crate) enum TxOp {
    ApplyRows(Vec<(String, RowOp)>),
    InsertEvents {
        queue: String,
        events: Vec<Event>,
        keep_ids: bool,
    },
    InsertEvent {
        queue: String,
        event: NewEvent,
    },
    CreateTick {
        queue: String,
        tick_id: i64,
        time: DateTime<Utc>,
        event_seq: i64,
    },
    RegisterLocation {
        queue: String,
        location: NodeLocation,
    },
    UnregisterLocation {
        queue: String,
        node: String,
    },
    SetGlobalWatermark {
        queue: String,
        tick_id: i64,
    },
    SetPartitionWatermark {
        part_queue: String,
        tick_id: i64,
    },
    SetConsumerCompleted {
        queue: String,
        consumer: String,
        tick_id: i64,
    },
    SaveTableState {
        queue: String,
        table: String,
        phase: TablePhase,
        snapshot: Option<TxidSnapshot>,
    },
    RegisterGlobalTable {
        queue: String,
        table: String,
    },
    UnregisterGlobalTable {
        queue: String,
        table: String,
    },
    SaveTableStruct {
        queue: String,
        table: String,
        dropped_ddl: Option<String>,
    },
    LockTable {
        table: String,
    },
    DropFkeys {
        table: String,
    },
    DropObjects {
        table: String,
    },
    RestoreObjects {
        ddl: String,
    },
    RestorePendingFkeys {
        queue: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OpOutput {
    Unit,
    Count(usize),
    Ddl(Option<String>),
}

/// One database of the cluster.
#[derive(Debug, Clone)]
pub(crate) struct Database {
    pub(crate) location: String,
    pub(crate) reachable: bool,
    pub(crate) fail_commits: u32,
    pub(crate) next_txid: i64,
    pub(crate) next_batch_id: i64,
    pub(crate) queues: BTreeMap<String, Queue>,
    pub(crate) batches: BTreeMap<i64, OpenBatch>,
    pub(crate) nodes: BTreeMap<String, NodeRow>,
    pub(crate) consumers: BTreeMap<(String, String), LocalConsumer>,
    pub(crate) locations: BTreeMap<String, BTreeMap<String, NodeLocation>>,
    pub(crate) subscribers: BTreeMap<String, BTreeMap<String, Subscriber>>,
    pub(crate) tables: BTreeMap<String, BTreeMap<String, TableRecord>>,
    pub(crate) data: BTreeMap<String, DataTable>,
    pub(crate) fkeys: Vec<ForeignKey>,
    pub(crate) pending_fkeys: Vec<ForeignKey>,
    pub(crate) dropped_objects: BTreeMap<String, String>,
    /// Copy claims by queue and table, alive while a worker holds the strong side.
    pub(crate) copy_claims: BTreeMap<(String, String), Weak<()>>,
}

fn key(queue: &str, consumer: &str) -> (String, String) {
    (queue.to_string(), consumer.to_string())
}

fn row_matches(row: &RowMap, key: &RowMap) -> bool {
    key.iter().all(|(column, value)| row.get(column) == Some(value))
}

impl Database {
    fn new(location: &str) -> Self {
        Database {
            location: location.to_string(),
            reachable: true,
            fail_commits: 0,
            next_txid: 1,
            next_batch_id: 1,
            queues: BTreeMap::new(),
            batches: BTreeMap::new(),
            nodes: BTreeMap::new(),
            consumers: BTreeMap::new(),
            locations: BTreeMap::new(),
            subscribers: BTreeMap::new(),
            tables: BTreeMap::new(),
            data: BTreeMap::new(),
            fkeys: Vec::new(),
            pending_fkeys: Vec::new(),
            dropped_objects: BTreeMap::new(),
            copy_claims: BTreeMap::new(),
        }
    }

    pub(crate) fn claim_copy(&mut self, queue: &str, table: &str) -> Option<Arc<()>> {
        if self.copy_claimed(queue, table) {
            return None;
        }

        let claim = Arc::new(());
        self.copy_claims
            .insert(key(queue, table), Arc::downgrade(&claim));
        Some(claim)
    }

    pub(crate) fn copy_claimed(&self, queue: &str, table: &str) -> bool {
        self.copy_claims
            .get(&key(queue, table))
            .is_some_and(|claim| claim.strong_count() > 0)
    }

    pub(crate) fn allocate_txid(&mut self) -> i64 {
        let txid = self.next_txid;
        self.next_txid += 1;
        txid
    }

    pub(crate) fn queue(&self, queue: &str) -> CascadeResult<&Queue> {
        match self.queues.get(queue) {
            Some(found) => Ok(found),
            None => bail!(
                ErrorKind::QueryFailed,
                "Queue does not exist",
                format!("{queue} on {}", self.location)
            ),
        }
    }

    pub(crate) fn queue_mut(&mut self, queue: &str) -> CascadeResult<&mut Queue> {
        let location = self.location.clone();
        match self.queues.get_mut(queue) {
            Some(found) => Ok(found),
            None => bail!(
                ErrorKind::QueryFailed,
                "Queue does not exist",
                format!("{queue} on {location}")
            ),
        }
    }

    pub(crate) fn node(&self, queue: &str) -> CascadeResult<&NodeRow> {
        match self.nodes.get(queue) {
            Some(node) => Ok(node),
            None => bail!(
                ErrorKind::MissingConsumerState,
                "Node is not initialized",
                format!("queue {queue} on {}", self.location)
            ),
        }
    }

    fn node_mut(&mut self, queue: &str) -> CascadeResult<&mut NodeRow> {
        let location = self.location.clone();
        match self.nodes.get_mut(queue) {
            Some(node) => Ok(node),
            None => bail!(
                ErrorKind::MissingConsumerState,
                "Node is not initialized",
                format!("queue {queue} on {location}")
            ),
        }
    }

    fn is_root(&self, queue: &str) -> bool {
        self.nodes
            .get(queue)
            .is_some_and(|node| node.node_type == NodeType::Root)
    }

    pub(crate) fn consumer_mut(
        &mut self,
        queue: &str,
        consumer: &str,
    ) -> CascadeResult<&mut LocalConsumer> {
        match self.consumers.get_mut(&key(queue, consumer)) {
            Some(found) => Ok(found),
            None => bail!(
                ErrorKind::MissingConsumerState,
                "Consumer is not registered on the node",
                format!("queue {queue}, consumer {consumer}")
            ),
        }
    }

    fn table_mut(&mut self, queue: &str, table: &str) -> CascadeResult<&mut TableRecord> {
        match self.tables.get_mut(queue).and_then(|tables| tables.get_mut(table)) {
            Some(record) => Ok(record),
            None => bail!(
                ErrorKind::MissingTableState,
                "Table is not registered",
                format!("queue {queue}: {table}")
            ),
        }
    }

    fn data_mut(&mut self, table: &str) -> CascadeResult<&mut DataTable> {
        match self.data.get_mut(table) {
            Some(data) => Ok(data),
            None => bail!(ErrorKind::QueryFailed, "Relation does not exist", table),
        }
    }

    fn location_of(&self, queue: &str, node: &str) -> Option<String> {
        self.locations
            .get(queue)
            .and_then(|locations| locations.get(node))
            .map(|location| location.location.clone())
    }

    fn insert_new_event(&mut self, queue: &str, event: &NewEvent, txid: i64) -> CascadeResult<()> {
        let event = Event {
            id: 0,
            time: Utc::now(),
            txid,
            retry: None,
            ev_type: event.ev_type.clone(),
            data: event.data.clone(),
            extra1: event.extra1.clone(),
            extra2: event.extra2.clone(),
            extra3: event.extra3.clone(),
            extra4: event.extra4.clone(),
        };
        self.queue_mut(queue)?.push_event(event, false);

        Ok(())
    }

    /// Inserts an event in its own transaction.
    pub(crate) fn insert_autonomous_event(
        &mut self,
        queue: &str,
        event: &NewEvent,
    ) -> CascadeResult<()> {
        let txid = self.allocate_txid();
        self.insert_new_event(queue, event, txid)
    }

    pub(crate) fn snapshot(&self) -> TxidSnapshot {
        TxidSnapshot {
            xmin: self.next_txid,
            xmax: self.next_txid,
            xip: Vec::new(),
        }
    }

    pub(crate) fn node_info(&self, queue: &str) -> CascadeResult<NodeInfo> {
        let node = self.node(queue)?;
        let completed = self
            .consumers
            .get(&key(queue, &node.worker_name))
            .map(|consumer| consumer.completed_tick);
        let worker = self.consumers.get(&key(queue, &node.worker_name));
        let own_last_tick = self.queues.get(queue).map(Queue::last_tick);
        let min_subscriber = self
            .subscribers
            .get(queue)
            .and_then(|subscribers| {
                subscribers
                    .values()
                    .map(|subscriber| subscriber.watermark)
                    .min()
            });

        let local_watermark = match node.node_type {
            NodeType::Leaf => completed,
            NodeType::Branch => match (completed, min_subscriber) {
                (Some(completed), Some(subscriber)) => Some(completed.min(subscriber)),
                (completed, subscriber) => completed.or(subscriber),
            },
            NodeType::Root => min_subscriber.or(own_last_tick),
        }
        .unwrap_or(node.global_watermark);

        let worker_last_tick = match node.node_type {
            NodeType::Leaf => completed,
            NodeType::Root | NodeType::Branch => own_last_tick,
        };

        Ok(NodeInfo {
            node_type: node.node_type,
            node_name: node.node_name.clone(),
            global_watermark: node.global_watermark,
            local_watermark,
            provider_node: node.provider_node.clone(),
            provider_location: node
                .provider_node
                .as_deref()
                .and_then(|provider| self.location_of(queue, provider)),
            combined_queue: node.combined_queue.clone(),
            combined_type: node
                .combined_queue
                .as_deref()
                .and_then(|combined| self.nodes.get(combined))
                .map(|combined| combined.node_type),
            worker_name: Some(node.worker_name.clone()),
            worker_paused: worker.is_some_and(|worker| worker.paused),
            worker_uptodate: worker.is_some_and(|worker| worker.uptodate),
            worker_last_tick,
            attrs: node.attrs.clone(),
        })
    }

    pub(crate) fn consumer_state(&self, queue: &str, consumer: &str) -> Option<ConsumerState> {
        let node = self.nodes.get(queue)?;
        let state = self.consumers.get(&key(queue, consumer))?;

        let provider_location = match self.location_of(queue, &state.provider_node) {
            Some(location) => location,
            None if state.provider_node == node.node_name => self.location.clone(),
            None => String::new(),
        };

        Some(ConsumerState {
            node_type: node.node_type,
            node_name: node.node_name.clone(),
            completed_tick: state.completed_tick,
            provider_node: state.provider_node.clone(),
            provider_location,
            paused: state.paused,
            uptodate: state.uptodate,
            error: state.error.clone(),
        })
    }

    pub(crate) fn register_location(
        &mut self,
        queue: &str,
        location: &NodeLocation,
        txid: i64,
    ) -> CascadeResult<()> {
        self.locations
            .entry(queue.to_string())
            .or_default()
            .insert(location.node_name.clone(), location.clone());

        if self.is_root(queue) {
            let mut event = NewEvent::new(LOCATION_INFO_EVENT, Some(location.node_name.clone()));
            event.extra2 = Some(location.location.clone());
            event.extra3 = Some(if location.dead { "1" } else { "0" }.to_string());
            self.insert_new_event(queue, &event, txid)?;
        }

        Ok(())
    }

    pub(crate) fn unregister_location(
        &mut self,
        queue: &str,
        node: &str,
        txid: i64,
    ) -> CascadeResult<()> {
        if let Some(locations) = self.locations.get_mut(queue) {
            locations.remove(node);
        }

        if self.is_root(queue) {
            let event = NewEvent::new(UNREGISTER_LOCATION_EVENT, Some(node.to_string()));
            self.insert_new_event(queue, &event, txid)?;
        }

        Ok(())
    }

    pub(crate) fn register_location_now(
        &mut self,
        queue: &str,
        location: &NodeLocation,
    ) -> CascadeResult<()> {
        let txid = self.allocate_txid();
        self.register_location(queue, location, txid)
    }

    pub(crate) fn unregister_location_now(&mut self, queue: &str, node: &str) -> CascadeResult<()> {
        let txid = self.allocate_txid();
        self.unregister_location(queue, node, txid)
    }

    pub(crate) fn locations(&self, queue: &str) -> Vec<NodeLocation> {
        self.locations
            .get(queue)
            .map(|locations| locations.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn subscriber_info(&self, queue: &str) -> Vec<SubscriberInfo> {
        self.subscribers
            .get(queue)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .map(|(node_name, subscriber)| SubscriberInfo {
                        node_name: node_name.clone(),
                        worker_name: Some(subscriber.worker_name.clone()),
                        watermark: Some(subscriber.watermark),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn register_subscriber(
        &mut self,
        queue: &str,
        node: &str,
        worker: &str,
        tick_id: Option<i64>,
    ) -> CascadeResult<Option<i64>> {
        let tick_id = match tick_id {
            Some(tick_id) => tick_id,
            None => self.queue(queue)?.last_tick(),
        };
        self.register_consumer(queue, worker, Some(tick_id))?;
        self.subscribers.entry(queue.to_string()).or_default().insert(
            node.to_string(),
            Subscriber {
                worker_name: worker.to_string(),
                watermark: tick_id,
            },
        );

        Ok(Some(tick_id))
    }

    pub(crate) fn unregister_subscriber(&mut self, queue: &str, node: &str) -> CascadeResult<()> {
        let removed = self
            .subscribers
            .get_mut(queue)
            .and_then(|subscribers| subscribers.remove(node));
        if let Some(subscriber) = removed {
            self.unregister_consumer(queue, &subscriber.worker_name);
        }

        Ok(())
    }

    /// Stores the watermark as given; it may move back when a subscriber reports a lower one.
    pub(crate) fn set_subscriber_watermark(
        &mut self,
        queue: &str,
        node: &str,
        tick_id: i64,
    ) -> CascadeResult<()> {
        match self
            .subscribers
            .get_mut(queue)
            .and_then(|subscribers| subscribers.get_mut(node))
        {
            Some(subscriber) => {
                subscriber.watermark = tick_id;
                Ok(())
            }
            None => bail!(
                ErrorKind::NodeCommandFailed,
                "Subscriber is not registered",
                format!("queue {queue}: {node}")
            ),
        }
    }

    pub(crate) fn set_global_watermark(
        &mut self,
        queue: &str,
        tick_id: Option<i64>,
    ) -> CascadeResult<()> {
        let info = self.node_info(queue)?;
        let watermark = tick_id.unwrap_or(info.local_watermark);
        if watermark <= info.global_watermark {
            return Ok(());
        }

        self.node_mut(queue)?.global_watermark = watermark;
        if info.node_type == NodeType::Root {
            let event = NewEvent::new(GLOBAL_WATERMARK_EVENT, Some(watermark.to_string()));
            self.insert_autonomous_event(queue, &event)?;
        }

        Ok(())
    }

    pub(crate) fn create_node(&mut self, new_node: &NewNode) -> CascadeResult<()> {
        let queue = new_node.queue.as_str();
        if self.nodes.contains_key(queue) {
            bail!(
                ErrorKind::NodeCommandFailed,
                "Node already exists",
                format!("queue {queue} on {}", self.location)
            );
        }

        let (global_watermark, provider_node) = match new_node.node_type {
            NodeType::Root => {
                let queue_state = self
                    .queues
                    .entry(queue.to_string())
                    .or_insert_with(|| Queue::new(ROOT_INITIAL_TICK));
                (queue_state.last_tick(), new_node.node_name.clone())
            }
            NodeType::Branch | NodeType::Leaf => {
                let Some(provider_node) = new_node.provider_node.clone() else {
                    bail!(
                        ErrorKind::NodeCommandFailed,
                        "Non-root node needs a provider",
                        new_node.node_name.clone()
                    );
                };
                let start_tick = new_node.global_watermark.unwrap_or(ROOT_INITIAL_TICK);
                if new_node.node_type == NodeType::Branch {
                    self.queues
                        .entry(queue.to_string())
                        .or_insert_with(|| Queue::new(start_tick));
                }
                (start_tick, provider_node)
            }
        };

        self.nodes.insert(
            queue.to_string(),
            NodeRow {
                node_type: new_node.node_type,
                node_name: new_node.node_name.clone(),
                worker_name: new_node.worker_name.clone(),
                provider_node: (new_node.node_type != NodeType::Root)
                    .then(|| provider_node.clone()),
                global_watermark,
                combined_queue: new_node.combined_queue.clone(),
                attrs: NodeAttrs::default(),
            },
        );
        self.consumers.insert(
            key(queue, &new_node.worker_name),
            LocalConsumer {
                provider_node,
                completed_tick: global_watermark,
                paused: false,
                uptodate: false,
                error: None,
            },
        );

        Ok(())
    }

    pub(crate) fn drop_node(&mut self, queue: &str, node_name: &str) -> CascadeResult<()> {
        let own = self.nodes.get(queue).is_some_and(|node| node.node_name == node_name);
        if !own {
            self.unregister_location_now(queue, node_name)?;
            return self.unregister_subscriber(queue, node_name);
        }

        if self.subscribers.get(queue).is_some_and(|subscribers| !subscribers.is_empty()) {
            bail!(
                ErrorKind::NodeCommandFailed,
                "Node still has subscribers",
                node_name
            );
        }

        self.nodes.remove(queue);
        self.queues.remove(queue);
        self.locations.remove(queue);
        self.subscribers.remove(queue);
        self.tables.remove(queue);
        self.consumers.retain(|(consumer_queue, _), _| consumer_queue != queue);
        self.batches.retain(|_, batch| batch.queue != queue);

        Ok(())
    }

    pub(crate) fn demote_root(
        &mut self,
        queue: &str,
        step: i32,
        new_provider: &str,
    ) -> CascadeResult<Option<i64>> {
        let node = self.node(queue)?.clone();
        match step {
            1 | 2 if node.node_type != NodeType::Root => bail!(
                ErrorKind::NodeCommandFailed,
                "Only a root can be demoted",
                node.node_name
            ),
            1 => {
                self.queue_mut(queue)?.frozen = true;
                Ok(None)
            }
            2 => {
                let last_tick = self.queue_mut(queue)?.tick();
                Ok(Some(last_tick))
            }
            3 => {
                let queue_state = self.queue_mut(queue)?;
                queue_state.frozen = false;
                let last_tick = queue_state.last_tick();

                let row = self.node_mut(queue)?;
                row.node_type = NodeType::Branch;
                row.provider_node = Some(new_provider.to_string());
                let worker = row.worker_name.clone();

                let consumer = self.consumer_mut(queue, &worker)?;
                consumer.provider_node = new_provider.to_string();
                consumer.completed_tick = last_tick;
                consumer.uptodate = false;

                Ok(None)
            }
            other => bail!(
                ErrorKind::NodeCommandFailed,
                "Unknown demotion step",
                other
            ),
        }
    }

    pub(crate) fn promote_branch(&mut self, queue: &str) -> CascadeResult<()> {
        let row = self.node_mut(queue)?;
        if row.node_type != NodeType::Branch {
            bail!(
                ErrorKind::NodeCommandFailed,
                "Only a branch can be promoted",
                row.node_name.clone()
            );
        }
        row.node_type = NodeType::Root;
        row.provider_node = None;
        let node_name = row.node_name.clone();
        let worker = row.worker_name.clone();

        let consumer = self.consumer_mut(queue, &worker)?;
        consumer.provider_node = node_name;
        consumer.uptodate = false;

        Ok(())
    }

    pub(crate) fn rename_node_step1(&mut self, queue: &str, old_name: &str, new_name: &str) {
        if let Some(locations) = self.locations.get_mut(queue)
            && let Some(mut location) = locations.remove(old_name)
        {
            location.node_name = new_name.to_string();
            locations.insert(new_name.to_string(), location);
        }
        if let Some(subscribers) = self.subscribers.get_mut(queue)
            && let Some(subscriber) = subscribers.remove(old_name)
        {
            subscribers.insert(new_name.to_string(), subscriber);
        }
        if let Some(node) = self.nodes.get_mut(queue)
            && node.provider_node.as_deref() == Some(old_name)
        {
            node.provider_node = Some(new_name.to_string());
        }
        for ((consumer_queue, _), consumer) in self.consumers.iter_mut() {
            if consumer_queue == queue && consumer.provider_node == old_name {
                consumer.provider_node = new_name.to_string();
            }
        }
    }

    pub(crate) fn rename_node_step2(
        &mut self,
        queue: &str,
        old_name: &str,
        new_name: &str,
    ) -> CascadeResult<()> {
        let row = self.node_mut(queue)?;
        if row.node_name != old_name {
            bail!(
                ErrorKind::NodeCommandFailed,
                "Node has a different name",
                format!("expected {old_name}, found {}", row.node_name)
            );
        }
        row.node_name = new_name.to_string();

        Ok(())
    }

    pub(crate) fn next_batch(
        &mut self,
        queue: &str,
        consumer: &str,
        single_tick: bool,
    ) -> CascadeResult<Option<BatchInfo>> {
        let queue_state = self.queue(queue)?;
        let Some(position) = queue_state.consumers.get(consumer) else {
            bail!(
                ErrorKind::QueryFailed,
                "Consumer is not registered on the queue",
                format!("queue {queue}, consumer {consumer}")
            );
        };
        if let Some(batch_id) = position.batch_id
            && let Some(batch) = self.batches.get(&batch_id)
        {
            return Ok(Some(batch.info.clone()));
        }

        let prev_tick_id = position.last_tick;
        let Some(prev_tick) = queue_state.ticks.get(&prev_tick_id) else {
            bail!(
                ErrorKind::QueryFailed,
                "Consumer position points to a missing tick",
                format!("queue {queue}, consumer {consumer}, tick {prev_tick_id}")
            );
        };
        let mut later = queue_state.ticks.range(prev_tick_id + 1..);
        let next = if single_tick { later.next() } else { later.next_back() };
        let Some((&cur_tick_id, cur_tick)) = next else {
            return Ok(None);
        };

        let info = BatchInfo {
            batch_id: self.next_batch_id,
            cur_tick_id,
            prev_tick_id,
            cur_tick_time: cur_tick.time,
            prev_tick_time: prev_tick.time,
            cur_tick_event_seq: cur_tick.event_seq,
            prev_tick_event_seq: prev_tick.event_seq,
        };
        self.next_batch_id += 1;

        self.batches.insert(
            info.batch_id,
            OpenBatch {
                queue: queue.to_string(),
                consumer: consumer.to_string(),
                info: info.clone(),
            },
        );
        if let Some(position) = self.queue_mut(queue)?.consumers.get_mut(consumer) {
            position.batch_id = Some(info.batch_id);
        }

        Ok(Some(info))
    }

    fn open_batch(&self, batch_id: i64) -> CascadeResult<&OpenBatch> {
        match self.batches.get(&batch_id) {
            Some(batch) => Ok(batch),
            None => bail!(ErrorKind::QueryFailed, "Batch is not open", batch_id),
        }
    }

    pub(crate) fn batch_events(&self, batch_id: i64) -> CascadeResult<Vec<Event>> {
        let batch = self.open_batch(batch_id)?;
        let queue = self.queue(&batch.queue)?;
        let range = batch.info.prev_tick_event_seq + 1..=batch.info.cur_tick_event_seq;

        Ok(queue.events.range(range).map(|(_, event)| event.clone()).collect())
    }

    pub(crate) fn finish_batch(&mut self, batch_id: i64) -> CascadeResult<()> {
        let Some(batch) = self.batches.remove(&batch_id) else {
            return Ok(());
        };
        if let Some(queue) = self.queues.get_mut(&batch.queue)
            && let Some(position) = queue.consumers.get_mut(&batch.consumer)
            && position.batch_id == Some(batch_id)
        {
            position.last_tick = batch.info.cur_tick_id;
            position.batch_id = None;
        }

        Ok(())
    }

    pub(crate) fn retry_event(&mut self, batch_id: i64, event_id: i64) -> CascadeResult<()> {
        let queue_name = self.open_batch(batch_id)?.queue.clone();
        let queue = self.queue_mut(&queue_name)?;
        let Some(mut event) = queue.events.get(&event_id).cloned() else {
            bail!(ErrorKind::QueryFailed, "Event is not part of the batch", event_id);
        };
        event.retry = Some(event.retry.unwrap_or_default() + 1);
        queue.retry.push(event);

        Ok(())
    }

    pub(crate) fn register_consumer(
        &mut self,
        queue: &str,
        consumer: &str,
        tick_id: Option<i64>,
    ) -> CascadeResult<()> {
        let queue_state = self.queue_mut(queue)?;
        let tick_id = tick_id.unwrap_or_else(|| queue_state.last_tick());
        if !queue_state.ticks.contains_key(&tick_id) {
            bail!(
                ErrorKind::QueryFailed,
                "Tick does not exist",
                format!("queue {queue}, tick {tick_id}")
            );
        }

        let previous = queue_state.consumers.insert(
            consumer.to_string(),
            QueueConsumer {
                last_tick: tick_id,
                batch_id: None,
            },
        );
        if let Some(batch_id) = previous.and_then(|previous| previous.batch_id) {
            self.batches.remove(&batch_id);
        }

        Ok(())
    }

    pub(crate) fn unregister_consumer(&mut self, queue: &str, consumer: &str) {
        let removed = self
            .queues
            .get_mut(queue)
            .and_then(|queue_state| queue_state.consumers.remove(consumer));
        if let Some(batch_id) = removed.and_then(|removed| removed.batch_id) {
            self.batches.remove(&batch_id);
        }
    }

    /// Ticks a queue unless it is fed by an upstream node.
    pub(crate) fn force_tick(&mut self, queue: &str) -> CascadeResult<i64> {
        let upstream_fed = self
            .nodes
            .get(queue)
            .is_some_and(|node| node.node_type != NodeType::Root);
        let queue_state = self.queue_mut(queue)?;
        if upstream_fed {
            return Ok(queue_state.last_tick());
        }

        Ok(queue_state.tick())
    }

    pub(crate) fn delete_batch_events(&mut self, queue: &str, batch_id: i64) -> CascadeResult<u64> {
        let info = self.open_batch(batch_id)?.info.clone();
        let queue_state = self.queue_mut(queue)?;
        let ids: Vec<i64> = queue_state
            .events
            .range(info.prev_tick_event_seq + 1..=info.cur_tick_event_seq)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            queue_state.events.remove(id);
        }

        Ok(ids.len() as u64)
    }

    pub(crate) fn drop_ticks_after(&mut self, queue: &str, tick_id: i64) -> CascadeResult<u64> {
        let queue_state = self.queue_mut(queue)?;
        let dropped = queue_state.ticks.split_off(&(tick_id + 1));
        for position in queue_state.consumers.values_mut() {
            position.last_tick = position.last_tick.min(tick_id);
        }

        Ok(dropped.len() as u64)
    }

    pub(crate) fn table_states(&self, queue: &str) -> Vec<TableState> {
        let Some(tables) = self.tables.get(queue) else {
            return Vec::new();
        };

        let mut copy_pos = 0;
        tables
            .iter()
            .map(|(name, record)| {
                let state = TableState {
                    name: name.clone(),
                    dest_table: record.dest_table.clone(),
                    local: record.local,
                    phase: record.phase,
                    snapshot: record.snapshot.clone(),
                    attrs: record.attrs.clone(),
                    dropped_ddl: record.dropped_ddl.clone(),
                    copy_pos,
                };
                if record.local && record.phase.is_copy_phase() {
                    copy_pos += 1;
                }
                state
            })
            .collect()
    }

    pub(crate) fn add_table(
        &mut self,
        queue: &str,
        table: &str,
        attrs: &TableAttrs,
        dest_table: Option<&str>,
    ) -> CascadeResult<()> {
        let is_root = self.node(queue)?.node_type == NodeType::Root;
        let record = self
            .tables
            .entry(queue.to_string())
            .or_default()
            .entry(table.to_string())
            .or_insert_with(|| TableRecord::global(table));
        if record.local {
            return Ok(());
        }

        record.local = true;
        record.attrs = attrs.clone();
        record.dest_table = dest_table.unwrap_or(table).to_string();
        record.phase = if is_root { TablePhase::Ok } else { TablePhase::Missing };
        record.snapshot = None;

        if is_root {
            let event = NewEvent::new(ADD_TABLE_EVENT, Some(table.to_string()));
            self.insert_autonomous_event(queue, &event)?;
        }

        Ok(())
    }

    pub(crate) fn remove_table(&mut self, queue: &str, table: &str) -> CascadeResult<()> {
        if self.is_root(queue) {
            if let Some(tables) = self.tables.get_mut(queue) {
                tables.remove(table);
            }
            let event = NewEvent::new(REMOVE_TABLE_EVENT, Some(table.to_string()));
            return self.insert_autonomous_event(queue, &event);
        }

        let record = self.table_mut(queue, table)?;
        record.local = false;
        record.phase = TablePhase::Missing;
        record.snapshot = None;
        record.dropped_ddl = None;

        Ok(())
    }

    pub(crate) fn reset_table(&mut self, queue: &str, table: &str) -> CascadeResult<()> {
        let record = self.table_mut(queue, table)?;
        record.phase = TablePhase::Missing;
        record.snapshot = None;
        record.dropped_ddl = None;

        Ok(())
    }

    fn apply_row_op(&mut self, table: &str, op: &RowOp) -> CascadeResult<usize> {
        let data = self.data_mut(table)?;
        let touched = match op {
            RowOp::Insert { row } => {
                data.rows.push(row.clone());
                1
            }
            RowOp::Upsert { key_columns, row } => {
                let key: RowMap = key_columns
                    .iter()
                    .map(|column| (column.clone(), row.get(column).cloned().flatten()))
                    .collect();
                match data.rows.iter_mut().find(|existing| row_matches(existing, &key)) {
                    Some(existing) => *existing = row.clone(),
                    None => data.rows.push(row.clone()),
                }
                1
            }
            RowOp::Delete { key } => {
                let before = data.rows.len();
                data.rows.retain(|existing| !row_matches(existing, key));
                before - data.rows.len()
            }
            RowOp::Truncate => {
                let before = data.rows.len();
                data.rows.clear();
                before
            }
            RowOp::Copy { rows } => {
                data.rows.extend(rows.iter().cloned());
                rows.len()
            }
        };

        Ok(touched)
    }

    /// A table is ready for its foreign keys unless it is a local table still being synced.
    fn fkey_table_ready(&self, queue: &str, table: &str) -> bool {
        !self.tables.get(queue).is_some_and(|tables| {
            tables
                .values()
                .any(|record| {
                    record.local && record.dest_table == table && record.phase != TablePhase::Ok
                })
        })
    }

    pub(crate) fn apply(&mut self, op: &TxOp, txid: i64) -> CascadeResult<OpOutput> {
        let output = match op {
            TxOp::ApplyRows(ops) => {
                let mut touched = 0;
                for (table, row_op) in ops {
                    touched += self.apply_row_op(table, row_op)?;
                }
                OpOutput::Count(touched)
            }
            TxOp::InsertEvents {
                queue,
                events,
                keep_ids,
            } => {
                let queue_state = self.queue_mut(queue)?;
                for event in events {
                    let mut event = event.clone();
                    event.txid = txid;
                    queue_state.push_event(event, *keep_ids);
                }
                OpOutput::Unit
            }
            TxOp::InsertEvent { queue, event } => {
                self.insert_new_event(queue, event, txid)?;
                OpOutput::Unit
            }
            TxOp::CreateTick {
                queue,
                tick_id,
                time,
                event_seq,
            } => {
                let queue_state = self.queue_mut(queue)?;
                if *tick_id <= queue_state.last_tick() {
                    bail!(
                        ErrorKind::QueryFailed,
                        "Tick is not after the last tick of the queue",
                        format!("queue {queue}: tick {tick_id}, last {}", queue_state.last_tick())
                    );
                }
                queue_state.ticks.insert(
                    *tick_id,
                    Tick {
                        time: *time,
                        event_seq: (*event_seq).max(queue_state.next_event_id - 1),
                    },
                );
                OpOutput::Unit
            }
            TxOp::RegisterLocation { queue, location } => {
                self.register_location(queue, location, txid)?;
                OpOutput::Unit
            }
            TxOp::UnregisterLocation { queue, node } => {
                self.unregister_location(queue, node, txid)?;
                OpOutput::Unit
            }
            TxOp::SetGlobalWatermark { queue, tick_id } => {
                let node = self.node_mut(queue)?;
                node.global_watermark = node.global_watermark.max(*tick_id);
                OpOutput::Unit
            }
            TxOp::SetPartitionWatermark { part_queue, tick_id } => {
                let worker = self.node(part_queue)?.worker_name.clone();
                let consumer = self.consumer_mut(part_queue, &worker)?;
                consumer.completed_tick = consumer.completed_tick.max(*tick_id);
                OpOutput::Unit
            }
            TxOp::SetConsumerCompleted {
                queue,
                consumer,
                tick_id,
            } => {
                self.consumer_mut(queue, consumer)?.completed_tick = *tick_id;
                OpOutput::Unit
            }
            TxOp::SaveTableState {
                queue,
                table,
                phase,
                snapshot,
            } => {
                let record = self.table_mut(queue, table)?;
                record.phase = *phase;
                record.snapshot = snapshot.clone();
                OpOutput::Unit
            }
            TxOp::RegisterGlobalTable { queue, table } => {
                self.tables
                    .entry(queue.clone())
                    .or_default()
                    .entry(table.clone())
                    .or_insert_with(|| TableRecord::global(table));
                OpOutput::Unit
            }
            TxOp::UnregisterGlobalTable { queue, table } => {
                if let Some(tables) = self.tables.get_mut(queue) {
                    tables.remove(table);
                }
                OpOutput::Unit
            }
            TxOp::SaveTableStruct {
                queue,
                table,
                dropped_ddl,
            } => {
                self.table_mut(queue, table)?.dropped_ddl = dropped_ddl.clone();
                OpOutput::Unit
            }
            TxOp::LockTable { table } => {
                self.data_mut(table)?;
                OpOutput::Unit
            }
            TxOp::DropFkeys { table } => {
                let (dropped, kept): (Vec<_>, Vec<_>) = mem::take(&mut self.fkeys)
                    .into_iter()
                    .partition(|fkey| fkey.touches(table));
                self.fkeys = kept;
                let count = dropped.len();
                self.pending_fkeys.extend(dropped);
                OpOutput::Count(count)
            }
            TxOp::DropObjects { table } => {
                let ddl = self.data_mut(table)?.objects.take();
                if let Some(ddl) = &ddl {
                    self.dropped_objects.insert(ddl.clone(), table.clone());
                }
                OpOutput::Ddl(ddl)
            }
            TxOp::RestoreObjects { ddl } => {
                let Some(table) = self.dropped_objects.remove(ddl) else {
                    bail!(ErrorKind::QueryFailed, "Unknown DDL to restore", ddl);
                };
                self.data_mut(&table)?.objects = Some(ddl.clone());
                OpOutput::Unit
            }
            TxOp::RestorePendingFkeys { queue } => {
                let (ready, waiting): (Vec<_>, Vec<_>) = mem::take(&mut self.pending_fkeys)
                    .into_iter()
                    .partition(|fkey| {
                        self.fkey_table_ready(queue, &fkey.table)
                            && self.fkey_table_ready(queue, &fkey.ref_table)
                    });
                self.pending_fkeys = waiting;
                let count = ready.len();
                self.fkeys.extend(ready);
                OpOutput::Count(count)
            }
        };

        Ok(output)
    }
}

/// Builds the queue event a row trigger would produce for `change`.
pub(crate) fn row_event(
    table: &str,
    op: ChangeOp,
    pkey_columns: &[&str],
    row: &RowMap,
) -> NewEvent {
    let ev_type = if pkey_columns.is_empty() {
        op.to_string()
    } else {
        format!("{op}:{}", pkey_columns.join(","))
    };
    let data = (op != ChangeOp::Truncate).then(|| encode_map(row.iter()));

    NewEvent::new(ev_type, data).with_extra1(table)
}

#[derive(Debug)]
pub(crate) struct ClusterInner {
    pub(crate) databases: BTreeMap<String, Database>,
}

/// A set of in-memory node databases addressed by location.
///
/// Cloning is cheap and every clone shares the same databases.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    pub(crate) inner: Arc<Mutex<ClusterInner>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        MemoryCluster {
            inner: Arc::new(Mutex::new(ClusterInner {
                databases: BTreeMap::new(),
            })),
        }
    }

    /// Adds an empty database reachable at `location`.
    pub async fn add_database(&self, location: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .databases
            .entry(location.to_string())
            .or_insert_with(|| Database::new(location));
    }

    /// Runs `f` on the database at `location`, failing like a broken connection when the
    /// database is unknown or unreachable.
    pub(crate) async fn with_db<T, F>(&self, location: &str, f: F) -> CascadeResult<T>
    where
        F: FnOnce(&mut Database) -> CascadeResult<T> + Send,
        T: Send,
    {
        let mut inner = self.inner.lock().await;
        match inner.databases.get_mut(location) {
            Some(db) if db.reachable => f(db),
            Some(_) => bail!(ErrorKind::ConnectionFailed, "Database is unreachable", location),
            None => bail!(ErrorKind::ConnectionFailed, "No database at location", location),
        }
    }

    /// Like [`MemoryCluster::with_db`] but ignores reachability, for test setup and assertions.
    async fn inspect<T, F>(&self, location: &str, f: F) -> CascadeResult<T>
    where
        F: FnOnce(&mut Database) -> CascadeResult<T> + Send,
        T: Send,
    {
        let mut inner = self.inner.lock().await;
        match inner.databases.get_mut(location) {
            Some(db) => f(db),
            None => bail!(ErrorKind::ConnectionFailed, "No database at location", location),
        }
    }

    pub async fn set_reachable(&self, location: &str, reachable: bool) -> CascadeResult<()> {
        self.inspect(location, |db| {
            db.reachable = reachable;
            Ok(())
        })
        .await
    }

    /// Makes the next `count` commits on `location` fail with a connection error.
    pub async fn fail_next_commits(&self, location: &str, count: u32) -> CascadeResult<()> {
        self.inspect(location, |db| {
            db.fail_commits = count;
            Ok(())
        })
        .await
    }

    pub async fn create_table(&self, location: &str, table: &str) -> CascadeResult<()> {
        self.inspect(location, |db| {
            db.data.entry(table.to_string()).or_default();
            Ok(())
        })
        .await
    }

    /// Sets the DDL of secondary objects a bulk load drops and re-creates.
    pub async fn set_table_objects(
        &self,
        location: &str,
        table: &str,
        ddl: &str,
    ) -> CascadeResult<()> {
        self.inspect(location, |db| {
            db.data_mut(table)?.objects = Some(ddl.to_string());
            Ok(())
        })
        .await
    }

    pub async fn table_objects(
        &self,
        location: &str,
        table: &str,
    ) -> CascadeResult<Option<String>> {
        self.inspect(location, |db| Ok(db.data_mut(table)?.objects.clone()))
            .await
    }

    pub async fn add_foreign_key(&self, location: &str, fkey: ForeignKey) -> CascadeResult<()> {
        self.inspect(location, |db| {
            db.fkeys.push(fkey);
            Ok(())
        })
        .await
    }

    pub async fn foreign_keys(&self, location: &str) -> CascadeResult<Vec<ForeignKey>> {
        self.inspect(location, |db| Ok(db.fkeys.clone())).await
    }

    pub async fn pending_foreign_keys(&self, location: &str) -> CascadeResult<Vec<ForeignKey>> {
        self.inspect(location, |db| Ok(db.pending_fkeys.clone()))
            .await
    }

    /// Applies a change to a source table of a root and queues its event in one transaction.
    /// Returns the transaction id.
    pub async fn source_change(
        &self,
        location: &str,
        queue: &str,
        table: &str,
        op: ChangeOp,
        pkey_columns: &[&str],
        row: RowMap,
    ) -> CascadeResult<i64> {
        self.with_db(location, |db| {
            if db.queue(queue)?.frozen {
                bail!(ErrorKind::QueryFailed, "Queue is frozen", queue);
            }

            let key: RowMap = pkey_columns
                .iter()
                .map(|column| (column.to_string(), row.get(*column).cloned().flatten()))
                .collect();
            let row_op = match op {
                ChangeOp::Insert if pkey_columns.is_empty() => RowOp::Insert { row: row.clone() },
                ChangeOp::Insert | ChangeOp::Update => RowOp::Upsert {
                    key_columns: pkey_columns.iter().map(|column| column.to_string()).collect(),
                    row: row.clone(),
                },
                ChangeOp::Delete => RowOp::Delete { key },
                ChangeOp::Truncate => RowOp::Truncate,
            };

            let mut next = db.clone();
            let txid = next.allocate_txid();
            next.apply_row_op(table, &row_op)?;
            next.insert_new_event(queue, &row_event(table, op, pkey_columns, &row), txid)?;
            *db = next;

            Ok(txid)
        })
        .await
    }

    /// Runs the ticker of a queue once. Returns the new tick.
    pub async fn tick(&self, location: &str, queue: &str) -> CascadeResult<i64> {
        self.with_db(location, |db| Ok(db.queue_mut(queue)?.tick()))
            .await
    }

    pub async fn last_tick(&self, location: &str, queue: &str) -> CascadeResult<i64> {
        self.inspect(location, |db| Ok(db.queue(queue)?.last_tick()))
            .await
    }

    /// Rows of a data table, sorted.
    pub async fn rows(&self, location: &str, table: &str) -> CascadeResult<Vec<RowMap>> {
        self.inspect(location, |db| {
            let mut rows = db.data_mut(table)?.rows.clone();
            rows.sort();
            Ok(rows)
        })
        .await
    }

    pub async fn queue_events(&self, location: &str, queue: &str) -> CascadeResult<Vec<Event>> {
        self.inspect(location, |db| Ok(db.queue(queue)?.events.values().cloned().collect()))
            .await
    }

    pub async fn subscriber_watermark(
        &self,
        location: &str,
        queue: &str,
        node: &str,
    ) -> CascadeResult<Option<i64>> {
        self.inspect(location, |db| {
            Ok(db
                .subscribers
                .get(queue)
                .and_then(|subscribers| subscribers.get(node))
                .map(|subscriber| subscriber.watermark))
        })
        .await
    }

    pub async fn set_node_attr(
        &self,
        location: &str,
        queue: &str,
        key: &str,
        value: &str,
    ) -> CascadeResult<()> {
        self.inspect(location, |db| {
            db.node_mut(queue)?.attrs.insert(key, value);
            Ok(())
        })
        .await
    }

    pub async fn table_phase(
        &self,
        location: &str,
        queue: &str,
        table: &str,
    ) -> CascadeResult<Option<TablePhase>> {
        self.inspect(location, |db| {
            Ok(db
                .tables
                .get(queue)
                .and_then(|tables| tables.get(table))
                .filter(|record| record.local)
                .map(|record| record.phase))
        })
        .await
    }

    /// Node row as seen by the node itself, ignoring reachability.
    pub async fn node_info(&self, location: &str, queue: &str) -> CascadeResult<NodeInfo> {
        self.inspect(location, |db| db.node_info(queue)).await
    }

    pub async fn consumer_state(
        &self,
        location: &str,
        queue: &str,
        consumer: &str,
    ) -> CascadeResult<Option<ConsumerState>> {
        self.inspect(location, |db| Ok(db.consumer_state(queue, consumer)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_db() -> Database {
        let mut db = Database::new("root");
        db.create_node(&NewNode {
            queue: "q".to_string(),
            node_type: NodeType::Root,
            node_name: "root".to_string(),
            worker_name: "root_worker".to_string(),
            provider_node: None,
            global_watermark: None,
            combined_queue: None,
        })
        .unwrap();
        db.register_consumer("q", "c", None).unwrap();
        db
    }

    #[test]
    fn test_open_batch_is_handed_out_again_until_finished() {
        let mut db = root_db();
        db.insert_autonomous_event("q", &NewEvent::new("custom", None)).unwrap();
        let tick = db.force_tick("q").unwrap();

        let first = db.next_batch("q", "c", true).unwrap().unwrap();
        let again = db.next_batch("q", "c", true).unwrap().unwrap();
        assert_eq!(first, again);
        assert_eq!(first.cur_tick_id, tick);
        assert_eq!(db.batch_events(first.batch_id).unwrap().len(), 1);

        db.finish_batch(first.batch_id).unwrap();
        db.finish_batch(first.batch_id).unwrap();
        assert!(db.next_batch("q", "c", true).unwrap().is_none());
    }

    #[test]
    fn test_single_tick_batches_follow_every_tick() {
        let mut db = root_db();
        db.force_tick("q").unwrap();
        let last = db.force_tick("q").unwrap();

        let single = db.next_batch("q", "c", true).unwrap().unwrap();
        assert_eq!(single.cur_tick_id, single.prev_tick_id + 1);
        db.register_consumer("q", "c", Some(single.prev_tick_id)).unwrap();

        let merged = db.next_batch("q", "c", false).unwrap().unwrap();
        assert_eq!(merged.cur_tick_id, last);
    }

    #[test]
    fn test_subscriber_watermark_is_stored_as_given() {
        let mut db = root_db();
        db.force_tick("q").unwrap();
        db.force_tick("q").unwrap();
        db.register_subscriber("q", "branch", "branch_worker", Some(1))
            .unwrap();

        db.set_subscriber_watermark("q", "branch", 3).unwrap();
        assert_eq!(db.subscribers["q"]["branch"].watermark, 3);

        db.set_subscriber_watermark("q", "branch", 2).unwrap();
        assert_eq!(db.subscribers["q"]["branch"].watermark, 2);

        let err = db.set_subscriber_watermark("q", "leaf", 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeCommandFailed);
    }

    #[test]
    fn test_commit_replay_assigns_event_ids_in_order() {
        let mut db = root_db();
        let op = TxOp::InsertEvent {
            queue: "q".to_string(),
            event: NewEvent::new("custom", None),
        };
        db.apply(&op, 7).unwrap();
        db.apply(&op, 7).unwrap();

        let ids: Vec<i64> = db.queue("q").unwrap().events.keys().copied().collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_pending_fkeys_wait_for_both_tables() {
        let mut db = root_db();
        db.data.insert("a".to_string(), DataTable::default());
        db.data.insert("b".to_string(), DataTable::default());
        db.fkeys.push(ForeignKey::new("a_b_fkey", "a", "b"));
        db.tables.entry("q".to_string()).or_default().insert(
            "b".to_string(),
            TableRecord {
                local: true,
                phase: TablePhase::InCopy,
                ..TableRecord::global("b")
            },
        );

        let dropped = db.apply(&TxOp::DropFkeys { table: "b".to_string() }, 1).unwrap();
        assert_eq!(dropped, OpOutput::Count(1));

        let restore = TxOp::RestorePendingFkeys { queue: "q".to_string() };
        assert_eq!(db.apply(&restore, 1).unwrap(), OpOutput::Count(0));

        db.table_mut("q", "b").unwrap().phase = TablePhase::Ok;
        assert_eq!(db.apply(&restore, 1).unwrap(), OpOutput::Count(1));
        assert_eq!(db.fkeys.len(), 1);
    }
}
