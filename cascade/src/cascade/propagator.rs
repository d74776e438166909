//! Per-batch cascade duties: control events, re-publishing and local ticks.

use tracing::{debug, info};

use crate::bail;
use crate::cascade::worker_state::WorkerState;
use crate::error::{CascadeResult, ErrorKind};
use crate::node::base::CascadeNode;
use crate::replication::base::TableApplier;
use crate::store::base::{TargetStore, TargetTx};
use crate::types::{BatchInfo, ControlEvent, Event, EventKind, NewEvent, NodeLocation};

const PGQ_EVENT_PREFIX: &str = "pgq.";

/// Where a batch stands relative to the consumer's completed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchProgress {
    /// The batch continues exactly where the consumer stopped.
    Pending,
    /// The batch was applied and committed before, only closing it is left.
    AlreadyApplied,
}

/// Compares a batch to the consumer's completed tick.
///
/// Any other position than the two known ones means the consumer and its provider disagree
/// about history, which no retry can fix.
pub fn is_batch_done(batch: &BatchInfo, completed_tick: i64) -> CascadeResult<BatchProgress> {
    if batch.prev_tick_id == completed_tick {
        return Ok(BatchProgress::Pending);
    }
    if batch.cur_tick_id == completed_tick {
        return Ok(BatchProgress::AlreadyApplied);
    }

    bail!(
        ErrorKind::LostPosition,
        "Consumer position does not match the batch",
        format!(
            "batch {} covers ticks {}..{} but the completed tick is {completed_tick}",
            batch.batch_id, batch.prev_tick_id, batch.cur_tick_id
        )
    )
}

/// Event counts of one batch, by what happened to them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub applied: u64,
    pub filtered: u64,
    pub republished: u64,
}

/// Routes the events of one batch according to the worker state.
///
/// Created per batch; everything it writes goes through the batch transaction.
#[derive(Debug)]
pub struct BatchPropagator<'a> {
    queue: &'a str,
    state: &'a WorkerState,
    max_event_buffer: usize,
    /// Global watermark of the node, raised by broadcasts applied in this batch.
    global_watermark: i64,
    buffer: Vec<Event>,
    max_event_id: Option<i64>,
    upstream_global_watermark: Option<i64>,
    stats: BatchStats,
}

impl<'a> BatchPropagator<'a> {
    pub fn new(
        queue: &'a str,
        state: &'a WorkerState,
        max_event_buffer: usize,
        global_watermark: i64,
    ) -> Self {
        BatchPropagator {
            queue,
            state,
            max_event_buffer,
            global_watermark,
            buffer: Vec::new(),
            max_event_id: None,
            upstream_global_watermark: None,
            stats: BatchStats::default(),
        }
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    /// Last global watermark broadcast from upstream, seen by a node that merges watermarks
    /// with its peers instead of applying them.
    pub fn upstream_global_watermark(&self) -> Option<i64> {
        self.upstream_global_watermark
    }

    /// Processes one event: control handling, business apply and re-publishing.
    pub async fn route<N, A>(
        &mut self,
        tx: &mut <N as TargetStore>::Tx,
        applier: &mut A,
        event: &Event,
    ) -> CascadeResult<()>
    where
        N: CascadeNode,
        A: TableApplier<N>,
    {
        if event.retry.is_some() {
            bail!(
                ErrorKind::RetryEventInCascade,
                "Retried event found in a cascaded queue",
                format!("event {} of type {}", event.id, event.ev_type)
            );
        }

        self.max_event_id = Some(self.max_event_id.map_or(event.id, |max| max.max(event.id)));

        match event.kind()? {
            EventKind::Control(control) if control.is_table_layer() => {
                if self.state.process_events {
                    applier.apply_control(tx, &control).await?;
                }
            }
            EventKind::Control(control) => {
                if self.state.handle_control {
                    self.apply_cascade_control::<N>(tx, &control).await?;
                }
            }
            EventKind::Row(change) => {
                if self.state.process_events {
                    if applier.apply_row(tx, event, &change).await? {
                        self.stats.applied += 1;
                    } else {
                        self.stats.filtered += 1;
                    }
                }
            }
            EventKind::Custom => {}
        }

        let filtered = self.state.filtered_copy && event.ev_type.starts_with(PGQ_EVENT_PREFIX);
        if self.state.copy_events && !filtered {
            self.buffer.push(event.clone());
            self.stats.republished += 1;
            if self.buffer.len() >= self.max_event_buffer {
                self.flush::<N>(tx).await?;
            }
        }

        Ok(())
    }

    async fn apply_cascade_control<N: CascadeNode>(
        &mut self,
        tx: &mut <N as TargetStore>::Tx,
        control: &ControlEvent,
    ) -> CascadeResult<()> {
        match control {
            ControlEvent::LocationInfo {
                node_name,
                location,
                dead,
            } => {
                debug!(node = %node_name, dead, "registering node location");
                let location = NodeLocation {
                    node_name: node_name.clone(),
                    location: location.clone(),
                    dead: *dead,
                };
                tx.register_location(self.queue, &location).await?;
            }
            ControlEvent::UnregisterLocation { node_name } => {
                debug!(node = %node_name, "unregistering node location");
                tx.unregister_location(self.queue, node_name).await?;
            }
            ControlEvent::GlobalWatermark { tick_id } => {
                if self.state.sync_watermark {
                    debug!(tick_id, "remembering upstream global watermark for peer merge");
                    self.upstream_global_watermark = Some(*tick_id);
                } else if self.state.process_global_wm && *tick_id > self.global_watermark {
                    tx.set_global_watermark(self.queue, *tick_id).await?;
                    self.global_watermark = *tick_id;
                }
            }
            ControlEvent::TickId { source_queue, tick_id } => {
                if self.state.process_tick_event {
                    tx.set_partition_watermark(self.queue, source_queue, *tick_id)
                        .await?;
                }
            }
            ControlEvent::AddTable { .. } | ControlEvent::RemoveTable { .. } => {}
        }

        Ok(())
    }

    async fn flush<N: CascadeNode>(
        &mut self,
        tx: &mut <N as TargetStore>::Tx,
    ) -> CascadeResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let Some(target_queue) = self.state.target_queue.as_deref() else {
            self.buffer.clear();
            return Ok(());
        };

        tx.insert_events(target_queue, &self.buffer, self.state.keep_event_ids)
            .await?;
        self.buffer.clear();

        Ok(())
    }

    /// Flushes re-published events and stamps the target queue with the batch position.
    ///
    /// Returns `true` when a local tick was created.
    pub async fn finish<N: CascadeNode>(
        &mut self,
        tx: &mut <N as TargetStore>::Tx,
        batch: &BatchInfo,
    ) -> CascadeResult<bool> {
        self.flush::<N>(tx).await?;

        let Some(target_queue) = self.state.target_queue.as_deref() else {
            return Ok(false);
        };

        if self.state.send_tick_event {
            tx.insert_event(target_queue, &NewEvent::tick_id(self.queue, batch.cur_tick_id))
                .await?;
        }

        if self.state.create_tick {
            let event_seq = self
                .max_event_id
                .map_or(batch.cur_tick_event_seq, |max| max.max(batch.cur_tick_event_seq));
            tx.create_tick(target_queue, batch.cur_tick_id, batch.cur_tick_time, event_seq)
                .await?;
            info!(tick_id = batch.cur_tick_id, event_seq, "created local tick");
            return Ok(true);
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn batch(prev: i64, cur: i64) -> BatchInfo {
        BatchInfo {
            batch_id: 7,
            cur_tick_id: cur,
            prev_tick_id: prev,
            cur_tick_time: Utc::now(),
            prev_tick_time: Utc::now(),
            cur_tick_event_seq: 100,
            prev_tick_event_seq: 50,
        }
    }

    #[test]
    fn test_batch_after_completed_tick_is_pending() {
        assert_eq!(is_batch_done(&batch(4, 5), 4).unwrap(), BatchProgress::Pending);
    }

    #[test]
    fn test_batch_ending_at_completed_tick_was_applied() {
        assert_eq!(is_batch_done(&batch(4, 5), 5).unwrap(), BatchProgress::AlreadyApplied);
    }

    #[test]
    fn test_repeated_check_never_asks_to_reapply() {
        let batch = batch(4, 5);
        assert_eq!(is_batch_done(&batch, 5).unwrap(), BatchProgress::AlreadyApplied);
        assert_eq!(is_batch_done(&batch, 5).unwrap(), BatchProgress::AlreadyApplied);
    }

    #[test]
    fn test_other_positions_are_lost() {
        for completed in [3, 6, 0] {
            let err = is_batch_done(&batch(4, 5), completed).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::LostPosition);
        }
    }
}
