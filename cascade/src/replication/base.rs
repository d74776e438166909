use std::future::Future;

use crate::error::CascadeResult;
use crate::node::base::CascadeNode;
use crate::replication::sync::SyncStep;
use crate::store::base::TargetStore;
use crate::types::{BatchInfo, BatchThresholds, ControlEvent, Event, RowChange};

/// Business-event side of a worker.
///
/// The worker loop owns batch acquisition and the cascade duties of the node; everything that
/// concerns replicated tables happens behind this trait, inside the batch transaction handed in
/// as `tx`.
pub trait TableApplier<N: CascadeNode>: Send {
    /// Thresholds to use for the next fetch instead of the configured ones.
    fn batch_thresholds(&self) -> Option<BatchThresholds>;

    /// Called when a poll found no batch.
    fn note_idle(&mut self);

    /// Runs table synchronization for `batch`, fetched from `provider` with `thresholds`.
    fn prepare_batch(
        &mut self,
        batch: &BatchInfo,
        provider: &N,
        thresholds: &BatchThresholds,
    ) -> impl Future<Output = CascadeResult<SyncStep>> + Send;

    /// Applies a row change. Returns `false` when the event was filtered out.
    fn apply_row(
        &mut self,
        tx: &mut <N as TargetStore>::Tx,
        event: &Event,
        change: &RowChange,
    ) -> impl Future<Output = CascadeResult<bool>> + Send;

    /// Handles a table-layer control event.
    fn apply_control(
        &mut self,
        tx: &mut <N as TargetStore>::Tx,
        control: &ControlEvent,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Writes everything still buffered for the batch.
    fn finish_batch(
        &mut self,
        tx: &mut <N as TargetStore>::Tx,
        batch: &BatchInfo,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Called once the batch transaction committed.
    fn after_commit(&mut self);
}
