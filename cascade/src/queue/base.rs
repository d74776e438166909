use std::future::Future;
use std::time::Duration;

use crate::error::CascadeResult;
use crate::types::{BatchInfo, BatchThresholds, Event, FetchMode, NewEvent};

/// Events of one batch, read in chunks.
///
/// A stream can only be consumed once; a batch that has to be re-read is loaded again.
pub trait EventStream: Send {
    /// Returns the next chunk of events in ascending id order, `None` once drained.
    fn next_chunk(&mut self) -> impl Future<Output = CascadeResult<Option<Vec<Event>>>> + Send;
}

/// Batch-level access to the queue storage of a node.
pub trait BatchSource {
    type Events: EventStream;

    /// Allocates the next batch of `consumer`, `None` when no batch is ready.
    fn next_batch(
        &self,
        queue: &str,
        consumer: &str,
        thresholds: &BatchThresholds,
    ) -> impl Future<Output = CascadeResult<Option<BatchInfo>>> + Send;

    /// Opens the event stream of a batch, eagerly loaded or through a server-side cursor.
    fn load_events(
        &self,
        batch: &BatchInfo,
        mode: FetchMode,
    ) -> impl Future<Output = CascadeResult<Self::Events>> + Send;

    /// Closes a batch. Calling it again for a closed batch is harmless.
    fn finish_batch(&self, batch_id: i64) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Puts an event back into the queue to be delivered again after `delay`.
    fn retry_event(
        &self,
        batch_id: i64,
        event_id: i64,
        delay: Duration,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Registers a queue consumer, optionally positioned at an explicit tick.
    fn register_consumer(
        &self,
        queue: &str,
        consumer: &str,
        tick_id: Option<i64>,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn unregister_consumer(
        &self,
        queue: &str,
        consumer: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Last tick finished by a queue consumer, `None` when it is not registered.
    fn get_consumer_tick(
        &self,
        queue: &str,
        consumer: &str,
    ) -> impl Future<Output = CascadeResult<Option<i64>>> + Send;

    /// Requests an immediate tick from the ticker.
    fn force_tick(&self, queue: &str) -> impl Future<Output = CascadeResult<Option<i64>>> + Send;

    /// Inserts a single event in its own transaction.
    fn insert_event(
        &self,
        queue: &str,
        event: &NewEvent,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Deletes the events of an open batch from the queue tables. Returns the deleted count.
    fn delete_batch_events(
        &self,
        queue: &str,
        batch_id: i64,
    ) -> impl Future<Output = CascadeResult<u64>> + Send;

    /// Removes all ticks after `tick_id`. Returns the removed count.
    fn drop_ticks_after(
        &self,
        queue: &str,
        tick_id: i64,
    ) -> impl Future<Output = CascadeResult<u64>> + Send;
}
