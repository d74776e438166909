use std::time::Duration;

use cascade_postgres::pgq;
use cascade_postgres::pgq::NewEventRow;
use sqlx::{Postgres, Transaction};
use tracing::debug;

use crate::error::CascadeResult;
use crate::node::postgres::PgNode;
use crate::queue::base::{BatchSource, EventStream};
use crate::types::{BatchInfo, BatchThresholds, Event, FetchMode, NewEvent};

/// Event stream over a batch of a Postgres queue.
#[derive(Debug)]
pub enum PgEventStream {
    /// All events were loaded with a single query.
    Eager(Option<Vec<Event>>),
    /// Events are read from a server-side cursor living in `tx`.
    Cursor {
        tx: Option<Transaction<'static, Postgres>>,
        cursor_name: String,
        fetch_size: u32,
        first_chunk: Option<Vec<Event>>,
    },
}

impl EventStream for PgEventStream {
    async fn next_chunk(&mut self) -> CascadeResult<Option<Vec<Event>>> {
        match self {
            PgEventStream::Eager(events) => Ok(events.take()),
            PgEventStream::Cursor {
                tx,
                cursor_name,
                fetch_size,
                first_chunk,
            } => {
                if let Some(chunk) = first_chunk.take()
                    && !chunk.is_empty()
                {
                    return Ok(Some(chunk));
                }

                let Some(conn) = tx.as_mut() else {
                    return Ok(None);
                };

                let rows = pgq::fetch_batch_cursor(conn, cursor_name, *fetch_size).await?;
                if !rows.is_empty() {
                    return Ok(Some(rows.into_iter().map(Event::from).collect()));
                }

                if let Some(mut conn) = tx.take() {
                    pgq::close_batch_cursor(&mut conn, cursor_name).await?;
                    conn.commit().await?;
                }

                Ok(None)
            }
        }
    }
}

impl BatchSource for PgNode {
    type Events = PgEventStream;

    async fn next_batch(
        &self,
        queue: &str,
        consumer: &str,
        thresholds: &BatchThresholds,
    ) -> CascadeResult<Option<BatchInfo>> {
        let row = pgq::next_batch_custom(
            self.pool(),
            queue,
            consumer,
            thresholds.min_lag.map(|lag| lag.as_millis() as u64),
            thresholds.min_count,
            thresholds.min_interval.map(|interval| interval.as_millis() as u64),
        )
        .await?;

        row.map(BatchInfo::try_from).transpose()
    }

    async fn load_events(
        &self,
        batch: &BatchInfo,
        mode: FetchMode,
    ) -> CascadeResult<PgEventStream> {
        match mode {
            FetchMode::Eager => {
                let rows = pgq::get_batch_events(self.pool(), batch.batch_id).await?;
                let events = rows.into_iter().map(Event::from).collect();

                Ok(PgEventStream::Eager(Some(events)))
            }
            FetchMode::Cursor { fetch_size } => {
                let cursor_name = format!("batch_walker_{}", batch.batch_id);
                let mut tx = self.pool().begin().await?;
                let rows =
                    pgq::open_batch_cursor(&mut tx, batch.batch_id, &cursor_name, fetch_size)
                        .await?;
                debug!(batch_id = batch.batch_id, fetch_size, "opened batch cursor");

                Ok(PgEventStream::Cursor {
                    tx: Some(tx),
                    cursor_name,
                    fetch_size,
                    first_chunk: Some(rows.into_iter().map(Event::from).collect()),
                })
            }
        }
    }

    async fn finish_batch(&self, batch_id: i64) -> CascadeResult<()> {
        pgq::finish_batch(self.pool(), batch_id).await?;

        Ok(())
    }

    async fn retry_event(
        &self,
        batch_id: i64,
        event_id: i64,
        delay: Duration,
    ) -> CascadeResult<()> {
        let seconds = i32::try_from(delay.as_secs()).unwrap_or(i32::MAX);
        pgq::event_retry(self.pool(), batch_id, event_id, seconds).await?;

        Ok(())
    }

    async fn register_consumer(
        &self,
        queue: &str,
        consumer: &str,
        tick_id: Option<i64>,
    ) -> CascadeResult<()> {
        pgq::register_consumer(self.pool(), queue, consumer, tick_id).await?;

        Ok(())
    }

    async fn unregister_consumer(&self, queue: &str, consumer: &str) -> CascadeResult<()> {
        pgq::unregister_consumer(self.pool(), queue, consumer).await?;

        Ok(())
    }

    async fn get_consumer_tick(&self, queue: &str, consumer: &str) -> CascadeResult<Option<i64>> {
        let info = pgq::get_consumer_info(self.pool(), queue, consumer).await?;

        Ok(info.and_then(|info| info.last_tick))
    }

    async fn force_tick(&self, queue: &str) -> CascadeResult<Option<i64>> {
        let tick_id = pgq::force_tick(self.pool(), queue).await?;

        Ok(tick_id)
    }

    async fn insert_event(&self, queue: &str, event: &NewEvent) -> CascadeResult<()> {
        pgq::insert_event(self.pool(), queue, &NewEventRow::from(event)).await?;

        Ok(())
    }

    async fn delete_batch_events(&self, queue: &str, batch_id: i64) -> CascadeResult<u64> {
        let mut tx = self.pool().begin().await?;
        let deleted = pgq::delete_batch_events(&mut tx, queue, batch_id).await?;
        tx.commit().await?;

        Ok(deleted)
    }

    async fn drop_ticks_after(&self, queue: &str, tick_id: i64) -> CascadeResult<u64> {
        let dropped = pgq::drop_ticks_after(self.pool(), queue, tick_id).await?;

        Ok(dropped)
    }
}
