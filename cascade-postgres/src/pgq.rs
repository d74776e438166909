//! Wrappers for the queue storage functions in the `pgq` schema.

use chrono::{DateTime, Utc};
use pg_escape::quote_identifier;
use sqlx::postgres::types::PgInterval;
use sqlx::{FromRow, PgConnection, PgExecutor};

/// A batch allocated by `pgq.next_batch_custom`.
#[derive(Debug, Clone, FromRow)]
pub struct BatchRow {
    pub batch_id: Option<i64>,
    pub cur_tick_id: Option<i64>,
    pub prev_tick_id: Option<i64>,
    pub cur_tick_time: Option<DateTime<Utc>>,
    pub prev_tick_time: Option<DateTime<Utc>>,
    pub cur_tick_event_seq: Option<i64>,
    pub prev_tick_event_seq: Option<i64>,
}

/// One queue event as returned by `pgq.get_batch_events` and the cursor variant.
#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub ev_id: i64,
    pub ev_time: DateTime<Utc>,
    pub ev_txid: i64,
    pub ev_retry: Option<i32>,
    pub ev_type: Option<String>,
    pub ev_data: Option<String>,
    pub ev_extra1: Option<String>,
    pub ev_extra2: Option<String>,
    pub ev_extra3: Option<String>,
    pub ev_extra4: Option<String>,
}

/// Event to be written into a queue by bulk insert.
#[derive(Debug, Clone)]
pub struct NewEventRow {
    pub ev_id: Option<i64>,
    pub ev_time: DateTime<Utc>,
    pub ev_type: String,
    pub ev_data: Option<String>,
    pub ev_extra1: Option<String>,
    pub ev_extra2: Option<String>,
    pub ev_extra3: Option<String>,
    pub ev_extra4: Option<String>,
}

/// Consumer position as returned by `pgq.get_consumer_info`.
#[derive(Debug, Clone, FromRow)]
pub struct ConsumerInfoRow {
    pub queue_name: String,
    pub consumer_name: String,
    pub last_tick: Option<i64>,
    pub current_batch: Option<i64>,
    pub pending_events: Option<i64>,
}

fn millis_to_interval(millis: Option<u64>) -> Option<PgInterval> {
    millis.map(|millis| PgInterval {
        months: 0,
        days: 0,
        microseconds: (millis as i64).saturating_mul(1000),
    })
}

/// Allocates the next batch for `consumer`, honoring the lag/count/interval thresholds.
///
/// Returns `None` when no batch is ready yet.
pub async fn next_batch_custom<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
    min_lag_ms: Option<u64>,
    min_count: Option<u32>,
    min_interval_ms: Option<u64>,
) -> sqlx::Result<Option<BatchRow>>
where
    E: PgExecutor<'c>,
{
    let row = sqlx::query_as::<_, BatchRow>(
        r#"
        select batch_id, cur_tick_id, prev_tick_id, cur_tick_time, prev_tick_time,
               cur_tick_event_seq, prev_tick_event_seq
        from pgq.next_batch_custom($1, $2, $3, $4, $5)
        "#,
    )
    .bind(queue)
    .bind(consumer)
    .bind(millis_to_interval(min_lag_ms))
    .bind(min_count.map(|count| count as i32))
    .bind(millis_to_interval(min_interval_ms))
    .fetch_one(executor)
    .await?;

    Ok(row.batch_id.map(|_| row))
}

/// Loads all events of a batch in one round trip.
pub async fn get_batch_events<'c, E>(executor: E, batch_id: i64) -> sqlx::Result<Vec<EventRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, EventRow>(
        r#"
        select ev_id, ev_time, ev_txid, ev_retry, ev_type, ev_data,
               ev_extra1, ev_extra2, ev_extra3, ev_extra4
        from pgq.get_batch_events($1)
        "#,
    )
    .bind(batch_id)
    .fetch_all(executor)
    .await
}

/// Opens a server-side cursor over the batch events and returns the first `quick_limit` rows.
///
/// Must run inside a transaction; the remaining rows are read with [`fetch_batch_cursor`].
pub async fn open_batch_cursor(
    conn: &mut PgConnection,
    batch_id: i64,
    cursor_name: &str,
    quick_limit: u32,
) -> sqlx::Result<Vec<EventRow>> {
    sqlx::query_as::<_, EventRow>(
        r#"
        select ev_id, ev_time, ev_txid, ev_retry, ev_type, ev_data,
               ev_extra1, ev_extra2, ev_extra3, ev_extra4
        from pgq.get_batch_cursor($1, $2, $3, null)
        "#,
    )
    .bind(batch_id)
    .bind(cursor_name)
    .bind(quick_limit as i32)
    .fetch_all(conn)
    .await
}

/// Fetches the next chunk from a cursor opened with [`open_batch_cursor`].
pub async fn fetch_batch_cursor(
    conn: &mut PgConnection,
    cursor_name: &str,
    fetch_size: u32,
) -> sqlx::Result<Vec<EventRow>> {
    let query = format!("fetch {fetch_size} from {}", quote_identifier(cursor_name));
    sqlx::query_as::<_, EventRow>(&query).fetch_all(conn).await
}

/// Closes a cursor opened with [`open_batch_cursor`].
pub async fn close_batch_cursor(conn: &mut PgConnection, cursor_name: &str) -> sqlx::Result<()> {
    let query = format!("close {}", quote_identifier(cursor_name));
    sqlx::query(&query).execute(conn).await?;
    Ok(())
}

/// Marks the batch as finished; calling it twice is harmless.
pub async fn finish_batch<'c, E>(executor: E, batch_id: i64) -> sqlx::Result<i32>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar::<_, i32>("select pgq.finish_batch($1)")
        .bind(batch_id)
        .fetch_one(executor)
        .await
}

/// Schedules a single event of a batch for redelivery after `retry_seconds`.
pub async fn event_retry<'c, E>(
    executor: E,
    batch_id: i64,
    event_id: i64,
    retry_seconds: i32,
) -> sqlx::Result<i32>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar::<_, i32>("select pgq.event_retry($1, $2, $3)")
        .bind(batch_id)
        .bind(event_id)
        .bind(retry_seconds)
        .fetch_one(executor)
        .await
}

/// Registers a queue consumer, optionally at an explicit tick position.
pub async fn register_consumer<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
    tick_id: Option<i64>,
) -> sqlx::Result<i32>
where
    E: PgExecutor<'c>,
{
    match tick_id {
        Some(tick_id) => {
            sqlx::query_scalar::<_, i32>("select pgq.register_consumer_at($1, $2, $3)")
                .bind(queue)
                .bind(consumer)
                .bind(tick_id)
                .fetch_one(executor)
                .await
        }
        None => {
            sqlx::query_scalar::<_, i32>("select pgq.register_consumer($1, $2)")
                .bind(queue)
                .bind(consumer)
                .fetch_one(executor)
                .await
        }
    }
}

/// Removes a queue consumer together with its pending retry events.
pub async fn unregister_consumer<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
) -> sqlx::Result<i32>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar::<_, i32>("select pgq.unregister_consumer($1, $2)")
        .bind(queue)
        .bind(consumer)
        .fetch_one(executor)
        .await
}

/// Asks the ticker to create a tick as soon as possible.
pub async fn force_tick<'c, E>(executor: E, queue: &str) -> sqlx::Result<Option<i64>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar::<_, Option<i64>>("select pgq.force_tick($1)")
        .bind(queue)
        .fetch_one(executor)
        .await
}

/// Inserts one event into a queue.
pub async fn insert_event<'c, E>(executor: E, queue: &str, event: &NewEventRow) -> sqlx::Result<i64>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar::<_, i64>("select pgq.insert_event($1, $2, $3, $4, $5, $6, $7)")
        .bind(queue)
        .bind(&event.ev_type)
        .bind(&event.ev_data)
        .bind(&event.ev_extra1)
        .bind(&event.ev_extra2)
        .bind(&event.ev_extra3)
        .bind(&event.ev_extra4)
        .fetch_one(executor)
        .await
}

/// Bulk inserts events into the current event table of `queue`, preserving order.
///
/// When `keep_ids` is set the upstream event ids are kept, which branch nodes need so that the
/// local tick's event sequence lines up with the upstream one.
pub async fn bulk_insert_events(
    conn: &mut PgConnection,
    queue: &str,
    events: &[NewEventRow],
    keep_ids: bool,
) -> sqlx::Result<()> {
    if events.is_empty() {
        return Ok(());
    }

    let table: String = sqlx::query_scalar("select pgq.current_event_table($1)")
        .bind(queue)
        .fetch_one(&mut *conn)
        .await?;

    let mut ids = Vec::with_capacity(events.len());
    let mut times = Vec::with_capacity(events.len());
    let mut types = Vec::with_capacity(events.len());
    let mut data = Vec::with_capacity(events.len());
    let mut extra1 = Vec::with_capacity(events.len());
    let mut extra2 = Vec::with_capacity(events.len());
    let mut extra3 = Vec::with_capacity(events.len());
    let mut extra4 = Vec::with_capacity(events.len());
    for event in events {
        ids.push(event.ev_id);
        times.push(event.ev_time);
        types.push(event.ev_type.clone());
        data.push(event.ev_data.clone());
        extra1.push(event.ev_extra1.clone());
        extra2.push(event.ev_extra2.clone());
        extra3.push(event.ev_extra3.clone());
        extra4.push(event.ev_extra4.clone());
    }

    // The event table name comes from pgq itself and is already schema qualified.
    let query = if keep_ids {
        format!(
            "insert into {table} (ev_id, ev_time, ev_type, ev_data, ev_extra1, ev_extra2, ev_extra3, ev_extra4) \
             select * from unnest($1::int8[], $2::timestamptz[], $3::text[], $4::text[], $5::text[], $6::text[], $7::text[], $8::text[])"
        )
    } else {
        format!(
            "insert into {table} (ev_time, ev_type, ev_data, ev_extra1, ev_extra2, ev_extra3, ev_extra4) \
             select t, ty, d, e1, e2, e3, e4 from unnest($1::int8[], $2::timestamptz[], $3::text[], $4::text[], $5::text[], $6::text[], $7::text[], $8::text[]) \
             as u(i, t, ty, d, e1, e2, e3, e4)"
        )
    };

    sqlx::query(&query)
        .bind(ids)
        .bind(times)
        .bind(types)
        .bind(data)
        .bind(extra1)
        .bind(extra2)
        .bind(extra3)
        .bind(extra4)
        .execute(conn)
        .await?;

    Ok(())
}

/// Creates a tick with an explicit id, time and event sequence.
///
/// Used by branch nodes to stamp their own queue with the boundary of the upstream batch they
/// just applied.
pub async fn ticker<'c, E>(
    executor: E,
    queue: &str,
    tick_id: i64,
    tick_time: DateTime<Utc>,
    event_seq: i64,
) -> sqlx::Result<i64>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar::<_, i64>("select pgq.ticker($1, $2, $3, $4)")
        .bind(queue)
        .bind(tick_id)
        .bind(tick_time)
        .bind(event_seq)
        .fetch_one(executor)
        .await
}

/// Returns the queue position of a consumer, if registered.
pub async fn get_consumer_info<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
) -> sqlx::Result<Option<ConsumerInfoRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, ConsumerInfoRow>(
        r#"
        select queue_name, consumer_name, last_tick, current_batch, pending_events
        from pgq.get_consumer_info($1, $2)
        "#,
    )
    .bind(queue)
    .bind(consumer)
    .fetch_optional(executor)
    .await
}

/// Deletes exactly the events belonging to a batch.
///
/// The row selection comes from `pgq.batch_event_sql`, which bounds the events by the txid
/// snapshots of the two ticks. Events of transactions that were still running at either tick
/// are therefore never touched.
pub async fn delete_batch_events(
    conn: &mut PgConnection,
    queue: &str,
    batch_id: i64,
) -> sqlx::Result<u64> {
    let batch_sql: String = sqlx::query_scalar("select pgq.batch_event_sql($1)")
        .bind(batch_id)
        .fetch_one(&mut *conn)
        .await?;
    let data_table: String =
        sqlx::query_scalar("select queue_data_pfx from pgq.queue where queue_name = $1")
            .bind(queue)
            .fetch_one(&mut *conn)
            .await?;

    let query = format!(
        "delete from only {data_table} d using ({batch_sql}) b where d.ev_id = b.ev_id and d.ev_txid = b.ev_txid"
    );
    let mut deleted = sqlx::query(&query).execute(&mut *conn).await?.rows_affected();

    // Events live in the rotating child tables, the parent normally stays empty.
    let children: Vec<String> = sqlx::query_scalar(
        "select c.oid::regclass::text from pg_inherits i join pg_class c on c.oid = i.inhrelid \
         where i.inhparent = $1::regclass",
    )
    .bind(&data_table)
    .fetch_all(&mut *conn)
    .await?;
    for child in children {
        let query = format!(
            "delete from {child} d using ({batch_sql}) b where d.ev_id = b.ev_id and d.ev_txid = b.ev_txid"
        );
        deleted += sqlx::query(&query).execute(&mut *conn).await?.rows_affected();
    }

    Ok(deleted)
}

/// Removes ticks above `tick_id` so that the queue can be re-stamped from a new provider.
pub async fn drop_ticks_after<'c, E>(executor: E, queue: &str, tick_id: i64) -> sqlx::Result<u64>
where
    E: PgExecutor<'c>,
{
    let result = sqlx::query(
        r#"
        delete from pgq.tick
        where tick_queue = (select queue_id from pgq.queue where queue_name = $1)
          and tick_id > $2
        "#,
    )
    .bind(queue)
    .bind(tick_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
