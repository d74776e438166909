//! Wrappers for the cascade node functions in the `pgq_node` schema.

use sqlx::{FromRow, PgExecutor};

use crate::error::{NodeCallError, ReturnStatus};

/// Node row as returned by `pgq_node.get_node_info`.
#[derive(Debug, Clone, FromRow)]
pub struct NodeInfoRow {
    pub ret_code: i32,
    pub ret_note: String,
    pub node_type: Option<String>,
    pub node_name: Option<String>,
    pub global_watermark: Option<i64>,
    pub local_watermark: Option<i64>,
    pub provider_node: Option<String>,
    pub provider_location: Option<String>,
    pub combined_queue: Option<String>,
    pub combined_type: Option<String>,
    pub worker_name: Option<String>,
    pub worker_paused: Option<bool>,
    pub worker_uptodate: Option<bool>,
    pub worker_last_tick: Option<i64>,
    pub node_attrs: Option<String>,
}

/// Consumer row as returned by `pgq_node.get_consumer_state`.
#[derive(Debug, Clone, FromRow)]
pub struct ConsumerStateRow {
    pub ret_code: i32,
    pub ret_note: String,
    pub node_type: Option<String>,
    pub node_name: Option<String>,
    pub completed_tick: Option<i64>,
    pub provider_node: Option<String>,
    pub provider_location: Option<String>,
    pub paused: Option<bool>,
    pub uptodate: Option<bool>,
    pub cur_error: Option<String>,
}

/// Row of `pgq_node.get_queue_locations`.
#[derive(Debug, Clone, FromRow)]
pub struct LocationRow {
    pub node_name: String,
    pub node_location: String,
    pub dead: bool,
}

/// Row of `pgq_node.get_subscriber_info`.
#[derive(Debug, Clone, FromRow)]
pub struct SubscriberRow {
    pub node_name: String,
    pub worker_name: Option<String>,
    pub node_watermark: Option<i64>,
}

/// Status plus tick returned by `pgq_node.demote_root` and `pgq_node.register_subscriber`.
#[derive(Debug, Clone, FromRow)]
pub struct TickStatusRow {
    pub ret_code: i32,
    pub ret_note: String,
    pub tick_id: Option<i64>,
}

async fn call_status<'c, E>(
    executor: E,
    function: &'static str,
    query: &'static str,
    binds: StatusBinds<'_>,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let mut q = sqlx::query_as::<_, ReturnStatus>(query);
    for bind in binds.0 {
        q = match bind {
            Bind::Text(value) => q.bind(value),
            Bind::OptText(value) => q.bind(value),
            Bind::Int(value) => q.bind(value),
            Bind::OptInt(value) => q.bind(value),
            Bind::Bool(value) => q.bind(value),
        };
    }

    let status = q.fetch_optional(executor).await?;
    let status = status.ok_or(NodeCallError::NoRows { function })?;

    status.check(function)
}

enum Bind<'a> {
    Text(&'a str),
    OptText(Option<&'a str>),
    Int(i64),
    OptInt(Option<i64>),
    Bool(bool),
}

struct StatusBinds<'a>(Vec<Bind<'a>>);

/// Reads the node row of `queue` on this database.
pub async fn get_node_info<'c, E>(executor: E, queue: &str) -> Result<NodeInfoRow, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let row = sqlx::query_as::<_, NodeInfoRow>(
        r#"
        select ret_code, ret_note, node_type, node_name, global_watermark, local_watermark,
               provider_node, provider_location, combined_queue, combined_type,
               worker_name, worker_paused, worker_uptodate, worker_last_tick, node_attrs
        from pgq_node.get_node_info($1)
        "#,
    )
    .bind(queue)
    .fetch_optional(executor)
    .await?
    .ok_or(NodeCallError::NoRows {
        function: "pgq_node.get_node_info",
    })?;

    ReturnStatus {
        ret_code: row.ret_code,
        ret_note: row.ret_note.clone(),
    }
    .check("pgq_node.get_node_info")?;

    Ok(row)
}

/// Reads the state row of a local consumer.
///
/// Returns `None` when the consumer is not registered on this node.
pub async fn get_consumer_state<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
) -> Result<Option<ConsumerStateRow>, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let row = sqlx::query_as::<_, ConsumerStateRow>(
        r#"
        select ret_code, ret_note, node_type, node_name, completed_tick,
               provider_node, provider_location, paused, uptodate, cur_error
        from pgq_node.get_consumer_state($1, $2)
        "#,
    )
    .bind(queue)
    .bind(consumer)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(row) if row.ret_code == 404 => Ok(None),
        Some(row) => {
            ReturnStatus {
                ret_code: row.ret_code,
                ret_note: row.ret_note.clone(),
            }
            .check("pgq_node.get_consumer_state")?;
            Ok(Some(row))
        }
        None => Ok(None),
    }
}

/// Sets or clears the pause flag of a consumer; clears `uptodate` as a side effect.
pub async fn set_consumer_paused<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
    paused: bool,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.set_consumer_paused",
        "select ret_code, ret_note from pgq_node.set_consumer_paused($1, $2, $3)",
        StatusBinds(vec![Bind::Text(queue), Bind::Text(consumer), Bind::Bool(paused)]),
    )
    .await
}

/// Records that the worker observed its latest state change.
pub async fn set_consumer_uptodate<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
    uptodate: bool,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.set_consumer_uptodate",
        "select ret_code, ret_note from pgq_node.set_consumer_uptodate($1, $2, $3)",
        StatusBinds(vec![
            Bind::Text(queue),
            Bind::Text(consumer),
            Bind::Bool(uptodate),
        ]),
    )
    .await
}

/// Advances the completed tick of a consumer.
pub async fn set_consumer_completed<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
    tick_id: i64,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.set_consumer_completed",
        "select ret_code, ret_note from pgq_node.set_consumer_completed($1, $2, $3)",
        StatusBinds(vec![Bind::Text(queue), Bind::Text(consumer), Bind::Int(tick_id)]),
    )
    .await
}

/// Stores (or clears with `None`) the last error of a consumer.
pub async fn set_consumer_error<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
    error: Option<&str>,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.set_consumer_error",
        "select ret_code, ret_note from pgq_node.set_consumer_error($1, $2, $3)",
        StatusBinds(vec![
            Bind::Text(queue),
            Bind::Text(consumer),
            Bind::OptText(error),
        ]),
    )
    .await
}

/// Subscribes a downstream node to this node's queue, optionally at an explicit tick.
///
/// Returns the tick the subscription starts from.
pub async fn register_subscriber<'c, E>(
    executor: E,
    queue: &str,
    remote_node: &str,
    remote_worker: &str,
    tick_id: Option<i64>,
) -> Result<Option<i64>, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let row = sqlx::query_as::<_, TickStatusRow>(
        r#"
        select ret_code, ret_note, global_watermark as tick_id
        from pgq_node.register_subscriber($1, $2, $3, $4)
        "#,
    )
    .bind(queue)
    .bind(remote_node)
    .bind(remote_worker)
    .bind(tick_id)
    .fetch_one(executor)
    .await?;

    ReturnStatus {
        ret_code: row.ret_code,
        ret_note: row.ret_note,
    }
    .check("pgq_node.register_subscriber")?;

    Ok(row.tick_id)
}

/// Removes a downstream node subscription.
pub async fn unregister_subscriber<'c, E>(
    executor: E,
    queue: &str,
    remote_node: &str,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.unregister_subscriber",
        "select ret_code, ret_note from pgq_node.unregister_subscriber($1, $2)",
        StatusBinds(vec![Bind::Text(queue), Bind::Text(remote_node)]),
    )
    .await
}

/// Adds or updates a node location; `dead` marks a node as permanently unreachable.
pub async fn register_location<'c, E>(
    executor: E,
    queue: &str,
    node_name: &str,
    node_location: &str,
    dead: bool,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.register_location",
        "select ret_code, ret_note from pgq_node.register_location($1, $2, $3, $4)",
        StatusBinds(vec![
            Bind::Text(queue),
            Bind::Text(node_name),
            Bind::Text(node_location),
            Bind::Bool(dead),
        ]),
    )
    .await
}

/// Removes a node location.
pub async fn unregister_location<'c, E>(
    executor: E,
    queue: &str,
    node_name: &str,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.unregister_location",
        "select ret_code, ret_note from pgq_node.unregister_location($1, $2)",
        StatusBinds(vec![Bind::Text(queue), Bind::Text(node_name)]),
    )
    .await
}

/// Sets the global watermark of `queue`.
///
/// On a root node `None` lets the function compute the watermark from the subscriber
/// positions and emit a `pgq.global-watermark` event into the queue.
pub async fn set_global_watermark<'c, E>(
    executor: E,
    queue: &str,
    watermark: Option<i64>,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.set_global_watermark",
        "select ret_code, ret_note from pgq_node.set_global_watermark($1, $2)",
        StatusBinds(vec![Bind::Text(queue), Bind::OptInt(watermark)]),
    )
    .await
}

/// Records the position of a partition queue inside a combined queue.
pub async fn set_partition_watermark<'c, E>(
    executor: E,
    combined_queue: &str,
    part_queue: &str,
    watermark: i64,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.set_partition_watermark",
        "select ret_code, ret_note from pgq_node.set_partition_watermark($1, $2, $3)",
        StatusBinds(vec![
            Bind::Text(combined_queue),
            Bind::Text(part_queue),
            Bind::Int(watermark),
        ]),
    )
    .await
}

/// Records the local watermark reported by a subscriber.
pub async fn set_subscriber_watermark<'c, E>(
    executor: E,
    queue: &str,
    node_name: &str,
    watermark: i64,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.set_subscriber_watermark",
        "select ret_code, ret_note from pgq_node.set_subscriber_watermark($1, $2, $3)",
        StatusBinds(vec![
            Bind::Text(queue),
            Bind::Text(node_name),
            Bind::Int(watermark),
        ]),
    )
    .await
}

/// Lists the registered node locations of `queue`.
pub async fn get_queue_locations<'c, E>(
    executor: E,
    queue: &str,
) -> Result<Vec<LocationRow>, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let rows = sqlx::query_as::<_, LocationRow>(
        "select node_name, node_location, dead from pgq_node.get_queue_locations($1)",
    )
    .bind(queue)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// Lists the direct subscribers of this node.
pub async fn get_subscriber_info<'c, E>(
    executor: E,
    queue: &str,
) -> Result<Vec<SubscriberRow>, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let rows = sqlx::query_as::<_, SubscriberRow>(
        "select node_name, worker_name, node_watermark from pgq_node.get_subscriber_info($1)",
    )
    .bind(queue)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// Creates the node row for `queue` on this database.
#[allow(clippy::too_many_arguments)]
pub async fn create_node<'c, E>(
    executor: E,
    queue: &str,
    node_type: &str,
    node_name: &str,
    worker_name: &str,
    provider_node: Option<&str>,
    global_watermark: Option<i64>,
    combined_queue: Option<&str>,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.create_node",
        "select ret_code, ret_note from pgq_node.create_node($1, $2, $3, $4, $5, $6, $7)",
        StatusBinds(vec![
            Bind::Text(queue),
            Bind::Text(node_type),
            Bind::Text(node_name),
            Bind::Text(worker_name),
            Bind::OptText(provider_node),
            Bind::OptInt(global_watermark),
            Bind::OptText(combined_queue),
        ]),
    )
    .await
}

/// Drops the node row (and its queue, when dropping the local node).
pub async fn drop_node<'c, E>(
    executor: E,
    queue: &str,
    node_name: &str,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.drop_node",
        "select ret_code, ret_note from pgq_node.drop_node($1, $2)",
        StatusBinds(vec![Bind::Text(queue), Bind::Text(node_name)]),
    )
    .await
}

/// Registers a local consumer that reads from `provider_node`.
pub async fn register_consumer<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
    provider_node: &str,
    tick_id: i64,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.register_consumer",
        "select ret_code, ret_note from pgq_node.register_consumer($1, $2, $3, $4)",
        StatusBinds(vec![
            Bind::Text(queue),
            Bind::Text(consumer),
            Bind::Text(provider_node),
            Bind::Int(tick_id),
        ]),
    )
    .await
}

/// Removes a local consumer.
pub async fn unregister_consumer<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.unregister_consumer",
        "select ret_code, ret_note from pgq_node.unregister_consumer($1, $2)",
        StatusBinds(vec![Bind::Text(queue), Bind::Text(consumer)]),
    )
    .await
}

/// Points a local consumer at a different provider node.
pub async fn change_consumer_provider<'c, E>(
    executor: E,
    queue: &str,
    consumer: &str,
    provider_node: &str,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.change_consumer_provider",
        "select ret_code, ret_note from pgq_node.change_consumer_provider($1, $2, $3)",
        StatusBinds(vec![
            Bind::Text(queue),
            Bind::Text(consumer),
            Bind::Text(provider_node),
        ]),
    )
    .await
}

/// Runs one step of the root demotion sequence.
///
/// Step 1 freezes event insertion, step 2 returns the last tick of the frozen queue and step 3
/// converts the node into a branch reading from `new_provider`.
pub async fn demote_root<'c, E>(
    executor: E,
    queue: &str,
    step: i32,
    new_provider: &str,
) -> Result<Option<i64>, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let row = sqlx::query_as::<_, TickStatusRow>(
        "select ret_code, ret_note, last_tick as tick_id from pgq_node.demote_root($1, $2, $3)",
    )
    .bind(queue)
    .bind(step)
    .bind(new_provider)
    .fetch_one(executor)
    .await?;

    ReturnStatus {
        ret_code: row.ret_code,
        ret_note: row.ret_note,
    }
    .check("pgq_node.demote_root")?;

    Ok(row.tick_id)
}

/// Converts a branch node into the root.
pub async fn promote_branch<'c, E>(executor: E, queue: &str) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.promote_branch",
        "select ret_code, ret_note from pgq_node.promote_branch($1)",
        StatusBinds(vec![Bind::Text(queue)]),
    )
    .await
}

/// First rename step, run against every node that knows the renamed node's location.
pub async fn rename_node_step1<'c, E>(
    executor: E,
    queue: &str,
    old_name: &str,
    new_name: &str,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.rename_node_step1",
        "select ret_code, ret_note from pgq_node.rename_node_step1($1, $2, $3)",
        StatusBinds(vec![Bind::Text(queue), Bind::Text(old_name), Bind::Text(new_name)]),
    )
    .await
}

/// Second rename step, run on the renamed node itself.
pub async fn rename_node_step2<'c, E>(
    executor: E,
    queue: &str,
    old_name: &str,
    new_name: &str,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    call_status(
        executor,
        "pgq_node.rename_node_step2",
        "select ret_code, ret_note from pgq_node.rename_node_step2($1, $2, $3)",
        StatusBinds(vec![Bind::Text(queue), Bind::Text(old_name), Bind::Text(new_name)]),
    )
    .await
}
