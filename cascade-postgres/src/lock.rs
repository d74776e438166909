//! Session-level advisory locks keeping a single copy worker per table.
//!
//! The lock key is derived from the queue and table names, so every process working on the node
//! database sees the same lock. The lock lives as long as the session that took it.

use sqlx::PgExecutor;

use crate::error::NodeCallError;

/// Takes the copy lock of `table` for the calling session. Returns `false` when another session
/// holds it.
pub async fn try_copy_lock<'c, E>(
    executor: E,
    queue: &str,
    table: &str,
) -> Result<bool, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let locked =
        sqlx::query_scalar::<_, bool>("select pg_try_advisory_lock(hashtext($1), hashtext($2))")
            .bind(queue)
            .bind(table)
            .fetch_one(executor)
            .await?;

    Ok(locked)
}

/// Releases a copy lock held by the calling session.
pub async fn copy_unlock<'c, E>(
    executor: E,
    queue: &str,
    table: &str,
) -> Result<bool, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let unlocked =
        sqlx::query_scalar::<_, bool>("select pg_advisory_unlock(hashtext($1), hashtext($2))")
            .bind(queue)
            .bind(table)
            .fetch_one(executor)
            .await?;

    Ok(unlocked)
}
