//! Wrappers for the table registry functions in the `londiste` schema.

use sqlx::{FromRow, PgExecutor};

use crate::error::{NodeCallError, ReturnStatus};

/// Registered table as returned by `londiste.get_table_list`.
#[derive(Debug, Clone, FromRow)]
pub struct TableRow {
    pub table_name: String,
    pub local: bool,
    pub merge_state: Option<String>,
    pub custom_snapshot: Option<String>,
    pub table_attrs: Option<String>,
    pub dropped_ddl: Option<String>,
    pub copy_role: Option<String>,
    pub copy_pos: Option<i32>,
    pub dest_table: Option<String>,
}

/// Foreign key definition as returned by `londiste.find_table_fkeys` and
/// `londiste.get_valid_pending_fkeys`.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct FkeyRow {
    pub from_table: String,
    pub to_table: String,
    pub fkey_name: String,
    pub fkey_def: String,
}

/// Lists all tables known to `queue`, local or not.
pub async fn get_table_list<'c, E>(executor: E, queue: &str) -> Result<Vec<TableRow>, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let rows = sqlx::query_as::<_, TableRow>(
        r#"
        select table_name, local, merge_state, custom_snapshot, table_attrs,
               dropped_ddl, copy_role, copy_pos, dest_table
        from londiste.get_table_list($1)
        "#,
    )
    .bind(queue)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// Persists the merge state and the copy snapshot of a table.
pub async fn local_set_table_state<'c, E>(
    executor: E,
    queue: &str,
    table: &str,
    snapshot: Option<&str>,
    merge_state: Option<&str>,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let status = sqlx::query_as::<_, ReturnStatus>(
        "select ret_code, ret_note from londiste.local_set_table_state($1, $2, $3, $4)",
    )
    .bind(queue)
    .bind(table)
    .bind(snapshot)
    .bind(merge_state)
    .fetch_one(executor)
    .await?;

    status.check("londiste.local_set_table_state")
}

/// Persists the dropped index/constraint DDL of a table, `None` clearing it.
pub async fn local_set_table_struct<'c, E>(
    executor: E,
    queue: &str,
    table: &str,
    dropped_ddl: Option<&str>,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let status = sqlx::query_as::<_, ReturnStatus>(
        "select ret_code, ret_note from londiste.local_set_table_struct($1, $2, $3)",
    )
    .bind(queue)
    .bind(table)
    .bind(dropped_ddl)
    .fetch_one(executor)
    .await?;

    status.check("londiste.local_set_table_struct")
}

/// Marks a table as replicated on this node; `attrs` carries the handler and copy settings.
pub async fn local_add_table<'c, E>(
    executor: E,
    queue: &str,
    table: &str,
    attrs: Option<&str>,
    dest_table: Option<&str>,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let status = sqlx::query_as::<_, ReturnStatus>(
        r#"
        select ret_code, ret_note
        from londiste.local_add_table($1, $2, array[]::text[], $3, $4)
        "#,
    )
    .bind(queue)
    .bind(table)
    .bind(attrs)
    .bind(dest_table)
    .fetch_one(executor)
    .await?;

    status.check("londiste.local_add_table")
}

/// Stops replicating a table on this node.
pub async fn local_remove_table<'c, E>(
    executor: E,
    queue: &str,
    table: &str,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let status = sqlx::query_as::<_, ReturnStatus>(
        "select ret_code, ret_note from londiste.local_remove_table($1, $2)",
    )
    .bind(queue)
    .bind(table)
    .fetch_one(executor)
    .await?;

    status.check("londiste.local_remove_table")
}

/// Registers a table in the queue-wide table list, as relayed by `londiste.add-table`.
pub async fn global_add_table<'c, E>(
    executor: E,
    queue: &str,
    table: &str,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let status = sqlx::query_as::<_, ReturnStatus>(
        "select ret_code, ret_note from londiste.global_add_table($1, $2)",
    )
    .bind(queue)
    .bind(table)
    .fetch_one(executor)
    .await?;

    status.check("londiste.global_add_table")
}

/// Removes a table from the queue-wide table list, as relayed by `londiste.remove-table`.
pub async fn global_remove_table<'c, E>(
    executor: E,
    queue: &str,
    table: &str,
) -> Result<ReturnStatus, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let status = sqlx::query_as::<_, ReturnStatus>(
        "select ret_code, ret_note from londiste.global_remove_table($1, $2)",
    )
    .bind(queue)
    .bind(table)
    .fetch_one(executor)
    .await?;

    status.check("londiste.global_remove_table")
}

/// Lists the foreign keys that reference or are defined on `table`.
pub async fn find_table_fkeys<'c, E>(
    executor: E,
    table: &str,
) -> Result<Vec<FkeyRow>, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let rows = sqlx::query_as::<_, FkeyRow>(
        "select from_table, to_table, fkey_name, fkey_def from londiste.find_table_fkeys($1)",
    )
    .bind(table)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// Drops a foreign key and remembers its definition as pending.
pub async fn drop_table_fkey<'c, E>(
    executor: E,
    from_table: &str,
    fkey_name: &str,
) -> Result<i32, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let code = sqlx::query_scalar::<_, i32>("select londiste.drop_table_fkey($1, $2)")
        .bind(from_table)
        .bind(fkey_name)
        .fetch_one(executor)
        .await?;

    Ok(code)
}

/// Lists pending foreign keys whose both ends are back in the `ok` state.
pub async fn get_valid_pending_fkeys<'c, E>(
    executor: E,
    queue: &str,
) -> Result<Vec<FkeyRow>, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let rows = sqlx::query_as::<_, FkeyRow>(
        "select from_table, to_table, fkey_name, fkey_def from londiste.get_valid_pending_fkeys($1)",
    )
    .bind(queue)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// Re-creates a pending foreign key from its saved definition.
pub async fn restore_table_fkey<'c, E>(
    executor: E,
    from_table: &str,
    fkey_name: &str,
) -> Result<i32, NodeCallError>
where
    E: PgExecutor<'c>,
{
    let code = sqlx::query_scalar::<_, i32>("select londiste.restore_table_fkey($1, $2)")
        .bind(from_table)
        .bind(fkey_name)
        .fetch_one(executor)
        .await?;

    Ok(code)
}
