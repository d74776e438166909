//! Row level statements against replicated tables.
//!
//! Row values travel as text and are handed to the server as a JSON object, which lets
//! `json_populate_record` apply the column input functions of the destination table. No column
//! types need to be known on the client.

use pg_escape::quote_identifier;
use serde_json::{Map, Value};
use sqlx::{PgConnection, PgExecutor};
use tracing::debug;

use crate::RowMap;

/// Quotes a possibly schema qualified table name.
///
/// Names without a schema are assumed to live in `public`.
pub fn quote_table_name(name: &str) -> String {
    let (schema, table) = split_table_name(name);
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

/// Splits `schema.table` into its parts, defaulting the schema to `public`.
pub fn split_table_name(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => ("public", name),
    }
}

fn row_to_value(row: &RowMap) -> Value {
    let object: Map<String, Value> = row
        .iter()
        .map(|(column, value)| {
            let value = match value {
                Some(value) => Value::String(value.clone()),
                None => Value::Null,
            };
            (column.clone(), value)
        })
        .collect();

    Value::Object(object)
}

fn row_to_json(row: &RowMap) -> String {
    row_to_value(row).to_string()
}

fn json_to_row(json: Value) -> RowMap {
    let Value::Object(object) = json else {
        return RowMap::new();
    };

    object
        .into_iter()
        .map(|(column, value)| {
            let value = match value {
                Value::Null => None,
                Value::String(value) => Some(value),
                Value::Bool(true) => Some("t".to_string()),
                Value::Bool(false) => Some("f".to_string()),
                other => Some(other.to_string()),
            };
            (column, value)
        })
        .collect()
}

fn column_list<'a>(columns: impl Iterator<Item = &'a String>) -> String {
    columns
        .map(|column| quote_identifier(column).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Inserts a single row.
pub async fn insert_row<'c, E>(executor: E, table: &str, row: &RowMap) -> sqlx::Result<u64>
where
    E: PgExecutor<'c>,
{
    let quoted = quote_table_name(table);
    let columns = column_list(row.keys());
    let query = format!(
        "insert into {quoted} ({columns}) select {columns} from json_populate_record(null::{quoted}, $1::json)"
    );

    let result = sqlx::query(&query)
        .bind(row_to_json(row))
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Updates the row identified by `key_columns`, returning the number of touched rows.
pub async fn update_row<'c, E>(
    executor: E,
    table: &str,
    key_columns: &[String],
    row: &RowMap,
) -> sqlx::Result<u64>
where
    E: PgExecutor<'c>,
{
    let quoted = quote_table_name(table);
    let value_columns: Vec<&String> = row.keys().filter(|c| !key_columns.contains(c)).collect();
    // A row made only of key columns has nothing to update; touching a key column keeps the
    // statement valid and still reports whether the row exists.
    let set_columns = if value_columns.is_empty() {
        column_list(key_columns.iter())
    } else {
        column_list(value_columns.into_iter())
    };
    let keys = column_list(key_columns.iter());
    let query = format!(
        "update {quoted} set ({set_columns}) = (select {set_columns} from json_populate_record(null::{quoted}, $1::json)) \
         where ({keys}) = (select {keys} from json_populate_record(null::{quoted}, $1::json))"
    );

    let result = sqlx::query(&query)
        .bind(row_to_json(row))
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Updates the row identified by `key_columns` or inserts it when missing.
pub async fn upsert_row(
    conn: &mut PgConnection,
    table: &str,
    key_columns: &[String],
    row: &RowMap,
) -> sqlx::Result<u64> {
    let updated = update_row(&mut *conn, table, key_columns, row).await?;
    if updated > 0 {
        return Ok(updated);
    }

    insert_row(conn, table, row).await
}

/// Deletes the row identified by the key columns in `key`.
pub async fn delete_row<'c, E>(executor: E, table: &str, key: &RowMap) -> sqlx::Result<u64>
where
    E: PgExecutor<'c>,
{
    let quoted = quote_table_name(table);
    let keys = column_list(key.keys());
    let query = format!(
        "delete from {quoted} where ({keys}) = (select {keys} from json_populate_record(null::{quoted}, $1::json))"
    );

    let result = sqlx::query(&query)
        .bind(row_to_json(key))
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Truncates a table.
pub async fn truncate_table<'c, E>(executor: E, table: &str) -> sqlx::Result<()>
where
    E: PgExecutor<'c>,
{
    let query = format!("truncate {}", quote_table_name(table));
    sqlx::query(&query).execute(executor).await?;

    Ok(())
}

/// Takes an exclusive lock on a table for the rest of the transaction.
pub async fn lock_table<'c, E>(executor: E, table: &str) -> sqlx::Result<()>
where
    E: PgExecutor<'c>,
{
    let query = format!("lock table {} in access exclusive mode", quote_table_name(table));
    sqlx::query(&query).execute(executor).await?;

    Ok(())
}

/// Returns whether `table` exists.
pub async fn table_exists<'c, E>(executor: E, table: &str) -> sqlx::Result<bool>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar::<_, bool>("select to_regclass($1) is not null")
        .bind(quote_table_name(table))
        .fetch_one(executor)
        .await
}

/// Inserts many rows in one statement.
pub async fn bulk_insert_rows<'c, E>(executor: E, table: &str, rows: &[RowMap]) -> sqlx::Result<u64>
where
    E: PgExecutor<'c>,
{
    if rows.is_empty() {
        return Ok(0);
    }

    let array = Value::Array(rows.iter().map(row_to_value).collect());
    let quoted = quote_table_name(table);
    let query = format!("insert into {quoted} select * from json_populate_recordset(null::{quoted}, $1::json)");

    let result = sqlx::query(&query)
        .bind(array.to_string())
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Reads all rows of a table, optionally narrowed by a raw SQL `where` condition.
pub async fn read_table_rows<'c, E>(
    executor: E,
    table: &str,
    condition: Option<&str>,
) -> sqlx::Result<Vec<RowMap>>
where
    E: PgExecutor<'c>,
{
    let quoted = quote_table_name(table);
    let query = match condition {
        Some(condition) => format!("select row_to_json(t)::text from {quoted} t where {condition}"),
        None => format!("select row_to_json(t)::text from {quoted} t"),
    };

    let rows: Vec<String> = sqlx::query_scalar(&query).fetch_all(executor).await?;

    Ok(rows
        .into_iter()
        .filter_map(|json| serde_json::from_str::<Value>(&json).ok())
        .map(json_to_row)
        .collect())
}

/// Switches the current transaction to repeatable read; must be its first statement.
pub async fn set_repeatable_read(conn: &mut PgConnection) -> sqlx::Result<()> {
    sqlx::query("set transaction isolation level repeatable read")
        .execute(conn)
        .await?;

    Ok(())
}

/// Returns the txid snapshot of the current transaction in `xmin:xmax:xip,...` form.
pub async fn current_snapshot<'c, E>(executor: E) -> sqlx::Result<String>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar::<_, String>("select txid_current_snapshot()::text")
        .fetch_one(executor)
        .await
}

/// Drops the secondary indexes and the non-key constraints of a table.
///
/// Returns the DDL that re-creates them, or `None` when there was nothing to drop.
pub async fn drop_table_objects(
    conn: &mut PgConnection,
    table: &str,
) -> sqlx::Result<Option<String>> {
    let quoted = quote_table_name(table);

    let constraints: Vec<(String, String)> = sqlx::query_as(
        r#"
        select conname::text, pg_get_constraintdef(oid)
        from pg_constraint
        where conrelid = $1::regclass and contype in ('u', 'c', 'x')
        order by conname
        "#,
    )
    .bind(&quoted)
    .fetch_all(&mut *conn)
    .await?;

    let indexes: Vec<(String, String)> = sqlx::query_as(
        r#"
        select i.indexrelid::regclass::text, pg_get_indexdef(i.indexrelid)
        from pg_index i
        where i.indrelid = $1::regclass
          and not i.indisprimary
          and not exists (select 1 from pg_constraint c where c.conindid = i.indexrelid)
        order by 1
        "#,
    )
    .bind(&quoted)
    .fetch_all(&mut *conn)
    .await?;

    if constraints.is_empty() && indexes.is_empty() {
        return Ok(None);
    }

    debug!(
        table,
        constraints = constraints.len(),
        indexes = indexes.len(),
        "dropping table objects before copy"
    );

    let mut restore = Vec::with_capacity(constraints.len() + indexes.len());
    for (name, definition) in constraints {
        let name = quote_identifier(&name).into_owned();
        sqlx::query(&format!("alter table {quoted} drop constraint {name}"))
            .execute(&mut *conn)
            .await?;
        restore.push(format!("alter table {quoted} add constraint {name} {definition}"));
    }
    for (name, definition) in indexes {
        // regclass output is already quoted where needed.
        sqlx::query(&format!("drop index {name}"))
            .execute(&mut *conn)
            .await?;
        restore.push(definition);
    }

    Ok(Some(restore.join(";\n")))
}

/// Re-runs DDL saved by [`drop_table_objects`].
pub async fn restore_table_objects(conn: &mut PgConnection, ddl: &str) -> sqlx::Result<()> {
    debug!("restoring dropped table objects");
    for statement in ddl.split(";\n").filter(|s| !s.trim().is_empty()) {
        sqlx::query(statement).execute(&mut *conn).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_table_name_defaults_schema() {
        assert_eq!(split_table_name("orders"), ("public", "orders"));
        assert_eq!(quote_table_name("sales.orders"), "sales.orders");
        assert_eq!(quote_table_name("sales.Orders"), "sales.\"Orders\"");
    }

    #[test]
    fn test_row_json_conversion_keeps_nulls() {
        let mut row = RowMap::new();
        row.insert("id".to_string(), Some("1".to_string()));
        row.insert("note".to_string(), None);

        let json: Value = serde_json::from_str(&row_to_json(&row)).unwrap();
        assert_eq!(json_to_row(json), row);
    }

    #[test]
    fn test_json_to_row_renders_scalars_as_text() {
        let json = serde_json::json!({"id": 7, "active": true, "tags": ["a"]});
        let row = json_to_row(json);
        assert_eq!(row["id"], Some("7".to_string()));
        assert_eq!(row["active"], Some("t".to_string()));
        assert_eq!(row["tags"], Some("[\"a\"]".to_string()));
    }
}
