// ABOUTME: Catalog queries describing a table's columns and primary key
// ABOUTME: Type names come from format_type so they can be replayed in CREATE TABLE

use tokio_postgres::Client;

use crate::error::{Result, SyncError};
use crate::schema::{ColumnInfo, TableRef, TableSchema};

/// Describe `table`, or `None` if it does not exist.
pub async fn describe_table(client: &Client, table: &TableRef) -> Result<Option<TableSchema>> {
    let err = |e: tokio_postgres::Error| {
        SyncError::from_postgres("describe table", &table.to_string(), &e)
    };

    let exists = client
        .query_opt(
            "SELECT 1
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1
               AND c.relname = $2
               AND c.relkind IN ('r', 'p')",
            &[&table.schema, &table.name],
        )
        .await
        .map_err(err)?;
    if exists.is_none() {
        return Ok(None);
    }

    let columns = client
        .query(
            "SELECT a.attname, format_type(a.atttypid, a.atttypmod), NOT a.attnotnull
             FROM pg_attribute a
             JOIN pg_class c ON c.oid = a.attrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1
               AND c.relname = $2
               AND a.attnum > 0
               AND NOT a.attisdropped
             ORDER BY a.attnum",
            &[&table.schema, &table.name],
        )
        .await
        .map_err(err)?
        .iter()
        .map(|row| ColumnInfo::new(row.get::<_, String>(0), row.get::<_, String>(1), row.get(2)))
        .collect();

    let primary_key = client
        .query(
            "SELECT a.attname
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             JOIN pg_class c ON c.oid = i.indrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE i.indisprimary
               AND n.nspname = $1
               AND c.relname = $2
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&table.schema, &table.name],
        )
        .await
        .map_err(err)?
        .iter()
        .map(|row| row.get(0))
        .collect();

    Ok(Some(TableSchema {
        table: table.clone(),
        columns,
        primary_key,
    }))
}
