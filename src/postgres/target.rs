// ABOUTME: PostgreSQL target store - table creation, transactional upserts and reloads
// ABOUTME: Splits large batches across statements inside a single transaction

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Transaction};

use super::introspect;
use crate::error::{Result, SyncError};
use crate::row::{Row, RowBatch, SqlValue};
use crate::schema::{TableRef, TableSchema, DEFAULT_SCHEMA};
use crate::store::TargetStore;
use crate::sync::merge::{MergePlan, MAX_BIND_PARAMS};
use crate::utils::quote_ident;

pub struct PgTarget {
    client: Client,
}

impl PgTarget {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Plain multi-row insert of every column of `schema`, used by full reloads.
pub(crate) fn insert_sql(schema: &TableSchema, num_rows: usize) -> String {
    let quoted: Vec<String> = schema.columns.iter().map(|c| quote_ident(&c.name)).collect();
    let num_cols = schema.columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = schema
                .columns
                .iter()
                .enumerate()
                .map(|(col_idx, col)| col.placeholder(row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        schema.table.quoted(),
        quoted.join(", "),
        value_rows.join(", ")
    )
}

/// Run `sql_for(n)` once per slice of `rows`, binding `columns` of each row.
async fn execute_chunked<F>(
    tx: &Transaction<'_>,
    rows: &[Row],
    columns: &[String],
    rows_per_statement: usize,
    sql_for: F,
) -> std::result::Result<u64, tokio_postgres::Error>
where
    F: Fn(usize) -> String,
{
    let mut affected = 0u64;
    for chunk in rows.chunks(rows_per_statement.max(1)) {
        let sql = sql_for(chunk.len());
        let values: Vec<SqlValue> = chunk.iter().flat_map(|row| row.project(columns)).collect();
        let params: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        affected += tx.execute(&sql, &params).await?;
    }
    Ok(affected)
}

#[async_trait]
impl TargetStore for PgTarget {
    async fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableSchema>> {
        introspect::describe_table(&self.client, table).await
    }

    async fn create_table(&mut self, schema: &TableSchema) -> Result<()> {
        let table = schema.table.to_string();
        if schema.table.schema != DEFAULT_SCHEMA {
            let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&schema.table.schema));
            self.client
                .batch_execute(&sql)
                .await
                .map_err(|e| SyncError::from_postgres("create schema", &table, &e))?;
        }
        self.client
            .batch_execute(&schema.create_table_sql())
            .await
            .map_err(|e| SyncError::from_postgres("create table", &table, &e))
    }

    async fn apply_merge(&mut self, plan: &MergePlan, batch: &RowBatch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let table = plan.table().to_string();
        let err = |e: tokio_postgres::Error| SyncError::from_postgres("upsert", &table, &e);

        let tx = self.client.transaction().await.map_err(err)?;
        let affected = execute_chunked(
            &tx,
            &batch.rows,
            plan.columns(),
            plan.rows_per_statement(),
            |n| plan.to_sql(n),
        )
        .await
        .map_err(err)?;
        tx.commit().await.map_err(err)?;
        Ok(affected)
    }

    async fn replace_all(&mut self, schema: &TableSchema, batch: &RowBatch) -> Result<(u64, u64)> {
        let table = schema.table.to_string();
        let err = |e: tokio_postgres::Error| SyncError::from_postgres("reload", &table, &e);
        let columns = schema.column_names();
        let rows_per_statement = MAX_BIND_PARAMS / columns.len().max(1);

        let tx = self.client.transaction().await.map_err(err)?;
        let deleted = tx
            .execute(&format!("DELETE FROM {}", schema.table.quoted()), &[])
            .await
            .map_err(err)?;
        let loaded = execute_chunked(&tx, &batch.rows, &columns, rows_per_statement, |n| {
            insert_sql(schema, n)
        })
        .await
        .map_err(err)?;
        tx.commit().await.map_err(err)?;
        Ok((deleted, loaded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnInfo;

    fn flags(extra: Option<ColumnInfo>) -> TableSchema {
        let mut columns = vec![
            ColumnInfo::new("name", "text", false),
            ColumnInfo::new("enabled", "boolean", false),
        ];
        columns.extend(extra);
        TableSchema {
            table: TableRef::parse("flags").unwrap(),
            columns,
            primary_key: Vec::new(),
        }
    }

    #[test]
    fn test_insert_sql() {
        assert_eq!(
            insert_sql(&flags(None), 2),
            "INSERT INTO \"public\".\"flags\" (\"name\", \"enabled\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn test_insert_sql_casts_text_transported_columns() {
        let schema = flags(Some(ColumnInfo::new("tags", "text[]", true)));
        assert_eq!(
            insert_sql(&schema, 2),
            "INSERT INTO \"public\".\"flags\" (\"name\", \"enabled\", \"tags\") \
             VALUES ($1, $2, $3::text::text[]), ($4, $5, $6::text::text[])"
        );
    }
}
