// ABOUTME: PostgreSQL source store - counts, keyset-paginated reads, full scans
// ABOUTME: Converts result rows into typed rows sharing one column index

use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::introspect;
use crate::error::{Result, SyncError};
use crate::row::{ColumnIndex, Row, RowBatch, SqlValue};
use crate::schema::{TableRef, TableSchema};
use crate::store::SourceStore;
use crate::utils::quote_ident;

pub struct PgSource {
    client: Client,
}

impl PgSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn query_rows(
        &self,
        schema: &TableSchema,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<RowBatch> {
        let kinds = schema.column_kinds();
        let table = schema.table.to_string();
        let rows = self
            .client
            .query(sql, params)
            .await
            .map_err(|e| SyncError::from_postgres("read batch", &table, &e))?;

        let index = Arc::new(ColumnIndex::new(schema.column_names()));
        let rows = rows
            .iter()
            .map(|pg_row| {
                let values = kinds
                    .iter()
                    .enumerate()
                    .map(|(idx, kind)| SqlValue::from_pg_row(pg_row, idx, *kind))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| SyncError::schema(table.clone(), e.to_string()))?;
                Ok(Row::new(index.clone(), values))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RowBatch::new(rows))
    }
}

fn select_list(schema: &TableSchema) -> String {
    schema
        .columns
        .iter()
        .map(|c| c.select_expr())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Keyset page query. With `has_after`, the key tuple is compared against
/// `$1..$n` and the limit is the next parameter.
pub(crate) fn keyset_query(schema: &TableSchema, key_columns: &[String], has_after: bool) -> String {
    let keys: Vec<String> = key_columns.iter().map(|k| quote_ident(k)).collect();
    let key_list = keys.join(", ");

    if has_after {
        let placeholders: Vec<String> = key_columns
            .iter()
            .enumerate()
            .map(|(i, k)| match schema.column(k) {
                Some(col) => col.placeholder(i + 1),
                None => format!("${}", i + 1),
            })
            .collect();
        format!(
            "SELECT {} FROM {} WHERE ({}) > ({}) ORDER BY {} LIMIT ${}",
            select_list(schema),
            schema.table.quoted(),
            key_list,
            placeholders.join(", "),
            key_list,
            keys.len() + 1
        )
    } else {
        format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT $1",
            select_list(schema),
            schema.table.quoted(),
            key_list
        )
    }
}

#[async_trait]
impl SourceStore for PgSource {
    async fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableSchema>> {
        introspect::describe_table(&self.client, table).await
    }

    async fn count_rows(&mut self, table: &TableRef) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.quoted());
        let row = self
            .client
            .query_one(&sql, &[])
            .await
            .map_err(|e| SyncError::from_postgres("count rows", &table.to_string(), &e))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn fetch_after(
        &mut self,
        schema: &TableSchema,
        key_columns: &[String],
        after: Option<&[SqlValue]>,
        limit: usize,
    ) -> Result<RowBatch> {
        let limit = limit as i64;
        let sql = keyset_query(schema, key_columns, after.is_some());

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(key_columns.len() + 1);
        if let Some(after) = after {
            params.extend(after.iter().map(|v| v as &(dyn ToSql + Sync)));
        }
        params.push(&limit);

        self.query_rows(schema, &sql, &params).await
    }

    async fn fetch_all(&mut self, schema: &TableSchema) -> Result<RowBatch> {
        let sql = format!("SELECT {} FROM {}", select_list(schema), schema.table.quoted());
        self.query_rows(schema, &sql, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnInfo;

    fn events() -> TableSchema {
        TableSchema {
            table: TableRef::parse("audit.events").unwrap(),
            columns: vec![
                ColumnInfo::new("tenant", "integer", false),
                ColumnInfo::new("seq", "bigint", false),
                ColumnInfo::new("body", "jsonb", true),
            ],
            primary_key: vec!["tenant".to_string(), "seq".to_string()],
        }
    }

    #[test]
    fn test_keyset_query_first_page() {
        let schema = events();
        assert_eq!(
            keyset_query(&schema, &schema.primary_key, false),
            "SELECT \"tenant\", \"seq\", \"body\" FROM \"audit\".\"events\" \
             ORDER BY \"tenant\", \"seq\" LIMIT $1"
        );
    }

    #[test]
    fn test_keyset_query_composite_key() {
        let schema = events();
        assert_eq!(
            keyset_query(&schema, &schema.primary_key, true),
            "SELECT \"tenant\", \"seq\", \"body\" FROM \"audit\".\"events\" \
             WHERE (\"tenant\", \"seq\") > ($1, $2) ORDER BY \"tenant\", \"seq\" LIMIT $3"
        );
    }

    #[test]
    fn test_keyset_query_text_transported_key() {
        let schema = TableSchema {
            table: TableRef::parse("hosts").unwrap(),
            columns: vec![
                ColumnInfo::new("addr", "inet", false),
                ColumnInfo::new("ttl", "interval", true),
            ],
            primary_key: vec!["addr".to_string()],
        };
        assert_eq!(
            keyset_query(&schema, &schema.primary_key, true),
            "SELECT \"addr\"::text AS \"addr\", \"ttl\"::text AS \"ttl\" \
             FROM \"public\".\"hosts\" WHERE (\"addr\") > ($1::text::inet) \
             ORDER BY \"addr\" LIMIT $2"
        );
    }
}
