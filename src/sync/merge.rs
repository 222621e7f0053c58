// ABOUTME: Merge engine - turns a row batch into an idempotent upsert
// ABOUTME: Builds INSERT ... ON CONFLICT DO UPDATE with an optional watermark guard

use crate::schema::{ColumnInfo, TableRef, TableSchema};
use crate::utils::quote_ident;

/// PostgreSQL accepts at most 65535 bind parameters per statement.
pub const MAX_BIND_PARAMS: usize = 65000;

/// How one table's batches are merged into the target.
///
/// Built once per job from the mirrored schema; every batch of the job is
/// written with the same plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    table: TableRef,
    columns: Vec<String>,
    column_info: Vec<ColumnInfo>,
    key_columns: Vec<String>,
    update_columns: Vec<String>,
    guard_column: Option<String>,
}

impl MergePlan {
    /// Plan a merge of `source` columns into `target`.
    ///
    /// The update is guarded by `watermark_column` when the target carries
    /// that column and it is not part of the key.
    pub fn new(source: &TableSchema, target: &TableSchema, watermark_column: Option<&str>) -> Self {
        let columns = source.column_names();
        let key_columns = source.primary_key.clone();
        let update_columns: Vec<String> = columns
            .iter()
            .filter(|c| !key_columns.contains(c))
            .cloned()
            .collect();

        let guard_column = watermark_column
            .filter(|wm| target.has_column(wm) && source.has_column(wm))
            .filter(|wm| !key_columns.iter().any(|k| k == wm))
            .map(str::to_string);

        Self {
            table: target.table.clone(),
            columns,
            column_info: source.columns.clone(),
            key_columns,
            update_columns,
            guard_column,
        }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// Non-key columns; empty means conflicts are ignored.
    pub fn update_columns(&self) -> &[String] {
        &self.update_columns
    }

    pub fn guard_column(&self) -> Option<&str> {
        self.guard_column.as_deref()
    }

    /// Rows that fit in one statement without exceeding the bind limit.
    pub fn rows_per_statement(&self) -> usize {
        std::cmp::max(1, MAX_BIND_PARAMS / std::cmp::max(1, self.columns.len()))
    }

    /// Upsert statement for `num_rows` rows.
    ///
    /// ```sql
    /// INSERT INTO "public"."accounts" ("id", "name", "server_modified_date")
    /// VALUES ($1, $2, $3), ($4, $5, $6)
    /// ON CONFLICT ("id") DO UPDATE SET
    ///   "name" = EXCLUDED."name",
    ///   "server_modified_date" = EXCLUDED."server_modified_date"
    /// WHERE EXCLUDED."server_modified_date" > "public"."accounts"."server_modified_date"
    /// ```
    pub fn to_sql(&self, num_rows: usize) -> String {
        let quoted_columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        let quoted_keys: Vec<String> = self.key_columns.iter().map(|c| quote_ident(c)).collect();

        let num_cols = self.columns.len();
        let value_rows: Vec<String> = (0..num_rows)
            .map(|row_idx| {
                let placeholders: Vec<String> = self
                    .column_info
                    .iter()
                    .enumerate()
                    .map(|(col_idx, col)| col.placeholder(row_idx * num_cols + col_idx + 1))
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();

        let conflict = if self.update_columns.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let sets: Vec<String> = self
                .update_columns
                .iter()
                .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
                .collect();
            let mut clause = format!("DO UPDATE SET {}", sets.join(", "));
            if let Some(guard) = &self.guard_column {
                let guard = quote_ident(guard);
                clause.push_str(&format!(
                    " WHERE EXCLUDED.{} > {}.{}",
                    guard,
                    self.table.quoted(),
                    guard
                ));
            }
            clause
        };

        format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
            self.table.quoted(),
            quoted_columns.join(", "),
            value_rows.join(", "),
            quoted_keys.join(", "),
            conflict
        )
    }
}
