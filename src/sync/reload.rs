// ABOUTME: Full-reload strategy for tables without a primary key
// ABOUTME: Replaces every target row with a one-pass copy of the source

use crate::error::Result;
use crate::schema::TableSchema;
use crate::store::{SourceStore, TargetStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReloadOutcome {
    /// Source row count taken before the target was touched.
    pub source_count: u64,
    pub deleted: u64,
    pub loaded: u64,
}

/// Copy a keyless table wholesale.
///
/// The delete and the insert commit together, so a failed reload leaves
/// the previous target contents in place. Not chunked and not resumable.
pub async fn reload<S, T>(source: &mut S, target: &mut T, schema: &TableSchema) -> Result<ReloadOutcome>
where
    S: SourceStore + ?Sized,
    T: TargetStore + ?Sized,
{
    let source_count = source.count_rows(&schema.table).await?;
    let batch = source.fetch_all(schema).await?;
    let (deleted, loaded) = target.replace_all(schema, &batch).await?;

    tracing::info!(
        "Reloaded {}: deleted {} rows, loaded {} rows",
        schema.table,
        deleted,
        loaded
    );

    Ok(ReloadOutcome {
        source_count,
        deleted,
        loaded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::SqlValue;
    use crate::schema::{ColumnInfo, TableRef};
    use crate::store::MemoryStore;

    fn flags() -> TableSchema {
        TableSchema {
            table: TableRef::parse("flags").unwrap(),
            columns: vec![
                ColumnInfo::new("name", "text", false),
                ColumnInfo::new("enabled", "boolean", false),
            ],
            primary_key: Vec::new(),
        }
    }

    fn flag(name: &str, on: bool) -> Vec<SqlValue> {
        vec![SqlValue::Text(name.to_string()), SqlValue::Bool(on)]
    }

    #[tokio::test]
    async fn test_reload_replaces_target_rows() {
        let source = MemoryStore::new();
        source.create_table(flags());
        source.insert_rows(&flags().table, vec![flag("a", true), flag("b", false)]);

        let target = MemoryStore::new();
        target.create_table(flags());
        target.insert_rows(
            &flags().table,
            vec![flag("x", true), flag("y", true), flag("z", false)],
        );

        let outcome = reload(&mut source.handle(), &mut target.handle(), &flags())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReloadOutcome {
                source_count: 2,
                deleted: 3,
                loaded: 2
            }
        );

        let names: Vec<_> = target
            .rows(&flags().table)
            .iter()
            .map(|r| r.get("name").cloned())
            .collect();
        assert_eq!(
            names,
            vec![
                Some(SqlValue::Text("a".into())),
                Some(SqlValue::Text("b".into()))
            ]
        );
    }
}
