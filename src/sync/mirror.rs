// ABOUTME: Schema mirror - describes the source table and ensures the target matches
// ABOUTME: Creates a missing target table and rejects incompatible existing ones

use crate::error::{Result, SyncError};
use crate::schema::{TableRef, TableSchema};
use crate::store::{SourceStore, TargetStore};

/// Source and target schemas resolved at the start of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredSchema {
    pub source: TableSchema,
    pub target: TableSchema,
    /// The target table did not exist and was created by this job.
    pub created: bool,
}

/// Resolve `table` on the source and make sure the target can receive it.
///
/// Fails with a schema error when the source table is missing, or when an
/// existing target table lacks a source column or keys the table
/// differently.
pub async fn ensure_target<S, T>(source: &mut S, target: &mut T, table: &TableRef) -> Result<MirroredSchema>
where
    S: SourceStore + ?Sized,
    T: TargetStore + ?Sized,
{
    let source_schema = source
        .describe_table(table)
        .await?
        .ok_or_else(|| SyncError::schema(table.to_string(), "source table does not exist"))?;

    let mut created = false;
    let target_schema = match target.describe_table(table).await? {
        Some(existing) => existing,
        None => {
            tracing::info!("Creating target table {}", table);
            target.create_table(&source_schema).await?;
            created = true;
            target.describe_table(table).await?.ok_or_else(|| {
                SyncError::schema(table.to_string(), "target table missing after creation")
            })?
        }
    };

    check_compatible(&source_schema, &target_schema)?;

    Ok(MirroredSchema {
        source: source_schema,
        target: target_schema,
        created,
    })
}

fn check_compatible(source: &TableSchema, target: &TableSchema) -> Result<()> {
    let missing: Vec<&str> = source
        .columns
        .iter()
        .filter(|c| !target.has_column(&c.name))
        .map(|c| c.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(SyncError::schema(
            target.table.to_string(),
            format!("target is missing source columns: {}", missing.join(", ")),
        ));
    }

    if source.has_primary_key() && source.primary_key != target.primary_key {
        return Err(SyncError::schema(
            target.table.to_string(),
            format!(
                "primary key mismatch: source ({}) vs target ({})",
                source.primary_key.join(", "),
                target.primary_key.join(", ")
            ),
        ));
    }

    Ok(())
}
