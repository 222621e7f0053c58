// ABOUTME: End-to-end job runs against the in-memory store
// ABOUTME: Covers chunked merge, full reload, idempotence and the watermark guard

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use table_replicator::events::{Broadcaster, EventBus, LogLevel, Subscription, SyncEvent};
use table_replicator::row::SqlValue;
use table_replicator::schema::{ColumnInfo, TableRef, TableSchema};
use table_replicator::store::{MemoryConnector, MemoryStore};
use table_replicator::sync::{JobReport, JobRunner, JobState, Strategy, SyncJob};
use table_replicator::SyncError;
use tokio::sync::watch;

fn accounts_schema() -> TableSchema {
    TableSchema {
        table: TableRef::parse("accounts").unwrap(),
        columns: vec![
            ColumnInfo::new("id", "bigint", false),
            ColumnInfo::new("owner", "text", true),
        ],
        primary_key: vec!["id".to_string()],
    }
}

fn docs_schema() -> TableSchema {
    TableSchema {
        table: TableRef::parse("docs").unwrap(),
        columns: vec![
            ColumnInfo::new("id", "integer", false),
            ColumnInfo::new("body", "text", true),
            ColumnInfo::new("server_modified_date", "timestamp with time zone", true),
        ],
        primary_key: vec!["id".to_string()],
    }
}

fn flags_schema() -> TableSchema {
    TableSchema {
        table: TableRef::parse("flags").unwrap(),
        columns: vec![
            ColumnInfo::new("name", "text", false),
            ColumnInfo::new("enabled", "boolean", false),
        ],
        primary_key: Vec::new(),
    }
}

fn ts(secs: i64) -> SqlValue {
    SqlValue::TimestampTz(DateTime::<Utc>::from_timestamp(secs, 0).unwrap())
}

fn doc(id: i32, body: &str, modified: i64) -> Vec<SqlValue> {
    vec![SqlValue::I32(id), SqlValue::Text(body.to_string()), ts(modified)]
}

struct Harness {
    source: MemoryStore,
    target: MemoryStore,
    bus: Arc<Broadcaster>,
    runner: JobRunner<MemoryConnector>,
}

impl Harness {
    fn new() -> Self {
        let source = MemoryStore::new();
        let target = MemoryStore::new();
        let bus = Arc::new(Broadcaster::new(1024));
        let runner = JobRunner::new(
            MemoryConnector::new(source.clone(), target.clone()),
            bus.clone(),
        );
        Self {
            source,
            target,
            bus,
            runner,
        }
    }

    async fn run(&self, job: &SyncJob) -> Result<JobReport, SyncError> {
        let (state, _rx) = watch::channel(JobState::Queued);
        self.runner.run(job, &state).await
    }
}

fn drain(sub: &mut Subscription) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    events
}

fn progress(events: &[SyncEvent]) -> Vec<(u64, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Progress(p) => Some((p.processed, p.total)),
            _ => None,
        })
        .collect()
}

fn ids(rows: &[table_replicator::row::Row], column: &str) -> Vec<i64> {
    rows.iter()
        .filter_map(|r| match r.get(column) {
            Some(SqlValue::I64(v)) => Some(*v),
            Some(SqlValue::I32(v)) => Some(i64::from(*v)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_accounts_chunked_copy_reports_three_progress_events() {
    let h = Harness::new();
    let schema = accounts_schema();
    h.source.create_table(schema.clone());
    h.source.insert_rows(
        &schema.table,
        (1..=25_000)
            .map(|i| vec![SqlValue::I64(i), SqlValue::Text(format!("owner-{}", i))])
            .collect(),
    );
    let mut sub = h.bus.subscribe();

    let job = SyncJob::new(schema.table.clone(), "server_modified_date", 10_000);
    let report = h.run(&job).await.unwrap();

    assert_eq!(report.strategy, Strategy::Incremental);
    assert_eq!(report.processed, 25_000);
    assert_eq!(report.batches, 3);
    assert!(report.created_target);

    let events = drain(&mut sub);
    assert_eq!(
        progress(&events),
        vec![(10_000, 25_000), (20_000, 25_000), (25_000, 25_000)]
    );

    let rows = h.target.rows(&schema.table);
    assert_eq!(rows.len(), 25_000);
    let copied: BTreeSet<i64> = ids(&rows, "id").into_iter().collect();
    assert_eq!(copied, (1..=25_000).collect::<BTreeSet<_>>());
}

#[tokio::test]
async fn test_flags_keyless_table_is_reloaded() {
    let h = Harness::new();
    let schema = flags_schema();
    h.source.create_table(schema.clone());
    h.source.insert_rows(
        &schema.table,
        vec![
            vec![SqlValue::Text("dark_mode".into()), SqlValue::Bool(true)],
            vec![SqlValue::Text("beta".into()), SqlValue::Bool(false)],
            vec![SqlValue::Text("search".into()), SqlValue::Bool(true)],
        ],
    );
    h.target.create_table(schema.clone());
    h.target.insert_rows(
        &schema.table,
        (0..5)
            .map(|i| vec![SqlValue::Text(format!("stale-{}", i)), SqlValue::Bool(false)])
            .collect(),
    );
    let mut sub = h.bus.subscribe();

    let job = SyncJob::new(schema.table.clone(), "server_modified_date", 10_000);
    let report = h.run(&job).await.unwrap();

    assert_eq!(report.strategy, Strategy::FullReload);
    assert_eq!(report.deleted, 5);
    assert_eq!(progress(&drain(&mut sub)), vec![(3, 3)]);

    let names: Vec<_> = h
        .target
        .rows(&schema.table)
        .iter()
        .map(|r| r.get("name").cloned())
        .collect();
    assert_eq!(
        names,
        vec![
            Some(SqlValue::Text("dark_mode".into())),
            Some(SqlValue::Text("beta".into())),
            Some(SqlValue::Text("search".into())),
        ]
    );
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let h = Harness::new();
    let schema = docs_schema();
    h.source.create_table(schema.clone());
    h.source.insert_rows(
        &schema.table,
        (1..=30).map(|i| doc(i, "v1", 1_000 + i64::from(i))).collect(),
    );

    let job = SyncJob::new(schema.table.clone(), "server_modified_date", 7);
    h.run(&job).await.unwrap();
    let first = h.target.rows(&schema.table);

    let job = SyncJob::new(schema.table.clone(), "server_modified_date", 7);
    let report = h.run(&job).await.unwrap();
    assert!(!report.created_target);
    assert_eq!(h.target.rows(&schema.table), first);
}

#[tokio::test]
async fn test_watermark_guard_keeps_newer_target_rows() {
    let h = Harness::new();
    let schema = docs_schema();
    h.source.create_table(schema.clone());
    h.source.insert_rows(
        &schema.table,
        vec![
            doc(1, "older", 100),
            doc(2, "same-age", 200),
            doc(3, "newer", 400),
        ],
    );
    h.target.create_table(schema.clone());
    h.target.insert_rows(
        &schema.table,
        vec![
            doc(1, "kept", 150),
            doc(2, "kept", 200),
            doc(3, "replaced", 300),
        ],
    );

    let job = SyncJob::new(schema.table.clone(), "server_modified_date", 10);
    h.run(&job).await.unwrap();

    let bodies: Vec<_> = h
        .target
        .rows(&schema.table)
        .iter()
        .map(|r| r.get("body").cloned())
        .collect();
    assert_eq!(
        bodies,
        vec![
            Some(SqlValue::Text("kept".into())),
            Some(SqlValue::Text("kept".into())),
            Some(SqlValue::Text("newer".into())),
        ]
    );
}

#[tokio::test]
async fn test_without_watermark_column_source_wins() {
    let h = Harness::new();
    let schema = accounts_schema();
    h.source.create_table(schema.clone());
    h.source.insert_rows(
        &schema.table,
        vec![vec![SqlValue::I64(1), SqlValue::Text("source".into())]],
    );
    h.target.create_table(schema.clone());
    h.target.insert_rows(
        &schema.table,
        vec![vec![SqlValue::I64(1), SqlValue::Text("target".into())]],
    );

    let job = SyncJob::new(schema.table.clone(), "server_modified_date", 10);
    h.run(&job).await.unwrap();

    let rows = h.target.rows(&schema.table);
    assert_eq!(rows[0].get("owner"), Some(&SqlValue::Text("source".into())));
}

#[tokio::test]
async fn test_composite_key_pages_over_full_tuple() {
    let h = Harness::new();
    let schema = TableSchema {
        table: TableRef::parse("ledger.entries").unwrap(),
        columns: vec![
            ColumnInfo::new("tenant", "integer", false),
            ColumnInfo::new("seq", "integer", false),
            ColumnInfo::new("amount", "numeric(12,2)", true),
        ],
        primary_key: vec!["tenant".to_string(), "seq".to_string()],
    };
    h.source.create_table(schema.clone());
    let mut rows = Vec::new();
    for tenant in 1..=3 {
        for seq in 1..=4 {
            rows.push(vec![SqlValue::I32(tenant), SqlValue::I32(seq), SqlValue::Null]);
        }
    }
    h.source.insert_rows(&schema.table, rows);

    // A chunk boundary falls in the middle of each tenant's run.
    let job = SyncJob::new(schema.table.clone(), "server_modified_date", 3);
    let report = h.run(&job).await.unwrap();

    assert_eq!(report.processed, 12);
    assert_eq!(report.batches, 4);
    assert_eq!(h.target.rows(&schema.table).len(), 12);
}

#[tokio::test]
async fn test_missing_source_table_reports_error_event() {
    let h = Harness::new();
    let mut sub = h.bus.subscribe();

    let job = SyncJob::new(TableRef::parse("ghost").unwrap(), "server_modified_date", 10);
    let err = h.run(&job).await.unwrap_err();
    assert!(!err.is_retryable());

    let errors: Vec<_> = drain(&mut sub)
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::Log(l) if l.level == LogLevel::Error => Some(l.message),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("ghost"));
}

#[tokio::test]
async fn test_progress_is_monotonic_and_ends_complete() {
    let h = Harness::new();
    let schema = accounts_schema();
    h.source.create_table(schema.clone());
    h.source.insert_rows(
        &schema.table,
        (1..=95).map(|i| vec![SqlValue::I64(i), SqlValue::Null]).collect(),
    );
    let mut sub = h.bus.subscribe();

    let job = SyncJob::new(schema.table.clone(), "server_modified_date", 10);
    h.run(&job).await.unwrap();

    let steps = progress(&drain(&mut sub));
    assert_eq!(steps.len(), 10);
    assert!(steps.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(steps.last(), Some(&(95, 95)));
    assert_eq!(h.source.open_handles() + h.target.open_handles(), 0);
}
