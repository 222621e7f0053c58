// ABOUTME: Event fan-out behaviour across observers and over the TCP stream
// ABOUTME: Slow observers are evicted without disturbing the others

use std::sync::Arc;
use std::time::Duration;

use table_replicator::events::{Broadcaster, EventBus, SyncEvent};
use table_replicator::queue::{JobQueue, QueueConfig};
use table_replicator::row::SqlValue;
use table_replicator::schema::{ColumnInfo, TableRef, TableSchema};
use table_replicator::server::{serve_events, serve_submissions};
use table_replicator::store::{MemoryConnector, MemoryStore};
use table_replicator::sync::JobRunner;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

async fn wait_for_subscribers(bus: &Broadcaster, n: usize) {
    for _ in 0..200 {
        if bus.subscriber_count() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} subscribers, have {}", n, bus.subscriber_count());
}

#[tokio::test]
async fn test_slow_observer_is_evicted_fast_one_sees_everything() {
    let bus = Broadcaster::new(4);
    let mut fast = bus.subscribe();
    let mut slow = bus.subscribe();

    let mut received = Vec::new();
    for n in 1..=20u64 {
        bus.publish(SyncEvent::progress("public.accounts", n, 20));
        // The fast observer keeps up; the slow one never reads.
        while let Some(event) = fast.try_recv() {
            received.push(event);
        }
    }

    assert_eq!(received.len(), 20);
    assert_eq!(received[19], SyncEvent::progress("public.accounts", 20, 20));
    assert_eq!(bus.subscriber_count(), 1);

    // The slow observer drains what it buffered, then sees the end.
    let mut buffered = 0;
    while slow.recv().await.is_some() {
        buffered += 1;
    }
    assert_eq!(buffered, 4);
}

#[tokio::test]
async fn test_late_subscriber_gets_no_replay() {
    let bus = Broadcaster::default();
    bus.publish(SyncEvent::progress("t", 1, 2));
    let mut sub = bus.subscribe();
    bus.publish(SyncEvent::progress("t", 2, 2));

    assert_eq!(sub.try_recv(), Some(SyncEvent::progress("t", 2, 2)));
    assert_eq!(sub.try_recv(), None);
}

#[tokio::test]
async fn test_event_server_streams_json_lines() {
    let bus = Arc::new(Broadcaster::new(64));
    let server = serve_events("127.0.0.1:0".parse().unwrap(), bus.clone())
        .await
        .unwrap();

    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    wait_for_subscribers(&bus, 1).await;

    bus.publish(SyncEvent::progress("public.accounts", 10_000, 25_000));
    bus.publish(SyncEvent::log(
        "public.accounts",
        table_replicator::events::LogLevel::Info,
        "created target table",
    ));

    let mut lines = BufReader::new(stream).lines();
    let first = lines.next_line().await.unwrap().unwrap();
    assert_eq!(
        first,
        r#"{"kind":"progress","table_name":"public.accounts","processed":10000,"total":25000}"#
    );
    let second: SyncEvent = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(second.table_name(), "public.accounts");

    // Disconnecting unsubscribes the client on the next publish.
    drop(lines);
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.publish(SyncEvent::progress("public.accounts", 25_000, 25_000));
    wait_for_subscribers(&bus, 0).await;
    server.stop().await;
}

#[tokio::test]
async fn test_submission_server_queues_jobs_and_events_follow() {
    let schema = TableSchema {
        table: TableRef::parse("invoices").unwrap(),
        columns: vec![
            ColumnInfo::new("id", "integer", false),
            ColumnInfo::new("amount", "numeric", true),
        ],
        primary_key: vec!["id".to_string()],
    };
    let source = MemoryStore::new();
    source.create_table(schema.clone());
    source.insert_rows(
        &schema.table,
        (1..=5).map(|i| vec![SqlValue::I32(i), SqlValue::Null]).collect(),
    );
    let target = MemoryStore::new();

    let bus = Arc::new(Broadcaster::new(64));
    let runner = JobRunner::new(MemoryConnector::new(source, target.clone()), bus.clone());
    let queue = Arc::new(JobQueue::start(runner, QueueConfig::default()));
    let mut events = bus.subscribe();

    let server = serve_submissions("127.0.0.1:0".parse().unwrap(), queue.clone())
        .await
        .unwrap();
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut replies = BufReader::new(reader).lines();

    writer
        .write_all(b"{\"table_name\":\"invoices\"}\nnot json\n")
        .await
        .unwrap();

    let accepted: serde_json::Value =
        serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(accepted["table_name"], "public.invoices");
    assert!(accepted["job_id"].as_str().is_some());

    let rejected: serde_json::Value =
        serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
    assert!(rejected["error"]
        .as_str()
        .unwrap()
        .starts_with("invalid request"));

    loop {
        match events.recv().await {
            Some(SyncEvent::Progress(p)) if p.processed == p.total => {
                assert_eq!(p.total, 5);
                break;
            }
            Some(_) => continue,
            None => panic!("event stream closed early"),
        }
    }

    server.stop().await;
    queue.shutdown().await;
    assert_eq!(target.rows(&schema.table).len(), 5);
}
