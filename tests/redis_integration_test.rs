// ABOUTME: Integration tests for the Redis event bus against a live server
// ABOUTME: Needs TEST_REDIS_URL; run with --ignored

use std::env;
use std::time::Duration;

use table_replicator::events::{EventBus, RedisEventBus, Subscription, SyncEvent};
use tokio::time::{timeout, Instant};

/// Helper to get the test Redis URL from environment
fn get_redis_url() -> String {
    env::var("TEST_REDIS_URL").expect("TEST_REDIS_URL must be set")
}

fn test_channel(suffix: &str) -> String {
    format!("replicator_test_{}_{}", suffix, uuid::Uuid::new_v4().simple())
}

/// Publish `event` every 200ms until `sub` receives a matching one.
async fn publish_until_seen(bus: &RedisEventBus, sub: &mut Subscription, event: SyncEvent, within: Duration) {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        bus.publish(event.clone());
        if let Ok(Some(received)) = timeout(Duration::from_millis(200), sub.recv()).await {
            if received == event {
                return;
            }
        }
    }
    panic!("event not relayed within {:?}", within);
}

/// Test: events cross between two buses on the same channel
#[tokio::test]
#[ignore]
async fn test_events_reach_other_process_bus() {
    let url = get_redis_url();
    let channel = test_channel("fanout");
    let sender = RedisEventBus::connect(&url, &channel, 64)
        .await
        .expect("Failed to connect sender");
    let receiver = RedisEventBus::connect(&url, &channel, 64)
        .await
        .expect("Failed to connect receiver");
    let mut sub = receiver.subscribe();

    sender.publish(SyncEvent::progress("public.accounts", 1, 2));
    let event = timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for event");
    assert_eq!(event, Some(SyncEvent::progress("public.accounts", 1, 2)));
}

/// Test: a killed subscription is re-established and relaying resumes
#[tokio::test]
#[ignore]
async fn test_relay_resubscribes_after_connection_loss() {
    let url = get_redis_url();
    let channel = test_channel("resubscribe");
    let bus = RedisEventBus::connect(&url, &channel, 64)
        .await
        .expect("Failed to connect bus");
    let mut sub = bus.subscribe();

    publish_until_seen(&bus, &mut sub, SyncEvent::progress("t", 1, 3), Duration::from_secs(5)).await;

    let client = redis::Client::open(url.as_str()).unwrap();
    let mut admin = client.get_connection_manager().await.unwrap();
    let killed: redis::RedisResult<i64> = redis::cmd("CLIENT")
        .arg("KILL")
        .arg("TYPE")
        .arg("pubsub")
        .query_async(&mut admin)
        .await;
    assert!(killed.expect("CLIENT KILL failed") >= 1);

    publish_until_seen(&bus, &mut sub, SyncEvent::progress("t", 2, 3), Duration::from_secs(15)).await;
}
