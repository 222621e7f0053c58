// ABOUTME: Cross-process event bus over Redis pub/sub
// ABOUTME: Publishes JSON events to a channel and relays the channel into local mailboxes

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::{Broadcaster, EventBus, Subscription, SyncEvent};
use crate::error::Result;

/// Outbound events buffered while the publisher task talks to Redis.
const PUBLISH_QUEUE: usize = 4096;

const RESUBSCRIBE_MIN_DELAY: Duration = Duration::from_secs(1);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

/// Event bus shared by every process subscribed to the same Redis channel.
///
/// Published events go out through a background task, so `publish` stays
/// non-blocking; a second task listens on the channel and feeds a local
/// [`Broadcaster`], which applies the same bounded-mailbox policy to local
/// observers. Events from other processes reach local observers too.
///
/// A dropped subscription is re-established with exponential backoff;
/// events published on the channel while it is down are not seen.
pub struct RedisEventBus {
    local: Arc<Broadcaster>,
    outbound: mpsc::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl RedisEventBus {
    pub async fn connect(url: &str, channel: &str, mailbox: usize) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        let pubsub = subscribe(&client, channel).await?;

        let local = Arc::new(Broadcaster::new(mailbox));
        let (outbound, rx) = mpsc::channel(PUBLISH_QUEUE);

        let publisher = tokio::spawn(run_publisher(conn, channel.to_string(), rx));
        let relay = tokio::spawn(run_relay(client, channel.to_string(), pubsub, local.clone()));

        tracing::info!("Publishing events to Redis channel '{}'", channel);

        Ok(Self {
            local,
            outbound,
            tasks: vec![publisher, relay],
        })
    }
}

async fn subscribe(client: &redis::Client, channel: &str) -> redis::RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

/// Decode one channel payload; malformed payloads are logged and skipped.
fn decode_event(payload: &str) -> Option<SyncEvent> {
    match serde_json::from_str::<SyncEvent>(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("Ignoring malformed event: {}", e);
            None
        }
    }
}

fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(RESUBSCRIBE_MAX_DELAY)
}

/// Feed channel messages into `local` for as long as the bus lives,
/// resubscribing whenever the subscription ends.
async fn run_relay(client: redis::Client, channel: String, mut pubsub: PubSub, local: Arc<Broadcaster>) {
    let mut delay = RESUBSCRIBE_MIN_DELAY;
    loop {
        {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                delay = RESUBSCRIBE_MIN_DELAY;
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if let Some(event) = decode_event(&payload) {
                            local.publish(event);
                        }
                    }
                    Err(e) => tracing::warn!("Ignoring undecodable event payload: {}", e),
                }
            }
        }
        tracing::warn!("Subscription to '{}' closed, resubscribing", channel);

        pubsub = loop {
            tokio::time::sleep(delay).await;
            delay = next_delay(delay);
            match subscribe(&client, &channel).await {
                Ok(pubsub) => break pubsub,
                Err(e) => tracing::warn!(
                    "Failed to resubscribe to '{}', retrying in {:?}: {}",
                    channel,
                    delay,
                    e
                ),
            }
        };
        tracing::info!("Resubscribed to Redis channel '{}'", channel);
    }
}

async fn run_publisher(mut conn: ConnectionManager, channel: String, mut rx: mpsc::Receiver<String>) {
    while let Some(payload) = rx.recv().await {
        let sent: redis::RedisResult<i64> = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(e) = sent {
            tracing::warn!("Failed to publish event to '{}': {}", channel, e);
        }
    }
}

impl EventBus for RedisEventBus {
    fn publish(&self, event: SyncEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to encode event: {}", e);
                return;
            }
        };
        match self.outbound.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Event publish queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Event publisher stopped, dropping event");
            }
        }
    }

    fn subscribe(&self) -> Subscription {
        self.local.subscribe()
    }
}

impl Drop for RedisEventBus {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogLevel;

    #[test]
    fn test_decode_event_accepts_both_kinds() {
        assert_eq!(
            decode_event(r#"{"kind":"progress","table_name":"public.a","processed":3,"total":9}"#),
            Some(SyncEvent::progress("public.a", 3, 9))
        );
        assert_eq!(
            decode_event(r#"{"kind":"log","table_name":"public.a","level":"error","message":"boom"}"#),
            Some(SyncEvent::log("public.a", LogLevel::Error, "boom"))
        );
    }

    #[test]
    fn test_decode_event_skips_malformed_payloads() {
        assert_eq!(decode_event("not json"), None);
        assert_eq!(decode_event(r#"{"kind":"heartbeat","table_name":"t"}"#), None);
        assert_eq!(decode_event(r#"{"kind":"progress","table_name":"t"}"#), None);
    }

    #[test]
    fn test_resubscribe_delay_doubles_up_to_cap() {
        let mut delay = RESUBSCRIBE_MIN_DELAY;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = next_delay(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
