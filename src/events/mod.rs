// ABOUTME: Progress and log events published while jobs run
// ABOUTME: Defines the wire format and the EventBus seam with its subscriptions

pub mod broadcaster;
pub mod pubsub;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub use broadcaster::Broadcaster;
pub use pubsub::RedisEventBus;

/// Channel name used for cross-process fan-out.
pub const DEFAULT_CHANNEL: &str = "sync_events";

/// Default per-subscriber mailbox capacity.
pub const DEFAULT_MAILBOX: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub table_name: String,
    pub processed: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub table_name: String,
    pub level: LogLevel,
    pub message: String,
}

/// One line of the event stream.
///
/// Serialized as a flat JSON object tagged by `kind`:
///
/// ```json
/// {"kind":"progress","table_name":"public.accounts","processed":10000,"total":25000}
/// {"kind":"log","table_name":"public.accounts","level":"warning","message":"..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncEvent {
    Progress(ProgressEvent),
    Log(LogEvent),
}

impl SyncEvent {
    pub fn progress(table_name: impl Into<String>, processed: u64, total: u64) -> Self {
        Self::Progress(ProgressEvent {
            table_name: table_name.into(),
            processed,
            total,
        })
    }

    pub fn log(table_name: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log(LogEvent {
            table_name: table_name.into(),
            level,
            message: message.into(),
        })
    }

    pub fn table_name(&self) -> &str {
        match self {
            Self::Progress(p) => &p.table_name,
            Self::Log(l) => &l.table_name,
        }
    }

    /// JSON encoding terminated by a newline.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Receiving end of one observer's bounded mailbox.
///
/// Yields events in publish order. Returns `None` once the observer has been
/// dropped by the bus (mailbox overflow) and the buffered events are drained.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<SyncEvent>,
}

impl Subscription {
    pub(crate) fn new(id: u64, rx: mpsc::Receiver<SyncEvent>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<SyncEvent> {
        ReceiverStream::new(self.rx)
    }
}

/// Fan-out of job events to any number of observers.
///
/// `publish` never blocks and never fails the caller: an observer whose
/// mailbox is full is unsubscribed instead.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: SyncEvent);

    /// New observer starting from the next published event (no replay).
    fn subscribe(&self) -> Subscription;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_wire_format() {
        let line = SyncEvent::progress("public.accounts", 10000, 25000)
            .to_json_line()
            .unwrap();
        assert_eq!(
            line,
            "{\"kind\":\"progress\",\"table_name\":\"public.accounts\",\"processed\":10000,\"total\":25000}\n"
        );
    }

    #[test]
    fn test_log_wire_format() {
        let event = SyncEvent::log("public.flags", LogLevel::Warning, "retry 1/5 in 30s");
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "log");
        assert_eq!(value["level"], "warning");
        assert_eq!(value["table_name"], "public.flags");
    }

    #[test]
    fn test_event_parses_back() {
        let raw = r#"{"kind":"log","table_name":"t","level":"error","message":"boom"}"#;
        let event: SyncEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event, SyncEvent::log("t", LogLevel::Error, "boom"));
        assert_eq!(event.table_name(), "t");
    }
}
