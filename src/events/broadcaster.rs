// ABOUTME: In-process event broadcaster with a bounded mailbox per subscriber
// ABOUTME: Slow subscribers are unsubscribed instead of blocking the publisher

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{EventBus, Subscription, SyncEvent};

struct Mailbox {
    id: u64,
    tx: mpsc::Sender<SyncEvent>,
}

pub struct Broadcaster {
    capacity: usize,
    mailboxes: Mutex<Vec<Mailbox>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            mailboxes: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.mailboxes.lock().len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(super::DEFAULT_MAILBOX)
    }
}

impl EventBus for Broadcaster {
    fn publish(&self, event: SyncEvent) {
        let mut mailboxes = self.mailboxes.lock();
        mailboxes.retain(|mailbox| match mailbox.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Dropping subscriber {}: mailbox full", mailbox.id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.mailboxes.lock().push(Mailbox { id, tx });
        Subscription::new(id, rx)
    }
}
