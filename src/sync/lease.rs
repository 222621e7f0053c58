// ABOUTME: Per-table leases so two jobs never replicate the same table at once
// ABOUTME: Leases expire after a TTL and are released when their guard drops

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::schema::TableRef;

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct Lease {
    holder: Uuid,
    expires_at: Instant,
}

/// In-process lease table keyed by table name.
#[derive(Debug)]
pub struct TableLeases {
    ttl: Duration,
    leases: Mutex<HashMap<TableRef, Lease>>,
}

impl TableLeases {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            leases: Mutex::new(HashMap::new()),
        })
    }

    /// Take the lease on `table` for `holder`.
    ///
    /// Fails with [`SyncError::LeaseHeld`] while another holder's lease is
    /// live. An expired lease is taken over.
    pub fn acquire(self: &Arc<Self>, table: &TableRef, holder: Uuid) -> Result<LeaseGuard> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some(existing) = leases.get(table) {
            if existing.holder != holder && existing.expires_at > now {
                return Err(SyncError::LeaseHeld {
                    table: table.to_string(),
                    holder: existing.holder.to_string(),
                });
            }
            if existing.holder != holder {
                tracing::warn!(
                    "Taking over expired lease on {} from job {}",
                    table,
                    existing.holder
                );
            }
        }
        leases.insert(
            table.clone(),
            Lease {
                holder,
                expires_at: now + self.ttl,
            },
        );
        Ok(LeaseGuard {
            leases: Arc::clone(self),
            table: table.clone(),
            holder,
        })
    }

    pub fn is_leased(&self, table: &TableRef) -> bool {
        self.leases
            .lock()
            .get(table)
            .is_some_and(|l| l.expires_at > Instant::now())
    }

    fn release(&self, table: &TableRef, holder: Uuid) {
        let mut leases = self.leases.lock();
        if leases.get(table).is_some_and(|l| l.holder == holder) {
            leases.remove(table);
        }
    }
}

/// Held lease; dropping it releases the table.
#[derive(Debug)]
pub struct LeaseGuard {
    leases: Arc<TableLeases>,
    table: TableRef,
    holder: Uuid,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.leases.release(&self.table, self.holder);
    }
}
