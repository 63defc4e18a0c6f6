//! Named distributed locks with expiring leases.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardingError};
use crate::unix_time_ms;

/// Proof of holding a lock. `term` increases every time the lock changes hands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub resource: String,
    pub holder: String,
    pub why: String,
    pub term: u64,
    pub acquired_unix_ms: u64,
    pub lease_until_ms: u64,
}

impl LockLease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.lease_until_ms
    }
}

/// Cluster-wide mutual exclusion keyed by resource name.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Waits up to `wait` for `resource`. Fails with
    /// [`ShardingError::LockNotAcquired`] when the wait runs out.
    async fn acquire(&self, resource: &str, why: &str, wait: Duration) -> Result<LockLease>;

    /// Releases `lease`. Releasing a lease that was already taken over is a no-op.
    async fn release(&self, lease: &LockLease) -> Result<()>;
}

#[derive(Debug, Default)]
struct LeaseTable {
    leases: BTreeMap<String, LockLease>,
    terms: BTreeMap<String, u64>,
}

/// Lease table shared by every holder created from the same manager.
///
/// Leases expire after `ttl`, after which another holder may take the lock
/// over with a higher term.
#[derive(Debug, Clone)]
pub struct InMemoryLockManager {
    table: Arc<Mutex<LeaseTable>>,
    holder: String,
    ttl: Duration,
    retry_interval: Duration,
}

impl InMemoryLockManager {
    pub fn new(holder: impl Into<String>, ttl: Duration, retry_interval: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(LeaseTable::default())),
            holder: holder.into(),
            ttl,
            retry_interval,
        }
    }

    /// Another process sharing this lease table.
    pub fn for_holder(&self, holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            ..self.clone()
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Current lease on `resource`, expired or not.
    pub fn current(&self, resource: &str) -> Result<Option<LockLease>> {
        Ok(self.table.lock()?.leases.get(resource).cloned())
    }

    fn try_acquire(&self, resource: &str, why: &str) -> Result<std::result::Result<LockLease, String>> {
        let now = unix_time_ms();
        let mut table = self.table.lock()?;
        if let Some(existing) = table.leases.get(resource) {
            if !existing.is_expired(now) {
                return Ok(Err(format!("{} ({})", existing.holder, existing.why)));
            }
            tracing::warn!(
                resource,
                previous_holder = %existing.holder,
                term = existing.term,
                "taking over expired lock lease"
            );
        }
        let term = table.terms.entry(resource.to_string()).or_insert(0);
        *term = term.saturating_add(1);
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        let lease = LockLease {
            resource: resource.to_string(),
            holder: self.holder.clone(),
            why: why.to_string(),
            term: *term,
            acquired_unix_ms: now,
            lease_until_ms: now.saturating_add(ttl_ms),
        };
        table.leases.insert(resource.to_string(), lease.clone());
        Ok(Ok(lease))
    }
}

#[async_trait]
impl DistributedLock for InMemoryLockManager {
    async fn acquire(&self, resource: &str, why: &str, wait: Duration) -> Result<LockLease> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let holder = match self.try_acquire(resource, why)? {
                Ok(lease) => {
                    tracing::debug!(resource, holder = %lease.holder, term = lease.term, why, "lock acquired");
                    return Ok(lease);
                }
                Err(holder) => holder,
            };
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ShardingError::LockNotAcquired {
                    resource: resource.to_string(),
                    why: why.to_string(),
                    holder,
                });
            }
            tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<()> {
        let mut table = self.table.lock()?;
        match table.leases.get(&lease.resource) {
            Some(current) if current.holder == lease.holder && current.term == lease.term => {
                table.leases.remove(&lease.resource);
                tracing::debug!(resource = %lease.resource, term = lease.term, "lock released");
            }
            _ => {
                tracing::warn!(
                    resource = %lease.resource,
                    term = lease.term,
                    "lock lease was lost before release"
                );
            }
        }
        Ok(())
    }
}
