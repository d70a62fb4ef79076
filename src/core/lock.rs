//! Resource lock table.
//!
//! At most one workflow holds a resource at a time. Acquisition never
//! blocks: contention is reported immediately so the caller can defer.
//! Locks carry a lease and are treated as free once it expires.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Mutual-exclusion token for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_id: String,
    pub holder_workflow_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResourceLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The resource is held by another workflow; a deferral signal, not a failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("resource '{resource_id}' is held by workflow {holder}")]
pub struct LockContention {
    pub resource_id: String,
    pub holder: Uuid,
}

/// Sharded lock table keyed by resource id
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<String, ResourceLock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire without blocking. Any unexpired hold is contention.
    pub fn try_acquire(
        &self,
        resource_id: &str,
        holder: Uuid,
        lease: Duration,
    ) -> Result<ResourceLock, LockContention> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1));
        let lock = ResourceLock {
            resource_id: resource_id.to_string(),
            holder_workflow_id: holder,
            acquired_at: now,
            expires_at: now + lease,
        };

        match self.locks.entry(resource_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if !current.is_expired(now) {
                    return Err(LockContention {
                        resource_id: resource_id.to_string(),
                        holder: current.holder_workflow_id,
                    });
                }
                warn!(
                    resource_id,
                    stale_holder = %current.holder_workflow_id,
                    "Reclaiming expired resource lock"
                );
                occupied.insert(lock.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lock.clone());
            }
        }

        debug!(resource_id, holder = %holder, "Resource lock acquired");
        Ok(lock)
    }

    /// Release a lock if `holder` still owns it
    pub fn release(&self, resource_id: &str, holder: Uuid) -> bool {
        let released = self
            .locks
            .remove_if(resource_id, |_, lock| lock.holder_workflow_id == holder)
            .is_some();
        if released {
            debug!(resource_id, holder = %holder, "Resource lock released");
        }
        released
    }

    /// Hand a held lock over to another workflow id
    pub fn rebind(&self, resource_id: &str, from: Uuid, to: Uuid) -> bool {
        match self.locks.get_mut(resource_id) {
            Some(mut lock) if lock.holder_workflow_id == from => {
                lock.holder_workflow_id = to;
                true
            }
            _ => false,
        }
    }

    /// Current holder, ignoring expired leases
    pub fn holder(&self, resource_id: &str) -> Option<Uuid> {
        self.get(resource_id).map(|lock| lock.holder_workflow_id)
    }

    /// Current unexpired lock on a resource
    pub fn get(&self, resource_id: &str) -> Option<ResourceLock> {
        let now = Utc::now();
        self.locks
            .get(resource_id)
            .filter(|lock| !lock.is_expired(now))
            .map(|lock| lock.clone())
    }

    /// Drop expired leases, returning them
    pub fn purge_expired(&self) -> Vec<ResourceLock> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|resource| {
                self.locks
                    .remove_if(&resource, |_, lock| lock.is_expired(now))
                    .map(|(_, lock)| lock)
            })
            .collect()
    }

    /// Reinstate a lock loaded from the journal
    pub fn restore(&self, lock: ResourceLock) {
        self.locks.insert(lock.resource_id.clone(), lock);
    }

    /// Number of held (possibly expired) locks
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
