use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::domain::types::{ExternalSubscriptionId, OrganizationId};

/// Serialization key: one subscription of one organization
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub organization_id: OrganizationId,
    pub external_subscription_id: ExternalSubscriptionId,
}

impl LockKey {
    pub fn new(
        organization_id: OrganizationId,
        external_subscription_id: &ExternalSubscriptionId,
    ) -> Self {
        Self {
            organization_id,
            external_subscription_id: external_subscription_id.clone(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization_id, self.external_subscription_id)
    }
}

/// Held for the duration of aggregation and fee work on one subscription
#[derive(Debug)]
pub struct SubscriptionGuard {
    key: LockKey,
    _guard: OwnedMutexGuard<()>,
}

impl SubscriptionGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        trace!("Released subscription lock {}", self.key);
    }
}

/// Per-subscription mutual exclusion; different subscriptions never contend
#[derive(Clone, Default)]
pub struct SubscriptionLocks {
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl SubscriptionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: LockKey) -> SubscriptionGuard {
        // Clone the mutex out so the shard lock is not held across the await
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        trace!("Acquired subscription lock {}", key);
        SubscriptionGuard { key, _guard: guard }
    }

    /// Drops idle entries; a lock is idle when nobody holds or awaits it
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
