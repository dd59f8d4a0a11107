//! Owner-fenced, TTL-bounded distributed lock over a [`CoordinationStore`].
//!
//! One lock entry per task (`distributed_lock:<task>`), value = the
//! acquiring instance's id. Release and renewal are both conditioned on the
//! caller still being the recorded owner, so a lock that outlived its
//! owner (TTL expiry during a GC pause, a lost renewal race) can never be
//! silently stolen back or torn down by the original holder once someone
//! else has it.

use crate::store::CoordinationStore;
use crate::StoreError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

fn lock_key(task: &str) -> String {
    format!("distributed_lock:{task}")
}

pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Attempt to acquire the lock for `task` on behalf of `owner`. Returns
    /// `false` (not an error) when another instance already holds it —
    /// losing the race is the expected, common case in a healthy fleet.
    pub async fn try_acquire(&self, task: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = lock_key(task);
        let acquired = self.store.set_if_absent(&key, owner, ttl).await?;
        if !acquired {
            debug!(task, owner, "lock contested, another instance holds it");
        }
        Ok(acquired)
    }

    /// Extend the lock's TTL, but only if `owner` still holds it. Returns
    /// `false` if ownership was lost (TTL expired and someone else grabbed
    /// it, or it was released out from under us).
    pub async fn renew(&self, task: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = lock_key(task);
        self.store.compare_and_expire(&key, owner, ttl).await
    }

    /// Release the lock, but only if `owner` still holds it. Never errors
    /// the caller's control flow over a lock we no longer own — that's
    /// already the steady state after a lost renewal, and is logged, not
    /// propagated.
    pub async fn release(&self, task: &str, owner: &str) {
        let key = lock_key(task);
        match self.store.compare_and_delete(&key, owner).await {
            Ok(true) => debug!(task, owner, "lock released"),
            Ok(false) => debug!(task, owner, "release skipped, no longer the owner"),
            Err(error) => warn!(task, owner, %error, "lock release failed"),
        }
    }

    /// Current holder (if any) and whether it's live.
    pub async fn is_held(&self, task: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&lock_key(task)).await
    }

    pub async fn lock_ttl(&self, task: &str) -> Result<Option<Duration>, StoreError> {
        self.store.ttl(&lock_key(task)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn lock() -> DistributedLock {
        DistributedLock::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn second_instance_cannot_acquire_a_held_lock() {
        let lock = lock();
        assert!(lock.try_acquire("ingest", "instance-a", Duration::from_secs(30)).await.unwrap());
        assert!(!lock.try_acquire("ingest", "instance-b", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn renew_fails_for_a_non_owner() {
        let lock = lock();
        lock.try_acquire("ingest", "instance-a", Duration::from_secs(30)).await.unwrap();
        assert!(!lock.renew("ingest", "instance-b", Duration::from_secs(30)).await.unwrap());
        assert!(lock.renew("ingest", "instance-a", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn release_by_non_owner_is_a_noop() {
        let lock = lock();
        lock.try_acquire("ingest", "instance-a", Duration::from_secs(30)).await.unwrap();
        lock.release("ingest", "instance-b").await;
        assert_eq!(lock.is_held("ingest").await.unwrap(), Some("instance-a".to_string()));
        lock.release("ingest", "instance-a").await;
        assert_eq!(lock.is_held("ingest").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lock_can_be_reacquired_once_released() {
        let lock = lock();
        lock.try_acquire("ingest", "instance-a", Duration::from_secs(30)).await.unwrap();
        lock.release("ingest", "instance-a").await;
        assert!(lock.try_acquire("ingest", "instance-b", Duration::from_secs(30)).await.unwrap());
    }
}
