//! Fleet membership: each running process registers itself, heartbeats on
//! an interval, and is swept out of the active set by any instance once its
//! entry goes TTL-stale. There is no central coordinator — membership is
//! just the reachable set of live `cron_instance:<id>` keys.

use crate::store::{CoordinationStore, CoordinationStoreJsonExt};
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ACTIVE_SET_KEY: &str = "cron_active_instances";
const MAX_CONSECUTIVE_HEARTBEAT_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub instance_id: String,
    pub host: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
    pub version: String,
    pub task_names: Vec<String>,
}

fn instance_key(instance_id: &str) -> String {
    format!("cron_instance:{instance_id}")
}

/// Generate a process-unique instance id: hostname, pid, and the epoch
/// second this process started, so a restarted process on the same host
/// never collides with its predecessor's still-draining lock ownership.
pub fn generate_instance_id() -> String {
    let host = hostname();
    format!("{host}-{}-{}", process::id(), Utc::now().timestamp())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

pub struct InstanceRegistry {
    store: Arc<dyn CoordinationStore>,
    instance_id: String,
    version: String,
    entry_ttl: Duration,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, instance_id: String, version: String, entry_ttl: Duration) -> Self {
        Self {
            store,
            instance_id,
            version,
            entry_ttl,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Write this instance's entry and add it to the active set.
    pub async fn register(&self, task_names: Vec<String>) -> Result<(), StoreError> {
        let now = Utc::now();
        let entry = InstanceEntry {
            instance_id: self.instance_id.clone(),
            host: hostname(),
            pid: process::id(),
            started_at: now,
            last_heartbeat: now,
            status: InstanceStatus::Running,
            version: self.version.clone(),
            task_names,
        };
        self.store
            .set_json(&instance_key(&self.instance_id), &entry, self.entry_ttl)
            .await?;
        self.store.set_add(ACTIVE_SET_KEY, &self.instance_id).await?;
        info!(instance = %self.instance_id, "instance registered");
        Ok(())
    }

    async fn heartbeat_once(&self) -> Result<(), StoreError> {
        let key = instance_key(&self.instance_id);
        let Some(mut entry) = self.store.get_json::<InstanceEntry>(&key).await? else {
            return Ok(());
        };
        entry.last_heartbeat = Utc::now();
        self.store.set_json(&key, &entry, self.entry_ttl).await?;
        Ok(())
    }

    /// Mark this instance's entry `Failed` in place, without removing it
    /// from the active set — a failed instance is still visible to
    /// observers until its entry goes TTL-stale and `sweep_dead` drops it.
    async fn mark_failed(&self) -> Result<(), StoreError> {
        let key = instance_key(&self.instance_id);
        let Some(mut entry) = self.store.get_json::<InstanceEntry>(&key).await? else {
            return Ok(());
        };
        entry.status = InstanceStatus::Failed;
        self.store.set_json(&key, &entry, self.entry_ttl).await?;
        warn!(instance = %self.instance_id, "instance marked failed");
        Ok(())
    }

    /// Spawn a background task that heartbeats this instance's entry on
    /// `interval` until `shutdown` is cancelled. After
    /// `MAX_CONSECUTIVE_HEARTBEAT_FAILURES` failed heartbeats in a row, the
    /// instance marks itself `Failed` and stops trying — at that point its
    /// lease is as good as expired, so continuing to retry in a loop that
    /// can't reach the store serves no one.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut consecutive_failures = 0u32;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match registry.heartbeat_once().await {
                            Ok(()) => consecutive_failures = 0,
                            Err(error) => {
                                consecutive_failures += 1;
                                warn!(instance = %registry.instance_id, %error, consecutive_failures, "heartbeat failed");
                                if consecutive_failures >= MAX_CONSECUTIVE_HEARTBEAT_FAILURES {
                                    if let Err(error) = registry.mark_failed().await {
                                        warn!(instance = %registry.instance_id, %error, "failed to record failed status");
                                    }
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Remove this instance from the active set and mark its entry stopped.
    pub async fn unregister(&self) -> Result<(), StoreError> {
        self.store.set_remove(ACTIVE_SET_KEY, &self.instance_id).await?;
        self.store.delete(&[&instance_key(&self.instance_id)]).await?;
        info!(instance = %self.instance_id, "instance unregistered");
        Ok(())
    }

    /// Instances listed in the active set whose entry is still live.
    pub async fn active_instances(&self) -> Result<Vec<InstanceEntry>, StoreError> {
        let ids = self.store.set_members(ACTIVE_SET_KEY).await?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.store.get_json::<InstanceEntry>(&instance_key(&id)).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn instance_count(&self) -> Result<usize, StoreError> {
        Ok(self.active_instances().await?.len())
    }

    /// Drop any active-set member whose entry has expired (missed its
    /// heartbeat for longer than `entry_ttl`). Idempotent — any instance
    /// can run this, and running it twice concurrently is harmless.
    pub async fn sweep_dead(&self) -> Result<usize, StoreError> {
        let ids = self.store.set_members(ACTIVE_SET_KEY).await?;
        let mut swept = 0;
        for id in ids {
            if !self.store.exists(&instance_key(&id)).await? {
                self.store.set_remove(ACTIVE_SET_KEY, &id).await?;
                debug!(instance = %id, "swept dead instance from active set");
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Spawn a background task that sweeps the active set on `interval`
    /// until `shutdown` is cancelled.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match registry.sweep_dead().await {
                            Ok(0) => {}
                            Ok(n) => info!(swept = n, "swept dead instances"),
                            Err(error) => warn!(%error, "sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn registry(id: &str) -> Arc<InstanceRegistry> {
        Arc::new(InstanceRegistry::new(
            Arc::new(InMemoryStore::new()),
            id.to_string(),
            "test".to_string(),
            Duration::from_secs(30),
        ))
    }

    #[tokio::test]
    async fn register_adds_to_active_set_and_is_queryable() {
        let registry = registry("instance-a");
        registry.register(vec!["ingest".to_string()]).await.unwrap();
        let active = registry.active_instances().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].instance_id, "instance-a");
        assert_eq!(active[0].task_names, vec!["ingest".to_string()]);
    }

    #[tokio::test]
    async fn unregister_removes_from_active_set() {
        let registry = registry("instance-a");
        registry.register(vec![]).await.unwrap();
        registry.unregister().await.unwrap();
        assert_eq!(registry.instance_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_dead_drops_members_with_no_live_entry() {
        let store = Arc::new(InMemoryStore::new());
        store.set_add("cron_active_instances", "ghost").await.unwrap();
        let registry = Arc::new(InstanceRegistry::new(
            store,
            "instance-a".to_string(),
            "test".to_string(),
            Duration::from_secs(30),
        ));
        registry.register(vec![]).await.unwrap();
        let swept = registry.sweep_dead().await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(registry.instance_count().await.unwrap(), 1);
    }
}
