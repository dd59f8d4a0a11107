//! Execution history and aggregate stats for each task. Per-firing records
//! are append-only and TTL-bounded; the "last execution" pointer and the
//! per-task aggregate are each a single key, updated by plain
//! read-modify-write (no script) — the spec accepts an occasional
//! under-count on concurrent writers here in exchange for not needing a
//! third Lua script for a non-safety-critical counter.

use crate::store::{CoordinationStore, CoordinationStoreJsonExt};
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const RECORD_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const STATS_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const HISTORY_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Written the moment a firing acquires the lock, before the body or
    /// its renewal task start, so `task_last_execution:<task>` never reads
    /// as empty while a run is in flight. Overwritten by a terminal status
    /// once the firing finishes.
    Running,
    Success,
    Failure,
    Panicked,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task: String,
    pub instance: String,
    pub started_at_unix_nanos: u128,
    pub finished_at_unix_nanos: u128,
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_run_unix_nanos: Option<u128>,
    /// Populated from the separate `task_next_run:<task>` key (see
    /// `set_next_run`/`get_next_run`), not from `record()` — the scheduler
    /// writes it once per tick, when it knows the cron timer's next fire
    /// time, which `record()` has no way to compute on its own.
    #[serde(skip)]
    pub next_run_unix_nanos: Option<u128>,
}

fn execution_key(task: &str, instance: &str, started_at_unix_nanos: u128) -> String {
    format!("task_execution:{task}:{instance}:{started_at_unix_nanos}")
}

fn last_execution_key(task: &str) -> String {
    format!("task_last_execution:{task}")
}

fn stats_key(task: &str) -> String {
    format!("task_stats:{task}")
}

fn next_run_key(task: &str) -> String {
    format!("task_next_run:{task}")
}

fn history_key(task: &str) -> String {
    format!("task_history:{task}")
}

pub fn now_unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

pub struct ExecutionRecordStore {
    store: Arc<dyn CoordinationStore>,
}

impl ExecutionRecordStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Persist a firing's record, update the last-execution pointer and
    /// capped history index, and bump the per-task aggregate. Best-effort:
    /// a failure to persist the *record* of a run is logged by the caller,
    /// never turned into a reason to retry the run itself.
    pub async fn record(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        let key = execution_key(&record.task, &record.instance, record.started_at_unix_nanos);
        self.store.set_json(&key, &record, RECORD_TTL).await?;
        self.store
            .set_json(&last_execution_key(&record.task), &record, RECORD_TTL)
            .await?;
        self.store
            .zadd_capped(
                &history_key(&record.task),
                &key,
                record.started_at_unix_nanos as f64,
                HISTORY_CAP,
                RECORD_TTL,
            )
            .await?;

        let mut stats = self
            .store
            .get_json::<TaskStats>(&stats_key(&record.task))
            .await?
            .unwrap_or_default();
        match record.status {
            ExecutionStatus::Success => stats.success_count += 1,
            ExecutionStatus::Failure | ExecutionStatus::Panicked => stats.failure_count += 1,
            ExecutionStatus::Running | ExecutionStatus::Skipped => {}
        }
        stats.last_run_unix_nanos = Some(record.started_at_unix_nanos);
        self.store.set_json(&stats_key(&record.task), &stats, STATS_TTL).await?;

        Ok(())
    }

    pub async fn stats(&self, task: &str) -> Result<TaskStats, StoreError> {
        let mut stats: TaskStats = self.store.get_json(&stats_key(task)).await?.unwrap_or_default();
        stats.next_run_unix_nanos = self.get_next_run(task).await?;
        Ok(stats)
    }

    pub async fn last_execution(&self, task: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        self.store.get_json(&last_execution_key(task)).await
    }

    /// Up to the `limit` most recent records for `task`, newest first.
    /// `limit == 0` returns the full capped history.
    pub async fn history(&self, task: &str, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError> {
        let keys = self.store.zrevrange(&history_key(task), limit).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.store.get_json(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn set_next_run(&self, task: &str, next_run_unix_nanos: u128) -> Result<(), StoreError> {
        self.store
            .set(&next_run_key(task), &next_run_unix_nanos.to_string(), STATS_TTL)
            .await
    }

    pub async fn get_next_run(&self, task: &str) -> Result<Option<u128>, StoreError> {
        Ok(self
            .store
            .get(&next_run_key(task))
            .await?
            .and_then(|raw| raw.parse().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn sample(task: &str, started: u128, status: ExecutionStatus) -> ExecutionRecord {
        ExecutionRecord {
            task: task.to_string(),
            instance: "instance-a".to_string(),
            started_at_unix_nanos: started,
            finished_at_unix_nanos: started + 1_000_000,
            status,
            error: None,
        }
    }

    fn store() -> ExecutionRecordStore {
        ExecutionRecordStore::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn recording_updates_last_execution_and_stats() {
        let store = store();
        store.record(sample("ingest", 1, ExecutionStatus::Success)).await.unwrap();
        store.record(sample("ingest", 2, ExecutionStatus::Failure)).await.unwrap();

        let last = store.last_execution("ingest").await.unwrap().unwrap();
        assert_eq!(last.started_at_unix_nanos, 2);

        let stats = store.stats("ingest").await.unwrap();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test]
    async fn history_returns_newest_first() {
        let store = store();
        for i in 1..=3u128 {
            store.record(sample("ingest", i, ExecutionStatus::Success)).await.unwrap();
        }
        let history = store.history("ingest", 0).await.unwrap();
        let started: Vec<u128> = history.iter().map(|r| r.started_at_unix_nanos).collect();
        assert_eq!(started, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn stats_reports_the_next_run_once_it_is_set() {
        let store = store();
        store.record(sample("ingest", 1, ExecutionStatus::Success)).await.unwrap();
        assert_eq!(store.stats("ingest").await.unwrap().next_run_unix_nanos, None);

        store.set_next_run("ingest", 99).await.unwrap();
        let stats = store.stats("ingest").await.unwrap();
        assert_eq!(stats.next_run_unix_nanos, Some(99));
        assert_eq!(stats.success_count, 1);
    }

    #[tokio::test]
    async fn a_running_record_does_not_count_toward_success_or_failure() {
        let store = store();
        store.record(sample("ingest", 1, ExecutionStatus::Running)).await.unwrap();
        let stats = store.stats("ingest").await.unwrap();
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(
            store.last_execution("ingest").await.unwrap().unwrap().status,
            ExecutionStatus::Running
        );
    }

    #[tokio::test]
    async fn next_run_round_trips() {
        let store = store();
        assert_eq!(store.get_next_run("ingest").await.unwrap(), None);
        store.set_next_run("ingest", 12345).await.unwrap();
        assert_eq!(store.get_next_run("ingest").await.unwrap(), Some(12345));
    }
}
