//! Read-only query surface: everything an external collaborator (an admin
//! panel, a health check) needs to observe the fleet's state. Pure
//! functions over the other components' handles — no independent state of
//! its own.

use crate::records::{ExecutionRecord, TaskStats};
use crate::registry::InstanceEntry;
use crate::scheduler::Scheduler;
use crate::StoreError;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub instance_id: String,
    pub enabled: bool,
    pub task_count: usize,
    pub instance_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub name: String,
    /// Empty when no instance this process knows of carries a binding for
    /// `name` locally (e.g. it only ever saw another instance's entry).
    pub description: String,
    /// Every active instance id whose registry entry lists this task.
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub store_reachable: bool,
    pub instance_count: usize,
}

impl<S: Send + Sync + 'static> Scheduler<S> {
    /// A one-shot snapshot of this instance's view of the fleet.
    pub async fn status(&self) -> Result<Status, StoreError> {
        Ok(Status {
            instance_id: self.instance_id().to_string(),
            enabled: self.config.enabled,
            task_count: self.bindings.len(),
            instance_count: self.registry.instance_count().await?,
        })
    }

    /// Every instance currently in the active set.
    pub async fn instances(&self) -> Result<Vec<InstanceEntry>, StoreError> {
        self.registry.active_instances().await
    }

    /// The union of task names across every active instance in the fleet,
    /// each paired with the instance ids currently hosting it — built from
    /// the registry's `active_instances()`, not this process's own
    /// bindings, since two instances need not register the same task set.
    pub async fn tasks(&self) -> Result<Vec<TaskInfo>, StoreError> {
        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for instance in self.registry.active_instances().await? {
            for task_name in instance.task_names {
                by_name.entry(task_name).or_default().push(instance.instance_id.clone());
            }
        }
        Ok(by_name
            .into_iter()
            .map(|(name, instance_ids)| {
                let description = self
                    .bindings
                    .get(&name)
                    .map(|binding| binding.task.description.clone())
                    .unwrap_or_default();
                TaskInfo {
                    name,
                    description,
                    instance_ids,
                }
            })
            .collect())
    }

    pub async fn task_stats(&self, task: &str) -> Result<TaskStats, StoreError> {
        self.records.stats(task).await
    }

    pub async fn task_history(&self, task: &str, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.records.history(task, limit).await
    }

    /// Cheap liveness probe: can we still reach the coordination store, and
    /// how many instances does it currently know about.
    pub async fn health(&self) -> Health {
        match self.registry.instance_count().await {
            Ok(count) => Health {
                store_reachable: true,
                instance_count: count,
            },
            Err(_) => Health {
                store_reachable: false,
                instance_count: 0,
            },
        }
    }
}
