//! Binds [`Task`]s to their [`Schedule`]s and drives the
//! contest → renew → execute → record → release lifecycle on every firing.
//!
//! Grounded on `kernel/scheduled_tasks.rs`'s `JobScheduler` wiring for the
//! timer side, and `JobWorker::execute_with_heartbeat`'s
//! spawn-a-parallel-renewal-task shape for the lock-renewal side.

use crate::error::ConfigError;
use crate::lock::DistributedLock;
use crate::records::{ExecutionRecord, ExecutionRecordStore, ExecutionStatus};
use crate::registry::{generate_instance_id, InstanceRegistry};
use crate::store::CoordinationStore;
use crate::task::{Schedule, Task, TaskContext};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, TypedBuilder)]
pub struct SchedulerConfig {
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default = Duration::from_secs(30))]
    pub lock_ttl: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub heartbeat_interval: Duration,
    #[builder(default = Duration::from_secs(60))]
    pub cleanup_interval: Duration,
    #[builder(default = Duration::from_secs(60))]
    pub drain_timeout: Duration,
    #[builder(default = env!("CARGO_PKG_VERSION").to_string())]
    pub version: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<&crate::config::Config> for SchedulerConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            enabled: config.enabled,
            lock_ttl: config.lock_ttl,
            heartbeat_interval: config.heartbeat_interval,
            cleanup_interval: config.cleanup_interval,
            drain_timeout: config.drain_timeout,
            version: config.version.clone(),
        }
    }
}

pub(crate) struct Binding<S> {
    pub(crate) task: Task<S>,
    pub(crate) schedule: Schedule,
}

/// The scheduler/worker: one per process, parameterized over the ambient
/// services type `S` every task's run function receives.
pub struct Scheduler<S> {
    pub(crate) store: Arc<dyn CoordinationStore>,
    pub(crate) lock: Arc<DistributedLock>,
    pub(crate) records: Arc<ExecutionRecordStore>,
    pub(crate) registry: Arc<InstanceRegistry>,
    services: Arc<S>,
    pub(crate) config: SchedulerConfig,
    pub(crate) bindings: HashMap<String, Binding<S>>,
    overlap_guards: HashMap<String, Arc<AsyncMutex<()>>>,
    cron: Option<JobScheduler>,
    shutdown: CancellationToken,
    heartbeat_handle: Option<tokio::task::JoinHandle<()>>,
    sweeper_handle: Option<tokio::task::JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
}

impl<S: Send + Sync + 'static> Scheduler<S> {
    pub fn new(store: Arc<dyn CoordinationStore>, services: Arc<S>, config: SchedulerConfig) -> Self {
        let instance_id = generate_instance_id();
        let registry = Arc::new(InstanceRegistry::new(
            Arc::clone(&store),
            instance_id,
            config.version.clone(),
            config.lock_ttl.max(config.heartbeat_interval * 3),
        ));
        Self {
            lock: Arc::new(DistributedLock::new(Arc::clone(&store))),
            records: Arc::new(ExecutionRecordStore::new(Arc::clone(&store))),
            registry,
            store,
            services,
            config,
            bindings: HashMap::new(),
            overlap_guards: HashMap::new(),
            cron: None,
            shutdown: CancellationToken::new(),
            heartbeat_handle: None,
            sweeper_handle: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn instance_id(&self) -> &str {
        self.registry.instance_id()
    }

    /// Bind a task to a schedule. Rejects a duplicate task name or a
    /// schedule that can't be lowered to a cron expression.
    pub fn register(&mut self, task: Task<S>, schedule: Schedule) -> Result<(), ConfigError> {
        if self.bindings.contains_key(&task.name) {
            return Err(ConfigError::DuplicateTask(task.name.clone()));
        }
        schedule.to_cron_expression(&task.name)?;
        self.overlap_guards
            .insert(task.name.clone(), Arc::new(AsyncMutex::new(())));
        self.bindings.insert(task.name.clone(), Binding { task, schedule });
        Ok(())
    }

    /// Register this instance, start the heartbeat and dead-instance
    /// sweeper (when `enabled`), and start the cron timer wheel.
    pub async fn start(&mut self) -> Result<(), ConfigError> {
        let task_names: Vec<String> = self.bindings.keys().cloned().collect();

        if self.config.enabled {
            self.registry.register(task_names).await?;
            self.heartbeat_handle = Some(
                self.registry
                    .start_heartbeat(self.config.heartbeat_interval, self.shutdown.clone()),
            );
            self.sweeper_handle = Some(
                self.registry
                    .start_sweeper(self.config.cleanup_interval, self.shutdown.clone()),
            );
        }

        let mut cron = JobScheduler::new().await?;
        for (name, binding) in &self.bindings {
            let cron_expr = binding.schedule.to_cron_expression(name)?;
            let name = name.clone();
            let weak = WeakExecutor {
                store: Arc::clone(&self.store),
                lock: Arc::clone(&self.lock),
                records: Arc::clone(&self.records),
                services: Arc::clone(&self.services),
                instance_id: self.registry.instance_id().to_string(),
                lock_ttl: self.config.lock_ttl,
                in_flight: Arc::clone(&self.in_flight),
                guard: Arc::clone(self.overlap_guards.get(&name).expect("guard registered alongside binding")),
                enabled: self.config.enabled,
            };
            let run = self.bindings.get(&name).expect("just iterated").task.clone_run();
            let job = Job::new_async(cron_expr.as_str(), move |job_id, mut cron| {
                let weak = weak.clone();
                let run = run.clone();
                let name = name.clone();
                Box::pin(async move {
                    if let Ok(Some(next)) = cron.next_tick_for_job(job_id).await {
                        if let Some(nanos) = next.timestamp_nanos_opt() {
                            if let Err(error) = weak.records.set_next_run(&name, nanos.max(0) as u128).await {
                                warn!(task = %name, %error, "failed to persist next run time");
                            }
                        }
                    }
                    weak.execute(&name, run).await;
                })
            })
            .map_err(ConfigError::Scheduler)?;
            cron.add(job).await.map_err(ConfigError::Scheduler)?;
        }
        cron.start().await.map_err(ConfigError::Scheduler)?;
        self.cron = Some(cron);
        info!(instance = self.registry.instance_id(), tasks = self.bindings.len(), "scheduler started");
        Ok(())
    }

    /// Stop accepting new firings, wait up to `drain_timeout` for in-flight
    /// ones to finish, then unregister from the fleet.
    pub async fn stop(&mut self) -> Result<(), ConfigError> {
        if let Some(mut cron) = self.cron.take() {
            cron.shutdown().await.map_err(ConfigError::Scheduler)?;
        }
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while self.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "drain timeout elapsed with firings still in flight");
        }

        if let Some(handle) = self.heartbeat_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.sweeper_handle.take() {
            let _ = handle.await;
        }
        if self.config.enabled {
            self.registry.unregister().await.ok();
        }
        Ok(())
    }
}

/// Everything an individual firing needs, independent of the `Scheduler`'s
/// own lifetime — cloned into the closure `tokio-cron-scheduler` holds.
struct WeakExecutor<S> {
    store: Arc<dyn CoordinationStore>,
    lock: Arc<DistributedLock>,
    records: Arc<ExecutionRecordStore>,
    services: Arc<S>,
    instance_id: String,
    lock_ttl: Duration,
    in_flight: Arc<AtomicUsize>,
    guard: Arc<AsyncMutex<()>>,
    enabled: bool,
}

impl<S> Clone for WeakExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            lock: Arc::clone(&self.lock),
            records: Arc::clone(&self.records),
            services: Arc::clone(&self.services),
            instance_id: self.instance_id.clone(),
            lock_ttl: self.lock_ttl,
            in_flight: Arc::clone(&self.in_flight),
            guard: Arc::clone(&self.guard),
            enabled: self.enabled,
        }
    }
}

impl<S: Send + Sync + 'static> WeakExecutor<S> {
    async fn execute(&self, task_name: &str, run: crate::task::RunFn<S>) {
        let Ok(_overlap_permit) = self.guard.clone().try_lock_owned() else {
            debug!(task = task_name, "skipped firing, previous run still in flight on this instance");
            return;
        };

        if self.enabled {
            match self.lock.try_acquire(task_name, &self.instance_id, self.lock_ttl).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(error) => {
                    warn!(task = task_name, %error, "coordination store unavailable, skipping firing");
                    return;
                }
            }
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let started_at = crate::records::now_unix_nanos();
        let cancellation = CancellationToken::new();
        let renewal_stop = CancellationToken::new();

        if self.enabled {
            let running_record = ExecutionRecord {
                task: task_name.to_string(),
                instance: self.instance_id.clone(),
                started_at_unix_nanos: started_at,
                finished_at_unix_nanos: started_at,
                status: ExecutionStatus::Running,
                error: None,
            };
            if let Err(error) = self.records.record(running_record).await {
                warn!(task = task_name, %error, "failed to persist running record");
            }
        }

        let renewal_handle = if self.enabled {
            let lock = Arc::clone(&self.lock);
            let task_name_owned = task_name.to_string();
            let owner = self.instance_id.clone();
            let ttl = self.lock_ttl;
            let cancellation_for_renewal = cancellation.clone();
            let renewal_stop = renewal_stop.clone();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ttl / 2);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = renewal_stop.cancelled() => break,
                        _ = ticker.tick() => {
                            match lock.renew(&task_name_owned, &owner, ttl).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    warn!(task = %task_name_owned, "lock lost mid-run, signalling cancellation");
                                    cancellation_for_renewal.cancel();
                                    break;
                                }
                                Err(error) => {
                                    warn!(task = %task_name_owned, %error, "lock renewal failed");
                                }
                            }
                        }
                    }
                }
            }))
        } else {
            None
        };

        let ctx = TaskContext {
            cancellation: cancellation.clone(),
            services: Arc::clone(&self.services),
        };
        let body = (run.as_ref())(ctx);
        let result = tokio::spawn(body).await;

        renewal_stop.cancel();
        if let Some(handle) = renewal_handle {
            let _ = handle.await;
        }

        if self.enabled {
            self.lock.release(task_name, &self.instance_id).await;
        }

        let finished_at = crate::records::now_unix_nanos();
        let (status, error) = match result {
            Ok(Ok(())) => (ExecutionStatus::Success, None),
            Ok(Err(error)) => (ExecutionStatus::Failure, Some(error.to_string())),
            Err(join_error) if join_error.is_panic() => {
                (ExecutionStatus::Panicked, Some(join_error.to_string()))
            }
            Err(join_error) => (ExecutionStatus::Failure, Some(join_error.to_string())),
        };

        if let Some(error) = &error {
            warn!(task = task_name, %error, ?status, "task firing did not succeed");
        } else {
            debug!(task = task_name, "task firing succeeded");
        }

        if self.enabled {
            let record = ExecutionRecord {
                task: task_name.to_string(),
                instance: self.instance_id.clone(),
                started_at_unix_nanos: started_at,
                finished_at_unix_nanos: finished_at,
                status,
                error,
            };
            if let Err(error) = self.records.record(record).await {
                warn!(task = task_name, %error, "failed to persist execution record");
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::task::RunFn;

    fn weak_executor(store: Arc<dyn CoordinationStore>, instance_id: &str) -> WeakExecutor<()> {
        WeakExecutor {
            lock: Arc::new(DistributedLock::new(Arc::clone(&store))),
            records: Arc::new(ExecutionRecordStore::new(Arc::clone(&store))),
            store,
            services: Arc::new(()),
            instance_id: instance_id.to_string(),
            lock_ttl: Duration::from_secs(30),
            in_flight: Arc::new(AtomicUsize::new(0)),
            guard: Arc::new(AsyncMutex::new(())),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn two_instances_contesting_the_same_task_never_run_concurrently() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let executor_a = weak_executor(Arc::clone(&store), "instance-a");
        let executor_b = weak_executor(Arc::clone(&store), "instance-b");

        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let run: RunFn<()> = Arc::new({
            let concurrent = Arc::clone(&concurrent);
            let max_concurrent = Arc::clone(&max_concurrent);
            move |_ctx: TaskContext<()>| {
                let concurrent = Arc::clone(&concurrent);
                let max_concurrent = Arc::clone(&max_concurrent);
                Box::pin(async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            }
        });

        tokio::join!(
            executor_a.execute("contested-task", Arc::clone(&run)),
            executor_b.execute("contested-task", run),
        );

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(executor_a.lock.is_held("contested-task").await.unwrap(), None);
    }

    #[tokio::test]
    async fn a_firing_writes_a_running_record_before_its_terminal_one() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let executor = weak_executor(Arc::clone(&store), "instance-a");
        let records = Arc::clone(&executor.records);

        let run: RunFn<()> = Arc::new(move |_ctx: TaskContext<()>| {
            let records = Arc::clone(&records);
            Box::pin(async move {
                let mid_run = records.last_execution("slow-task").await.unwrap().unwrap();
                assert_eq!(mid_run.status, ExecutionStatus::Running);
                Ok(())
            })
        });

        executor.execute("slow-task", run).await;

        let finished = executor.records.last_execution("slow-task").await.unwrap().unwrap();
        assert_eq!(finished.status, ExecutionStatus::Success);
    }
}
