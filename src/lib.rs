//! A fleet of worker processes cooperatively executing named, cron-scheduled
//! tasks over a shared Redis-class coordination store, with at most one
//! instance running any given task firing at a time.

pub mod config;
pub mod error;
pub mod lock;
pub mod query;
pub mod records;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod task;

pub use config::Config;
pub use error::{ConfigError, StoreError};
pub use lock::DistributedLock;
pub use query::{Health, Status, TaskInfo};
pub use records::{ExecutionRecord, ExecutionRecordStore, ExecutionStatus, TaskStats};
pub use registry::{InstanceEntry, InstanceRegistry, InstanceStatus};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{CoordinationStore, CoordinationStoreJsonExt, InMemoryStore, RedisStore};
pub use task::{Schedule, Task, TaskContext};
