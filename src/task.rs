//! Task definitions: the schedule-spec forms a binding can use, and the
//! typed run-function shape tasks implement. Grounded on the registry's
//! `Fn(J, Arc<ServerDeps>) -> Fut` handler shape, generalized from a
//! job-type dispatch table to a single task's own entry.

use crate::error::ConfigError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a task's run function receives: a cooperative cancellation signal
/// (set if the distributed lock is lost mid-run) and the ambient services
/// container it needs to do its work.
pub struct TaskContext<S> {
    pub cancellation: CancellationToken,
    pub services: Arc<S>,
}

pub(crate) type RunFn<S> = Arc<dyn Fn(TaskContext<S>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named, schedulable unit of work. `S` is the ambient services type the
/// whole scheduler is parameterized over.
pub struct Task<S> {
    pub name: String,
    pub description: String,
    run: RunFn<S>,
}

impl<S> Clone for Task<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            run: Arc::clone(&self.run),
        }
    }
}

impl<S> Task<S> {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, run: F) -> Self
    where
        F: Fn(TaskContext<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            run: Arc::new(move |ctx| Box::pin(run(ctx))),
        }
    }

    /// A cloneable handle to this task's run function, independent of the
    /// `Task` itself — used when the binding moves into a cron job closure
    /// while the `Task` stays owned by the scheduler's binding table.
    pub(crate) fn clone_run(&self) -> RunFn<S> {
        Arc::clone(&self.run)
    }
}

/// The cadence a [`Task`] is bound to. Convenience forms are lowered to an
/// equivalent 6-field cron expression (`sec min hour day month dow`) before
/// being handed to the timer wheel, so the scheduler only ever deals in one
/// representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// A raw 6-field cron expression, used as-is.
    Cron(String),
    /// Fire every `interval`. Must evenly divide a minute, hour, or day —
    /// arbitrary durations (e.g. 90 seconds) aren't expressible as a single
    /// cron field and are rejected at registration time.
    Every(std::time::Duration),
    /// Fire once a day at the given UTC hour:minute.
    DailyAt { hour: u32, minute: u32 },
}

impl Schedule {
    pub fn to_cron_expression(&self, task: &str) -> Result<String, ConfigError> {
        match self {
            Schedule::Cron(expr) => Ok(expr.clone()),
            Schedule::DailyAt { hour, minute } => {
                if *hour > 23 || *minute > 59 {
                    return Err(ConfigError::InvalidSchedule {
                        task: task.to_string(),
                        reason: format!("hour {hour} or minute {minute} out of range"),
                    });
                }
                Ok(format!("0 {minute} {hour} * * *"))
            }
            Schedule::Every(duration) => {
                let secs = duration.as_secs();
                if secs == 0 {
                    return Err(ConfigError::InvalidSchedule {
                        task: task.to_string(),
                        reason: "interval must be at least one second".to_string(),
                    });
                }
                if secs < 60 {
                    return Ok(format!("*/{secs} * * * * *"));
                }
                if secs % 60 == 0 {
                    let minutes = secs / 60;
                    if minutes < 60 {
                        return Ok(format!("0 */{minutes} * * * *"));
                    }
                    if minutes % 60 == 0 {
                        let hours = minutes / 60;
                        if hours < 24 {
                            return Ok(format!("0 0 */{hours} * * *"));
                        }
                    }
                }
                Err(ConfigError::InvalidSchedule {
                    task: task.to_string(),
                    reason: format!(
                        "{secs}s does not evenly divide a minute, hour, or day; use Schedule::Cron instead"
                    ),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn every_30_seconds_lowers_to_a_seconds_step_field() {
        let schedule = Schedule::Every(Duration::from_secs(30));
        assert_eq!(schedule.to_cron_expression("t").unwrap(), "*/30 * * * * *");
    }

    #[test]
    fn every_5_minutes_lowers_to_a_minutes_step_field() {
        let schedule = Schedule::Every(Duration::from_secs(300));
        assert_eq!(schedule.to_cron_expression("t").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn every_90_seconds_is_rejected() {
        let schedule = Schedule::Every(Duration::from_secs(90));
        assert!(schedule.to_cron_expression("t").is_err());
    }

    #[test]
    fn daily_at_lowers_to_fixed_hour_and_minute() {
        let schedule = Schedule::DailyAt { hour: 3, minute: 15 };
        assert_eq!(schedule.to_cron_expression("t").unwrap(), "0 15 3 * * *");
    }

    #[test]
    fn cron_passes_through_unchanged() {
        let schedule = Schedule::Cron("0 0 * * * *".to_string());
        assert_eq!(schedule.to_cron_expression("t").unwrap(), "0 0 * * * *");
    }
}
