use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cronfleet::{Config, RedisStore, Schedule, Scheduler, SchedulerConfig, Task};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Ambient services every registered task receives. A real deployment would
/// put its db pool, http clients, and the like here — see `kernel/deps.rs`
/// for the shape this generalizes.
struct Services {
    label: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,cronfleet=debug".into()))
        .with(fmt::layer().with_target(true).with_line_number(true))
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    let store = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .context("failed to connect to coordination store")?,
    );
    let services = Arc::new(Services {
        label: "demo".to_string(),
    });

    let mut scheduler = Scheduler::new(store, services, SchedulerConfig::from(&config));

    scheduler.register(
        Task::new("heartbeat-log", "logs a line every minute", |ctx| async move {
            tracing::info!(label = %ctx.services.label, "heartbeat task fired");
            Ok(())
        }),
        Schedule::Every(Duration::from_secs(60)),
    )?;

    scheduler.start().await.context("failed to start scheduler")?;
    tracing::info!(instance = scheduler.instance_id(), "demo scheduler running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    scheduler.stop().await.context("failed to stop scheduler cleanly")?;
    Ok(())
}
