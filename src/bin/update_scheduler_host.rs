//! Headless host for the update scheduler.
//!
//! Loads `scheduler.toml`, restores the persisted schedule, and logs every
//! `TaskReady` notification until Ctrl-C. The schedule is written back on
//! shutdown. All diagnostic output goes to stderr.

use tokio::sync::mpsc;
use update_scheduler::SchedulerConfig;
use update_scheduler::scheduler::{LoopUpdateTask, Scheduler, builtin_builders};

/// Interval for the seed task when nothing was persisted yet.
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("update_scheduler=info")),
        )
        .init();

    let config_path = SchedulerConfig::default_config_path();
    let config = SchedulerConfig::load_or_default(&config_path)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", config_path.display()))?;
    tracing::info!(namespace = %config.namespace, "update-scheduler-host starting");

    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
    let (handle, join) = Scheduler::new(ready_tx)
        .with_settings_path(config.settings_path())
        .run();

    for (task_type, builder) in builtin_builders() {
        handle.register_task_builder(task_type, builder)?;
    }
    handle.configure_namespace(config.namespace.clone()).await?;
    handle.start().await?;

    if handle.group_ids().await?.is_empty() {
        let id = handle
            .schedule_task(Box::new(LoopUpdateTask::new(DEFAULT_CHECK_INTERVAL_SECS, None)))
            .await?;
        tracing::info!(group_id = id, "seeded default update check");
    }

    loop {
        tokio::select! {
            ready = ready_rx.recv() => match ready {
                Some(ready) => tracing::info!(group_id = ready.group_id, "update check due"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, stopping");
                break;
            }
        }
    }

    handle.shutdown().await?;
    if let Err(e) = join.await {
        tracing::error!(error = %e, "scheduler loop panicked");
    }

    tracing::info!("update-scheduler-host shut down cleanly");
    Ok(())
}
