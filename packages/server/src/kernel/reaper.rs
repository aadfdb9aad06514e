//! Periodic eviction of idle stream clients.
//!
//! A consumer that stops draining its queue or disconnects uncleanly stops
//! refreshing `last_active`; the reaper sweeps those out on a fixed schedule
//! so dead connections cannot pin registry slots and queue memory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};

use super::clients::ClientRegistry;

/// Start the reaper schedule.
///
/// The returned scheduler must be kept alive for the jobs to keep firing.
pub async fn start_reaper(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    max_age: Duration,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
        let registry = registry.clone();
        Box::pin(async move {
            let removed = registry.cleanup_inactive(max_age);
            if !removed.is_empty() {
                tracing::info!(
                    removed = removed.len(),
                    remaining = registry.len(),
                    "reaper evicted idle stream clients"
                );
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    tracing::info!(
        interval_secs = interval.as_secs(),
        max_age_secs = max_age.as_secs(),
        "idle client reaper started"
    );
    Ok(scheduler)
}
