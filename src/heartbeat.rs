use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::api::{memory_usage_mb, AppState};

/// Periodic one-line stats summary, so a quiet instance still proves
/// it is alive without per-request logging.
pub async fn start_heartbeat(state: Arc<AppState>) -> anyhow::Result<()> {
    let sched = JobScheduler::new().await?;

    let state_clone = state.clone();
    sched
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let state = state_clone.clone();
            Box::pin(async move {
                let (used_mb, _) = memory_usage_mb();
                let pool = state.solver.occupancy();
                info!(
                    "📊 Stats | Mem: {}MB | Reqs: {} | Success: {} | Errors: {} | Browsers: {}/{} busy | Uptime: {}m",
                    used_mb,
                    state.stats.requests.load(Ordering::Relaxed),
                    state.stats.success.load(Ordering::Relaxed),
                    state.stats.errors.load(Ordering::Relaxed),
                    pool.active,
                    pool.browsers,
                    state.started.elapsed().as_secs() / 60,
                );
            })
        })?)
        .await?;

    sched.start().await?;
    info!("✅ Stats heartbeat started");
    Ok(())
}
