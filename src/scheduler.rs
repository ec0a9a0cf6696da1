//! Periodic background jobs.
//!
//! Each job runs on its own task with its own interval. A run that fails is
//! logged and the job simply waits for its next tick; a run that overshoots
//! its period delays the following tick rather than stacking up behind it.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// ---

/// One unit of periodic work.
pub trait Job: Send + 'static {
    // ---
    fn name(&self) -> &'static str;

    fn run_once(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Run `job` every `period` until `cancel` fires. The first run is immediate.
pub fn spawn_periodic<J: Job>(
    mut job: J,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let name = job.name();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(job = name, period = ?period, "job started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = job.run_once().await {
                        tracing::warn!(job = name, "run failed: {err:#}");
                    }
                }
            }
        }

        tracing::info!(job = name, "job stopped");
    })
}
