//! Fixed-interval loops, one per leased sync job.

use crate::jobs::leased::{JobOutcome, LeasedSyncJob};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct SyncScheduler {
    jobs: Vec<Arc<LeasedSyncJob>>,
    interval: Duration,
}

impl SyncScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            interval,
        }
    }

    pub fn with_job(mut self, job: LeasedSyncJob) -> Self {
        self.jobs.push(Arc::new(job));
        self
    }

    pub fn jobs(&self) -> &[Arc<LeasedSyncJob>] {
        &self.jobs
    }

    /// Spawn one independent loop per job.
    ///
    /// Each handle resolves to `Ok(())` after `shutdown` fires, or to the
    /// error that ended its loop. Only fatal errors end a loop early.
    pub fn start(self, shutdown: CancellationToken) -> Vec<JoinHandle<Result<()>>> {
        tracing::info!(jobs = self.jobs.len(), interval_ms = self.interval.as_millis() as u64, "sync scheduler started");
        self.jobs
            .into_iter()
            .map(|job| tokio::spawn(run_loop(job, self.interval, shutdown.clone())))
            .collect()
    }
}

#[tracing::instrument(level = "info", skip_all, fields(data_type = %job.data_type()))]
async fn run_loop(job: Arc<LeasedSyncJob>, interval: Duration, shutdown: CancellationToken) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("sync loop cancelled");
                return Ok(());
            }
            _ = ticker.tick() => {
                match job.run_once(&shutdown).await {
                    Ok(JobOutcome::Ran { .. }) | Ok(JobOutcome::Skipped { .. }) => {}
                    Err(e) if e.is_fatal() => {
                        tracing::error!(%e, "sync loop stopped on invariant violation");
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(%e, transient = e.is_transient(), "sync tick failed");
                    }
                }
            }
        }
    }
}
