use crate::lease::manager::{LeaseAcquisition, LeaseManager};
use crate::o11y::conventions;
use crate::o11y::metrics::SharedMetrics;
use crate::sync::engine::{SyncReport, SyncRun};
use crate::sync::models::DataType;
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The lease was ours and the sync ran to completion or cancellation.
    Ran {
        report: SyncReport,
        /// Renewal failed during the run, so it stopped early.
        lease_lost: bool,
    },
    /// Another instance holds the lease.
    Skipped { retry_after: Duration },
}

/// One data type's sync, guarded by that data type's lease.
pub struct LeasedSyncJob {
    sync: Arc<dyn SyncRun>,
    leases: LeaseManager,
    lease_duration: Duration,
    metrics: SharedMetrics,
}

impl LeasedSyncJob {
    pub fn new(
        sync: Arc<dyn SyncRun>,
        leases: LeaseManager,
        lease_duration: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            sync,
            leases,
            lease_duration,
            metrics,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.sync.data_type()
    }

    pub fn lease_id(&self) -> String {
        self.data_type().lease_id()
    }

    /// Acquire the lease, run one sync, release the lease.
    ///
    /// The sync stops between pages when either `shutdown` fires or the lease
    /// is lost.
    #[tracing::instrument(level = "info", skip_all, fields(data_type = %self.data_type()))]
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<JobOutcome> {
        let lease_id = self.lease_id();
        let mut lease = match self
            .leases
            .acquire_lease(&lease_id, self.lease_duration, None)
            .await?
        {
            LeaseAcquisition::Owned(lease) => lease,
            LeaseAcquisition::Unavailable(held) => {
                let retry_after = held.retry_after(Utc::now());
                self.metrics
                    .increment(self.data_type().as_str(), conventions::JOB_SKIPPED, 1);
                tracing::debug!(
                    lease_id = %lease_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "lease held elsewhere; skipping run"
                );
                return Ok(JobOutcome::Skipped { retry_after });
            }
        };

        let run_token = shutdown.child_token();
        let forward = {
            let lost = lease.lost();
            let run_token = run_token.clone();
            tokio::spawn(async move {
                lost.cancelled().await;
                run_token.cancel();
            })
        };

        let result = self.sync.run(&run_token).await;
        forward.abort();
        let lease_lost = lease.is_lost();

        if let Err(e) = lease.release().await {
            tracing::warn!(lease_id = %lease_id, %e, "failed to release lease after run");
        }

        let report = result?;
        if lease_lost {
            tracing::warn!(lease_id = %lease_id, "lease lost during run");
        }
        Ok(JobOutcome::Ran { report, lease_lost })
    }
}
