use crate::clock::{Clock, SystemClock};
use crate::lease::models::{
    LeaseAcceptance, LeaseAcquireResult, LeaseReleaseResult, LeaseTicket, expiry_after,
};
use crate::lease::traits::{LeaseProvider, LeaseRepository};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lease provider backed by a [`LeaseRepository`].
///
/// Each acquisition mints a fresh token; renewals reuse the ticket's token so
/// the repository treats them as the same holder.
#[derive(Clone)]
pub struct StorageLeaseProvider {
    repo: Arc<dyn LeaseRepository>,
    clock: Arc<dyn Clock>,
}

impl StorageLeaseProvider {
    pub fn new(repo: Arc<dyn LeaseRepository>) -> Self {
        Self {
            repo,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(repo: Arc<dyn LeaseRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub fn repository(&self) -> &Arc<dyn LeaseRepository> {
        &self.repo
    }
}

#[async_trait]
impl LeaseProvider for StorageLeaseProvider {
    #[tracing::instrument(level = "debug", skip(self, acceptance))]
    async fn try_acquire(
        &self,
        lease_id: &str,
        duration: Duration,
        acceptance: Option<LeaseAcceptance>,
    ) -> Result<LeaseAcquireResult> {
        let now = self.clock.now();
        let ticket = LeaseTicket::new(lease_id, Uuid::new_v4(), expiry_after(now, duration)?)?;
        self.repo.upsert(&ticket, now, acceptance.as_ref()).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(lease_id = %ticket.lease_id))]
    async fn try_renew(&self, ticket: &LeaseTicket, duration: Duration) -> Result<LeaseAcquireResult> {
        let now = self.clock.now();
        let renewal = LeaseTicket {
            expires: expiry_after(now, duration)?,
            ..ticket.clone()
        };
        self.repo.upsert(&renewal, now, None).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(lease_id = %ticket.lease_id))]
    async fn release(&self, ticket: &LeaseTicket) -> Result<LeaseReleaseResult> {
        self.repo.release(ticket, self.clock.now()).await
    }
}
