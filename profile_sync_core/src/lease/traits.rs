use crate::lease::models::{
    LeaseAcceptance, LeaseAcquireResult, LeaseRecord, LeaseReleaseResult, LeaseTicket,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Conditional writes against the lease table.
///
/// Every implementation must make `upsert` a single atomic decision: two
/// callers racing to seize the same expired row must never both succeed.
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Insert, renew, or seize `lease` according to the acquisition decision
    /// table, returning the outcome and the state needed to report it.
    async fn upsert(
        &self,
        lease: &LeaseTicket,
        now: DateTime<Utc>,
        acceptance: Option<&LeaseAcceptance>,
    ) -> Result<LeaseAcquireResult>;

    /// Give the lease up early. Only the current token may release.
    async fn release(&self, ticket: &LeaseTicket, now: DateTime<Utc>)
    -> Result<LeaseReleaseResult>;

    async fn get(&self, lease_id: &str) -> Result<Option<LeaseRecord>>;

    /// Build a `Failed` result for a lease the caller already knows it could not take.
    ///
    /// A failure implies a blocking row exists, so a missing row is fatal.
    async fn failed_result(&self, lease_id: &str) -> Result<LeaseAcquireResult> {
        match self.get(lease_id).await? {
            Some(row) => Ok(LeaseAcquireResult::failed_from(&row)),
            None => Err(Error::Unreachable(format!(
                "lease '{lease_id}' reported as held but no row exists"
            ))),
        }
    }
}

/// Generic lease contract consumed by the lease manager.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    async fn try_acquire(
        &self,
        lease_id: &str,
        duration: Duration,
        acceptance: Option<LeaseAcceptance>,
    ) -> Result<LeaseAcquireResult>;

    async fn try_renew(&self, ticket: &LeaseTicket, duration: Duration)
    -> Result<LeaseAcquireResult>;

    async fn release(&self, ticket: &LeaseTicket) -> Result<LeaseReleaseResult>;
}

pub type SharedLeaseProvider = Arc<dyn LeaseProvider>;
