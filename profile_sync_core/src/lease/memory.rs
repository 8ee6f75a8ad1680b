use crate::lease::models::{
    LeaseAcceptance, LeaseAcquireResult, LeaseRecord, LeaseReleaseResult, LeaseTicket,
    UpsertDecision, decide_upsert,
};
use crate::lease::traits::LeaseRepository;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory lease table for local development and unit tests.
///
/// Each call runs under one lock, so the decision and the write are atomic
/// within the process. It offers no coordination across processes.
#[derive(Clone, Default)]
pub struct MemoryLeaseRepository {
    rows: Arc<Mutex<HashMap<String, LeaseRecord>>>,
}

impl MemoryLeaseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows (primarily for tests).
    pub async fn all_leases(&self) -> Vec<LeaseRecord> {
        let mut rows: Vec<_> = self.rows.lock().await.values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }
}

#[async_trait]
impl LeaseRepository for MemoryLeaseRepository {
    #[tracing::instrument(level = "debug", skip(self, acceptance), fields(lease_id = %lease.lease_id))]
    async fn upsert(
        &self,
        lease: &LeaseTicket,
        now: DateTime<Utc>,
        acceptance: Option<&LeaseAcceptance>,
    ) -> Result<LeaseAcquireResult> {
        let mut rows = self.rows.lock().await;
        let existing = rows.get(&lease.lease_id);
        let previous_expiry = existing.map(|r| r.expires);

        match decide_upsert(existing, lease.token, now, acceptance) {
            UpsertDecision::Vetoed | UpsertDecision::Held => {
                let row = existing.ok_or_else(|| {
                    Error::Unreachable(format!(
                        "lease '{}' rejected without an existing row",
                        lease.lease_id
                    ))
                })?;
                Ok(LeaseAcquireResult::failed_from(row))
            }
            UpsertDecision::Insert => {
                let row = LeaseRecord {
                    id: lease.lease_id.clone(),
                    token: lease.token,
                    expires: lease.expires,
                    acquired: now,
                    released: None,
                };
                rows.insert(lease.lease_id.clone(), row);
                Ok(LeaseAcquireResult::Acquired {
                    ticket: lease.clone(),
                    acquired_at: now,
                    previous_expiry,
                })
            }
            UpsertDecision::Renew => {
                let row = rows.get_mut(&lease.lease_id).ok_or_else(|| {
                    Error::Unreachable(format!("lease '{}' vanished mid-renewal", lease.lease_id))
                })?;
                row.expires = row.expires.max(lease.expires);
                Ok(LeaseAcquireResult::Acquired {
                    ticket: LeaseTicket {
                        lease_id: row.id.clone(),
                        token: row.token,
                        expires: row.expires,
                    },
                    acquired_at: row.acquired,
                    previous_expiry,
                })
            }
            UpsertDecision::Seize => {
                let row = rows.get_mut(&lease.lease_id).ok_or_else(|| {
                    Error::Unreachable(format!("lease '{}' vanished mid-seizure", lease.lease_id))
                })?;
                row.token = lease.token;
                row.expires = lease.expires;
                row.acquired = now;
                Ok(LeaseAcquireResult::Acquired {
                    ticket: lease.clone(),
                    acquired_at: now,
                    previous_expiry,
                })
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(lease_id = %ticket.lease_id))]
    async fn release(
        &self,
        ticket: &LeaseTicket,
        now: DateTime<Utc>,
    ) -> Result<LeaseReleaseResult> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&ticket.lease_id) {
            Some(row) if row.token == ticket.token => {
                row.expires = row.expires.min(now);
                row.released = Some(now);
                Ok(LeaseReleaseResult::Released { released_at: now })
            }
            _ => Ok(LeaseReleaseResult::NotHeld),
        }
    }

    async fn get(&self, lease_id: &str) -> Result<Option<LeaseRecord>> {
        Ok(self.rows.lock().await.get(lease_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ticket(id: &str, token: Uuid, expires: DateTime<Utc>) -> LeaseTicket {
        LeaseTicket::new(id, token, expires).unwrap()
    }

    #[tokio::test]
    async fn live_lease_blocks_other_tokens_without_mutation() {
        let repo = MemoryLeaseRepository::new();
        let t0 = Utc::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let first = repo
            .upsert(&ticket("job-x", a, t0 + chrono::Duration::seconds(30)), t0, None)
            .await
            .unwrap();
        assert!(first.is_acquired());

        let t10 = t0 + chrono::Duration::seconds(10);
        let second = repo
            .upsert(&ticket("job-x", b, t10 + chrono::Duration::seconds(30)), t10, None)
            .await
            .unwrap();
        assert_eq!(
            second,
            LeaseAcquireResult::Failed {
                expires: t0 + chrono::Duration::seconds(30),
                last_acquired: t0,
                last_released: None,
            }
        );

        let row = repo.get("job-x").await.unwrap().unwrap();
        assert_eq!(row.token, a);
        assert_eq!(row.expires, t0 + chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn renewal_never_moves_expiry_backward() {
        let repo = MemoryLeaseRepository::new();
        let t0 = Utc::now();
        let a = Uuid::new_v4();
        repo.upsert(&ticket("job-x", a, t0 + chrono::Duration::seconds(60)), t0, None)
            .await
            .unwrap();

        let res = repo
            .upsert(&ticket("job-x", a, t0 + chrono::Duration::seconds(20)), t0, None)
            .await
            .unwrap();
        assert_eq!(
            res.ticket().unwrap().expires,
            t0 + chrono::Duration::seconds(60)
        );

        let res = repo
            .upsert(&ticket("job-x", a, t0 + chrono::Duration::seconds(90)), t0, None)
            .await
            .unwrap();
        match res {
            LeaseAcquireResult::Acquired {
                ticket,
                acquired_at,
                previous_expiry,
            } => {
                assert_eq!(ticket.expires, t0 + chrono::Duration::seconds(90));
                assert_eq!(acquired_at, t0);
                assert_eq!(previous_expiry, Some(t0 + chrono::Duration::seconds(60)));
            }
            other => panic!("expected renewal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let repo = MemoryLeaseRepository::new();
        let t0 = Utc::now();
        let a = ticket("job-x", Uuid::new_v4(), t0 + chrono::Duration::seconds(30));
        repo.upsert(&a, t0, None).await.unwrap();

        let stranger = ticket("job-x", Uuid::new_v4(), a.expires);
        assert_eq!(
            repo.release(&stranger, t0).await.unwrap(),
            LeaseReleaseResult::NotHeld
        );

        let t5 = t0 + chrono::Duration::seconds(5);
        assert_eq!(
            repo.release(&a, t5).await.unwrap(),
            LeaseReleaseResult::Released { released_at: t5 }
        );
        let row = repo.get("job-x").await.unwrap().unwrap();
        assert_eq!(row.expires, t5);
        assert_eq!(row.released, Some(t5));

        // Released rows are immediately available to other tokens.
        let b = ticket("job-x", Uuid::new_v4(), t5 + chrono::Duration::seconds(30));
        assert!(repo.upsert(&b, t5, None).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn failed_result_without_row_is_unreachable() {
        let repo = MemoryLeaseRepository::new();
        let err = repo.failed_result("missing").await.unwrap_err();
        assert!(err.is_fatal());
    }
}
