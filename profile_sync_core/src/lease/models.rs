use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// A persisted lease row.
///
/// A row whose `expires` lies in the future belongs to the holder of `token`;
/// once `expires` has passed, anyone may take it over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub id: String,
    pub token: Uuid,
    pub expires: DateTime<Utc>,
    pub acquired: DateTime<Utc>,
    pub released: Option<DateTime<Utc>>,
}

impl LeaseRecord {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}

/// Handle returned to a successful acquirer or renewer. Never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseTicket {
    pub lease_id: String,
    pub token: Uuid,
    pub expires: DateTime<Utc>,
}

impl LeaseTicket {
    #[tracing::instrument(level = "debug")]
    pub fn new(
        lease_id: impl Into<String> + std::fmt::Debug,
        token: Uuid,
        expires: DateTime<Utc>,
    ) -> Result<Self> {
        let lease_id = lease_id.into();
        if lease_id.trim().is_empty() {
            return Err(Error::InvalidInput("lease_id is empty".to_string()));
        }
        Ok(Self {
            lease_id,
            token,
            expires,
        })
    }
}

/// Outcome of an acquire or renew attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LeaseAcquireResult {
    Acquired {
        ticket: LeaseTicket,
        /// When the current holder first acquired the lease.
        acquired_at: DateTime<Utc>,
        /// Expiry stored before this call, if a row existed.
        previous_expiry: Option<DateTime<Utc>>,
    },
    Failed {
        expires: DateTime<Utc>,
        last_acquired: DateTime<Utc>,
        last_released: Option<DateTime<Utc>>,
    },
}

impl LeaseAcquireResult {
    pub fn failed_from(record: &LeaseRecord) -> Self {
        Self::Failed {
            expires: record.expires,
            last_acquired: record.acquired,
            last_released: record.released,
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    pub fn ticket(&self) -> Option<&LeaseTicket> {
        match self {
            Self::Acquired { ticket, .. } => Some(ticket),
            Self::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LeaseReleaseResult {
    Released { released_at: DateTime<Utc> },
    /// The ticket's token no longer owns the row; nothing was changed.
    NotHeld,
}

/// Caller-supplied veto evaluated against the existing row before acquisition.
///
/// Returning `false` makes the attempt fail without touching the row.
pub type LeaseAcceptance = Arc<dyn Fn(&LeaseRecord) -> bool + Send + Sync>;

/// What a conditional upsert does with an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertDecision {
    Insert,
    Vetoed,
    Renew,
    Seize,
    Held,
}

/// The acquisition decision table, shared by the in-memory repository and
/// mirrored by the SQL repositories' conditional statements.
pub fn decide_upsert(
    existing: Option<&LeaseRecord>,
    token: Uuid,
    now: DateTime<Utc>,
    acceptance: Option<&LeaseAcceptance>,
) -> UpsertDecision {
    let Some(row) = existing else {
        return UpsertDecision::Insert;
    };
    if let Some(accept) = acceptance {
        if !accept(row) {
            return UpsertDecision::Vetoed;
        }
    }
    if row.token == token {
        return UpsertDecision::Renew;
    }
    if row.expires <= now {
        return UpsertDecision::Seize;
    }
    UpsertDecision::Held
}

/// `now + duration`, or `InvalidInput` when the sum is not a representable instant.
pub(crate) fn expiry_after(now: DateTime<Utc>, duration: std::time::Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| {
            Error::InvalidInput(format!("lease duration {duration:?} is out of range"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(token: Uuid, expires: DateTime<Utc>) -> LeaseRecord {
        LeaseRecord {
            id: "job-x".to_string(),
            token,
            expires,
            acquired: expires - chrono::Duration::seconds(30),
            released: None,
        }
    }

    #[test]
    fn decision_table() {
        let now = Utc::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let live = row(a, now + chrono::Duration::seconds(10));
        let expired = row(a, now - chrono::Duration::seconds(1));
        let at_now = row(a, now);

        assert_eq!(decide_upsert(None, a, now, None), UpsertDecision::Insert);
        assert_eq!(decide_upsert(Some(&live), a, now, None), UpsertDecision::Renew);
        assert_eq!(decide_upsert(Some(&live), b, now, None), UpsertDecision::Held);
        assert_eq!(decide_upsert(Some(&expired), b, now, None), UpsertDecision::Seize);
        assert_eq!(decide_upsert(Some(&at_now), b, now, None), UpsertDecision::Seize);

        let veto: LeaseAcceptance = Arc::new(|_| false);
        assert_eq!(
            decide_upsert(Some(&expired), b, now, Some(&veto)),
            UpsertDecision::Vetoed
        );
        // The predicate only guards existing rows.
        assert_eq!(decide_upsert(None, b, now, Some(&veto)), UpsertDecision::Insert);
    }

    #[test]
    fn empty_lease_id_is_rejected() {
        assert!(matches!(
            LeaseTicket::new("  ", Uuid::new_v4(), Utc::now()),
            Err(Error::InvalidInput(_))
        ));
    }
}
