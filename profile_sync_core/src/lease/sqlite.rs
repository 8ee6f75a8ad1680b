//! SQLite-backed lease repository.
//!
//! Single-node / self-hosted deployments and tests. Timestamps are stored as
//! epoch milliseconds so expiry comparisons happen in SQL.

use crate::lease::models::{
    LeaseAcceptance, LeaseAcquireResult, LeaseRecord, LeaseReleaseResult, LeaseTicket,
};
use crate::db::{begin_immediate, finish_immediate};
use crate::lease::traits::LeaseRepository;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteLeaseRepository {
    pool: SqlitePool,
}

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profile_sync_leases (
  id TEXT PRIMARY KEY,
  token TEXT NOT NULL,
  expires INTEGER NOT NULL,
  acquired INTEGER NOT NULL,
  released INTEGER NULL
);
"#;

// One statement decides and writes. The WHERE clause is the whole mutual
// exclusion guarantee: same token renews, an expired row is seized, anything
// else leaves the row untouched and affects zero rows.
const UPSERT: &str = r#"
INSERT INTO profile_sync_leases (id, token, expires, acquired, released)
VALUES (?1, ?2, ?3, ?4, NULL)
ON CONFLICT(id) DO UPDATE SET
  expires = CASE WHEN profile_sync_leases.token = excluded.token
                 THEN MAX(profile_sync_leases.expires, excluded.expires)
                 ELSE excluded.expires END,
  acquired = CASE WHEN profile_sync_leases.token = excluded.token
                  THEN profile_sync_leases.acquired
                  ELSE excluded.acquired END,
  token = excluded.token
WHERE profile_sync_leases.token = excluded.token
   OR profile_sync_leases.expires <= ?4
"#;

impl SqliteLeaseRepository {
    /// Wrap an existing pool and create the lease table if needed.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::sqlx("sqlite lease schema", e))?;
        Ok(())
    }

    async fn fetch(conn: &mut SqliteConnection, lease_id: &str) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query(
            "SELECT id, token, expires, acquired, released FROM profile_sync_leases WHERE id = ?1",
        )
        .bind(lease_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| Error::sqlx("select lease", e))?;
        row.as_ref().map(record_from_row).transpose()
    }

    // Runs between `BEGIN IMMEDIATE` and `COMMIT`; the write lock is already held.
    async fn upsert_locked(
        conn: &mut SqliteConnection,
        lease: &LeaseTicket,
        now: DateTime<Utc>,
        acceptance: Option<&LeaseAcceptance>,
    ) -> Result<LeaseAcquireResult> {
        let existing = Self::fetch(conn, &lease.lease_id).await?;
        if let (Some(row), Some(accept)) = (existing.as_ref(), acceptance) {
            if !accept(row) {
                return Ok(LeaseAcquireResult::failed_from(row));
            }
        }

        let res = sqlx::query(UPSERT)
            .bind(&lease.lease_id)
            .bind(lease.token.to_string())
            .bind(lease.expires.timestamp_millis())
            .bind(now.timestamp_millis())
            .execute(&mut *conn)
            .await
            .map_err(|e| Error::sqlx("conditional lease upsert", e))?;

        let Some(stored) = Self::fetch(conn, &lease.lease_id).await? else {
            return Err(Error::Unreachable(format!(
                "lease '{}' has no row after upsert",
                lease.lease_id
            )));
        };
        if res.rows_affected() == 0 {
            return Ok(LeaseAcquireResult::failed_from(&stored));
        }
        Ok(LeaseAcquireResult::Acquired {
            ticket: LeaseTicket {
                lease_id: stored.id,
                token: stored.token,
                expires: stored.expires,
            },
            acquired_at: stored.acquired,
            previous_expiry: existing.map(|r| r.expires),
        })
    }

    /// Another writer held the database past the busy timeout: report whoever
    /// owns the row as the holder.
    async fn contended(&self, lease_id: &str) -> Result<LeaseAcquireResult> {
        match self.get(lease_id).await? {
            Some(row) => Ok(LeaseAcquireResult::failed_from(&row)),
            None => Err(Error::Conflict(format!(
                "lease '{lease_id}' is being created by another instance"
            ))),
        }
    }
}

#[async_trait]
impl LeaseRepository for SqliteLeaseRepository {
    #[tracing::instrument(level = "debug", skip(self, acceptance), fields(lease_id = %lease.lease_id))]
    async fn upsert(
        &self,
        lease: &LeaseTicket,
        now: DateTime<Utc>,
        acceptance: Option<&LeaseAcceptance>,
    ) -> Result<LeaseAcquireResult> {
        let res = match begin_immediate(&self.pool, "begin lease upsert").await {
            Ok(mut conn) => {
                let res = Self::upsert_locked(&mut conn, lease, now, acceptance).await;
                finish_immediate(&mut conn, "finish lease upsert", res).await
            }
            Err(e) => Err(e),
        };
        match res {
            Err(e) if e.is_sqlite_busy() => {
                tracing::debug!(lease_id = %lease.lease_id, "lease table busy; treating as contention");
                self.contended(&lease.lease_id).await
            }
            other => other,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(lease_id = %ticket.lease_id))]
    async fn release(
        &self,
        ticket: &LeaseTicket,
        now: DateTime<Utc>,
    ) -> Result<LeaseReleaseResult> {
        let now_ms = now.timestamp_millis();
        let res = sqlx::query(
            r#"
UPDATE profile_sync_leases
SET expires = MIN(expires, ?3), released = ?3
WHERE id = ?1 AND token = ?2
"#,
        )
        .bind(&ticket.lease_id)
        .bind(ticket.token.to_string())
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::sqlx("release lease", e))?;

        if res.rows_affected() == 0 {
            return Ok(LeaseReleaseResult::NotHeld);
        }
        Ok(LeaseReleaseResult::Released {
            released_at: from_millis(now_ms)?,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, lease_id: &str) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query(
            "SELECT id, token, expires, acquired, released FROM profile_sync_leases WHERE id = ?1",
        )
        .bind(lease_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::sqlx("get lease", e))?;
        row.as_ref().map(record_from_row).transpose()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<LeaseRecord> {
    let token: String = row
        .try_get("token")
        .map_err(|e| Error::sqlx("lease token", e))?;
    let released: Option<i64> = row
        .try_get("released")
        .map_err(|e| Error::sqlx("lease released", e))?;
    Ok(LeaseRecord {
        id: row.try_get("id").map_err(|e| Error::sqlx("lease id", e))?,
        token: Uuid::parse_str(&token).map_err(|e| Error::backend("parse lease token", e))?,
        expires: from_millis(
            row.try_get("expires")
                .map_err(|e| Error::sqlx("lease expires", e))?,
        )?,
        acquired: from_millis(
            row.try_get("acquired")
                .map_err(|e| Error::sqlx("lease acquired", e))?,
        )?,
        released: released.map(from_millis).transpose()?,
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::BackendMessage(format!("invalid lease timestamp: {ms}")))
}
