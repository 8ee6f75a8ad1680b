use crate::lease::models::{
    LeaseAcceptance, LeaseAcquireResult, LeaseRecord, LeaseReleaseResult, LeaseTicket,
};
use crate::lease::traits::LeaseRepository;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};

/// Shared lease table for multi-instance deployments.
#[derive(Debug, Clone)]
pub struct PostgresLeaseRepository {
    pool: PgPool,
}

impl PostgresLeaseRepository {
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn connect(postgres_url: &str, max_connections: u32) -> Result<Self> {
        let pool = crate::db::connect_postgres(postgres_url, max_connections).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profile_sync_leases (
                id       TEXT PRIMARY KEY,
                token    UUID NOT NULL,
                expires  TIMESTAMPTZ NOT NULL,
                acquired TIMESTAMPTZ NOT NULL,
                released TIMESTAMPTZ NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::sqlx("migrate lease table", e))?;
        Ok(())
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        lease_id: &str,
    ) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, token, expires, acquired, released
            FROM profile_sync_leases
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(lease_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| Error::sqlx("lock lease row", e))?;
        row.as_ref().map(record_from_row).transpose()
    }
}

#[async_trait]
impl LeaseRepository for PostgresLeaseRepository {
    #[tracing::instrument(level = "debug", skip(self, acceptance), fields(lease_id = %lease.lease_id))]
    async fn upsert(
        &self,
        lease: &LeaseTicket,
        now: DateTime<Utc>,
        acceptance: Option<&LeaseAcceptance>,
    ) -> Result<LeaseAcquireResult> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::sqlx("begin lease upsert", e))?;

        // Holding the row lock keeps the predicate's view valid until commit.
        let existing = Self::lock_row(&mut tx, &lease.lease_id).await?;
        if let (Some(row), Some(accept)) = (existing.as_ref(), acceptance) {
            if !accept(row) {
                tx.rollback()
                    .await
                    .map_err(|e| Error::sqlx("rollback vetoed lease", e))?;
                return Ok(LeaseAcquireResult::failed_from(row));
            }
        }

        let written = sqlx::query(
            r#"
            INSERT INTO profile_sync_leases AS l (id, token, expires, acquired, released)
            VALUES ($1, $2, $3, $4, NULL)
            ON CONFLICT (id) DO UPDATE SET
                expires  = CASE WHEN l.token = EXCLUDED.token
                                THEN GREATEST(l.expires, EXCLUDED.expires)
                                ELSE EXCLUDED.expires END,
                acquired = CASE WHEN l.token = EXCLUDED.token
                                THEN l.acquired
                                ELSE EXCLUDED.acquired END,
                token    = EXCLUDED.token
            WHERE l.token = EXCLUDED.token OR l.expires <= $4
            RETURNING id, token, expires, acquired, released
            "#,
        )
        .bind(&lease.lease_id)
        .bind(lease.token)
        .bind(lease.expires)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::sqlx("conditional lease upsert", e))?;

        let outcome = match written {
            Some(row) => {
                let stored = record_from_row(&row)?;
                LeaseAcquireResult::Acquired {
                    ticket: LeaseTicket {
                        lease_id: stored.id,
                        token: stored.token,
                        expires: stored.expires,
                    },
                    acquired_at: stored.acquired,
                    previous_expiry: existing.map(|r| r.expires),
                }
            }
            None => {
                // A concurrent first insert can win between our lock and our write,
                // so read what blocked us rather than trusting the earlier snapshot.
                let current = match existing {
                    Some(row) => Some(row),
                    None => Self::lock_row(&mut tx, &lease.lease_id).await?,
                };
                match current {
                    Some(row) => LeaseAcquireResult::failed_from(&row),
                    None => {
                        return Err(Error::Unreachable(format!(
                            "lease '{}' was neither written nor present",
                            lease.lease_id
                        )));
                    }
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| Error::sqlx("commit lease upsert", e))?;
        Ok(outcome)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(lease_id = %ticket.lease_id))]
    async fn release(
        &self,
        ticket: &LeaseTicket,
        now: DateTime<Utc>,
    ) -> Result<LeaseReleaseResult> {
        let res = sqlx::query(
            r#"
            UPDATE profile_sync_leases
            SET expires = LEAST(expires, $3), released = $3
            WHERE id = $1 AND token = $2
            "#,
        )
        .bind(&ticket.lease_id)
        .bind(ticket.token)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::sqlx("release lease", e))?;

        if res.rows_affected() == 0 {
            Ok(LeaseReleaseResult::NotHeld)
        } else {
            Ok(LeaseReleaseResult::Released { released_at: now })
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, lease_id: &str) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query(
            "SELECT id, token, expires, acquired, released FROM profile_sync_leases WHERE id = $1",
        )
        .bind(lease_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::sqlx("get lease", e))?;
        row.as_ref().map(record_from_row).transpose()
    }
}

fn record_from_row(row: &PgRow) -> Result<LeaseRecord> {
    Ok(LeaseRecord {
        id: row.try_get("id").map_err(|e| Error::sqlx("lease id", e))?,
        token: row
            .try_get("token")
            .map_err(|e| Error::sqlx("lease token", e))?,
        expires: row
            .try_get("expires")
            .map_err(|e| Error::sqlx("lease expires", e))?,
        acquired: row
            .try_get("acquired")
            .map_err(|e| Error::sqlx("lease acquired", e))?,
        released: row
            .try_get("released")
            .map_err(|e| Error::sqlx("lease released", e))?,
    })
}
