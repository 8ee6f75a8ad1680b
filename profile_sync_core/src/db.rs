//! Connection helpers shared by the SQLite and Postgres stores.

use crate::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Open (creating if needed) a WAL-mode SQLite database file.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn open_sqlite(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::backend("sqlite mkdir", e))?;
    }

    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
        .map_err(|e| Error::backend("sqlite connect options", e))?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await
        .map_err(|e| Error::backend("sqlite connect", e))
}

/// Private in-memory database. One connection, so every query sees the same data.
pub async fn open_sqlite_in_memory() -> Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(|e| Error::backend("sqlite in-memory connect", e))
}

/// Check out a connection and open a write transaction on it right away, so
/// concurrent writers queue on the busy timeout instead of failing a deferred
/// lock upgrade. Close it with [`finish_immediate`].
pub async fn begin_immediate(
    pool: &SqlitePool,
    context: &'static str,
) -> Result<PoolConnection<Sqlite>> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| Error::sqlx(context, e))?;
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .map_err(|e| Error::sqlx(context, e))?;
    Ok(conn)
}

/// Commit on `Ok`, roll back on `Err` or on a failed commit.
pub async fn finish_immediate<T>(
    conn: &mut SqliteConnection,
    context: &'static str,
    res: Result<T>,
) -> Result<T> {
    let res = match res {
        Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
            Ok(_) => return Ok(value),
            Err(e) => Err(Error::sqlx(context, e)),
        },
        Err(e) => Err(e),
    };
    if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        tracing::warn!(%rollback, context, "sqlite rollback failed");
    }
    res
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn connect_postgres(postgres_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(postgres_url)
        .await
        .map_err(|e| Error::backend("postgres connect", e))
}
