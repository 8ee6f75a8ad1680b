//! SQLite-backed cursor and document stores.

use crate::db::{begin_immediate, finish_immediate};
use crate::sync::documents::{Document, DocumentStore};
use crate::sync::models::{ChangeId, DataType};
use crate::sync::traits::CursorStore;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profile_sync_cursors (
  data_type TEXT PRIMARY KEY,
  cursor TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profile_sync_documents (
  data_type TEXT NOT NULL,
  entity_key TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  change_id TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (data_type, entity_key)
);
"#;

#[tracing::instrument(level = "debug", skip_all)]
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| Error::sqlx("sqlite sync schema", e))?;
    Ok(())
}

#[derive(Clone)]
pub struct SqliteCursorStore {
    pool: SqlitePool,
}

impl SqliteCursorStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        migrate(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn load(&self, data_type: DataType) -> Result<Option<ChangeId>> {
        let row = sqlx::query("SELECT cursor FROM profile_sync_cursors WHERE data_type = ?1")
            .bind(data_type.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::sqlx("load cursor", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row
            .try_get("cursor")
            .map_err(|e| Error::sqlx("cursor column", e))?;
        ChangeId::parse(data_type.cursor_kind(), &raw).map(Some)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn save(&self, data_type: DataType, cursor: ChangeId) -> Result<()> {
        let mut conn = begin_immediate(&self.pool, "begin cursor save").await?;
        let res = save_locked(&mut conn, data_type, cursor).await;
        finish_immediate(&mut conn, "finish cursor save", res).await
    }
}

// Runs inside `BEGIN IMMEDIATE`, so no other writer can slip in between the
// read and the write.
async fn save_locked(
    conn: &mut SqliteConnection,
    data_type: DataType,
    cursor: ChangeId,
) -> Result<()> {
    let stored: Option<String> =
        sqlx::query_scalar("SELECT cursor FROM profile_sync_cursors WHERE data_type = ?1")
            .bind(data_type.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| Error::sqlx("read cursor for save", e))?;
    let stored = stored
        .map(|raw| ChangeId::parse(cursor.kind(), &raw))
        .transpose()?;
    if !cursor.advances(stored)? {
        tracing::debug!(%data_type, %cursor, "ignoring cursor save that does not advance");
        return Ok(());
    }

    sqlx::query(
        r#"
INSERT INTO profile_sync_cursors (data_type, cursor, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(data_type) DO UPDATE SET
  cursor = excluded.cursor,
  updated_at = excluded.updated_at
"#,
    )
    .bind(data_type.as_str())
    .bind(cursor.to_cursor_string())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::sqlx("save cursor", e))?;
    Ok(())
}

#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        migrate(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    #[tracing::instrument(level = "debug", skip(self, doc), fields(data_type = %doc.data_type))]
    async fn upsert(&self, doc: &Document) -> Result<()> {
        let payload = serde_json::to_string(&doc.payload)
            .map_err(|e| Error::backend("serialize document", e))?;
        sqlx::query(
            r#"
INSERT INTO profile_sync_documents (data_type, entity_key, payload_json, change_id, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(data_type, entity_key) DO UPDATE SET
  payload_json = excluded.payload_json,
  change_id = excluded.change_id,
  updated_at = excluded.updated_at
"#,
        )
        .bind(doc.data_type.as_str())
        .bind(&doc.entity_key)
        .bind(payload)
        .bind(&doc.change_id)
        .bind(doc.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::sqlx("upsert document", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete(&self, data_type: DataType, entity_key: &str) -> Result<bool> {
        let res = sqlx::query(
            "DELETE FROM profile_sync_documents WHERE data_type = ?1 AND entity_key = ?2",
        )
        .bind(data_type.as_str())
        .bind(entity_key)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::sqlx("delete document", e))?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, data_type: DataType, entity_key: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            r#"
SELECT data_type, entity_key, payload_json, change_id, updated_at
FROM profile_sync_documents
WHERE data_type = ?1 AND entity_key = ?2
"#,
        )
        .bind(data_type.as_str())
        .bind(entity_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::sqlx("get document", e))?;
        row.as_ref().map(document_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list(&self, data_type: DataType) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
SELECT data_type, entity_key, payload_json, change_id, updated_at
FROM profile_sync_documents
WHERE data_type = ?1
ORDER BY entity_key
"#,
        )
        .bind(data_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::sqlx("list documents", e))?;
        rows.iter().map(document_from_row).collect()
    }
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let data_type: String = row
        .try_get("data_type")
        .map_err(|e| Error::sqlx("document data_type", e))?;
    let payload: String = row
        .try_get("payload_json")
        .map_err(|e| Error::sqlx("document payload", e))?;
    let updated_at: String = row
        .try_get("updated_at")
        .map_err(|e| Error::sqlx("document updated_at", e))?;
    Ok(Document {
        data_type: data_type.parse()?,
        entity_key: row
            .try_get("entity_key")
            .map_err(|e| Error::sqlx("document entity_key", e))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| Error::backend("parse document payload", e))?,
        change_id: row
            .try_get("change_id")
            .map_err(|e| Error::sqlx("document change_id", e))?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| Error::backend("parse document updated_at", e))?
            .with_timezone(&Utc),
    })
}
