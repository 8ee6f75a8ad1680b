use crate::sync::documents::{Document, DocumentStore};
use crate::sync::models::{ChangeId, DataType};
use crate::sync::traits::CursorStore;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};

/// Cursor and document tables on Postgres. Both share one pool.
#[derive(Debug, Clone)]
pub struct PostgresSyncStore {
    pool: PgPool,
}

impl PostgresSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profile_sync_cursors (
                data_type  TEXT PRIMARY KEY,
                cursor     TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::sqlx("migrate cursor table", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profile_sync_documents (
                data_type  TEXT NOT NULL,
                entity_key TEXT NOT NULL,
                payload    JSONB NOT NULL,
                change_id  TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (data_type, entity_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::sqlx("migrate document table", e))?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for PostgresSyncStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn load(&self, data_type: DataType) -> Result<Option<ChangeId>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM profile_sync_cursors WHERE data_type = $1")
                .bind(data_type.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::sqlx("load cursor", e))?;
        raw.map(|raw| ChangeId::parse(data_type.cursor_kind(), &raw))
            .transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn save(&self, data_type: DataType, cursor: ChangeId) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::sqlx("begin cursor save", e))?;

        // Make sure a row exists so FOR UPDATE always has something to lock.
        sqlx::query(
            r#"
            INSERT INTO profile_sync_cursors (data_type, cursor, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (data_type) DO NOTHING
            "#,
        )
        .bind(data_type.as_str())
        .bind(cursor.to_cursor_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::sqlx("seed cursor", e))?;

        let stored: String = sqlx::query_scalar(
            "SELECT cursor FROM profile_sync_cursors WHERE data_type = $1 FOR UPDATE",
        )
        .bind(data_type.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::sqlx("lock cursor", e))?;
        let stored = ChangeId::parse(cursor.kind(), &stored)?;

        if cursor.advances(Some(stored))? {
            sqlx::query(
                "UPDATE profile_sync_cursors SET cursor = $2, updated_at = $3 WHERE data_type = $1",
            )
            .bind(data_type.as_str())
            .bind(cursor.to_cursor_string())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::sqlx("save cursor", e))?;
        } else if stored != cursor {
            tracing::debug!(%data_type, %cursor, %stored, "ignoring cursor save that does not advance");
        }

        tx.commit()
            .await
            .map_err(|e| Error::sqlx("commit cursor save", e))?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PostgresSyncStore {
    #[tracing::instrument(level = "debug", skip(self, doc), fields(data_type = %doc.data_type))]
    async fn upsert(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profile_sync_documents (data_type, entity_key, payload, change_id, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (data_type, entity_key) DO UPDATE SET
                payload = EXCLUDED.payload,
                change_id = EXCLUDED.change_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(doc.data_type.as_str())
        .bind(&doc.entity_key)
        .bind(sqlx::types::Json(&doc.payload))
        .bind(&doc.change_id)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::sqlx("upsert document", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete(&self, data_type: DataType, entity_key: &str) -> Result<bool> {
        let res = sqlx::query(
            "DELETE FROM profile_sync_documents WHERE data_type = $1 AND entity_key = $2",
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
            SELECT data_type, entity_key, payload, change_id, updated_at
            FROM profile_sync_documents
            WHERE data_type = $1 AND entity_key = $2
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
            SELECT data_type, entity_key, payload, change_id, updated_at
            FROM profile_sync_documents
            WHERE data_type = $1
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

fn document_from_row(row: &PgRow) -> Result<Document> {
    let data_type: String = row
        .try_get("data_type")
        .map_err(|e| Error::sqlx("document data_type", e))?;
    let payload: sqlx::types::Json<serde_json::Value> = row
        .try_get("payload")
        .map_err(|e| Error::sqlx("document payload", e))?;
    Ok(Document {
        data_type: data_type.parse()?,
        entity_key: row
            .try_get("entity_key")
            .map_err(|e| Error::sqlx("document entity_key", e))?,
        payload: payload.0,
        change_id: row
            .try_get("change_id")
            .map_err(|e| Error::sqlx("document change_id", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| Error::sqlx("document updated_at", e))?,
    })
}
