//! Local document table that synchronized changes converge into.

use crate::sync::models::{ChangeId, DataType};
use crate::sync::traits::{ChangeHandler, ChangePayload};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Latest known state of one upstream entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub data_type: DataType,
    pub entity_key: String,
    pub payload: serde_json::Value,
    /// Cursor text of the change that produced this state.
    pub change_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Keyed by `(data_type, entity_key)`. Both writes are idempotent.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upsert(&self, doc: &Document) -> Result<()>;

    /// Returns whether a document was removed.
    async fn delete(&self, data_type: DataType, entity_key: &str) -> Result<bool>;

    async fn get(&self, data_type: DataType, entity_key: &str) -> Result<Option<Document>>;

    /// All documents of a data type ordered by entity key.
    async fn list(&self, data_type: DataType) -> Result<Vec<Document>>;
}

#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    docs: Arc<Mutex<BTreeMap<(DataType, String), Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, doc: &Document) -> Result<()> {
        self.docs
            .lock()
            .await
            .insert((doc.data_type, doc.entity_key.clone()), doc.clone());
        Ok(())
    }

    async fn delete(&self, data_type: DataType, entity_key: &str) -> Result<bool> {
        Ok(self
            .docs
            .lock()
            .await
            .remove(&(data_type, entity_key.to_string()))
            .is_some())
    }

    async fn get(&self, data_type: DataType, entity_key: &str) -> Result<Option<Document>> {
        Ok(self
            .docs
            .lock()
            .await
            .get(&(data_type, entity_key.to_string()))
            .cloned())
    }

    async fn list(&self, data_type: DataType) -> Result<Vec<Document>> {
        Ok(self
            .docs
            .lock()
            .await
            .values()
            .filter(|d| d.data_type == data_type)
            .cloned()
            .collect())
    }
}

/// Applies decoded changes of one data type into a [`DocumentStore`].
pub struct DocumentHandler<P> {
    data_type: DataType,
    store: Arc<dyn DocumentStore>,
    _payload: PhantomData<fn(&P)>,
}

impl<P> DocumentHandler<P> {
    pub fn new(data_type: DataType, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            data_type,
            store,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<P> ChangeHandler<P> for DocumentHandler<P>
where
    P: ChangePayload + Serialize,
{
    #[tracing::instrument(level = "debug", skip(self, payload), fields(data_type = %self.data_type))]
    async fn apply_upsert(&self, payload: &P, change_id: ChangeId) -> Result<()> {
        let doc = Document {
            data_type: self.data_type,
            entity_key: payload.entity_key(),
            payload: serde_json::to_value(payload)
                .map_err(|e| Error::backend("serialize document payload", e))?,
            change_id: change_id.to_cursor_string(),
            updated_at: Utc::now(),
        };
        self.store.upsert(&doc).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(data_type = %self.data_type))]
    async fn apply_delete(&self, entity_key: &str, _change_id: ChangeId) -> Result<()> {
        self.store.delete(self.data_type, entity_key).await?;
        Ok(())
    }
}
