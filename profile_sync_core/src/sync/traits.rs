use crate::sync::models::{ChangeId, DataType, FetchRequest, Page};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// Upstream change log for one or more data types.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn fetch(&self, data_type: DataType, request: &FetchRequest) -> Result<Page>;
}

/// Turns an entry's serialized payload into the data type's model.
pub trait PayloadCodec<P>: Send + Sync {
    fn decode(&self, raw: &str) -> Result<P>;
}

/// serde_json codec; the default for every data type.
pub struct JsonCodec<P> {
    _marker: PhantomData<fn() -> P>,
}

impl<P> JsonCodec<P> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<P> Default for JsonCodec<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: DeserializeOwned> PayloadCodec<P> for JsonCodec<P> {
    fn decode(&self, raw: &str) -> Result<P> {
        serde_json::from_str(raw).map_err(|e| Error::InvalidInput(format!("undecodable payload: {e}")))
    }
}

/// A payload model that identifies the entity it describes.
pub trait ChangePayload: Send + Sync + 'static {
    fn entity_key(&self) -> String;

    /// False when a key part is blank; such changes are skipped.
    fn is_identified(&self) -> bool {
        !self.entity_key().trim().is_empty()
    }
}

/// Idempotent apply target for decoded changes.
///
/// Re-applying the same change any number of times must leave the same end
/// state: a crash before the cursor is saved replays the whole page.
#[async_trait]
pub trait ChangeHandler<P>: Send + Sync {
    async fn apply_upsert(&self, payload: &P, change_id: ChangeId) -> Result<()>;
    async fn apply_delete(&self, entity_key: &str, change_id: ChangeId) -> Result<()>;
}

/// Last processed position per data type.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// `None` means the data type has never been synchronized.
    async fn load(&self, data_type: DataType) -> Result<Option<ChangeId>>;
    /// Store `cursor` unless the stored one is already at or past it.
    async fn save(&self, data_type: DataType, cursor: ChangeId) -> Result<()>;
}
