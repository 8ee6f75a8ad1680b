use crate::sync::models::{ChangeEntry, ChangeId, DataType, FetchRequest, OperationType, Page, Pagination};
use crate::sync::traits::{ChangeFeed, CursorStore};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory cursor table for local development and tests.
#[derive(Clone, Default)]
pub struct MemoryCursorStore {
    cursors: Arc<Mutex<HashMap<DataType, ChangeId>>>,
    history: Arc<Mutex<Vec<(DataType, ChangeId)>>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every save that moved a cursor, in call order (primarily for tests).
    pub async fn saves(&self) -> Vec<(DataType, ChangeId)> {
        self.history.lock().await.clone()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, data_type: DataType) -> Result<Option<ChangeId>> {
        Ok(self.cursors.lock().await.get(&data_type).copied())
    }

    async fn save(&self, data_type: DataType, cursor: ChangeId) -> Result<()> {
        let mut cursors = self.cursors.lock().await;
        if !cursor.advances(cursors.get(&data_type).copied())? {
            tracing::debug!(%data_type, %cursor, "ignoring cursor save that does not advance");
            return Ok(());
        }
        cursors.insert(data_type, cursor);
        self.history.lock().await.push((data_type, cursor));
        Ok(())
    }
}

/// In-memory append-only change log implementing both pagination styles.
///
/// Cursor re-query data types get entries strictly after the cursor. Next-link
/// data types additionally get a `mem://` continuation while more entries remain.
#[derive(Clone, Default)]
pub struct MemoryChangeFeed {
    log: Arc<Mutex<HashMap<DataType, Vec<ChangeEntry>>>>,
    requests: Arc<Mutex<Vec<(DataType, FetchRequest)>>>,
}

impl MemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change. Callers keep change ids non-decreasing per data type.
    pub async fn push(
        &self,
        data_type: DataType,
        operation: OperationType,
        change_id: ChangeId,
        payload: impl Into<String>,
    ) {
        self.log
            .lock()
            .await
            .entry(data_type)
            .or_default()
            .push(ChangeEntry {
                operation,
                data_type,
                change_id,
                payload: payload.into(),
            });
    }

    /// Every fetch in call order (primarily for tests).
    pub async fn requests(&self) -> Vec<(DataType, FetchRequest)> {
        self.requests.lock().await.clone()
    }

    fn link(data_type: DataType, offset: usize, page_size: usize) -> String {
        format!("mem://{}?offset={offset}&pageSize={page_size}", data_type.as_str())
    }

    fn parse_link(link: &str) -> Result<(usize, usize)> {
        let bad = || Error::InvalidInput(format!("not a memory feed link: {link}"));
        let (_, query) = link.split_once('?').ok_or_else(bad)?;
        let mut offset = None;
        let mut page_size = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("offset", v)) => offset = v.parse().ok(),
                Some(("pageSize", v)) => page_size = v.parse().ok(),
                _ => {}
            }
        }
        Ok((offset.ok_or_else(bad)?, page_size.ok_or_else(bad)?))
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn fetch(&self, data_type: DataType, request: &FetchRequest) -> Result<Page> {
        self.requests
            .lock()
            .await
            .push((data_type, request.clone()));
        let log = self.log.lock().await;
        let entries = log.get(&data_type).map(Vec::as_slice).unwrap_or_default();

        let (start, page_size) = match request {
            FetchRequest::Since { cursor, page_size } => (
                entries.partition_point(|e| e.change_id <= *cursor),
                (*page_size).max(1) as usize,
            ),
            FetchRequest::Continue { link } => Self::parse_link(link)?,
        };
        let end = entries.len().min(start.saturating_add(page_size));
        let mut page = Page::new(entries.get(start..end).unwrap_or_default().to_vec());
        if data_type.pagination() == Pagination::NextLink && end < entries.len() && !page.is_empty() {
            page = page.with_continuation(Self::link(data_type, end, page_size));
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cursor_requery_returns_entries_after_cursor() {
        let feed = MemoryChangeFeed::new();
        for n in 1..=5 {
            feed.push(
                DataType::PersonContactPreferences,
                OperationType::Insert,
                ChangeId::Sequence(n),
                "{}",
            )
            .await;
        }
        let page = feed
            .fetch(
                DataType::PersonContactPreferences,
                &FetchRequest::Since {
                    cursor: ChangeId::Sequence(2),
                    page_size: 2,
                },
            )
            .await
            .unwrap();
        let ids: Vec<_> = page.entries.iter().map(|e| e.change_id).collect();
        assert_eq!(ids, vec![ChangeId::Sequence(3), ChangeId::Sequence(4)]);
        assert_eq!(page.continuation, None);
    }

    #[tokio::test]
    async fn next_link_data_types_get_continuations() {
        let feed = MemoryChangeFeed::new();
        let base = chrono::Utc::now();
        for n in 0..3 {
            feed.push(
                DataType::OfficialAddresses,
                OperationType::Update,
                ChangeId::Timestamp(base + chrono::Duration::seconds(n)),
                "{}",
            )
            .await;
        }
        let first = feed
            .fetch(
                DataType::OfficialAddresses,
                &FetchRequest::Since {
                    cursor: ChangeId::min_for(crate::sync::models::CursorKind::Timestamp),
                    page_size: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 2);
        let link = first.continuation.unwrap();

        let second = feed
            .fetch(DataType::OfficialAddresses, &FetchRequest::Continue { link })
            .await
            .unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.continuation, None);
    }

    #[tokio::test]
    async fn cursor_store_records_history() {
        let store = MemoryCursorStore::new();
        store
            .save(DataType::Favorites, ChangeId::Sequence(1))
            .await
            .unwrap();
        assert_eq!(
            store.load(DataType::Favorites).await.unwrap(),
            Some(ChangeId::Sequence(1))
        );
        assert_eq!(store.saves().await.len(), 1);
    }

    #[tokio::test]
    async fn cursor_save_never_moves_backward() {
        let store = MemoryCursorStore::new();
        store
            .save(DataType::PersonContactPreferences, ChangeId::Sequence(9))
            .await
            .unwrap();
        store
            .save(DataType::PersonContactPreferences, ChangeId::Sequence(4))
            .await
            .unwrap();
        assert_eq!(
            store.load(DataType::PersonContactPreferences).await.unwrap(),
            Some(ChangeId::Sequence(9))
        );
        assert_eq!(store.saves().await.len(), 1);

        let stale_kind = store
            .save(
                DataType::PersonContactPreferences,
                ChangeId::min_for(crate::sync::models::CursorKind::Timestamp),
            )
            .await;
        assert!(matches!(stale_kind, Err(Error::InvalidInput(_))));
    }
}
